//! NTSTATUS codes returned across the driver boundary.
//!
//! The driver only understands 32-bit NTSTATUS values. Implementations and the
//! dispatcher work with precise codes ([`NtStatus::OBJECT_NAME_COLLISION`],
//! [`NtStatus::DIRECTORY_NOT_EMPTY`], ...) and every code is classified into the
//! closed [`StatusClass`] set by [`NtStatus::class`].

use std::fmt;

/// A raw NTSTATUS value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NtStatus(pub i32);

const fn code(value: u32) -> NtStatus {
    NtStatus(value.cast_signed())
}

impl NtStatus {
    pub const SUCCESS: Self = code(0x0000_0000);
    pub const BUFFER_OVERFLOW: Self = code(0x8000_0005);
    pub const NO_MORE_FILES: Self = code(0x8000_0006);
    pub const UNSUCCESSFUL: Self = code(0xC000_0001);
    pub const NOT_IMPLEMENTED: Self = code(0xC000_0002);
    pub const INVALID_HANDLE: Self = code(0xC000_0008);
    pub const INVALID_PARAMETER: Self = code(0xC000_000D);
    pub const NO_SUCH_FILE: Self = code(0xC000_000F);
    pub const INVALID_DEVICE_REQUEST: Self = code(0xC000_0010);
    pub const ACCESS_DENIED: Self = code(0xC000_0022);
    pub const BUFFER_TOO_SMALL: Self = code(0xC000_0023);
    pub const OBJECT_NAME_INVALID: Self = code(0xC000_0033);
    pub const OBJECT_NAME_NOT_FOUND: Self = code(0xC000_0034);
    pub const OBJECT_NAME_COLLISION: Self = code(0xC000_0035);
    pub const OBJECT_PATH_NOT_FOUND: Self = code(0xC000_003A);
    pub const SHARING_VIOLATION: Self = code(0xC000_0043);
    pub const FILE_LOCK_CONFLICT: Self = code(0xC000_0054);
    pub const RANGE_NOT_LOCKED: Self = code(0xC000_007E);
    pub const DISK_FULL: Self = code(0xC000_007F);
    pub const MEDIA_WRITE_PROTECTED: Self = code(0xC000_00A2);
    pub const IO_TIMEOUT: Self = code(0xC000_00B5);
    pub const FILE_IS_A_DIRECTORY: Self = code(0xC000_00BA);
    pub const NOT_SUPPORTED: Self = code(0xC000_00BB);
    pub const INTERNAL_ERROR: Self = code(0xC000_00E5);
    pub const DIRECTORY_NOT_EMPTY: Self = code(0xC000_0101);
    pub const NOT_A_DIRECTORY: Self = code(0xC000_0103);
    pub const NAME_TOO_LONG: Self = code(0xC000_0106);
    pub const CANCELLED: Self = code(0xC000_0120);
    pub const CANNOT_DELETE: Self = code(0xC000_0121);
    pub const FILE_CLOSED: Self = code(0xC000_0128);
    pub const INVALID_DEVICE_STATE: Self = code(0xC000_0184);
    pub const IO_DEVICE_ERROR: Self = code(0xC000_0185);
    pub const NOT_FOUND: Self = code(0xC000_0225);
    pub const DISK_QUOTA_EXCEEDED: Self = code(0xC000_0802);

    /// Raw value as the driver sees it.
    pub const fn bits(self) -> u32 {
        self.0.cast_unsigned()
    }

    /// `NT_SUCCESS`: success and informational severities.
    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Classifies the code into the closed set reported to callers.
    pub fn class(self) -> StatusClass {
        match self {
            s if s.is_success() => StatusClass::Success,
            Self::NO_SUCH_FILE
            | Self::OBJECT_NAME_NOT_FOUND
            | Self::OBJECT_PATH_NOT_FOUND
            | Self::INVALID_HANDLE
            | Self::NOT_FOUND => StatusClass::NotFound,
            Self::ACCESS_DENIED
            | Self::SHARING_VIOLATION
            | Self::CANNOT_DELETE
            | Self::MEDIA_WRITE_PROTECTED
            | Self::FILE_LOCK_CONFLICT => StatusClass::AccessDenied,
            Self::NOT_IMPLEMENTED | Self::NOT_SUPPORTED | Self::INVALID_DEVICE_REQUEST => {
                StatusClass::NotSupported
            }
            Self::INVALID_DEVICE_STATE
            | Self::FILE_CLOSED
            | Self::CANCELLED
            | Self::OBJECT_NAME_COLLISION
            | Self::OBJECT_NAME_INVALID
            | Self::NAME_TOO_LONG
            | Self::DIRECTORY_NOT_EMPTY
            | Self::NOT_A_DIRECTORY
            | Self::FILE_IS_A_DIRECTORY
            | Self::INVALID_PARAMETER
            | Self::RANGE_NOT_LOCKED
            | Self::BUFFER_TOO_SMALL => StatusClass::InvalidState,
            _ => StatusClass::IoError,
        }
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "STATUS_SUCCESS",
            Self::BUFFER_OVERFLOW => "STATUS_BUFFER_OVERFLOW",
            Self::NO_MORE_FILES => "STATUS_NO_MORE_FILES",
            Self::UNSUCCESSFUL => "STATUS_UNSUCCESSFUL",
            Self::NOT_IMPLEMENTED => "STATUS_NOT_IMPLEMENTED",
            Self::INVALID_HANDLE => "STATUS_INVALID_HANDLE",
            Self::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Self::NO_SUCH_FILE => "STATUS_NO_SUCH_FILE",
            Self::INVALID_DEVICE_REQUEST => "STATUS_INVALID_DEVICE_REQUEST",
            Self::ACCESS_DENIED => "STATUS_ACCESS_DENIED",
            Self::BUFFER_TOO_SMALL => "STATUS_BUFFER_TOO_SMALL",
            Self::OBJECT_NAME_INVALID => "STATUS_OBJECT_NAME_INVALID",
            Self::OBJECT_NAME_NOT_FOUND => "STATUS_OBJECT_NAME_NOT_FOUND",
            Self::OBJECT_NAME_COLLISION => "STATUS_OBJECT_NAME_COLLISION",
            Self::OBJECT_PATH_NOT_FOUND => "STATUS_OBJECT_PATH_NOT_FOUND",
            Self::SHARING_VIOLATION => "STATUS_SHARING_VIOLATION",
            Self::FILE_LOCK_CONFLICT => "STATUS_FILE_LOCK_CONFLICT",
            Self::RANGE_NOT_LOCKED => "STATUS_RANGE_NOT_LOCKED",
            Self::DISK_FULL => "STATUS_DISK_FULL",
            Self::MEDIA_WRITE_PROTECTED => "STATUS_MEDIA_WRITE_PROTECTED",
            Self::IO_TIMEOUT => "STATUS_IO_TIMEOUT",
            Self::FILE_IS_A_DIRECTORY => "STATUS_FILE_IS_A_DIRECTORY",
            Self::NOT_SUPPORTED => "STATUS_NOT_SUPPORTED",
            Self::INTERNAL_ERROR => "STATUS_INTERNAL_ERROR",
            Self::DIRECTORY_NOT_EMPTY => "STATUS_DIRECTORY_NOT_EMPTY",
            Self::NOT_A_DIRECTORY => "STATUS_NOT_A_DIRECTORY",
            Self::NAME_TOO_LONG => "STATUS_NAME_TOO_LONG",
            Self::CANCELLED => "STATUS_CANCELLED",
            Self::CANNOT_DELETE => "STATUS_CANNOT_DELETE",
            Self::FILE_CLOSED => "STATUS_FILE_CLOSED",
            Self::INVALID_DEVICE_STATE => "STATUS_INVALID_DEVICE_STATE",
            Self::IO_DEVICE_ERROR => "STATUS_IO_DEVICE_ERROR",
            Self::NOT_FOUND => "STATUS_NOT_FOUND",
            Self::DISK_QUOTA_EXCEEDED => "STATUS_DISK_QUOTA_EXCEEDED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "NtStatus({:#010X})", self.bits()),
        }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#010X})", self.bits()),
            None => write!(f, "{:#010X}", self.bits()),
        }
    }
}

impl From<NtStatus> for i32 {
    fn from(status: NtStatus) -> Self {
        status.0
    }
}

/// The closed set of outcomes every callback reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Success,
    NotFound,
    AccessDenied,
    NotSupported,
    InvalidState,
    IoError,
}

impl StatusClass {
    /// The canonical status for a class, used when no precise code exists.
    pub fn canonical(self) -> NtStatus {
        match self {
            StatusClass::Success => NtStatus::SUCCESS,
            StatusClass::NotFound => NtStatus::OBJECT_NAME_NOT_FOUND,
            StatusClass::AccessDenied => NtStatus::ACCESS_DENIED,
            StatusClass::NotSupported => NtStatus::NOT_IMPLEMENTED,
            StatusClass::InvalidState => NtStatus::INVALID_DEVICE_STATE,
            StatusClass::IoError => NtStatus::IO_DEVICE_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_values() {
        assert_eq!(NtStatus::NOT_IMPLEMENTED.bits(), 0xC000_0002);
        assert_eq!(NtStatus::OBJECT_NAME_COLLISION.bits(), 0xC000_0035);
        assert_eq!(i32::from(NtStatus::SUCCESS), 0);
        assert!(NtStatus::NO_SUCH_FILE.0 < 0);
    }

    #[test]
    fn test_success_severity() {
        assert!(NtStatus::SUCCESS.is_success());
        assert!(!NtStatus::BUFFER_OVERFLOW.is_success());
        assert!(!NtStatus::ACCESS_DENIED.is_success());
    }

    #[test]
    fn test_classification() {
        assert_eq!(NtStatus::SUCCESS.class(), StatusClass::Success);
        assert_eq!(NtStatus::NO_SUCH_FILE.class(), StatusClass::NotFound);
        assert_eq!(NtStatus::SHARING_VIOLATION.class(), StatusClass::AccessDenied);
        assert_eq!(NtStatus::NOT_IMPLEMENTED.class(), StatusClass::NotSupported);
        assert_eq!(NtStatus::DIRECTORY_NOT_EMPTY.class(), StatusClass::InvalidState);
        assert_eq!(NtStatus::IO_TIMEOUT.class(), StatusClass::IoError);
        assert_eq!(code(0xC0DE_0001).class(), StatusClass::IoError);
    }

    #[test]
    fn test_canonical_round_trips_class() {
        for class in [
            StatusClass::Success,
            StatusClass::NotFound,
            StatusClass::AccessDenied,
            StatusClass::NotSupported,
            StatusClass::InvalidState,
            StatusClass::IoError,
        ] {
            assert_eq!(class.canonical().class(), class);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            NtStatus::ACCESS_DENIED.to_string(),
            "STATUS_ACCESS_DENIED (0xC0000022)"
        );
        assert_eq!(format!("{:?}", code(0xC0DE_0001)), "NtStatus(0xC0DE0001)");
    }
}
