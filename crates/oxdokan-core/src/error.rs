//! Error taxonomy and NTSTATUS mapping.
//!
//! Every failure surfaced by the dispatcher ends up as an [`NtStatus`]. The
//! error types here keep enough structure for logging and tests while
//! [`ToNtStatus`] performs the final conversion at the boundary.
//!
//! Errors fall into three categories (see [`ErrorCategory`]):
//!
//! - **Boundary**: malformed callback arguments or a panic caught at the
//!   trampoline. Always reported as an I/O error.
//! - **Application**: the implementation or the dispatcher declined the
//!   request. Reported with the matching status.
//! - **Lifecycle**: the volume is unmounting or gone. Reported as
//!   `STATUS_INVALID_DEVICE_STATE`.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::handle_table::HandleId;
use crate::lifecycle::MountState;
use crate::request::OperationKind;
use crate::status::{NtStatus, StatusClass};

/// Errors produced while serving a single callback.
#[derive(Debug, Error)]
pub enum DokanError {
    /// Precise status chosen by the filesystem implementation.
    #[error("{0}")]
    Status(NtStatus),

    /// Path does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller lacks the access the operation needs.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Capability outside the implementation's supported set.
    #[error("Operation not supported: {0}")]
    NotSupported(OperationKind),

    /// Operation is not valid for the handle's current state.
    #[error("Invalid handle state: {0}")]
    InvalidState(String),

    /// Requested access conflicts with another open.
    #[error("Sharing violation: {0}")]
    SharingViolation(String),

    /// Mutating request on a write-protected volume.
    #[error("Volume is write protected")]
    WriteProtected,

    /// Handle id unknown to this session.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(HandleId),

    /// A bounded lock wait expired.
    #[error("Timed out after {0:?} waiting for handle lock")]
    TimedOut(Duration),

    /// Volume is draining.
    #[error("Volume is unmounting")]
    Unmounting,

    /// Volume is not mounted.
    #[error("Volume is not mounted")]
    NotMounted,

    /// Request cancelled by a forced unmount.
    #[error("Request cancelled by forced unmount")]
    Cancelled,

    /// Null or garbled argument from the driver.
    #[error("Malformed callback argument: {0}")]
    InvalidArgument(&'static str),

    /// The implementation panicked.
    #[error("Filesystem callback panicked: {0}")]
    Panic(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Where an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Boundary,
    Application,
    Lifecycle,
}

impl DokanError {
    /// Shorthand for [`DokanError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        DokanError::NotFound(what.into())
    }

    /// Shorthand for [`DokanError::AccessDenied`].
    pub fn access_denied(what: impl Into<String>) -> Self {
        DokanError::AccessDenied(what.into())
    }

    /// Shorthand for [`DokanError::InvalidState`].
    pub fn invalid_state(what: impl Into<String>) -> Self {
        DokanError::InvalidState(what.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DokanError::InvalidArgument(_) | DokanError::Panic(_) => ErrorCategory::Boundary,
            DokanError::Unmounting | DokanError::NotMounted | DokanError::Cancelled => {
                ErrorCategory::Lifecycle
            }
            _ => ErrorCategory::Application,
        }
    }

    /// Converts this error to the status returned to the driver.
    pub fn to_ntstatus(&self) -> NtStatus {
        match self {
            DokanError::Status(status) => *status,
            DokanError::NotFound(_) => NtStatus::OBJECT_NAME_NOT_FOUND,
            DokanError::AccessDenied(_) => NtStatus::ACCESS_DENIED,
            DokanError::NotSupported(_) => NtStatus::NOT_IMPLEMENTED,
            DokanError::InvalidState(_) => NtStatus::INVALID_DEVICE_STATE,
            DokanError::SharingViolation(_) => NtStatus::SHARING_VIOLATION,
            DokanError::WriteProtected => NtStatus::MEDIA_WRITE_PROTECTED,
            DokanError::InvalidHandle(_) => NtStatus::INVALID_HANDLE,
            DokanError::TimedOut(_) => NtStatus::IO_TIMEOUT,
            DokanError::Unmounting | DokanError::NotMounted | DokanError::Cancelled => {
                NtStatus::INVALID_DEVICE_STATE
            }
            DokanError::InvalidArgument(_) => NtStatus::IO_DEVICE_ERROR,
            DokanError::Panic(_) => NtStatus::INTERNAL_ERROR,
            DokanError::Io(e) => io_error_to_ntstatus(e),
        }
    }

    /// The closed class the status falls into.
    pub fn class(&self) -> StatusClass {
        self.to_ntstatus().class()
    }
}

impl From<NtStatus> for DokanError {
    fn from(status: NtStatus) -> Self {
        DokanError::Status(status)
    }
}

/// Result type for filesystem callbacks.
pub type DokanResult<T> = Result<T, DokanError>;

/// Maps an IO error to the closest NTSTATUS by kind.
pub fn io_error_to_ntstatus(e: &io::Error) -> NtStatus {
    match e.kind() {
        io::ErrorKind::NotFound => NtStatus::OBJECT_NAME_NOT_FOUND,
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
            NtStatus::ACCESS_DENIED
        }
        io::ErrorKind::AlreadyExists => NtStatus::OBJECT_NAME_COLLISION,
        io::ErrorKind::InvalidInput => NtStatus::INVALID_PARAMETER,
        io::ErrorKind::InvalidFilename => NtStatus::OBJECT_NAME_INVALID,
        io::ErrorKind::TimedOut => NtStatus::IO_TIMEOUT,
        io::ErrorKind::Unsupported => NtStatus::NOT_SUPPORTED,
        io::ErrorKind::DirectoryNotEmpty => NtStatus::DIRECTORY_NOT_EMPTY,
        io::ErrorKind::IsADirectory => NtStatus::FILE_IS_A_DIRECTORY,
        io::ErrorKind::NotADirectory => NtStatus::NOT_A_DIRECTORY,
        io::ErrorKind::StorageFull => NtStatus::DISK_FULL,
        io::ErrorKind::QuotaExceeded => NtStatus::DISK_QUOTA_EXCEEDED,
        _ => NtStatus::IO_DEVICE_ERROR,
    }
}

/// Extension trait to convert errors to NTSTATUS.
pub trait ToNtStatus {
    /// Converts this error to an NTSTATUS value.
    fn to_ntstatus(&self) -> NtStatus;
}

impl ToNtStatus for DokanError {
    fn to_ntstatus(&self) -> NtStatus {
        DokanError::to_ntstatus(self)
    }
}

impl ToNtStatus for io::Error {
    fn to_ntstatus(&self) -> NtStatus {
        io_error_to_ntstatus(self)
    }
}

impl<T> ToNtStatus for DokanResult<T> {
    fn to_ntstatus(&self) -> NtStatus {
        match self {
            Ok(_) => NtStatus::SUCCESS,
            Err(e) => e.to_ntstatus(),
        }
    }
}

/// Errors from mounting or unmounting a volume.
#[derive(Debug, Error)]
pub enum MountError {
    /// `DOKAN_ERROR`
    #[error("Driver reported a generic error")]
    Driver,

    /// `DOKAN_DRIVE_LETTER_ERROR`
    #[error("Bad drive letter: {0}")]
    DriveLetter(String),

    /// `DOKAN_DRIVER_INSTALL_ERROR`
    #[error("Can't install driver")]
    DriverInstall,

    /// `DOKAN_START_ERROR`
    #[error("Driver failed to start")]
    Start,

    /// `DOKAN_MOUNT_ERROR`
    #[error("Can't assign a drive letter or mount point: {0}")]
    Mount(String),

    /// `DOKAN_MOUNT_POINT_ERROR`
    #[error("Mount point error: {0}")]
    MountPoint(String),

    /// `DOKAN_VERSION_ERROR`
    #[error("Driver version mismatch")]
    Version,

    /// Any other non-zero driver result.
    #[error("Driver returned non-zero result: {0}")]
    Unknown(i32),

    /// The configuration failed validation.
    #[error("Invalid mount configuration: {0}")]
    Config(String),

    /// The lifecycle state machine rejected the transition.
    #[error("Invalid lifecycle transition from {from:?} to {to:?}")]
    InvalidTransition { from: MountState, to: MountState },

    /// Attempted to unmount a volume that isn't mounted.
    #[error("Volume is not mounted")]
    NotMounted,

    /// Handles still referenced after the forced phase of unmount.
    #[error("Unmount failed: {handles} handle(s) still referenced")]
    Busy { handles: usize },

    /// The driver refused a change notification.
    #[error("Driver rejected notification for {0}")]
    NotifyRejected(String),
}

/// `DOKAN_SUCCESS`
pub const DOKAN_SUCCESS: i32 = 0;
/// `DOKAN_ERROR`
pub const DOKAN_ERROR: i32 = -1;
/// `DOKAN_DRIVE_LETTER_ERROR`
pub const DOKAN_DRIVE_LETTER_ERROR: i32 = -2;
/// `DOKAN_DRIVER_INSTALL_ERROR`
pub const DOKAN_DRIVER_INSTALL_ERROR: i32 = -3;
/// `DOKAN_START_ERROR`
pub const DOKAN_START_ERROR: i32 = -4;
/// `DOKAN_MOUNT_ERROR`
pub const DOKAN_MOUNT_ERROR: i32 = -5;
/// `DOKAN_MOUNT_POINT_ERROR`
pub const DOKAN_MOUNT_POINT_ERROR: i32 = -6;
/// `DOKAN_VERSION_ERROR`
pub const DOKAN_VERSION_ERROR: i32 = -7;

impl MountError {
    /// Interprets a `DokanCreateFileSystem` result code.
    pub fn check_driver_result(code: i32, mount_point: &str) -> Result<(), MountError> {
        match code {
            DOKAN_SUCCESS => Ok(()),
            DOKAN_ERROR => Err(MountError::Driver),
            DOKAN_DRIVE_LETTER_ERROR => Err(MountError::DriveLetter(mount_point.to_string())),
            DOKAN_DRIVER_INSTALL_ERROR => Err(MountError::DriverInstall),
            DOKAN_START_ERROR => Err(MountError::Start),
            DOKAN_MOUNT_ERROR => Err(MountError::Mount(mount_point.to_string())),
            DOKAN_MOUNT_POINT_ERROR => Err(MountError::MountPoint(mount_point.to_string())),
            DOKAN_VERSION_ERROR => Err(MountError::Version),
            other => Err(MountError::Unknown(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            DokanError::not_found("\\a").to_ntstatus(),
            NtStatus::OBJECT_NAME_NOT_FOUND
        );
        assert_eq!(
            DokanError::NotSupported(OperationKind::WriteFile).class(),
            StatusClass::NotSupported
        );
        assert_eq!(DokanError::WriteProtected.class(), StatusClass::AccessDenied);
        assert_eq!(
            DokanError::InvalidHandle(HandleId::from_raw(7)).class(),
            StatusClass::NotFound
        );
        assert_eq!(
            DokanError::TimedOut(Duration::from_millis(5)).class(),
            StatusClass::IoError
        );
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            DokanError::Panic("boom".into()).category(),
            ErrorCategory::Boundary
        );
        assert_eq!(DokanError::Panic("boom".into()).class(), StatusClass::IoError);
        assert_eq!(
            DokanError::InvalidArgument("null path").class(),
            StatusClass::IoError
        );
        assert_eq!(DokanError::Unmounting.category(), ErrorCategory::Lifecycle);
        assert_eq!(DokanError::Unmounting.class(), StatusClass::InvalidState);
        assert_eq!(DokanError::Cancelled.class(), StatusClass::InvalidState);
        assert_eq!(
            DokanError::access_denied("x").category(),
            ErrorCategory::Application
        );
    }

    #[test]
    fn test_io_error_mapping() {
        let e = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(e.to_ntstatus(), NtStatus::OBJECT_NAME_NOT_FOUND);
        let e = io::Error::from(io::ErrorKind::AlreadyExists);
        assert_eq!(e.to_ntstatus(), NtStatus::OBJECT_NAME_COLLISION);
        let e = io::Error::from(io::ErrorKind::DirectoryNotEmpty);
        assert_eq!(e.to_ntstatus(), NtStatus::DIRECTORY_NOT_EMPTY);
        let e = io::Error::other("disk on fire");
        assert_eq!(DokanError::from(e).to_ntstatus(), NtStatus::IO_DEVICE_ERROR);
    }

    #[test]
    fn test_result_to_ntstatus() {
        let ok: DokanResult<u32> = Ok(3);
        assert_eq!(ok.to_ntstatus(), NtStatus::SUCCESS);
        let err: DokanResult<u32> = Err(NtStatus::FILE_IS_A_DIRECTORY.into());
        assert_eq!(err.to_ntstatus(), NtStatus::FILE_IS_A_DIRECTORY);
    }

    #[test]
    fn test_driver_result_codes() {
        assert!(MountError::check_driver_result(DOKAN_SUCCESS, "M:\\").is_ok());
        assert!(matches!(
            MountError::check_driver_result(DOKAN_DRIVE_LETTER_ERROR, "M:\\"),
            Err(MountError::DriveLetter(p)) if p == "M:\\"
        ));
        assert!(matches!(
            MountError::check_driver_result(DOKAN_VERSION_ERROR, "M:\\"),
            Err(MountError::Version)
        ));
        assert!(matches!(
            MountError::check_driver_result(-42, "M:\\"),
            Err(MountError::Unknown(-42))
        ));
    }
}
