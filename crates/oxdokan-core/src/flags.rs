//! Flag sets and enums carried by driver callbacks.
//!
//! Values match the Windows DDK headers so raw `u32`s from the driver convert
//! losslessly with `from_bits_retain`.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::DokanError;
use crate::status::NtStatus;

bitflags! {
    /// `FILE_ATTRIBUTE_*` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0000_0001;
        const HIDDEN = 0x0000_0002;
        const SYSTEM = 0x0000_0004;
        const DIRECTORY = 0x0000_0010;
        const ARCHIVE = 0x0000_0020;
        const DEVICE = 0x0000_0040;
        const NORMAL = 0x0000_0080;
        const TEMPORARY = 0x0000_0100;
        const SPARSE_FILE = 0x0000_0200;
        const REPARSE_POINT = 0x0000_0400;
        const COMPRESSED = 0x0000_0800;
        const OFFLINE = 0x0000_1000;
        const NOT_CONTENT_INDEXED = 0x0000_2000;
        const ENCRYPTED = 0x0000_4000;
    }
}

bitflags! {
    /// `ACCESS_MASK` as requested in `ZwCreateFile`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMask: u32 {
        const FILE_READ_DATA = 0x0000_0001;
        const FILE_WRITE_DATA = 0x0000_0002;
        const FILE_APPEND_DATA = 0x0000_0004;
        const FILE_READ_EA = 0x0000_0008;
        const FILE_WRITE_EA = 0x0000_0010;
        const FILE_EXECUTE = 0x0000_0020;
        const FILE_DELETE_CHILD = 0x0000_0040;
        const FILE_READ_ATTRIBUTES = 0x0000_0080;
        const FILE_WRITE_ATTRIBUTES = 0x0000_0100;
        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const WRITE_OWNER = 0x0008_0000;
        const SYNCHRONIZE = 0x0010_0000;
        const ACCESS_SYSTEM_SECURITY = 0x0100_0000;
        const MAXIMUM_ALLOWED = 0x0200_0000;
        const GENERIC_ALL = 0x1000_0000;
        const GENERIC_EXECUTE = 0x2000_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_READ = 0x8000_0000;

        const FILE_GENERIC_READ = Self::READ_CONTROL.bits()
            | Self::FILE_READ_DATA.bits()
            | Self::FILE_READ_ATTRIBUTES.bits()
            | Self::FILE_READ_EA.bits()
            | Self::SYNCHRONIZE.bits();
        const FILE_GENERIC_WRITE = Self::READ_CONTROL.bits()
            | Self::FILE_WRITE_DATA.bits()
            | Self::FILE_WRITE_ATTRIBUTES.bits()
            | Self::FILE_WRITE_EA.bits()
            | Self::FILE_APPEND_DATA.bits()
            | Self::SYNCHRONIZE.bits();
        const FILE_GENERIC_EXECUTE = Self::READ_CONTROL.bits()
            | Self::FILE_READ_ATTRIBUTES.bits()
            | Self::FILE_EXECUTE.bits()
            | Self::SYNCHRONIZE.bits();
        const FILE_ALL_ACCESS = 0x001F_01FF;
    }
}

impl AccessMask {
    /// Expands `GENERIC_*` bits into file-specific rights.
    #[must_use]
    pub fn mapped(self) -> Self {
        let mut mapped = self
            - (Self::GENERIC_ALL | Self::GENERIC_READ | Self::GENERIC_WRITE | Self::GENERIC_EXECUTE);
        if self.contains(Self::GENERIC_READ) {
            mapped |= Self::FILE_GENERIC_READ;
        }
        if self.contains(Self::GENERIC_WRITE) {
            mapped |= Self::FILE_GENERIC_WRITE;
        }
        if self.contains(Self::GENERIC_EXECUTE) {
            mapped |= Self::FILE_GENERIC_EXECUTE;
        }
        if self.contains(Self::GENERIC_ALL) || self.contains(Self::MAXIMUM_ALLOWED) {
            mapped |= Self::FILE_ALL_ACCESS;
        }
        mapped
    }

    pub fn can_read(self) -> bool {
        self.mapped().intersects(Self::FILE_READ_DATA | Self::FILE_EXECUTE)
    }

    pub fn can_write(self) -> bool {
        self.mapped()
            .intersects(Self::FILE_WRITE_DATA | Self::FILE_APPEND_DATA)
    }

    pub fn can_delete(self) -> bool {
        self.mapped().contains(Self::DELETE)
    }

    /// True if the open takes part in share-access accounting.
    ///
    /// Opens that only read attributes or synchronise never conflict.
    pub fn has_data_access(self) -> bool {
        self.can_read() || self.can_write() || self.can_delete()
    }
}

bitflags! {
    /// `FILE_SHARE_*` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShareAccess: u32 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const DELETE = 0x0000_0004;
    }
}

bitflags! {
    /// `FILE_*` create options passed to `ZwCreateFile`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CreateOptions: u32 {
        const DIRECTORY_FILE = 0x0000_0001;
        const WRITE_THROUGH = 0x0000_0002;
        const SEQUENTIAL_ONLY = 0x0000_0004;
        const NO_INTERMEDIATE_BUFFERING = 0x0000_0008;
        const SYNCHRONOUS_IO_ALERT = 0x0000_0010;
        const SYNCHRONOUS_IO_NONALERT = 0x0000_0020;
        const NON_DIRECTORY_FILE = 0x0000_0040;
        const CREATE_TREE_CONNECTION = 0x0000_0080;
        const COMPLETE_IF_OPLOCKED = 0x0000_0100;
        const NO_EA_KNOWLEDGE = 0x0000_0200;
        const OPEN_REMOTE_INSTANCE = 0x0000_0400;
        const RANDOM_ACCESS = 0x0000_0800;
        const DELETE_ON_CLOSE = 0x0000_1000;
        const OPEN_BY_FILE_ID = 0x0000_2000;
        const OPEN_FOR_BACKUP_INTENT = 0x0000_4000;
        const NO_COMPRESSION = 0x0000_8000;
        const OPEN_REPARSE_POINT = 0x0020_0000;
        const OPEN_NO_RECALL = 0x0040_0000;
    }
}

bitflags! {
    /// `DOKAN_OPTION_*` mount flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        /// Enable driver debug output.
        const DEBUG = 1;
        /// Write debug output to stderr.
        const STDERR = 1 << 1;
        /// Enable alternate data streams (`name:stream`).
        const ALT_STREAM = 1 << 2;
        /// Mount read-only.
        const WRITE_PROTECT = 1 << 3;
        /// Mount as a network drive (requires a UNC name).
        const NETWORK = 1 << 4;
        /// Mount as removable media.
        const REMOVABLE = 1 << 5;
        /// Register with the Windows mount manager.
        const MOUNT_MANAGER = 1 << 6;
        /// Only visible in the current session.
        const CURRENT_SESSION = 1 << 7;
        /// Handle `LockFile`/`UnlockFile` in user mode.
        const FILELOCK_USER_MODE = 1 << 8;
        /// Case-sensitive names.
        const CASE_SENSITIVE = 1 << 9;
        /// Allow unmounting network drives from Explorer.
        const ENABLE_UNMOUNT_NETWORK_DRIVE = 1 << 10;
        /// Forward driver logs to user mode.
        const DISPATCH_DRIVER_LOGS = 1 << 11;
        /// Batch IPC round-trips.
        const ALLOW_IPC_BATCHING = 1 << 12;
    }
}

bitflags! {
    /// `FILE_FS_ATTRIBUTE_INFORMATION` flags reported by `GetVolumeInformation`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileSystemFlags: u32 {
        const CASE_SENSITIVE_SEARCH = 0x0000_0001;
        const CASE_PRESERVED_NAMES = 0x0000_0002;
        const UNICODE_ON_DISK = 0x0000_0004;
        const PERSISTENT_ACLS = 0x0000_0008;
        const FILE_COMPRESSION = 0x0000_0010;
        const VOLUME_QUOTAS = 0x0000_0020;
        const SUPPORTS_SPARSE_FILES = 0x0000_0040;
        const SUPPORTS_REPARSE_POINTS = 0x0000_0080;
        const SUPPORTS_REMOTE_STORAGE = 0x0000_0100;
        const RETURNS_CLEANUP_RESULT_INFO = 0x0000_0200;
        const SUPPORTS_POSIX_UNLINK_RENAME = 0x0000_0400;
        const VOLUME_IS_COMPRESSED = 0x0000_8000;
        const SUPPORTS_OBJECT_IDS = 0x0001_0000;
        const SUPPORTS_ENCRYPTION = 0x0002_0000;
        const NAMED_STREAMS = 0x0004_0000;
        const READ_ONLY_VOLUME = 0x0008_0000;
        const SEQUENTIAL_WRITE_ONCE = 0x0010_0000;
        const SUPPORTS_TRANSACTIONS = 0x0020_0000;
        const SUPPORTS_HARD_LINKS = 0x0040_0000;
        const SUPPORTS_EXTENDED_ATTRIBUTES = 0x0080_0000;
        const SUPPORTS_OPEN_BY_FILE_ID = 0x0100_0000;
        const SUPPORTS_USN_JOURNAL = 0x0200_0000;
        const SUPPORTS_INTEGRITY_STREAMS = 0x0400_0000;
        const SUPPORTS_BLOCK_REFCOUNTING = 0x0800_0000;
        const SUPPORTS_SPARSE_VDL = 0x1000_0000;
        const DAX_VOLUME = 0x2000_0000;
        const SUPPORTS_GHOSTING = 0x4000_0000;
    }
}

// Mount flags travel through JSON config as their raw bits.
impl Serialize for MountFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for MountFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        MountFlags::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown mount flag bits {bits:#x}")))
    }
}

/// What `ZwCreateFile` does depending on whether the target exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CreateDisposition {
    /// Replace if it exists, create otherwise.
    Supersede = 0,
    /// Open if it exists, fail otherwise.
    Open = 1,
    /// Fail if it exists, create otherwise.
    Create = 2,
    /// Open if it exists, create otherwise.
    OpenIf = 3,
    /// Overwrite if it exists, fail otherwise.
    Overwrite = 4,
    /// Overwrite if it exists, create otherwise.
    OverwriteIf = 5,
}

impl CreateDisposition {
    /// True if the disposition may create a new entry.
    pub fn may_create(self) -> bool {
        matches!(
            self,
            Self::Supersede | Self::Create | Self::OpenIf | Self::OverwriteIf
        )
    }

    /// True if an existing file's contents are discarded.
    pub fn truncates(self) -> bool {
        matches!(self, Self::Supersede | Self::Overwrite | Self::OverwriteIf)
    }
}

impl TryFrom<u32> for CreateDisposition {
    type Error = DokanError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Supersede),
            1 => Ok(Self::Open),
            2 => Ok(Self::Create),
            3 => Ok(Self::OpenIf),
            4 => Ok(Self::Overwrite),
            5 => Ok(Self::OverwriteIf),
            _ => Err(DokanError::Status(NtStatus::INVALID_PARAMETER)),
        }
    }
}

impl fmt::Display for CreateDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Supersede => "FILE_SUPERSEDE",
            Self::Open => "FILE_OPEN",
            Self::Create => "FILE_CREATE",
            Self::OpenIf => "FILE_OPEN_IF",
            Self::Overwrite => "FILE_OVERWRITE",
            Self::OverwriteIf => "FILE_OVERWRITE_IF",
        };
        f.write_str(name)
    }
}
