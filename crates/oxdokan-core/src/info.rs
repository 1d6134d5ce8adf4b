//! Records filesystems return to the driver: per-file information, directory
//! entries, stream entries, volume information and disk space.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::flags::{FileAttributes, FileSystemFlags};

/// 100ns intervals between 1601-01-01 and 1970-01-01.
pub const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// Converts a `SystemTime` into a Windows FILETIME value.
///
/// Times before 1601 clamp to zero.
pub fn to_filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => FILETIME_UNIX_EPOCH.saturating_add(hundred_nanos(since)),
        Err(before) => FILETIME_UNIX_EPOCH.saturating_sub(hundred_nanos(before.duration())),
    }
}

/// Converts a FILETIME back into a `SystemTime`.
///
/// Zero means "not specified" in `SetFileTime` and yields `None`.
pub fn from_filetime(filetime: u64) -> Option<SystemTime> {
    if filetime == 0 {
        return None;
    }
    let time = if filetime >= FILETIME_UNIX_EPOCH {
        UNIX_EPOCH + from_hundred_nanos(filetime - FILETIME_UNIX_EPOCH)
    } else {
        UNIX_EPOCH - from_hundred_nanos(FILETIME_UNIX_EPOCH - filetime)
    };
    Some(time)
}

fn hundred_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos() / 100).unwrap_or(u64::MAX)
}

fn from_hundred_nanos(units: u64) -> Duration {
    Duration::new(units / 10_000_000, ((units % 10_000_000) * 100) as u32)
}

/// `BY_HANDLE_FILE_INFORMATION` in owned form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInformation {
    pub attributes: FileAttributes,
    pub creation_time: SystemTime,
    pub last_access_time: SystemTime,
    pub last_write_time: SystemTime,
    pub file_size: u64,
    pub number_of_links: u32,
    /// Stable per-volume file identifier.
    pub file_index: u64,
}

impl FileInformation {
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }
}

/// One directory entry (`WIN32_FIND_DATAW`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindData {
    pub file_name: String,
    pub attributes: FileAttributes,
    pub creation_time: SystemTime,
    pub last_access_time: SystemTime,
    pub last_write_time: SystemTime,
    pub file_size: u64,
}

impl FindData {
    /// Builds an entry for `name` from its file information.
    pub fn from_info(name: impl Into<String>, info: &FileInformation) -> Self {
        Self {
            file_name: name.into(),
            attributes: info.attributes,
            creation_time: info.creation_time,
            last_access_time: info.last_access_time,
            last_write_time: info.last_write_time,
            file_size: info.file_size,
        }
    }
}

/// One alternate data stream (`WIN32_FIND_STREAM_DATA`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData {
    /// `:name:$DATA` form.
    pub stream_name: String,
    pub stream_size: i64,
}

/// Times passed to `SetFileTime`; `None` leaves a field unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTimes {
    pub creation_time: Option<SystemTime>,
    pub last_access_time: Option<SystemTime>,
    pub last_write_time: Option<SystemTime>,
}

/// Answer to `GetVolumeInformation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInformation {
    /// Keep under 32 characters; Explorer truncates longer labels.
    pub volume_name: String,
    pub serial_number: u32,
    pub max_component_length: u32,
    pub file_system_flags: FileSystemFlags,
    /// Windows probes features by name; `NTFS` is the safe choice.
    pub file_system_name: String,
}

impl Default for VolumeInformation {
    fn default() -> Self {
        Self {
            volume_name: "DOKAN".to_string(),
            serial_number: 0x1983_1116,
            max_component_length: 255,
            file_system_flags: FileSystemFlags::CASE_PRESERVED_NAMES
                | FileSystemFlags::UNICODE_ON_DISK
                | FileSystemFlags::SUPPORTS_REMOTE_STORAGE,
            file_system_name: "NTFS".to_string(),
        }
    }
}

/// Answer to `GetDiskFreeSpace`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSpace {
    pub free_bytes_available: u64,
    pub total_bytes: u64,
    pub total_free_bytes: u64,
}
