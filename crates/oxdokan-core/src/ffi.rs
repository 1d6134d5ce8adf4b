//! `#[repr(C)]` mirrors of the Dokan structures crossing the native boundary,
//! and conversions to and from the owned records in [`crate::info`].
//!
//! Layouts follow `dokan.h` / `fileinfo.h` of the 2.x interface.

use std::ffi::c_void;
use std::fmt;
use std::ptr;

use widestring::{U16CStr, U16CString};

use crate::error::{DokanError, DokanResult};
use crate::flags::FileAttributes;
use crate::info::{FileInformation, FindData, StreamData, from_filetime, to_filetime};
use crate::path::MAX_PATH;
use crate::status::NtStatus;

/// `VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE`.
pub const VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE: usize = 1024 * 16;

/// Capacity of `WIN32_FIND_STREAM_DATA.cStreamName`.
pub const MAX_STREAM_NAME: usize = MAX_PATH + 36;

/// `FILETIME`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFileTime {
    pub low_date_time: u32,
    pub high_date_time: u32,
}

impl RawFileTime {
    pub fn from_u64(value: u64) -> Self {
        Self {
            low_date_time: value as u32,
            high_date_time: (value >> 32) as u32,
        }
    }

    pub fn to_u64(self) -> u64 {
        (u64::from(self.high_date_time) << 32) | u64::from(self.low_date_time)
    }
}

fn split(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

fn join(high: u32, low: u32) -> u64 {
    (u64::from(high) << 32) | u64::from(low)
}

/// `DOKAN_OPTIONS`.
#[repr(C)]
pub struct RawOptions {
    pub version: u16,
    pub single_thread: u8,
    pub options: u32,
    /// Set by the mounter; identifies the session in every callback.
    pub global_context: u64,
    pub mount_point: *const u16,
    pub unc_name: *const u16,
    /// Milliseconds.
    pub timeout: u32,
    pub allocation_unit_size: u32,
    pub sector_size: u32,
    pub volume_security_descriptor_length: u32,
    pub volume_security_descriptor: [u8; VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE],
}

// SAFETY: the string pointers are only read, and the owner of a `RawOptions`
// keeps the strings they point at alive for as long as the options exist.
unsafe impl Send for RawOptions {}
// SAFETY: see above; nothing mutates through the pointers.
unsafe impl Sync for RawOptions {}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            version: 0,
            single_thread: 0,
            options: 0,
            global_context: 0,
            mount_point: ptr::null(),
            unc_name: ptr::null(),
            timeout: 0,
            allocation_unit_size: 0,
            sector_size: 0,
            volume_security_descriptor_length: 0,
            volume_security_descriptor: [0; VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE],
        }
    }
}

impl fmt::Debug for RawOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawOptions")
            .field("version", &self.version)
            .field("single_thread", &self.single_thread)
            .field("options", &format_args!("{:#x}", self.options))
            .field("global_context", &self.global_context)
            .field("timeout", &self.timeout)
            .field("allocation_unit_size", &self.allocation_unit_size)
            .field("sector_size", &self.sector_size)
            .finish_non_exhaustive()
    }
}

/// `DOKAN_FILE_INFO`.
#[repr(C)]
#[derive(Debug)]
pub struct RawFileInfo {
    /// Per-open word; holds the handle id.
    pub context: u64,
    /// Reserved for the driver.
    pub dokan_context: u64,
    pub dokan_options: *mut RawOptions,
    pub processing_context: *mut c_void,
    pub process_id: u32,
    pub is_directory: u8,
    pub delete_on_close: u8,
    pub paging_io: u8,
    pub synchronous_io: u8,
    pub no_cache: u8,
    pub write_to_end_of_file: u8,
}

impl RawFileInfo {
    pub fn new(options: *mut RawOptions) -> Self {
        Self {
            context: 0,
            dokan_context: 0,
            dokan_options: options,
            processing_context: ptr::null_mut(),
            process_id: 0,
            is_directory: 0,
            delete_on_close: 0,
            paging_io: 0,
            synchronous_io: 0,
            no_cache: 0,
            write_to_end_of_file: 0,
        }
    }
}

/// `BY_HANDLE_FILE_INFORMATION`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFileInformation {
    pub file_attributes: u32,
    pub creation_time: RawFileTime,
    pub last_access_time: RawFileTime,
    pub last_write_time: RawFileTime,
    pub volume_serial_number: u32,
    pub file_size_high: u32,
    pub file_size_low: u32,
    pub number_of_links: u32,
    pub file_index_high: u32,
    pub file_index_low: u32,
}

impl RawFileInformation {
    pub fn from_info(info: &FileInformation, volume_serial_number: u32) -> Self {
        let (file_size_high, file_size_low) = split(info.file_size);
        let (file_index_high, file_index_low) = split(info.file_index);
        Self {
            file_attributes: info.attributes.bits(),
            creation_time: RawFileTime::from_u64(to_filetime(info.creation_time)),
            last_access_time: RawFileTime::from_u64(to_filetime(info.last_access_time)),
            last_write_time: RawFileTime::from_u64(to_filetime(info.last_write_time)),
            volume_serial_number,
            file_size_high,
            file_size_low,
            number_of_links: info.number_of_links,
            file_index_high,
            file_index_low,
        }
    }

    pub fn to_info(&self) -> FileInformation {
        FileInformation {
            attributes: FileAttributes::from_bits_retain(self.file_attributes),
            creation_time: filetime_or_epoch(self.creation_time),
            last_access_time: filetime_or_epoch(self.last_access_time),
            last_write_time: filetime_or_epoch(self.last_write_time),
            file_size: join(self.file_size_high, self.file_size_low),
            number_of_links: self.number_of_links,
            file_index: join(self.file_index_high, self.file_index_low),
        }
    }
}

fn filetime_or_epoch(time: RawFileTime) -> std::time::SystemTime {
    from_filetime(time.to_u64()).unwrap_or(std::time::UNIX_EPOCH)
}

/// Copy `value` into a fixed UTF-16 buffer with a terminating NUL.
///
/// Fails with `STATUS_NAME_TOO_LONG` if it does not fit.
pub fn encode_fixed(value: &str, buffer: &mut [u16]) -> DokanResult<()> {
    let wide = U16CString::from_str(value).map_err(|_| DokanError::Status(NtStatus::OBJECT_NAME_INVALID))?;
    let units = wide.as_slice_with_nul();
    if units.len() > buffer.len() {
        return Err(DokanError::Status(NtStatus::NAME_TOO_LONG));
    }
    buffer[..units.len()].copy_from_slice(units);
    buffer[units.len()..].fill(0);
    Ok(())
}

/// Copy `value` into a buffer, truncating to fit, always NUL-terminated.
pub fn encode_truncating(value: &str, buffer: &mut [u16]) {
    let Some(capacity) = buffer.len().checked_sub(1) else {
        return;
    };
    let mut written = 0;
    for unit in value.encode_utf16().take(capacity) {
        buffer[written] = unit;
        written += 1;
    }
    buffer[written] = 0;
}

fn decode_fixed(buffer: &[u16]) -> String {
    U16CStr::from_slice_truncate(buffer)
        .map(U16CStr::to_string_lossy)
        .unwrap_or_default()
}

/// `WIN32_FIND_DATAW`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawFindData {
    pub file_attributes: u32,
    pub creation_time: RawFileTime,
    pub last_access_time: RawFileTime,
    pub last_write_time: RawFileTime,
    pub file_size_high: u32,
    pub file_size_low: u32,
    pub reserved0: u32,
    pub reserved1: u32,
    pub file_name: [u16; MAX_PATH],
    pub alternate_file_name: [u16; 14],
}

impl RawFindData {
    /// Names must fit `MAX_PATH - 1` UTF-16 units.
    pub fn from_find_data(entry: &FindData) -> DokanResult<Self> {
        let (file_size_high, file_size_low) = split(entry.file_size);
        let mut raw = Self {
            file_attributes: entry.attributes.bits(),
            creation_time: RawFileTime::from_u64(to_filetime(entry.creation_time)),
            last_access_time: RawFileTime::from_u64(to_filetime(entry.last_access_time)),
            last_write_time: RawFileTime::from_u64(to_filetime(entry.last_write_time)),
            file_size_high,
            file_size_low,
            reserved0: 0,
            reserved1: 0,
            file_name: [0; MAX_PATH],
            alternate_file_name: [0; 14],
        };
        encode_fixed(&entry.file_name, &mut raw.file_name)?;
        Ok(raw)
    }

    pub fn to_find_data(&self) -> FindData {
        FindData {
            file_name: decode_fixed(&self.file_name),
            attributes: FileAttributes::from_bits_retain(self.file_attributes),
            creation_time: filetime_or_epoch(self.creation_time),
            last_access_time: filetime_or_epoch(self.last_access_time),
            last_write_time: filetime_or_epoch(self.last_write_time),
            file_size: join(self.file_size_high, self.file_size_low),
        }
    }
}

impl fmt::Debug for RawFindData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFindData")
            .field("file_name", &decode_fixed(&self.file_name))
            .field("file_attributes", &format_args!("{:#x}", self.file_attributes))
            .finish_non_exhaustive()
    }
}

/// `WIN32_FIND_STREAM_DATA`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawStreamData {
    pub stream_size: i64,
    pub stream_name: [u16; MAX_STREAM_NAME],
}

impl RawStreamData {
    pub fn from_stream_data(entry: &StreamData) -> DokanResult<Self> {
        let mut raw = Self {
            stream_size: entry.stream_size,
            stream_name: [0; MAX_STREAM_NAME],
        };
        encode_fixed(&entry.stream_name, &mut raw.stream_name)?;
        Ok(raw)
    }

    pub fn to_stream_data(&self) -> StreamData {
        StreamData {
            stream_name: decode_fixed(&self.stream_name),
            stream_size: self.stream_size,
        }
    }
}

impl fmt::Debug for RawStreamData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStreamData")
            .field("stream_name", &decode_fixed(&self.stream_name))
            .field("stream_size", &self.stream_size)
            .finish()
    }
}

/// `PFillFindData`; returns 1 when the driver buffer is full.
pub type FillFindDataFn = unsafe extern "system" fn(*mut RawFindData, *mut RawFileInfo) -> i32;

/// `PFillFindStreamData`; returns 0 when the driver buffer is full.
pub type FillFindStreamDataFn = unsafe extern "system" fn(*mut RawStreamData, *mut c_void) -> i32;

pub type ZwCreateFileFn =
    unsafe extern "system" fn(*const u16, *mut c_void, u32, u32, u32, u32, u32, *mut RawFileInfo) -> i32;
pub type NotifyFn = unsafe extern "system" fn(*const u16, *mut RawFileInfo);
pub type FileFn = unsafe extern "system" fn(*const u16, *mut RawFileInfo) -> i32;
pub type ReadFileFn = unsafe extern "system" fn(*const u16, *mut c_void, u32, *mut u32, i64, *mut RawFileInfo) -> i32;
pub type WriteFileFn =
    unsafe extern "system" fn(*const u16, *const c_void, u32, *mut u32, i64, *mut RawFileInfo) -> i32;
pub type GetFileInformationFn =
    unsafe extern "system" fn(*const u16, *mut RawFileInformation, *mut RawFileInfo) -> i32;
pub type FindFilesFn = unsafe extern "system" fn(*const u16, Option<FillFindDataFn>, *mut RawFileInfo) -> i32;
pub type FindFilesWithPatternFn =
    unsafe extern "system" fn(*const u16, *const u16, Option<FillFindDataFn>, *mut RawFileInfo) -> i32;
pub type SetFileAttributesFn = unsafe extern "system" fn(*const u16, u32, *mut RawFileInfo) -> i32;
pub type SetFileTimeFn = unsafe extern "system" fn(
    *const u16,
    *const RawFileTime,
    *const RawFileTime,
    *const RawFileTime,
    *mut RawFileInfo,
) -> i32;
pub type MoveFileFn = unsafe extern "system" fn(*const u16, *const u16, i32, *mut RawFileInfo) -> i32;
pub type SetSizeFn = unsafe extern "system" fn(*const u16, i64, *mut RawFileInfo) -> i32;
pub type LockFn = unsafe extern "system" fn(*const u16, i64, i64, *mut RawFileInfo) -> i32;
pub type GetDiskFreeSpaceFn = unsafe extern "system" fn(*mut u64, *mut u64, *mut u64, *mut RawFileInfo) -> i32;
pub type GetVolumeInformationFn = unsafe extern "system" fn(
    *mut u16,
    u32,
    *mut u32,
    *mut u32,
    *mut u32,
    *mut u16,
    u32,
    *mut RawFileInfo,
) -> i32;
pub type MountedFn = unsafe extern "system" fn(*const u16, *mut RawFileInfo) -> i32;
pub type UnmountedFn = unsafe extern "system" fn(*mut RawFileInfo) -> i32;
pub type GetFileSecurityFn =
    unsafe extern "system" fn(*const u16, *mut u32, *mut c_void, u32, *mut u32, *mut RawFileInfo) -> i32;
pub type SetFileSecurityFn = unsafe extern "system" fn(*const u16, *mut u32, *mut c_void, u32, *mut RawFileInfo) -> i32;
pub type FindStreamsFn =
    unsafe extern "system" fn(*const u16, Option<FillFindStreamDataFn>, *mut c_void, *mut RawFileInfo) -> i32;

/// `DOKAN_OPERATIONS`: one optional entry per callback, in driver order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DokanOperations {
    pub zw_create_file: Option<ZwCreateFileFn>,
    pub cleanup: Option<NotifyFn>,
    pub close_file: Option<NotifyFn>,
    pub read_file: Option<ReadFileFn>,
    pub write_file: Option<WriteFileFn>,
    pub flush_file_buffers: Option<FileFn>,
    pub get_file_information: Option<GetFileInformationFn>,
    pub find_files: Option<FindFilesFn>,
    pub find_files_with_pattern: Option<FindFilesWithPatternFn>,
    pub set_file_attributes: Option<SetFileAttributesFn>,
    pub set_file_time: Option<SetFileTimeFn>,
    pub delete_file: Option<FileFn>,
    pub delete_directory: Option<FileFn>,
    pub move_file: Option<MoveFileFn>,
    pub set_end_of_file: Option<SetSizeFn>,
    pub set_allocation_size: Option<SetSizeFn>,
    pub lock_file: Option<LockFn>,
    pub unlock_file: Option<LockFn>,
    pub get_disk_free_space: Option<GetDiskFreeSpaceFn>,
    pub get_volume_information: Option<GetVolumeInformationFn>,
    pub mounted: Option<MountedFn>,
    pub unmounted: Option<UnmountedFn>,
    pub get_file_security: Option<GetFileSecurityFn>,
    pub set_file_security: Option<SetFileSecurityFn>,
    pub find_streams: Option<FindStreamsFn>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_layouts_match_windows_headers() {
        assert_eq!(size_of::<RawFileTime>(), 8);
        assert_eq!(size_of::<RawFileInformation>(), 52);
        assert_eq!(size_of::<RawFindData>(), 592);
        assert_eq!(size_of::<RawStreamData>(), 8 + 2 * MAX_STREAM_NAME);
        assert_eq!(size_of::<DokanOperations>(), 25 * size_of::<usize>());
        assert_eq!(offset_of!(RawOptions, global_context), 8);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(offset_of!(RawFileInfo, process_id), 32);
    }

    #[test]
    fn test_filetime_halves() {
        let time = RawFileTime::from_u64(0x0123_4567_89AB_CDEF);
        assert_eq!(time.high_date_time, 0x0123_4567);
        assert_eq!(time.low_date_time, 0x89AB_CDEF);
        assert_eq!(time.to_u64(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn test_file_information_round_trip() {
        let info = FileInformation {
            attributes: FileAttributes::ARCHIVE,
            creation_time: UNIX_EPOCH + Duration::from_secs(1_000),
            last_access_time: UNIX_EPOCH + Duration::from_secs(2_000),
            last_write_time: UNIX_EPOCH + Duration::from_secs(3_000),
            file_size: (5 << 32) | 7,
            number_of_links: 1,
            file_index: 42,
        };
        let raw = RawFileInformation::from_info(&info, 0x1983_1116);
        assert_eq!(raw.file_size_high, 5);
        assert_eq!(raw.file_size_low, 7);
        assert_eq!(raw.to_info(), info);
    }

    #[test]
    fn test_find_data_rejects_long_names() {
        let mut entry = FindData {
            file_name: "a".repeat(MAX_PATH - 1),
            attributes: FileAttributes::NORMAL,
            creation_time: UNIX_EPOCH,
            last_access_time: UNIX_EPOCH,
            last_write_time: UNIX_EPOCH,
            file_size: 0,
        };
        assert!(RawFindData::from_find_data(&entry).is_ok());

        entry.file_name.push('a');
        let err = RawFindData::from_find_data(&entry).unwrap_err();
        assert_eq!(err.to_ntstatus(), NtStatus::NAME_TOO_LONG);
    }

    #[test]
    fn test_find_data_name_round_trip() {
        let entry = FindData {
            file_name: "résumé.txt".to_string(),
            attributes: FileAttributes::ARCHIVE,
            creation_time: UNIX_EPOCH,
            last_access_time: UNIX_EPOCH,
            last_write_time: UNIX_EPOCH,
            file_size: 12,
        };
        let raw = RawFindData::from_find_data(&entry).unwrap();
        assert_eq!(raw.to_find_data(), entry);
    }

    #[test]
    fn test_encode_truncating() {
        let mut buffer = [0xFFFF_u16; 4];
        encode_truncating("DOKAN", &mut buffer);
        assert_eq!(buffer, [u16::from(b'D'), u16::from(b'O'), u16::from(b'K'), 0]);

        let mut empty: [u16; 0] = [];
        encode_truncating("x", &mut empty);
    }
}
