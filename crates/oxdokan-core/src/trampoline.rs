//! Native entry points registered with the driver.
//!
//! Each `extern "system"` function decodes its raw arguments into a
//! [`CallbackRequest`], hands it to the session's [`Dispatcher`] and writes the
//! reply back through the driver's out-pointers. The session is found through
//! `DOKAN_OPTIONS.GlobalContext`, which holds a [`SessionId`] registered in a
//! process-wide table of weak references.
//!
//! No panic crosses this boundary: every entry point runs inside
//! `catch_unwind` and reports a panic as `STATUS_INTERNAL_ERROR`.

use std::ffi::c_void;
use std::fmt;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::{debug, error};
use widestring::U16CStr;

use crate::dispatch::{Dispatcher, panic_message};
use crate::driver::{NativeDriver, TimeoutReset};
use crate::error::{DokanError, DokanResult, ErrorCategory};
use crate::ffi::{
    DokanOperations, FillFindDataFn, FillFindStreamDataFn, RawFileInfo, RawFileInformation,
    RawFileTime, RawFindData, RawStreamData, encode_truncating,
};
use crate::flags::{AccessMask, CreateDisposition, CreateOptions, FileAttributes, MountFlags, ShareAccess};
use crate::handle_table::HandleId;
use crate::info::{FileTimes, FindData, StreamData, from_filetime};
use crate::path::DokanPath;
use crate::request::{CallbackRequest, CreateRequest, OperationKind, OperationSet, Payload, Reply, RequestFlags};
use crate::status::NtStatus;

/// What a `GlobalContext` value leads back to.
struct Registration {
    dispatcher: Weak<Dispatcher>,
    driver: Weak<dyn NativeDriver>,
}

static SESSIONS: Lazy<DashMap<u64, Registration>> = Lazy::new(DashMap::new);
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a mounted session, passed to the driver as
/// `GlobalContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Make `dispatcher` reachable from native callbacks served by `driver`.
pub fn register(dispatcher: &Arc<Dispatcher>, driver: &Arc<dyn NativeDriver>) -> SessionId {
    let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
    SESSIONS.insert(
        id,
        Registration {
            dispatcher: Arc::downgrade(dispatcher),
            driver: Arc::downgrade(driver),
        },
    );
    SessionId(id)
}

pub fn deregister(id: SessionId) {
    SESSIONS.remove(&id.0);
}

/// Look up a live session by its `GlobalContext` value.
pub fn resolve(global_context: u64) -> Option<Arc<Dispatcher>> {
    SESSIONS
        .get(&global_context)
        .and_then(|entry| entry.value().dispatcher.upgrade())
}

fn resolve_driver(global_context: u64) -> Option<Arc<dyn NativeDriver>> {
    SESSIONS
        .get(&global_context)
        .and_then(|entry| entry.value().driver.upgrade())
}

/// The driver table exposing only `operations`.
pub fn operations_for(operations: OperationSet) -> DokanOperations {
    let mut table = DokanOperations::default();
    for kind in operations.iter() {
        match kind {
            OperationKind::CreateFile => table.zw_create_file = Some(zw_create_file),
            OperationKind::Cleanup => table.cleanup = Some(cleanup),
            OperationKind::CloseFile => table.close_file = Some(close_file),
            OperationKind::ReadFile => table.read_file = Some(read_file),
            OperationKind::WriteFile => table.write_file = Some(write_file),
            OperationKind::FlushFileBuffers => table.flush_file_buffers = Some(flush_file_buffers),
            OperationKind::GetFileInformation => table.get_file_information = Some(get_file_information),
            OperationKind::FindFiles => table.find_files = Some(find_files),
            OperationKind::FindFilesWithPattern => {
                table.find_files_with_pattern = Some(find_files_with_pattern);
            }
            OperationKind::SetFileAttributes => table.set_file_attributes = Some(set_file_attributes),
            OperationKind::SetFileTime => table.set_file_time = Some(set_file_time),
            OperationKind::DeleteFile => table.delete_file = Some(delete_file),
            OperationKind::DeleteDirectory => table.delete_directory = Some(delete_directory),
            OperationKind::MoveFile => table.move_file = Some(move_file),
            OperationKind::SetEndOfFile => table.set_end_of_file = Some(set_end_of_file),
            OperationKind::SetAllocationSize => table.set_allocation_size = Some(set_allocation_size),
            OperationKind::LockFile => table.lock_file = Some(lock_file),
            OperationKind::UnlockFile => table.unlock_file = Some(unlock_file),
            OperationKind::GetDiskFreeSpace => table.get_disk_free_space = Some(get_disk_free_space),
            OperationKind::GetVolumeInformation => {
                table.get_volume_information = Some(get_volume_information);
            }
            OperationKind::Mounted => table.mounted = Some(mounted),
            OperationKind::Unmounted => table.unmounted = Some(unmounted),
            OperationKind::GetFileSecurity => table.get_file_security = Some(get_file_security),
            OperationKind::SetFileSecurity => table.set_file_security = Some(set_file_security),
            OperationKind::FindStreams => table.find_streams = Some(find_streams),
        }
    }
    table
}

fn complete(kind: OperationKind, result: DokanResult<()>) -> i32 {
    match result {
        Ok(()) => NtStatus::SUCCESS.into(),
        Err(e) => {
            if e.category() == ErrorCategory::Boundary {
                debug!(op = %kind, error = %e, "Rejected malformed callback");
            }
            e.to_ntstatus().into()
        }
    }
}

macro_rules! catch_panic {
    ($kind:expr, $body:block) => {
        match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| -> DokanResult<()> { $body })) {
            Ok(result) => complete($kind, result),
            Err(payload) => {
                error!(op = %$kind, message = %panic_message(&*payload), "Panic at the native boundary");
                NtStatus::INTERNAL_ERROR.into()
            }
        }
    };
}

fn mismatched(kind: OperationKind, reply: &Reply) -> DokanError {
    error!(op = %kind, ?reply, "Dispatcher returned a reply of the wrong shape");
    DokanError::Status(NtStatus::INTERNAL_ERROR)
}

fn offset_arg(value: i64) -> DokanResult<u64> {
    u64::try_from(value).map_err(|_| DokanError::Status(NtStatus::INVALID_PARAMETER))
}

/// # Safety
/// `ptr` must be null or valid for writes of `T`.
unsafe fn write_out<T>(ptr: *mut T, value: T) {
    // SAFETY: caller contract.
    if let Some(slot) = unsafe { ptr.as_mut() } {
        *slot = value;
    }
}

/// # Safety
/// `ptr` must be null or valid for `len` bytes of reads and writes.
unsafe fn buffer_mut<'a>(ptr: *mut c_void, len: u32) -> DokanResult<&'a mut [u8]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if ptr.is_null() {
        return Err(DokanError::InvalidArgument("null buffer"));
    }
    // SAFETY: caller contract; non-null and `len` bytes long.
    Ok(unsafe { slice::from_raw_parts_mut(ptr.cast::<u8>(), len as usize) })
}

/// # Safety
/// `ptr` must be null or valid for `len` bytes of reads.
unsafe fn buffer_ref<'a>(ptr: *const c_void, len: u32) -> DokanResult<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(DokanError::InvalidArgument("null buffer"));
    }
    // SAFETY: caller contract; non-null and `len` bytes long.
    Ok(unsafe { slice::from_raw_parts(ptr.cast::<u8>(), len as usize) })
}

/// # Safety
/// `ptr` must be null or point to a valid `FILETIME`.
unsafe fn requested_time(ptr: *const RawFileTime) -> Option<SystemTime> {
    // SAFETY: caller contract.
    let value = unsafe { ptr.as_ref() }?.to_u64();
    // All-ones values ask the file system to stop or resume automatic updates.
    if value >= u64::MAX - 1 {
        return None;
    }
    from_filetime(value)
}

/// Decoded `DOKAN_FILE_INFO` for one callback.
struct Call {
    session: Arc<Dispatcher>,
    driver: Option<Arc<dyn NativeDriver>>,
    info: *mut RawFileInfo,
    context: u64,
    process_id: u32,
    flags: RequestFlags,
    mount_flags: MountFlags,
}

impl Call {
    /// # Safety
    /// `info` must be null or point to a valid `DOKAN_FILE_INFO` whose options
    /// pointer is null or valid.
    unsafe fn enter(info: *mut RawFileInfo) -> DokanResult<Self> {
        // SAFETY: caller contract.
        let raw = unsafe { info.as_ref() }.ok_or(DokanError::InvalidArgument("null DOKAN_FILE_INFO"))?;
        // SAFETY: the driver keeps its options alive while the volume is mounted.
        let options =
            unsafe { raw.dokan_options.as_ref() }.ok_or(DokanError::InvalidArgument("null DOKAN_OPTIONS"))?;
        let session = resolve(options.global_context).ok_or(DokanError::NotMounted)?;

        let mut flags = RequestFlags::empty();
        flags.set(RequestFlags::PAGING_IO, raw.paging_io != 0);
        flags.set(RequestFlags::SYNCHRONOUS_IO, raw.synchronous_io != 0);
        flags.set(RequestFlags::NO_CACHE, raw.no_cache != 0);
        flags.set(RequestFlags::WRITE_TO_END_OF_FILE, raw.write_to_end_of_file != 0);

        Ok(Self {
            session,
            driver: resolve_driver(options.global_context),
            info,
            context: raw.context,
            process_id: raw.process_id,
            flags,
            mount_flags: MountFlags::from_bits_truncate(options.options),
        })
    }

    /// # Safety
    /// `raw` must be null or a NUL-terminated UTF-16 string.
    unsafe fn path(&self, raw: *const u16) -> DokanResult<DokanPath> {
        if raw.is_null() {
            return Err(DokanError::InvalidArgument("null file name"));
        }
        // SAFETY: caller contract.
        let wide = unsafe { U16CStr::from_ptr_str(raw) };
        let name = wide
            .to_string()
            .map_err(|_| DokanError::InvalidArgument("file name is not valid UTF-16"))?;
        if self.mount_flags.contains(MountFlags::ALT_STREAM) {
            DokanPath::parse_with_streams(&name)
        } else {
            DokanPath::parse(&name)
        }
    }

    fn dispatch(&self, path: DokanPath, payload: Payload<'_>) -> DokanResult<Reply> {
        let mut request = CallbackRequest::new(self.session.next_request_id(), path, payload)
            .with_flags(self.flags)
            .with_process_id(self.process_id);
        if let Some(driver) = &self.driver {
            request = request.with_timeout_reset(TimeoutReset::new(Arc::clone(driver), self.info));
        }
        if self.context != 0 {
            request = request.with_handle(HandleId::from_raw(self.context));
        }
        self.session.dispatch(request)
    }

    fn expect_done(&self, kind: OperationKind, path: DokanPath, payload: Payload<'_>) -> DokanResult<()> {
        match self.dispatch(path, payload)? {
            Reply::Done => Ok(()),
            other => Err(mismatched(kind, &other)),
        }
    }

    /// # Safety
    /// The `info` pointer given to [`Call::enter`] must still be valid.
    unsafe fn store_handle(&self, handle: HandleId, is_directory: bool) {
        // SAFETY: caller contract; the driver owns the struct for the callback's duration.
        if let Some(info) = unsafe { self.info.as_mut() } {
            info.context = handle.raw();
            info.is_directory = u8::from(is_directory);
        }
    }
}

fn native_find_fill(
    fill: FillFindDataFn,
    info: *mut RawFileInfo,
) -> impl FnMut(&FindData) -> DokanResult<()> {
    move |entry| {
        let mut raw = RawFindData::from_find_data(entry)?;
        // SAFETY: `fill` and `info` are the pair the driver passed to this
        // callback; both stay valid until it returns.
        if unsafe { fill(&mut raw, info) } == 1 {
            Err(DokanError::Status(NtStatus::BUFFER_OVERFLOW))
        } else {
            Ok(())
        }
    }
}

fn native_stream_fill(
    fill: FillFindStreamDataFn,
    context: *mut c_void,
) -> impl FnMut(&StreamData) -> DokanResult<()> {
    move |entry| {
        let mut raw = RawStreamData::from_stream_data(entry)?;
        // SAFETY: as for `native_find_fill`.
        if unsafe { fill(&mut raw, context) } == 0 {
            Err(DokanError::Status(NtStatus::BUFFER_OVERFLOW))
        } else {
            Ok(())
        }
    }
}

unsafe extern "system" fn zw_create_file(
    file_name: *const u16,
    _security_context: *mut c_void,
    desired_access: u32,
    file_attributes: u32,
    share_access: u32,
    create_disposition: u32,
    create_options: u32,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::CreateFile, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        let create = CreateRequest {
            access: AccessMask::from_bits_retain(desired_access),
            attributes: FileAttributes::from_bits_retain(file_attributes),
            share: ShareAccess::from_bits_retain(share_access),
            disposition: CreateDisposition::try_from(create_disposition)?,
            options: CreateOptions::from_bits_retain(create_options),
        };
        match call.dispatch(path, Payload::Create(create))? {
            Reply::Created {
                handle,
                is_directory,
                ..
            } => {
                // SAFETY: `info` is still owned by the driver for this call.
                unsafe { call.store_handle(handle, is_directory) };
                Ok(())
            }
            other => Err(mismatched(OperationKind::CreateFile, &other)),
        }
    })
}

unsafe extern "system" fn cleanup(file_name: *const u16, info: *mut RawFileInfo) {
    let _status = catch_panic!(OperationKind::Cleanup, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        call.expect_done(OperationKind::Cleanup, path, Payload::Cleanup)
    });
}

unsafe extern "system" fn close_file(file_name: *const u16, info: *mut RawFileInfo) {
    let _status = catch_panic!(OperationKind::CloseFile, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        call.expect_done(OperationKind::CloseFile, path, Payload::Close)?;
        // SAFETY: as above.
        if let Some(info) = unsafe { info.as_mut() } {
            info.context = 0;
        }
        Ok(())
    });
}

unsafe extern "system" fn read_file(
    file_name: *const u16,
    buffer: *mut c_void,
    buffer_length: u32,
    read_length: *mut u32,
    offset: i64,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::ReadFile, {
        // SAFETY: arguments come straight from the driver.
        unsafe { write_out(read_length, 0) };
        // SAFETY: as above.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        // SAFETY: the driver passes a buffer of `buffer_length` bytes.
        let buffer = unsafe { buffer_mut(buffer, buffer_length) }?;
        let offset = offset_arg(offset)?;
        match call.dispatch(path, Payload::Read { offset, buffer })? {
            Reply::Read(read) => {
                // SAFETY: as above.
                unsafe { write_out(read_length, read as u32) };
                Ok(())
            }
            other => Err(mismatched(OperationKind::ReadFile, &other)),
        }
    })
}

unsafe extern "system" fn write_file(
    file_name: *const u16,
    buffer: *const c_void,
    bytes_to_write: u32,
    bytes_written: *mut u32,
    offset: i64,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::WriteFile, {
        // SAFETY: arguments come straight from the driver.
        unsafe { write_out(bytes_written, 0) };
        // SAFETY: as above.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        // SAFETY: the driver passes `bytes_to_write` readable bytes.
        let data = unsafe { buffer_ref(buffer, bytes_to_write) }?;
        let offset = if call.flags.contains(RequestFlags::WRITE_TO_END_OF_FILE) {
            0
        } else {
            offset_arg(offset)?
        };
        match call.dispatch(path, Payload::Write { offset, data })? {
            Reply::Written(written) => {
                // SAFETY: as above.
                unsafe { write_out(bytes_written, written as u32) };
                Ok(())
            }
            other => Err(mismatched(OperationKind::WriteFile, &other)),
        }
    })
}

unsafe extern "system" fn flush_file_buffers(file_name: *const u16, info: *mut RawFileInfo) -> i32 {
    catch_panic!(OperationKind::FlushFileBuffers, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        call.expect_done(OperationKind::FlushFileBuffers, path, Payload::Flush)
    })
}

unsafe extern "system" fn get_file_information(
    file_name: *const u16,
    buffer: *mut RawFileInformation,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::GetFileInformation, {
        if buffer.is_null() {
            return Err(DokanError::InvalidArgument("null file information buffer"));
        }
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        match call.dispatch(path, Payload::GetFileInformation)? {
            Reply::FileInformation(file) => {
                // SAFETY: checked non-null; the driver owns the buffer.
                unsafe { write_out(buffer, RawFileInformation::from_info(&file, 0)) };
                Ok(())
            }
            other => Err(mismatched(OperationKind::GetFileInformation, &other)),
        }
    })
}

unsafe extern "system" fn find_files(
    path_name: *const u16,
    fill_find_data: Option<FillFindDataFn>,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::FindFiles, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(path_name) }?;
        let fill = fill_find_data.ok_or(DokanError::InvalidArgument("null fill callback"))?;
        let mut fill = native_find_fill(fill, info);
        call.dispatch(path, Payload::FindFiles { fill: &mut fill })?;
        Ok(())
    })
}

unsafe extern "system" fn find_files_with_pattern(
    path_name: *const u16,
    search_pattern: *const u16,
    fill_find_data: Option<FillFindDataFn>,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::FindFilesWithPattern, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(path_name) }?;
        let pattern = if search_pattern.is_null() {
            "*".to_string()
        } else {
            // SAFETY: non-null driver strings are NUL-terminated.
            unsafe { U16CStr::from_ptr_str(search_pattern) }
                .to_string()
                .map_err(|_| DokanError::InvalidArgument("search pattern is not valid UTF-16"))?
        };
        let fill = fill_find_data.ok_or(DokanError::InvalidArgument("null fill callback"))?;
        let mut fill = native_find_fill(fill, info);
        call.dispatch(
            path,
            Payload::FindFilesWithPattern {
                pattern,
                fill: &mut fill,
            },
        )?;
        Ok(())
    })
}

unsafe extern "system" fn set_file_attributes(
    file_name: *const u16,
    file_attributes: u32,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::SetFileAttributes, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        let attributes = FileAttributes::from_bits_retain(file_attributes);
        call.expect_done(
            OperationKind::SetFileAttributes,
            path,
            Payload::SetFileAttributes(attributes),
        )
    })
}

unsafe extern "system" fn set_file_time(
    file_name: *const u16,
    creation_time: *const RawFileTime,
    last_access_time: *const RawFileTime,
    last_write_time: *const RawFileTime,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::SetFileTime, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        // SAFETY: each pointer is null or a valid FILETIME.
        let times = unsafe {
            FileTimes {
                creation_time: requested_time(creation_time),
                last_access_time: requested_time(last_access_time),
                last_write_time: requested_time(last_write_time),
            }
        };
        call.expect_done(OperationKind::SetFileTime, path, Payload::SetFileTime(times))
    })
}

unsafe extern "system" fn delete_file(file_name: *const u16, info: *mut RawFileInfo) -> i32 {
    catch_panic!(OperationKind::DeleteFile, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        call.expect_done(OperationKind::DeleteFile, path, Payload::DeleteFile)
    })
}

unsafe extern "system" fn delete_directory(file_name: *const u16, info: *mut RawFileInfo) -> i32 {
    catch_panic!(OperationKind::DeleteDirectory, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        call.expect_done(OperationKind::DeleteDirectory, path, Payload::DeleteDirectory)
    })
}

unsafe extern "system" fn move_file(
    file_name: *const u16,
    new_file_name: *const u16,
    replace_if_existing: i32,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::MoveFile, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        // SAFETY: as above.
        let new_path = unsafe { call.path(new_file_name) }?;
        call.expect_done(
            OperationKind::MoveFile,
            path,
            Payload::MoveFile {
                new_path,
                replace_if_existing: replace_if_existing != 0,
            },
        )
    })
}

unsafe extern "system" fn set_end_of_file(file_name: *const u16, byte_offset: i64, info: *mut RawFileInfo) -> i32 {
    catch_panic!(OperationKind::SetEndOfFile, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        let length = offset_arg(byte_offset)?;
        call.expect_done(OperationKind::SetEndOfFile, path, Payload::SetEndOfFile(length))
    })
}

unsafe extern "system" fn set_allocation_size(file_name: *const u16, alloc_size: i64, info: *mut RawFileInfo) -> i32 {
    catch_panic!(OperationKind::SetAllocationSize, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        let size = offset_arg(alloc_size)?;
        call.expect_done(
            OperationKind::SetAllocationSize,
            path,
            Payload::SetAllocationSize(size),
        )
    })
}

unsafe extern "system" fn lock_file(
    file_name: *const u16,
    byte_offset: i64,
    length: i64,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::LockFile, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        let payload = Payload::LockFile {
            offset: offset_arg(byte_offset)?,
            length: offset_arg(length)?,
        };
        call.expect_done(OperationKind::LockFile, path, payload)
    })
}

unsafe extern "system" fn unlock_file(
    file_name: *const u16,
    byte_offset: i64,
    length: i64,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::UnlockFile, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        let payload = Payload::UnlockFile {
            offset: offset_arg(byte_offset)?,
            length: offset_arg(length)?,
        };
        call.expect_done(OperationKind::UnlockFile, path, payload)
    })
}

unsafe extern "system" fn get_disk_free_space(
    free_bytes_available: *mut u64,
    total_number_of_bytes: *mut u64,
    total_number_of_free_bytes: *mut u64,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::GetDiskFreeSpace, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        match call.dispatch(DokanPath::root(), Payload::GetDiskFreeSpace)? {
            Reply::DiskSpace(space) => {
                // SAFETY: each out-pointer is null or writable.
                unsafe {
                    write_out(free_bytes_available, space.free_bytes_available);
                    write_out(total_number_of_bytes, space.total_bytes);
                    write_out(total_number_of_free_bytes, space.total_free_bytes);
                }
                Ok(())
            }
            other => Err(mismatched(OperationKind::GetDiskFreeSpace, &other)),
        }
    })
}

unsafe extern "system" fn get_volume_information(
    volume_name_buffer: *mut u16,
    volume_name_size: u32,
    volume_serial_number: *mut u32,
    maximum_component_length: *mut u32,
    file_system_flags: *mut u32,
    file_system_name_buffer: *mut u16,
    file_system_name_size: u32,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::GetVolumeInformation, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        let volume = match call.dispatch(DokanPath::root(), Payload::GetVolumeInformation)? {
            Reply::Volume(volume) => volume,
            other => return Err(mismatched(OperationKind::GetVolumeInformation, &other)),
        };
        if !volume_name_buffer.is_null() {
            // SAFETY: the driver passes a buffer of `volume_name_size` characters.
            let buffer = unsafe { slice::from_raw_parts_mut(volume_name_buffer, volume_name_size as usize) };
            encode_truncating(&volume.volume_name, buffer);
        }
        if !file_system_name_buffer.is_null() {
            // SAFETY: as above, `file_system_name_size` characters.
            let buffer =
                unsafe { slice::from_raw_parts_mut(file_system_name_buffer, file_system_name_size as usize) };
            encode_truncating(&volume.file_system_name, buffer);
        }
        // SAFETY: each out-pointer is null or writable.
        unsafe {
            write_out(volume_serial_number, volume.serial_number);
            write_out(maximum_component_length, volume.max_component_length);
            write_out(file_system_flags, volume.file_system_flags.bits());
        }
        Ok(())
    })
}

unsafe extern "system" fn mounted(mount_point: *const u16, info: *mut RawFileInfo) -> i32 {
    catch_panic!(OperationKind::Mounted, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        let mount_point = if mount_point.is_null() {
            String::new()
        } else {
            // SAFETY: non-null driver strings are NUL-terminated.
            unsafe { U16CStr::from_ptr_str(mount_point) }.to_string_lossy()
        };
        call.expect_done(
            OperationKind::Mounted,
            DokanPath::root(),
            Payload::Mounted { mount_point },
        )
    })
}

unsafe extern "system" fn unmounted(info: *mut RawFileInfo) -> i32 {
    catch_panic!(OperationKind::Unmounted, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        call.expect_done(OperationKind::Unmounted, DokanPath::root(), Payload::Unmounted)
    })
}

unsafe extern "system" fn get_file_security(
    file_name: *const u16,
    security_information: *mut u32,
    security_descriptor: *mut c_void,
    buffer_length: u32,
    length_needed: *mut u32,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::GetFileSecurity, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        // SAFETY: null or a valid SECURITY_INFORMATION.
        let requested = unsafe { security_information.as_ref() }.copied().unwrap_or(0);
        // SAFETY: the driver passes `buffer_length` writable bytes.
        let buffer = unsafe { buffer_mut(security_descriptor, buffer_length) }?;
        let payload = Payload::GetFileSecurity {
            security_information: requested,
            buffer,
        };
        match call.dispatch(path, payload)? {
            Reply::Security { length_needed: needed } => {
                // SAFETY: null or writable.
                unsafe { write_out(length_needed, u32::try_from(needed).unwrap_or(u32::MAX)) };
                if needed > buffer_length as usize {
                    return Err(DokanError::Status(NtStatus::BUFFER_OVERFLOW));
                }
                Ok(())
            }
            other => Err(mismatched(OperationKind::GetFileSecurity, &other)),
        }
    })
}

unsafe extern "system" fn set_file_security(
    file_name: *const u16,
    security_information: *mut u32,
    security_descriptor: *mut c_void,
    buffer_length: u32,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::SetFileSecurity, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        // SAFETY: null or a valid SECURITY_INFORMATION.
        let requested = unsafe { security_information.as_ref() }.copied().unwrap_or(0);
        // SAFETY: the driver passes `buffer_length` readable bytes.
        let descriptor = unsafe { buffer_ref(security_descriptor.cast_const(), buffer_length) }?;
        call.expect_done(
            OperationKind::SetFileSecurity,
            path,
            Payload::SetFileSecurity {
                security_information: requested,
                descriptor,
            },
        )
    })
}

unsafe extern "system" fn find_streams(
    file_name: *const u16,
    fill_find_stream_data: Option<FillFindStreamDataFn>,
    find_stream_context: *mut c_void,
    info: *mut RawFileInfo,
) -> i32 {
    catch_panic!(OperationKind::FindStreams, {
        // SAFETY: arguments come straight from the driver.
        let call = unsafe { Call::enter(info) }?;
        // SAFETY: as above.
        let path = unsafe { call.path(file_name) }?;
        let fill = fill_find_stream_data.ok_or(DokanError::InvalidArgument("null fill callback"))?;
        let mut fill = native_stream_fill(fill, find_stream_context);
        call.dispatch(path, Payload::FindStreams { fill: &mut fill })?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::driver::InProcessDriver;
    use crate::ffi::RawOptions;
    use crate::filesystem::DokanFileSystem;
    use std::ptr;

    struct Nothing;

    impl DokanFileSystem for Nothing {}

    fn driver() -> Arc<dyn NativeDriver> {
        Arc::new(InProcessDriver::new())
    }

    #[test]
    fn test_registry_holds_weak_references() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(Nothing), &MountConfig::default()));
        let driver = driver();
        let id = register(&dispatcher, &driver);
        assert!(resolve(id.raw()).is_some());
        assert!(resolve_driver(id.raw()).is_some());
        drop(dispatcher);
        assert!(resolve(id.raw()).is_none());
        deregister(id);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(Nothing), &MountConfig::default()));
        let driver = driver();
        let a = register(&dispatcher, &driver);
        let b = register(&dispatcher, &driver);
        assert_ne!(a, b);
        deregister(a);
        deregister(b);
    }

    #[test]
    fn test_operations_table_follows_set() {
        let set = OperationSet::empty()
            .with(OperationKind::CreateFile)
            .with(OperationKind::ReadFile);
        let table = operations_for(set);
        assert!(table.zw_create_file.is_some());
        assert!(table.read_file.is_some());
        assert!(table.write_file.is_none());
        assert!(table.find_streams.is_none());

        let all = operations_for(OperationSet::all());
        assert!(all.find_streams.is_some());
        assert!(all.unmounted.is_some());
    }

    #[test]
    fn test_null_file_info_is_boundary_error() {
        // SAFETY: exercising the null-argument path.
        let status = unsafe { flush_file_buffers(ptr::null(), ptr::null_mut()) };
        assert_eq!(status, i32::from(NtStatus::IO_DEVICE_ERROR));
    }

    #[test]
    fn test_unknown_session_is_not_mounted() {
        let mut options = Box::new(RawOptions {
            global_context: u64::MAX,
            ..RawOptions::default()
        });
        let mut info = RawFileInfo::new(&raw mut *options);
        let name: Vec<u16> = "\\a.txt\0".encode_utf16().collect();
        // SAFETY: valid string, options and file info.
        let status = unsafe { flush_file_buffers(name.as_ptr(), &raw mut info) };
        assert_eq!(NtStatus(status).class(), crate::status::StatusClass::InvalidState);
    }
}
