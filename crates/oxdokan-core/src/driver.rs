//! The native driver seam and an in-process implementation.
//!
//! [`NativeDriver`] is what a mount session talks to: attach a volume with a
//! `DOKAN_OPTIONS` / `DOKAN_OPERATIONS` pair, and detach it again. On Windows
//! a downstream crate implements it over `DokanCreateFileSystem` and
//! `DokanCloseHandle`.
//!
//! The driver also carries the calls a file system makes towards the kernel:
//! change notifications for edits made outside a callback, and extending the
//! deadline of a slow request.
//!
//! [`InProcessDriver`] plays the kernel side without one. It keeps its own
//! copy of the options, runs every callback on a pool of `dokan-N` worker
//! threads and waits for the reply with the configured timeout, so callers
//! see the same raw pointers, out-parameters and fill callbacks a driver
//! would produce.

use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};
use widestring::{U16CStr, U16CString};

use crate::config::{DEFAULT_TIMEOUT, DOKAN_MINIMUM_VERSION};
use crate::error::{
    DOKAN_ERROR, DOKAN_MOUNT_ERROR, DOKAN_MOUNT_POINT_ERROR, DOKAN_START_ERROR, DOKAN_SUCCESS,
    DOKAN_VERSION_ERROR,
};
use crate::ffi::{
    DokanOperations, FileFn, LockFn, RawFileInfo, RawFileInformation, RawFileTime, RawFindData, RawOptions,
    RawStreamData, SetSizeFn, VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE,
};
use crate::flags::FileSystemFlags;
use crate::info::{DiskSpace, FileInformation, FileTimes, FindData, StreamData, VolumeInformation, to_filetime};
use crate::path::MAX_PATH;
use crate::request::{CreateRequest, RequestFlags};
use crate::status::NtStatus;

/// Number of callback workers when none is configured.
pub const DEFAULT_WORKERS: usize = 5;

/// Attaches and detaches a volume.
///
/// `create_file_system` returns one of the `DOKAN_*` codes in
/// [`crate::error`]. The driver calls `Mounted` once the volume is visible;
/// `close_file_system` calls `Unmounted` before it returns.
pub trait NativeDriver: Send + Sync {
    fn create_file_system(&self, options: &RawOptions, operations: &DokanOperations) -> i32;

    fn close_file_system(&self);

    /// `DokanNotify*`: report a change the OS did not see go through the
    /// volume. Paths include the mount point. Returns whether the driver
    /// accepted it.
    fn notify(&self, notification: &Notification) -> bool {
        let _ = notification;
        false
    }

    /// `DokanResetTimeout`: give the request that `info` belongs to `timeout`
    /// more before the driver abandons it. Only meaningful while that
    /// callback is running.
    fn reset_timeout(&self, timeout: Duration, info: *mut RawFileInfo) -> bool {
        let _ = (timeout, info);
        false
    }
}

/// A change to report with [`NativeDriver::notify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Create { path: String, is_directory: bool },
    Delete { path: String, is_directory: bool },
    /// Attributes, size or times changed.
    Update { path: String },
    /// Extended attributes changed.
    XattrUpdate { path: String },
    Rename {
        old_path: String,
        new_path: String,
        is_directory: bool,
        same_directory: bool,
    },
}

impl Notification {
    /// The path the notification is about; the old one for a rename.
    pub fn path(&self) -> &str {
        match self {
            Notification::Create { path, .. }
            | Notification::Delete { path, .. }
            | Notification::Update { path }
            | Notification::XattrUpdate { path }
            | Notification::Rename { old_path: path, .. } => path,
        }
    }
}

/// `DokanResetTimeout` bound to the callback being served.
#[derive(Clone)]
pub struct TimeoutReset {
    driver: Arc<dyn NativeDriver>,
    info: usize,
}

impl TimeoutReset {
    pub(crate) fn new(driver: Arc<dyn NativeDriver>, info: *mut RawFileInfo) -> Self {
        Self {
            driver,
            info: info.expose_provenance(),
        }
    }

    /// Ask for `timeout` more from now.
    pub fn reset(&self, timeout: Duration) -> bool {
        self.driver
            .reset_timeout(timeout, ptr::with_exposed_provenance_mut(self.info))
    }
}

impl fmt::Debug for TimeoutReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutReset").finish_non_exhaustive()
    }
}

/// Reply deadline of one queued call.
struct Deadline(Mutex<Instant>);

thread_local! {
    /// Deadline of the call the current worker is running.
    static CURRENT_CALL: RefCell<Option<Arc<Deadline>>> = const { RefCell::new(None) };
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Options, strings and callbacks of the attached volume.
struct Volume {
    options: Box<RawOptions>,
    mount_point: U16CString,
    _unc_name: Option<U16CString>,
    operations: DokanOperations,
    timeout: Duration,
}

impl Volume {
    fn options_ptr(&self) -> *mut RawOptions {
        ptr::from_ref(&*self.options).cast_mut()
    }

    fn file_info(&self, call: &CallInfo) -> RawFileInfo {
        let mut info = RawFileInfo::new(self.options_ptr());
        info.context = call.context;
        info.process_id = call.process_id;
        info.is_directory = u8::from(call.is_directory);
        info.paging_io = u8::from(call.flags.contains(RequestFlags::PAGING_IO));
        info.synchronous_io = u8::from(call.flags.contains(RequestFlags::SYNCHRONOUS_IO));
        info.no_cache = u8::from(call.flags.contains(RequestFlags::NO_CACHE));
        info.write_to_end_of_file = u8::from(call.flags.contains(RequestFlags::WRITE_TO_END_OF_FILE));
        info
    }
}

struct Attached {
    volume: Arc<Volume>,
    sender: Sender<Job>,
    pool: Pool,
}

/// Callback workers and the channel each reports its exit on.
struct Pool {
    workers: Vec<JoinHandle<()>>,
    exited: Receiver<usize>,
}

impl Pool {
    /// Join every worker that exits before `deadline`; the rest are detached.
    ///
    /// Returns the number of workers left running.
    fn shutdown(self, deadline: Instant) -> usize {
        let mut workers: Vec<_> = self.workers.into_iter().map(Some).collect();
        let mut remaining = workers.len();
        while remaining > 0 {
            let Ok(index) = self.exited.recv_deadline(deadline) else {
                break;
            };
            if let Some(worker) = workers.get_mut(index).and_then(Option::take) {
                remaining -= 1;
                if worker.join().is_err() {
                    warn!(worker = index, "Callback worker panicked");
                }
            }
        }
        let stuck = workers
            .into_iter()
            .enumerate()
            .filter_map(|(index, worker)| Some((index, worker?)));
        for (index, worker) in stuck {
            warn!(
                worker = index,
                thread = worker.thread().name().unwrap_or_default(),
                "Callback still running at detach; leaving it behind"
            );
        }
        remaining
    }
}

/// Reports a worker's exit, including by panic.
struct ExitNotice {
    index: usize,
    exited: Sender<usize>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.exited.send(self.index);
    }
}

/// Per-call view of a `DOKAN_FILE_INFO`.
#[derive(Debug, Clone, Copy)]
struct CallInfo {
    context: u64,
    is_directory: bool,
    process_id: u32,
    flags: RequestFlags,
}

impl CallInfo {
    fn volume() -> Self {
        Self {
            context: 0,
            is_directory: false,
            process_id: std::process::id(),
            flags: RequestFlags::empty(),
        }
    }
}

/// An open made through [`InProcessDriver::create`].
///
/// Cloning shares the handle; the driver tracks no per-clone state.
#[derive(Clone, PartialEq, Eq)]
pub struct DriverFile {
    path: U16CString,
    context: u64,
    is_directory: bool,
    flags: RequestFlags,
}

impl DriverFile {
    /// A file value carrying an arbitrary context word.
    pub fn from_raw(path: &str, context: u64) -> Result<Self, NtStatus> {
        Ok(Self {
            path: wide(path)?,
            context,
            is_directory: false,
            flags: RequestFlags::empty(),
        })
    }

    pub fn path(&self) -> String {
        self.path.to_string_lossy()
    }

    /// The handle id the file system stored in `DOKAN_FILE_INFO.Context`.
    pub fn context(&self) -> u64 {
        self.context
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Issue later calls with these request flags.
    #[must_use]
    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    fn call(&self) -> CallInfo {
        CallInfo {
            context: self.context,
            is_directory: self.is_directory,
            process_id: std::process::id(),
            flags: self.flags,
        }
    }
}

impl fmt::Debug for DriverFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverFile")
            .field("path", &self.path())
            .field("context", &self.context)
            .field("is_directory", &self.is_directory)
            .finish()
    }
}

/// `GetFileSecurity` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityReply {
    /// `STATUS_SUCCESS`, or `STATUS_BUFFER_OVERFLOW` when the buffer was short.
    pub status: NtStatus,
    pub length_needed: u32,
    pub descriptor: Vec<u8>,
}

fn wide(value: &str) -> Result<U16CString, NtStatus> {
    U16CString::from_str(value).map_err(|_| NtStatus::OBJECT_NAME_INVALID)
}

fn check(status: i32) -> Result<(), NtStatus> {
    let status = NtStatus(status);
    if status.is_success() { Ok(()) } else { Err(status) }
}

fn raw_time(time: Option<SystemTime>) -> Option<RawFileTime> {
    time.map(|time| RawFileTime::from_u64(to_filetime(time)))
}

fn time_ptr(time: Option<&RawFileTime>) -> *const RawFileTime {
    time.map_or(ptr::null(), ptr::from_ref)
}

struct FindCollector {
    entries: Vec<FindData>,
    capacity: Option<usize>,
}

struct StreamCollector {
    entries: Vec<StreamData>,
    capacity: Option<usize>,
}

unsafe extern "system" fn collect_find_data(data: *mut RawFindData, info: *mut RawFileInfo) -> i32 {
    // SAFETY: `info` is the file info built by `InProcessDriver::list`, whose
    // `dokan_context` points at a live `FindCollector`.
    let Some(info) = (unsafe { info.as_ref() }) else {
        return 1;
    };
    let collector = ptr::with_exposed_provenance_mut::<FindCollector>(info.dokan_context as usize);
    // SAFETY: see above; `data` is a valid entry for the duration of the call.
    let (Some(collector), Some(data)) = (unsafe { collector.as_mut() }, unsafe { data.as_ref() }) else {
        return 1;
    };
    if collector.capacity.is_some_and(|capacity| collector.entries.len() >= capacity) {
        return 1;
    }
    collector.entries.push(data.to_find_data());
    0
}

unsafe extern "system" fn collect_stream_data(data: *mut RawStreamData, context: *mut c_void) -> i32 {
    // SAFETY: `context` is the `StreamCollector` passed by
    // `InProcessDriver::find_streams`; `data` is valid for the call.
    let (Some(collector), Some(data)) = (unsafe { context.cast::<StreamCollector>().as_mut() }, unsafe {
        data.as_ref()
    }) else {
        return 0;
    };
    if collector.capacity.is_some_and(|capacity| collector.entries.len() >= capacity) {
        return 0;
    }
    collector.entries.push(data.to_stream_data());
    1
}

/// A driver that runs callbacks on its own worker threads.
pub struct InProcessDriver {
    attached: Mutex<Option<Attached>>,
    workers: usize,
    attach_failure: Option<i32>,
    find_capacity: Option<usize>,
    notifications: Mutex<Vec<Notification>>,
    timeout_resets: Mutex<Vec<Duration>>,
}

impl InProcessDriver {
    pub fn new() -> Self {
        Self {
            attached: Mutex::new(None),
            workers: DEFAULT_WORKERS,
            attach_failure: None,
            find_capacity: None,
            notifications: Mutex::new(Vec::new()),
            timeout_resets: Mutex::new(Vec::new()),
        }
    }

    /// A driver whose attach always returns `code`.
    pub fn failing(code: i32) -> Self {
        Self {
            attach_failure: Some(code),
            ..Self::new()
        }
    }

    /// Worker threads used when the options do not ask for a single thread.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Report a full buffer after `entries` directory or stream entries.
    #[must_use]
    pub fn with_find_capacity(mut self, entries: usize) -> Self {
        self.find_capacity = Some(entries);
        self
    }

    pub fn is_attached(&self) -> bool {
        self.attached.lock().is_some()
    }

    /// `GlobalContext` of the attached volume.
    pub fn global_context(&self) -> Option<u64> {
        self.attached
            .lock()
            .as_ref()
            .map(|attached| attached.volume.options.global_context)
    }

    /// Mount point as handed to the `Mounted` callback.
    pub fn mount_point(&self) -> Option<String> {
        self.attached
            .lock()
            .as_ref()
            .map(|attached| attached.volume.mount_point.to_string_lossy())
    }

    /// Volume security descriptor from the attached options.
    pub fn volume_security_descriptor(&self) -> Option<Vec<u8>> {
        let attached = self.attached.lock();
        let options = &attached.as_ref()?.volume.options;
        let length = options.volume_security_descriptor_length as usize;
        options
            .volume_security_descriptor
            .get(..length)
            .filter(|descriptor| !descriptor.is_empty())
            .map(<[u8]>::to_vec)
    }

    /// Notifications accepted so far, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    /// Extensions granted through `reset_timeout`, oldest first.
    pub fn timeout_resets(&self) -> Vec<Duration> {
        self.timeout_resets.lock().clone()
    }

    fn spawn_pool(&self, single_thread: bool) -> Result<(Sender<Job>, Pool), i32> {
        let count = if single_thread { 1 } else { self.workers };
        let (sender, receiver) = unbounded::<Job>();
        let (exited_tx, exited) = unbounded();
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let receiver = receiver.clone();
            let notice = ExitNotice {
                index,
                exited: exited_tx.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("dokan-{index}"))
                .spawn(move || {
                    let _notice = notice;
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                    trace!("Callback worker exiting");
                })
                .map_err(|e| {
                    warn!(error = %e, "Failed to spawn callback worker");
                    DOKAN_START_ERROR
                })?;
            workers.push(handle);
        }
        Ok((sender, Pool { workers, exited }))
    }

    /// Run `job` on a worker and wait for its result.
    fn run<T, F>(&self, job: F) -> Result<T, NtStatus>
    where
        F: FnOnce(&Volume) -> Result<T, NtStatus> + Send + 'static,
        T: Send + 'static,
    {
        let (volume, sender) = {
            let attached = self.attached.lock();
            let attached = attached.as_ref().ok_or(NtStatus::INVALID_DEVICE_STATE)?;
            (Arc::clone(&attached.volume), attached.sender.clone())
        };
        let timeout = volume.timeout;
        let deadline = Arc::new(Deadline(Mutex::new(Instant::now() + timeout)));
        let (reply_tx, reply_rx) = bounded(1);
        let task: Job = {
            let deadline = Arc::clone(&deadline);
            Box::new(move || {
                CURRENT_CALL.with_borrow_mut(|current| *current = Some(deadline));
                // The caller may have given up on the reply.
                let _ = reply_tx.send(job(volume.as_ref()));
                CURRENT_CALL.with_borrow_mut(|current| *current = None);
            })
        };
        sender.send(task).map_err(|_| NtStatus::INVALID_DEVICE_STATE)?;
        loop {
            let at = *deadline.0.lock();
            match reply_rx.recv_deadline(at) {
                Ok(reply) => return reply,
                // The callback pushed its deadline back.
                Err(RecvTimeoutError::Timeout) if *deadline.0.lock() > at => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!(timeout_ms = timeout.as_millis(), "Callback did not complete in time");
                    return Err(NtStatus::IO_TIMEOUT);
                }
                Err(RecvTimeoutError::Disconnected) => return Err(NtStatus::INTERNAL_ERROR),
            }
        }
    }

    /// `ZwCreateFile`.
    pub fn create(&self, path: &str, request: &CreateRequest) -> Result<DriverFile, NtStatus> {
        let path = wide(path)?;
        let request = *request;
        self.run(move |volume| {
            let op = volume.operations.zw_create_file.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&CallInfo::volume());
            // SAFETY: every pointer is valid for the duration of the call.
            check(unsafe {
                op(
                    path.as_ptr(),
                    ptr::null_mut(),
                    request.access.bits(),
                    request.attributes.bits(),
                    request.share.bits(),
                    request.disposition as u32,
                    request.options.bits(),
                    &raw mut info,
                )
            })?;
            Ok(DriverFile {
                path,
                context: info.context,
                is_directory: info.is_directory != 0,
                flags: RequestFlags::empty(),
            })
        })
    }

    fn release(&self, file: &DriverFile, close: bool) -> Result<(), NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        self.run(move |volume| {
            let op = if close {
                volume.operations.close_file
            } else {
                volume.operations.cleanup
            };
            let op = op.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            // SAFETY: every pointer is valid for the duration of the call.
            unsafe { op(path.as_ptr(), &raw mut info) };
            Ok(())
        })
    }

    /// `Cleanup`: the last user handle went away.
    pub fn cleanup(&self, file: &DriverFile) -> Result<(), NtStatus> {
        self.release(file, false)
    }

    /// `CloseFile`: the last reference went away.
    pub fn close(&self, file: DriverFile) -> Result<(), NtStatus> {
        self.release(&file, true)
    }

    pub fn read(&self, file: &DriverFile, offset: i64, length: usize) -> Result<Vec<u8>, NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        let length32 = u32::try_from(length).map_err(|_| NtStatus::INVALID_PARAMETER)?;
        self.run(move |volume| {
            let op = volume.operations.read_file.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            let mut buffer = vec![0u8; length];
            let mut read = 0u32;
            // SAFETY: `buffer` holds `length32` bytes; the rest are locals.
            check(unsafe {
                op(
                    path.as_ptr(),
                    buffer.as_mut_ptr().cast(),
                    length32,
                    &raw mut read,
                    offset,
                    &raw mut info,
                )
            })?;
            buffer.truncate(read as usize);
            Ok(buffer)
        })
    }

    fn write_with(&self, file: &DriverFile, offset: i64, data: &[u8], flags: RequestFlags) -> Result<usize, NtStatus> {
        let path = file.path.clone();
        let mut call = file.call();
        call.flags |= flags;
        let data = data.to_vec();
        let length = u32::try_from(data.len()).map_err(|_| NtStatus::INVALID_PARAMETER)?;
        self.run(move |volume| {
            let op = volume.operations.write_file.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            let mut written = 0u32;
            // SAFETY: `data` holds `length` bytes; the rest are locals.
            check(unsafe {
                op(
                    path.as_ptr(),
                    data.as_ptr().cast(),
                    length,
                    &raw mut written,
                    offset,
                    &raw mut info,
                )
            })?;
            Ok(written as usize)
        })
    }

    pub fn write(&self, file: &DriverFile, offset: i64, data: &[u8]) -> Result<usize, NtStatus> {
        self.write_with(file, offset, data, RequestFlags::empty())
    }

    /// Write with `WriteToEndOfFile` set.
    pub fn append(&self, file: &DriverFile, data: &[u8]) -> Result<usize, NtStatus> {
        self.write_with(file, -1, data, RequestFlags::WRITE_TO_END_OF_FILE)
    }

    fn simple(
        &self,
        file: &DriverFile,
        select: fn(&DokanOperations) -> Option<FileFn>,
    ) -> Result<(), NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        self.run(move |volume| {
            let op = select(&volume.operations).ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            // SAFETY: every pointer is valid for the duration of the call.
            check(unsafe { op(path.as_ptr(), &raw mut info) })
        })
    }

    pub fn flush(&self, file: &DriverFile) -> Result<(), NtStatus> {
        self.simple(file, |ops| ops.flush_file_buffers)
    }

    /// `DeleteFile`: ask whether the file may be deleted on close.
    pub fn delete_file(&self, file: &DriverFile) -> Result<(), NtStatus> {
        self.simple(file, |ops| ops.delete_file)
    }

    pub fn delete_directory(&self, file: &DriverFile) -> Result<(), NtStatus> {
        self.simple(file, |ops| ops.delete_directory)
    }

    pub fn get_file_information(&self, file: &DriverFile) -> Result<FileInformation, NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        self.run(move |volume| {
            let op = volume.operations.get_file_information.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            let mut raw = RawFileInformation::default();
            // SAFETY: every pointer is valid for the duration of the call.
            check(unsafe { op(path.as_ptr(), &raw mut raw, &raw mut info) })?;
            Ok(raw.to_info())
        })
    }

    fn list(&self, file: &DriverFile, pattern: Option<&str>) -> Result<Vec<FindData>, NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        let pattern = pattern.map(wide).transpose()?;
        let capacity = self.find_capacity;
        self.run(move |volume| {
            let mut collector = FindCollector {
                entries: Vec::new(),
                capacity,
            };
            let mut info = volume.file_info(&call);
            info.dokan_context = ptr::from_mut(&mut collector).expose_provenance() as u64;
            // SAFETY: `collector` outlives the call and is only touched by
            // `collect_find_data` through `info.dokan_context`.
            let status = unsafe {
                match &pattern {
                    Some(pattern) => {
                        let op = volume.operations.find_files_with_pattern.ok_or(NtStatus::NOT_IMPLEMENTED)?;
                        op(path.as_ptr(), pattern.as_ptr(), Some(collect_find_data), &raw mut info)
                    }
                    None => {
                        let op = volume.operations.find_files.ok_or(NtStatus::NOT_IMPLEMENTED)?;
                        op(path.as_ptr(), Some(collect_find_data), &raw mut info)
                    }
                }
            };
            check(status)?;
            Ok(collector.entries)
        })
    }

    pub fn find_files(&self, file: &DriverFile) -> Result<Vec<FindData>, NtStatus> {
        self.list(file, None)
    }

    pub fn find_files_with_pattern(&self, file: &DriverFile, pattern: &str) -> Result<Vec<FindData>, NtStatus> {
        self.list(file, Some(pattern))
    }

    pub fn find_streams(&self, file: &DriverFile) -> Result<Vec<StreamData>, NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        let capacity = self.find_capacity;
        self.run(move |volume| {
            let op = volume.operations.find_streams.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut collector = StreamCollector {
                entries: Vec::new(),
                capacity,
            };
            let mut info = volume.file_info(&call);
            // SAFETY: `collector` outlives the call.
            check(unsafe {
                op(
                    path.as_ptr(),
                    Some(collect_stream_data),
                    ptr::from_mut(&mut collector).cast(),
                    &raw mut info,
                )
            })?;
            Ok(collector.entries)
        })
    }

    pub fn set_file_attributes(&self, file: &DriverFile, attributes: u32) -> Result<(), NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        self.run(move |volume| {
            let op = volume.operations.set_file_attributes.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            // SAFETY: every pointer is valid for the duration of the call.
            check(unsafe { op(path.as_ptr(), attributes, &raw mut info) })
        })
    }

    pub fn set_file_time(&self, file: &DriverFile, times: &FileTimes) -> Result<(), NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        let creation = raw_time(times.creation_time);
        let access = raw_time(times.last_access_time);
        let write = raw_time(times.last_write_time);
        self.run(move |volume| {
            let op = volume.operations.set_file_time.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            // SAFETY: each time pointer is null or a local.
            check(unsafe {
                op(
                    path.as_ptr(),
                    time_ptr(creation.as_ref()),
                    time_ptr(access.as_ref()),
                    time_ptr(write.as_ref()),
                    &raw mut info,
                )
            })
        })
    }

    pub fn move_file(&self, file: &DriverFile, new_name: &str, replace_if_existing: bool) -> Result<(), NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        let new_name = wide(new_name)?;
        self.run(move |volume| {
            let op = volume.operations.move_file.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            // SAFETY: every pointer is valid for the duration of the call.
            check(unsafe {
                op(
                    path.as_ptr(),
                    new_name.as_ptr(),
                    i32::from(replace_if_existing),
                    &raw mut info,
                )
            })
        })
    }

    fn set_size(
        &self,
        file: &DriverFile,
        size: i64,
        select: fn(&DokanOperations) -> Option<SetSizeFn>,
    ) -> Result<(), NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        self.run(move |volume| {
            let op = select(&volume.operations).ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            // SAFETY: every pointer is valid for the duration of the call.
            check(unsafe { op(path.as_ptr(), size, &raw mut info) })
        })
    }

    pub fn set_end_of_file(&self, file: &DriverFile, length: i64) -> Result<(), NtStatus> {
        self.set_size(file, length, |ops| ops.set_end_of_file)
    }

    pub fn set_allocation_size(&self, file: &DriverFile, size: i64) -> Result<(), NtStatus> {
        self.set_size(file, size, |ops| ops.set_allocation_size)
    }

    fn range(
        &self,
        file: &DriverFile,
        offset: i64,
        length: i64,
        select: fn(&DokanOperations) -> Option<LockFn>,
    ) -> Result<(), NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        self.run(move |volume| {
            let op = select(&volume.operations).ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            // SAFETY: every pointer is valid for the duration of the call.
            check(unsafe { op(path.as_ptr(), offset, length, &raw mut info) })
        })
    }

    pub fn lock_file(&self, file: &DriverFile, offset: i64, length: i64) -> Result<(), NtStatus> {
        self.range(file, offset, length, |ops| ops.lock_file)
    }

    pub fn unlock_file(&self, file: &DriverFile, offset: i64, length: i64) -> Result<(), NtStatus> {
        self.range(file, offset, length, |ops| ops.unlock_file)
    }

    pub fn get_disk_free_space(&self) -> Result<DiskSpace, NtStatus> {
        self.run(|volume| {
            let op = volume.operations.get_disk_free_space.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&CallInfo::volume());
            let mut space = DiskSpace::default();
            // SAFETY: every pointer is valid for the duration of the call.
            check(unsafe {
                op(
                    &raw mut space.free_bytes_available,
                    &raw mut space.total_bytes,
                    &raw mut space.total_free_bytes,
                    &raw mut info,
                )
            })?;
            Ok(space)
        })
    }

    pub fn get_volume_information(&self) -> Result<VolumeInformation, NtStatus> {
        self.run(|volume| {
            let op = volume.operations.get_volume_information.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&CallInfo::volume());
            let mut volume_name = [0u16; MAX_PATH + 1];
            let mut file_system_name = [0u16; MAX_PATH + 1];
            let mut serial_number = 0u32;
            let mut max_component_length = 0u32;
            let mut file_system_flags = 0u32;
            // SAFETY: buffers are locals of the stated lengths.
            check(unsafe {
                op(
                    volume_name.as_mut_ptr(),
                    volume_name.len() as u32,
                    &raw mut serial_number,
                    &raw mut max_component_length,
                    &raw mut file_system_flags,
                    file_system_name.as_mut_ptr(),
                    file_system_name.len() as u32,
                    &raw mut info,
                )
            })?;
            let decode = |buffer: &[u16]| {
                U16CStr::from_slice_truncate(buffer)
                    .map(U16CStr::to_string_lossy)
                    .unwrap_or_default()
            };
            Ok(VolumeInformation {
                volume_name: decode(&volume_name),
                serial_number,
                max_component_length,
                file_system_flags: FileSystemFlags::from_bits_retain(file_system_flags),
                file_system_name: decode(&file_system_name),
            })
        })
    }

    pub fn get_file_security(
        &self,
        file: &DriverFile,
        security_information: u32,
        buffer_length: usize,
    ) -> Result<SecurityReply, NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        let length = u32::try_from(buffer_length).map_err(|_| NtStatus::INVALID_PARAMETER)?;
        self.run(move |volume| {
            let op = volume.operations.get_file_security.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            let mut requested = security_information;
            let mut descriptor = vec![0u8; buffer_length];
            let mut length_needed = 0u32;
            // SAFETY: `descriptor` holds `length` bytes; the rest are locals.
            let status = NtStatus(unsafe {
                op(
                    path.as_ptr(),
                    &raw mut requested,
                    descriptor.as_mut_ptr().cast(),
                    length,
                    &raw mut length_needed,
                    &raw mut info,
                )
            });
            if !status.is_success() && status != NtStatus::BUFFER_OVERFLOW {
                return Err(status);
            }
            descriptor.truncate((length_needed as usize).min(buffer_length));
            Ok(SecurityReply {
                status,
                length_needed,
                descriptor,
            })
        })
    }

    pub fn set_file_security(&self, file: &DriverFile, security_information: u32, descriptor: &[u8]) -> Result<(), NtStatus> {
        let path = file.path.clone();
        let call = file.call();
        let mut descriptor = descriptor.to_vec();
        let length = u32::try_from(descriptor.len()).map_err(|_| NtStatus::INVALID_PARAMETER)?;
        self.run(move |volume| {
            let op = volume.operations.set_file_security.ok_or(NtStatus::NOT_IMPLEMENTED)?;
            let mut info = volume.file_info(&call);
            let mut requested = security_information;
            // SAFETY: `descriptor` holds `length` bytes; the rest are locals.
            check(unsafe {
                op(
                    path.as_ptr(),
                    &raw mut requested,
                    descriptor.as_mut_ptr().cast(),
                    length,
                    &raw mut info,
                )
            })
        })
    }

    fn attach(&self, options: &RawOptions, operations: &DokanOperations) -> Result<(), i32> {
        if let Some(code) = self.attach_failure {
            return Err(code);
        }
        if self.attached.lock().is_some() {
            return Err(DOKAN_MOUNT_ERROR);
        }
        if options.version < DOKAN_MINIMUM_VERSION {
            return Err(DOKAN_VERSION_ERROR);
        }
        if options.mount_point.is_null() {
            return Err(DOKAN_MOUNT_POINT_ERROR);
        }
        // SAFETY: a non-null mount point is a NUL-terminated string owned by the caller.
        let mount_point = unsafe { U16CStr::from_ptr_str(options.mount_point) }.to_ucstring();
        if mount_point.is_empty() {
            return Err(DOKAN_MOUNT_POINT_ERROR);
        }
        let unc_name = if options.unc_name.is_null() {
            None
        } else {
            // SAFETY: as above.
            Some(unsafe { U16CStr::from_ptr_str(options.unc_name) }.to_ucstring())
        };
        if options.volume_security_descriptor_length as usize > VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE {
            return Err(DOKAN_ERROR);
        }

        let mut copy = Box::new(RawOptions {
            version: options.version,
            single_thread: options.single_thread,
            options: options.options,
            global_context: options.global_context,
            mount_point: mount_point.as_ptr(),
            unc_name: unc_name.as_ref().map_or(ptr::null(), |name| name.as_ptr()),
            timeout: options.timeout,
            allocation_unit_size: options.allocation_unit_size,
            sector_size: options.sector_size,
            volume_security_descriptor_length: options.volume_security_descriptor_length,
            volume_security_descriptor: [0; VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE],
        });
        copy.volume_security_descriptor
            .copy_from_slice(&options.volume_security_descriptor);

        let timeout = if options.timeout == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_millis(u64::from(options.timeout))
        };
        let (sender, pool) = self.spawn_pool(options.single_thread != 0)?;
        debug!(
            workers = pool.workers.len(),
            timeout_ms = timeout.as_millis(),
            global_context = options.global_context,
            "Volume attached"
        );
        *self.attached.lock() = Some(Attached {
            volume: Arc::new(Volume {
                options: copy,
                mount_point,
                _unc_name: unc_name,
                operations: *operations,
                timeout,
            }),
            sender,
            pool,
        });
        Ok(())
    }

    fn signal(&self, mounted: bool) {
        let result = self.run(move |volume| {
            let mut info = volume.file_info(&CallInfo::volume());
            // SAFETY: the mount point string and `info` outlive the call.
            let status = unsafe {
                match (mounted, volume.operations.mounted, volume.operations.unmounted) {
                    (true, Some(op), _) => op(volume.mount_point.as_ptr(), &raw mut info),
                    (false, _, Some(op)) => op(&raw mut info),
                    _ => return Ok(()),
                }
            };
            check(status)
        });
        if let Err(status) = result {
            warn!(mounted, %status, "Lifecycle notification failed");
        }
    }
}

impl Default for InProcessDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InProcessDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessDriver")
            .field("attached", &self.is_attached())
            .field("workers", &self.workers)
            .field("attach_failure", &self.attach_failure)
            .finish_non_exhaustive()
    }
}

impl NativeDriver for InProcessDriver {
    fn create_file_system(&self, options: &RawOptions, operations: &DokanOperations) -> i32 {
        match self.attach(options, operations) {
            Ok(()) => {
                self.signal(true);
                DOKAN_SUCCESS
            }
            Err(code) => {
                debug!(code, "Volume attach refused");
                code
            }
        }
    }

    fn close_file_system(&self) {
        if !self.is_attached() {
            return;
        }
        self.signal(false);
        let Some(attached) = self.attached.lock().take() else {
            return;
        };
        drop(attached.sender);
        // A callback stuck in the file system keeps its worker; waiting on it
        // is bounded by the volume timeout.
        let deadline = Instant::now() + attached.volume.timeout;
        let abandoned = attached.pool.shutdown(deadline);
        debug!(abandoned, "Volume detached");
    }

    fn notify(&self, notification: &Notification) -> bool {
        let Some(mount_point) = self.mount_point() else {
            return false;
        };
        let inside = |path: &str| {
            path.get(..mount_point.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&mount_point))
        };
        let accepted = match notification {
            Notification::Rename { old_path, new_path, .. } => inside(old_path) && inside(new_path),
            other => inside(other.path()),
        };
        if accepted {
            trace!(?notification, "Notification");
            self.notifications.lock().push(notification.clone());
        } else {
            debug!(path = notification.path(), "Notification outside the volume");
        }
        accepted
    }

    fn reset_timeout(&self, timeout: Duration, _info: *mut RawFileInfo) -> bool {
        let Some(deadline) = CURRENT_CALL.with_borrow(Clone::clone) else {
            return false;
        };
        *deadline.0.lock() = Instant::now() + timeout;
        self.timeout_resets.lock().push(timeout);
        trace!(timeout_ms = timeout.as_millis(), "Request deadline extended");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DOKAN_DRIVE_LETTER_ERROR;
    use std::sync::atomic::{AtomicU32, Ordering};

    static MOUNTED: AtomicU32 = AtomicU32::new(0);
    static UNMOUNTED: AtomicU32 = AtomicU32::new(0);

    unsafe extern "system" fn count_mounted(_mount_point: *const u16, _info: *mut RawFileInfo) -> i32 {
        MOUNTED.fetch_add(1, Ordering::SeqCst);
        0
    }

    unsafe extern "system" fn count_unmounted(_info: *mut RawFileInfo) -> i32 {
        UNMOUNTED.fetch_add(1, Ordering::SeqCst);
        0
    }

    unsafe extern "system" fn report_thread(_file_name: *const u16, _info: *mut RawFileInfo) -> i32 {
        let on_worker = thread::current().name().is_some_and(|name| name.starts_with("dokan-"));
        if on_worker { 0 } else { NtStatus::UNSUCCESSFUL.0 }
    }

    fn options(mount_point: &U16CString) -> RawOptions {
        RawOptions {
            version: 210,
            mount_point: mount_point.as_ptr(),
            timeout: 1000,
            ..RawOptions::default()
        }
    }

    #[test]
    fn test_attach_calls_lifecycle_callbacks() {
        let mount_point = U16CString::from_str("T:\\").unwrap();
        let operations = DokanOperations {
            mounted: Some(count_mounted),
            unmounted: Some(count_unmounted),
            ..DokanOperations::default()
        };
        let driver = InProcessDriver::new().with_workers(2);
        let before = (MOUNTED.load(Ordering::SeqCst), UNMOUNTED.load(Ordering::SeqCst));

        assert_eq!(driver.create_file_system(&options(&mount_point), &operations), DOKAN_SUCCESS);
        assert!(driver.is_attached());
        assert_eq!(driver.mount_point().as_deref(), Some("T:\\"));
        assert_eq!(MOUNTED.load(Ordering::SeqCst), before.0 + 1);

        driver.close_file_system();
        assert!(!driver.is_attached());
        assert_eq!(UNMOUNTED.load(Ordering::SeqCst), before.1 + 1);
    }

    #[test]
    fn test_attach_rejects_bad_options() {
        let mount_point = U16CString::from_str("T:\\").unwrap();
        let driver = InProcessDriver::new();
        let mut old = options(&mount_point);
        old.version = 100;
        assert_eq!(driver.create_file_system(&old, &DokanOperations::default()), DOKAN_VERSION_ERROR);

        let missing = RawOptions {
            version: 210,
            ..RawOptions::default()
        };
        assert_eq!(
            driver.create_file_system(&missing, &DokanOperations::default()),
            DOKAN_MOUNT_POINT_ERROR
        );
        assert!(!driver.is_attached());
    }

    #[test]
    fn test_second_attach_fails() {
        let mount_point = U16CString::from_str("T:\\").unwrap();
        let driver = InProcessDriver::new();
        let ops = DokanOperations::default();
        assert_eq!(driver.create_file_system(&options(&mount_point), &ops), DOKAN_SUCCESS);
        assert_eq!(driver.create_file_system(&options(&mount_point), &ops), DOKAN_MOUNT_ERROR);
        driver.close_file_system();
    }

    #[test]
    fn test_failing_driver() {
        let mount_point = U16CString::from_str("T:\\").unwrap();
        let driver = InProcessDriver::failing(DOKAN_DRIVE_LETTER_ERROR);
        assert_eq!(
            driver.create_file_system(&options(&mount_point), &DokanOperations::default()),
            DOKAN_DRIVE_LETTER_ERROR
        );
    }

    #[test]
    fn test_callbacks_run_on_named_workers() {
        let mount_point = U16CString::from_str("T:\\").unwrap();
        let operations = DokanOperations {
            flush_file_buffers: Some(report_thread),
            ..DokanOperations::default()
        };
        let driver = InProcessDriver::new();
        assert_eq!(driver.create_file_system(&options(&mount_point), &operations), DOKAN_SUCCESS);
        let file = DriverFile::from_raw("\\a", 1).unwrap();
        assert_eq!(driver.flush(&file), Ok(()));
        assert_eq!(driver.read(&file, 0, 4), Err(NtStatus::NOT_IMPLEMENTED));
        driver.close_file_system();
    }

    #[test]
    fn test_notify_needs_path_on_volume() {
        let mount_point = U16CString::from_str("T:\\").unwrap();
        let driver = InProcessDriver::new();
        let update = |path: &str| Notification::Update { path: path.to_string() };
        assert!(!driver.notify(&update("T:\\a.txt")));

        assert_eq!(driver.create_file_system(&options(&mount_point), &DokanOperations::default()), DOKAN_SUCCESS);
        assert!(driver.notify(&update("t:\\a.txt")));
        assert!(!driver.notify(&update("X:\\a.txt")));
        assert!(!driver.notify(&Notification::Rename {
            old_path: "T:\\a.txt".to_string(),
            new_path: "X:\\a.txt".to_string(),
            is_directory: false,
            same_directory: false,
        }));
        assert_eq!(driver.notifications(), [update("t:\\a.txt")]);
        driver.close_file_system();
    }

    #[test]
    fn test_reset_timeout_outside_callback_is_refused() {
        let driver = InProcessDriver::new();
        assert!(!driver.reset_timeout(Duration::from_secs(1), ptr::null_mut()));
        assert!(driver.timeout_resets().is_empty());
    }

    #[test]
    fn test_calls_without_volume_fail() {
        let driver = InProcessDriver::new();
        let file = DriverFile::from_raw("\\a", 1).unwrap();
        assert_eq!(driver.flush(&file), Err(NtStatus::INVALID_DEVICE_STATE));
    }
}
