//! Routes callback requests to the filesystem.
//!
//! [`Dispatcher::dispatch`] is the single entry point for every driver
//! callback. It admits the request through the lifecycle gate, checks
//! capability and write protection, resolves the handle, enforces the
//! per-operation threading contract and finally calls into the
//! [`DokanFileSystem`].
//!
//! # Lock Order
//!
//! global single-thread mutex → lifecycle lock → per-handle lock. Every wait
//! is bounded by the configured lock timeout.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, debug_span, error, trace, warn};

use crate::config::MountConfig;
use crate::driver::TimeoutReset;
use crate::error::{DokanError, DokanResult};
use crate::filesystem::{DokanFileSystem, FileContext};
use crate::flags::FileSystemFlags;
use crate::handle_table::{HandleId, HandleState, HandleTable, OpenFile};
use crate::info::{FindData, StreamData};
use crate::lifecycle::LifecycleGate;
use crate::path::DokanPath;
use crate::pattern;
use crate::request::{
    CallbackRequest, Contract, CreateRequest, FillFindData, OperationKind, OperationSet, Payload, Reply,
    RequestFlags, RequestId, RequestIdGenerator,
};
use crate::stats::DispatchStats;
use crate::status::NtStatus;

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// Held for its drop only.
#[allow(dead_code)]
enum OpGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

fn acquire(lock: &RwLock<()>, exclusive: bool, timeout: Duration) -> DokanResult<OpGuard<'_>> {
    let guard = if exclusive {
        lock.try_write_for(timeout).map(OpGuard::Exclusive)
    } else {
        lock.try_read_for(timeout).map(OpGuard::Shared)
    };
    guard.ok_or(DokanError::TimedOut(timeout))
}

fn is_notification(kind: OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::Cleanup
            | OperationKind::CloseFile
            | OperationKind::Mounted
            | OperationKind::Unmounted
    )
}

/// Operations that only make sense on a file's data.
fn is_data_operation(kind: OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::ReadFile
            | OperationKind::WriteFile
            | OperationKind::SetEndOfFile
            | OperationKind::SetAllocationSize
            | OperationKind::LockFile
            | OperationKind::UnlockFile
    )
}

/// Per-request fields that do not depend on the payload.
#[derive(Clone, Copy)]
struct Origin<'a> {
    id: RequestId,
    process_id: u32,
    flags: RequestFlags,
    timeout_reset: Option<&'a TimeoutReset>,
}

impl<'a> Origin<'a> {
    fn context(self, file: Option<&'a OpenFile>, cancelled: &'a AtomicBool) -> FileContext<'a> {
        FileContext::new(self.id, self.process_id, self.flags, file, cancelled)
            .with_timeout_reset(self.timeout_reset)
    }
}

/// Routes requests for one mount.
pub struct Dispatcher {
    fs: Arc<dyn DokanFileSystem>,
    table: HandleTable,
    gate: LifecycleGate,
    stats: Arc<DispatchStats>,
    ids: Arc<RequestIdGenerator>,
    supported: OperationSet,
    volume_label: String,
    write_protected: bool,
    case_sensitive: bool,
    lock_timeout: Duration,
    single_thread: Option<Mutex<()>>,
    lifecycle_lock: RwLock<()>,
}

impl Dispatcher {
    pub fn new(fs: Arc<dyn DokanFileSystem>, config: &MountConfig) -> Self {
        let gate = LifecycleGate::new();
        let stats = Arc::new(DispatchStats::new());
        let ids = Arc::new(RequestIdGenerator::new());

        let table = {
            let fs = Arc::clone(&fs);
            let stats = Arc::clone(&stats);
            let ids = Arc::clone(&ids);
            let cancelled = gate.cancel_token();
            HandleTable::with_finalizer(config.case_sensitive(), move |file: &OpenFile| {
                let ctx = FileContext::new(ids.next(), 0, RequestFlags::empty(), Some(file), &cancelled);
                let path = file.path();
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| fs.close(&path, &ctx))) {
                    stats.record_panic();
                    error!(handle = %file.id(), message = %panic_message(&*payload), "close callback panicked");
                }
                stats.record_handle_closed();
                trace!(handle = %file.id(), path = %path, "Handle released");
            })
        };

        Self {
            supported: fs.supported_operations(),
            volume_label: config.volume_label.clone(),
            fs,
            table,
            gate,
            stats,
            ids,
            write_protected: config.write_protected(),
            case_sensitive: config.case_sensitive(),
            lock_timeout: config.lock_timeout,
            single_thread: config.single_thread.then(|| Mutex::new(())),
            lifecycle_lock: RwLock::new(()),
        }
    }

    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    pub fn gate(&self) -> &LifecycleGate {
        &self.gate
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn filesystem(&self) -> &Arc<dyn DokanFileSystem> {
        &self.fs
    }

    /// Operations the filesystem implements.
    pub fn supported_operations(&self) -> OperationSet {
        self.supported
    }

    /// Operations the driver should route here.
    ///
    /// Handle bookkeeping needs cleanup and close even when the filesystem has
    /// nothing to do for them, and pattern listing falls back to plain listing.
    pub fn registered_operations(&self) -> OperationSet {
        let mut set = self
            .supported
            .with(OperationKind::Cleanup)
            .with(OperationKind::CloseFile)
            .with(OperationKind::Mounted)
            .with(OperationKind::Unmounted);
        if set.contains(OperationKind::FindFiles) {
            set = set.with(OperationKind::FindFilesWithPattern);
        }
        set
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn next_request_id(&self) -> RequestId {
        self.ids.next()
    }

    /// Handle one callback.
    pub fn dispatch(&self, request: CallbackRequest<'_>) -> DokanResult<Reply> {
        let kind = request.kind();
        let span = debug_span!("dokan_request", id = %request.id, op = %kind);
        let _entered = span.enter();
        let started = Instant::now();

        let result = self.dispatch_admitted(request);

        let status = match &result {
            Ok(_) => NtStatus::SUCCESS,
            Err(e) => e.to_ntstatus(),
        };
        self.stats.record(kind, status, started.elapsed());
        match &result {
            Ok(_) => trace!("Request completed"),
            Err(DokanError::TimedOut(timeout)) => {
                warn!(?timeout, "Lock wait timed out");
            }
            Err(DokanError::Panic(_)) => {}
            Err(e) => debug!(error = %e, %status, "Request failed"),
        }
        result
    }

    fn dispatch_admitted(&self, request: CallbackRequest<'_>) -> DokanResult<Reply> {
        let kind = request.kind();
        let _admitted = self
            .gate
            .admit(kind)
            .inspect_err(|_| self.stats.record_rejected())?;

        if !is_notification(kind) && !self.registered_operations().contains(kind) {
            return Err(DokanError::NotSupported(kind));
        }
        let creates_mutation = matches!(&request.payload, Payload::Create(create) if create.is_mutating());
        if self.write_protected && (kind.is_mutating() || creates_mutation) {
            return Err(DokanError::WriteProtected);
        }

        let _global = match &self.single_thread {
            Some(lock) => Some(
                lock.try_lock_for(self.lock_timeout)
                    .ok_or(DokanError::TimedOut(self.lock_timeout))?,
            ),
            None => None,
        };
        let _lifecycle = acquire(
            &self.lifecycle_lock,
            kind.contract() == Contract::Lifecycle,
            self.lock_timeout,
        )?;

        let CallbackRequest {
            id,
            path,
            handle,
            flags,
            process_id,
            payload,
            timeout_reset,
        } = request;
        let origin = Origin {
            id,
            process_id,
            flags,
            timeout_reset: timeout_reset.as_ref(),
        };

        if kind.targets_handle() {
            let handle = handle.ok_or(DokanError::InvalidArgument("missing file context"))?;
            self.dispatch_handle(kind, handle, origin, payload)
        } else {
            self.dispatch_volume(&path, origin, payload)
        }
    }

    fn dispatch_volume(&self, path: &DokanPath, origin: Origin<'_>, payload: Payload<'_>) -> DokanResult<Reply> {
        let cancelled = self.gate.cancel_token();
        let ctx = origin.context(None, &cancelled);
        match payload {
            Payload::Create(create) => self.create(path, &create, origin, &cancelled),
            Payload::GetDiskFreeSpace => self
                .call(OperationKind::GetDiskFreeSpace, || self.fs.get_disk_free_space(&ctx))
                .map(Reply::DiskSpace),
            Payload::GetVolumeInformation => {
                let mut volume = self.call(OperationKind::GetVolumeInformation, || {
                    self.fs.get_volume_information(&ctx)
                })?;
                if volume.volume_name.is_empty() {
                    volume.volume_name.clone_from(&self.volume_label);
                }
                if self.write_protected {
                    volume.file_system_flags |= FileSystemFlags::READ_ONLY_VOLUME;
                }
                if self.case_sensitive {
                    volume.file_system_flags |= FileSystemFlags::CASE_SENSITIVE_SEARCH;
                }
                Ok(Reply::Volume(volume))
            }
            Payload::Mounted { mount_point } => {
                self.call(OperationKind::Mounted, || self.fs.mounted(&mount_point, &ctx))?;
                Ok(Reply::Done)
            }
            Payload::Unmounted => {
                self.call(OperationKind::Unmounted, || self.fs.unmounted(&ctx))?;
                Ok(Reply::Done)
            }
            other => Err(DokanError::NotSupported(other.kind())),
        }
    }

    fn create(
        &self,
        path: &DokanPath,
        create: &CreateRequest,
        origin: Origin<'_>,
        cancelled: &AtomicBool,
    ) -> DokanResult<Reply> {
        let reservation = self.table.reserve(path, create)?;
        let ctx = origin.context(Some(reservation.file()), cancelled);
        // A failed create drops the reservation, which rolls it back.
        let outcome = self.call(OperationKind::CreateFile, || self.fs.create(path, create, &ctx))?;
        let handle = reservation.commit(outcome.is_directory);
        self.stats.record_handle_opened();
        debug!(%handle, %path, action = ?outcome.action, "Opened");
        Ok(Reply::Created {
            handle,
            is_directory: outcome.is_directory,
            action: outcome.action,
        })
    }

    fn dispatch_handle(
        &self,
        kind: OperationKind,
        handle: HandleId,
        origin: Origin<'_>,
        payload: Payload<'_>,
    ) -> DokanResult<Reply> {
        if kind == OperationKind::CloseFile {
            let outcome = self.table.close(handle)?;
            trace!(%handle, ?outcome, "Close");
            return Ok(Reply::Done);
        }

        let file = self.table.lookup(handle)?;
        self.check_handle(kind, &file, origin.flags)?;

        let exclusive = kind.contract() != Contract::Shared;
        let _op = acquire(file.op_lock(), exclusive, self.lock_timeout)?;

        let cancelled = self.gate.cancel_token();
        if kind != OperationKind::Cleanup && self.gate.is_cancelled() {
            return Err(DokanError::Cancelled);
        }
        let ctx = origin.context(Some(&*file), &cancelled);
        let path = file.path();

        match payload {
            Payload::Cleanup => {
                self.table.mark_cleaned_up(&file)?;
                self.call(kind, || {
                    self.fs.cleanup(&path, &ctx);
                    Ok(())
                })?;
                Ok(Reply::Done)
            }
            Payload::Read { offset, buffer } => {
                let capacity = buffer.len();
                let read = self
                    .call(kind, || self.fs.read(&path, buffer, offset, &ctx))?
                    .min(capacity);
                self.stats.record_read(read);
                Ok(Reply::Read(read))
            }
            Payload::Write { offset, data } => {
                let written = self
                    .call(kind, || self.fs.write(&path, data, offset, &ctx))?
                    .min(data.len());
                self.stats.record_write(written);
                Ok(Reply::Written(written))
            }
            Payload::Flush => {
                self.call(kind, || self.fs.flush(&path, &ctx))?;
                Ok(Reply::Done)
            }
            Payload::GetFileInformation => self
                .call(kind, || self.fs.get_file_information(&path, &ctx))
                .map(Reply::FileInformation),
            Payload::FindFiles { fill } => {
                let mut listed = 0usize;
                {
                    let mut counting = |entry: &FindData| -> DokanResult<()> {
                        fill(entry)?;
                        listed += 1;
                        Ok(())
                    };
                    self.call(kind, || self.fs.find_files(&path, &mut counting, &ctx))?;
                }
                Ok(Reply::Listed(listed))
            }
            Payload::FindFilesWithPattern { pattern, fill } => {
                self.find_with_pattern(&path, &pattern, fill, &ctx)
            }
            Payload::SetFileAttributes(attributes) => {
                self.call(kind, || self.fs.set_file_attributes(&path, attributes, &ctx))?;
                Ok(Reply::Done)
            }
            Payload::SetFileTime(times) => {
                self.call(kind, || self.fs.set_file_time(&path, &times, &ctx))?;
                Ok(Reply::Done)
            }
            Payload::DeleteFile => {
                self.call(kind, || self.fs.delete_file(&path, &ctx))?;
                file.set_delete_on_close(true);
                Ok(Reply::Done)
            }
            Payload::DeleteDirectory => {
                self.call(kind, || self.fs.delete_directory(&path, &ctx))?;
                file.set_delete_on_close(true);
                Ok(Reply::Done)
            }
            Payload::MoveFile {
                new_path,
                replace_if_existing,
            } => {
                self.call(kind, || {
                    self.fs.move_file(&path, &new_path, replace_if_existing, &ctx)
                })?;
                self.table.rename(&path, &new_path);
                debug!(from = %path, to = %new_path, "Renamed");
                Ok(Reply::Done)
            }
            Payload::SetEndOfFile(length) => {
                self.call(kind, || self.fs.set_end_of_file(&path, length, &ctx))?;
                Ok(Reply::Done)
            }
            Payload::SetAllocationSize(size) => {
                self.call(kind, || self.fs.set_allocation_size(&path, size, &ctx))?;
                Ok(Reply::Done)
            }
            Payload::LockFile { offset, length } => {
                self.call(kind, || self.fs.lock_file(&path, offset, length, &ctx))?;
                Ok(Reply::Done)
            }
            Payload::UnlockFile { offset, length } => {
                self.call(kind, || self.fs.unlock_file(&path, offset, length, &ctx))?;
                Ok(Reply::Done)
            }
            Payload::GetFileSecurity {
                security_information,
                buffer,
            } => {
                let length_needed = self.call(kind, || {
                    self.fs
                        .get_file_security(&path, security_information, buffer, &ctx)
                })?;
                Ok(Reply::Security { length_needed })
            }
            Payload::SetFileSecurity {
                security_information,
                descriptor,
            } => {
                self.call(kind, || {
                    self.fs
                        .set_file_security(&path, security_information, descriptor, &ctx)
                })?;
                Ok(Reply::Done)
            }
            Payload::FindStreams { fill } => {
                let mut listed = 0usize;
                {
                    let mut counting = |entry: &StreamData| -> DokanResult<()> {
                        fill(entry)?;
                        listed += 1;
                        Ok(())
                    };
                    self.call(kind, || self.fs.find_streams(&path, &mut counting, &ctx))?;
                }
                Ok(Reply::Listed(listed))
            }
            other => Err(DokanError::NotSupported(other.kind())),
        }
    }

    fn check_handle(&self, kind: OperationKind, file: &OpenFile, flags: RequestFlags) -> DokanResult<()> {
        if file.state() == HandleState::CleanedUp && !kind.allowed_after_cleanup() {
            return Err(DokanError::invalid_state(format!(
                "{kind} on {} after cleanup",
                file.id()
            )));
        }
        if file.is_directory() && is_data_operation(kind) {
            return Err(DokanError::invalid_state(format!(
                "{kind} on directory handle {}",
                file.id()
            )));
        }
        if !file.is_directory()
            && matches!(
                kind,
                OperationKind::FindFiles | OperationKind::FindFilesWithPattern
            )
        {
            return Err(DokanError::invalid_state(format!(
                "{kind} on file handle {}",
                file.id()
            )));
        }
        // Paging writes come from the memory manager, not the opener.
        if kind == OperationKind::WriteFile
            && !flags.contains(RequestFlags::PAGING_IO)
            && !file.access().can_write()
        {
            return Err(DokanError::access_denied(format!(
                "{} was not opened for writing",
                file.path()
            )));
        }
        if matches!(kind, OperationKind::DeleteFile | OperationKind::DeleteDirectory)
            && !file.access().can_delete()
        {
            return Err(DokanError::access_denied(format!(
                "{} was not opened for delete",
                file.path()
            )));
        }
        Ok(())
    }

    fn find_with_pattern(
        &self,
        path: &DokanPath,
        expression: &str,
        fill: &mut FillFindData<'_>,
        ctx: &FileContext<'_>,
    ) -> DokanResult<Reply> {
        let mut listed = 0usize;
        if self.supported.contains(OperationKind::FindFilesWithPattern) {
            let native = {
                let mut counting = |entry: &FindData| -> DokanResult<()> {
                    fill(entry)?;
                    listed += 1;
                    Ok(())
                };
                self.call(OperationKind::FindFilesWithPattern, || {
                    self.fs
                        .find_files_with_pattern(path, expression, &mut counting, ctx)
                })
            };
            match native {
                Ok(()) => return Ok(Reply::Listed(listed)),
                Err(DokanError::NotSupported(_)) => listed = 0,
                Err(e) => return Err(e),
            }
        }

        let ignore_case = !self.case_sensitive;
        {
            let mut filtering = |entry: &FindData| -> DokanResult<()> {
                if pattern::is_name_in_expression(expression, &entry.file_name, ignore_case) {
                    fill(entry)?;
                    listed += 1;
                }
                Ok(())
            };
            self.call(OperationKind::FindFiles, || {
                self.fs.find_files(path, &mut filtering, ctx)
            })?;
        }
        Ok(Reply::Listed(listed))
    }

    /// Call into the filesystem, turning a panic into an error.
    fn call<T>(&self, kind: OperationKind, f: impl FnOnce() -> DokanResult<T>) -> DokanResult<T> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&*payload);
                self.stats.record_panic();
                error!(op = %kind, %message, "Filesystem callback panicked");
                Err(DokanError::Panic(message))
            }
        }
    }

    /// Clean up and close every handle the driver left open.
    ///
    /// Runs while the gate is closed, during a graceful unmount. Returns the
    /// number of handles released.
    pub fn release_all(&self) -> usize {
        let cancelled = self.gate.cancel_token();
        let mut released = 0;
        for handle in self.table.open_handles() {
            if let Ok(file) = self.table.lookup(handle) {
                match file.op_lock().try_write_for(self.lock_timeout) {
                    Some(_op) => {
                        if file.state() == HandleState::Open && self.table.mark_cleaned_up(&file).is_ok() {
                            let ctx = FileContext::new(
                                self.ids.next(),
                                0,
                                RequestFlags::empty(),
                                Some(&*file),
                                &cancelled,
                            );
                            let path = file.path();
                            let _ = self.call(OperationKind::Cleanup, || {
                                self.fs.cleanup(&path, &ctx);
                                Ok(())
                            });
                        }
                    }
                    None => warn!(%handle, "Cleanup skipped; handle lock busy"),
                }
            }
            if self.table.close(handle).is_ok() {
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, "Released handles left open by the driver");
        }
        released
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("table", &self.table)
            .field("state", &self.gate.state())
            .field("supported", &self.supported)
            .field("write_protected", &self.write_protected)
            .field("single_thread", &self.single_thread.is_some())
            .finish_non_exhaustive()
    }
}
