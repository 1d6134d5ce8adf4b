//! The trait a filesystem implements to be mounted.
//!
//! Every method has a default: data operations fail with
//! [`DokanError::NotSupported`], notifications (`cleanup`, `close`, `mounted`,
//! `unmounted`) do nothing. An implementation overrides the capabilities it has
//! and reports them through [`DokanFileSystem::supported_operations`]; the
//! dispatcher answers everything outside that set itself, without calling in.
//!
//! Methods are invoked from the driver's callback threads. The dispatcher
//! guarantees that serialized operations on one handle never overlap, but
//! operations on distinct handles, including ones naming the same path, run
//! concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::driver::TimeoutReset;
use crate::error::{DokanError, DokanResult};
use crate::flags::{AccessMask, FileAttributes};
use crate::handle_table::{HandleId, OpenFile};
use crate::info::{DiskSpace, FileInformation, FileTimes, VolumeInformation};
use crate::path::DokanPath;
use crate::request::{
    CreateAction, CreateRequest, FillFindData, FillFindStreamData, OperationKind, OperationSet,
    RequestFlags, RequestId,
};

/// Per-request view handed to every filesystem method.
pub struct FileContext<'a> {
    request_id: RequestId,
    process_id: u32,
    flags: RequestFlags,
    file: Option<&'a OpenFile>,
    cancelled: &'a AtomicBool,
    timeout_reset: Option<&'a TimeoutReset>,
}

impl<'a> FileContext<'a> {
    pub(crate) fn new(
        request_id: RequestId,
        process_id: u32,
        flags: RequestFlags,
        file: Option<&'a OpenFile>,
        cancelled: &'a AtomicBool,
    ) -> Self {
        Self {
            request_id,
            process_id,
            flags,
            file,
            cancelled,
            timeout_reset: None,
        }
    }

    #[must_use]
    pub(crate) fn with_timeout_reset(mut self, reset: Option<&'a TimeoutReset>) -> Self {
        self.timeout_reset = reset;
        self
    }

    /// A volume-level context outside any dispatch, for calling a
    /// filesystem directly.
    pub fn detached(cancelled: &'a AtomicBool) -> Self {
        Self::new(RequestId::new(0), 0, RequestFlags::empty(), None, cancelled)
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Process that issued the request.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub fn paging_io(&self) -> bool {
        self.flags.contains(RequestFlags::PAGING_IO)
    }

    /// Write at end of file, ignoring the offset.
    pub fn write_to_end_of_file(&self) -> bool {
        self.flags.contains(RequestFlags::WRITE_TO_END_OF_FILE)
    }

    /// Handle the request targets; [`HandleId::NONE`] for volume requests.
    pub fn handle(&self) -> HandleId {
        self.file.map_or(HandleId::NONE, OpenFile::id)
    }

    pub fn is_directory(&self) -> bool {
        self.file.is_some_and(OpenFile::is_directory)
    }

    /// Whether the entry must be removed when the handle is cleaned up.
    pub fn delete_on_close(&self) -> bool {
        self.file.is_some_and(OpenFile::delete_on_close)
    }

    /// Access granted when the handle was opened.
    pub fn access(&self) -> AccessMask {
        self.file.map_or(AccessMask::empty(), OpenFile::access)
    }

    /// The per-open word the implementation stored at create time.
    pub fn user_context(&self) -> u64 {
        self.file
            .map_or(0, |file| file.user_context().load(Ordering::Acquire))
    }

    pub fn set_user_context(&self, value: u64) {
        if let Some(file) = self.file {
            file.user_context().store(value, Ordering::Release);
        }
    }

    /// Ask the driver to wait `timeout` longer for this request before it
    /// gives up. `false` when the driver cannot extend it.
    pub fn reset_timeout(&self, timeout: Duration) -> bool {
        self.timeout_reset.is_some_and(|reset| reset.reset(timeout))
    }

    /// Set once a forced unmount has begun; long operations should bail out.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOutcome {
    /// The opened entry is a directory.
    pub is_directory: bool,
    pub action: CreateAction,
}

impl CreateOutcome {
    pub fn opened(is_directory: bool) -> Self {
        Self {
            is_directory,
            action: CreateAction::Opened,
        }
    }

    pub fn created(is_directory: bool) -> Self {
        Self {
            is_directory,
            action: CreateAction::Created,
        }
    }
}

fn not_supported<T>(kind: OperationKind) -> DokanResult<T> {
    Err(DokanError::NotSupported(kind))
}

/// A user-mode filesystem served through the driver.
pub trait DokanFileSystem: Send + Sync {
    /// Capabilities this implementation provides.
    fn supported_operations(&self) -> OperationSet {
        OperationSet::all()
    }

    /// Open or create `path` (`ZwCreateFile`).
    ///
    /// The handle id is already allocated and visible through
    /// [`FileContext::handle`]; per-open state can be stored with
    /// [`FileContext::set_user_context`].
    fn create(
        &self,
        path: &DokanPath,
        request: &CreateRequest,
        ctx: &FileContext<'_>,
    ) -> DokanResult<CreateOutcome> {
        let _ = (path, request, ctx);
        not_supported(OperationKind::CreateFile)
    }

    /// The last user handle was closed. Entries flagged delete-on-close are
    /// removed here.
    fn cleanup(&self, path: &DokanPath, ctx: &FileContext<'_>) {
        let _ = (path, ctx);
    }

    /// The handle is gone; release per-open state.
    fn close(&self, path: &DokanPath, ctx: &FileContext<'_>) {
        let _ = (path, ctx);
    }

    /// Fill `buffer` from `offset`; returns the bytes read.
    fn read(
        &self,
        path: &DokanPath,
        buffer: &mut [u8],
        offset: u64,
        ctx: &FileContext<'_>,
    ) -> DokanResult<usize> {
        let _ = (path, buffer, offset, ctx);
        not_supported(OperationKind::ReadFile)
    }

    /// Write `data` at `offset`, or at end of file when
    /// [`FileContext::write_to_end_of_file`] is set; returns the bytes written.
    fn write(
        &self,
        path: &DokanPath,
        data: &[u8],
        offset: u64,
        ctx: &FileContext<'_>,
    ) -> DokanResult<usize> {
        let _ = (path, data, offset, ctx);
        not_supported(OperationKind::WriteFile)
    }

    fn flush(&self, path: &DokanPath, ctx: &FileContext<'_>) -> DokanResult<()> {
        let _ = (path, ctx);
        not_supported(OperationKind::FlushFileBuffers)
    }

    fn get_file_information(
        &self,
        path: &DokanPath,
        ctx: &FileContext<'_>,
    ) -> DokanResult<FileInformation> {
        let _ = (path, ctx);
        not_supported(OperationKind::GetFileInformation)
    }

    /// List the directory, passing every entry to `fill`.
    fn find_files(
        &self,
        path: &DokanPath,
        fill: &mut FillFindData<'_>,
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, fill, ctx);
        not_supported(OperationKind::FindFiles)
    }

    /// List entries matching a DOS wildcard `pattern`.
    ///
    /// Without this, the dispatcher filters [`find_files`](Self::find_files).
    fn find_files_with_pattern(
        &self,
        path: &DokanPath,
        pattern: &str,
        fill: &mut FillFindData<'_>,
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, pattern, fill, ctx);
        not_supported(OperationKind::FindFilesWithPattern)
    }

    fn set_file_attributes(
        &self,
        path: &DokanPath,
        attributes: FileAttributes,
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, attributes, ctx);
        not_supported(OperationKind::SetFileAttributes)
    }

    fn set_file_time(
        &self,
        path: &DokanPath,
        times: &FileTimes,
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, times, ctx);
        not_supported(OperationKind::SetFileTime)
    }

    /// May `path` be deleted? Success marks the handle delete-on-close; the
    /// removal itself happens in [`cleanup`](Self::cleanup).
    fn delete_file(&self, path: &DokanPath, ctx: &FileContext<'_>) -> DokanResult<()> {
        let _ = (path, ctx);
        not_supported(OperationKind::DeleteFile)
    }

    /// Like [`delete_file`](Self::delete_file); non-empty directories should
    /// fail with `STATUS_DIRECTORY_NOT_EMPTY`.
    fn delete_directory(&self, path: &DokanPath, ctx: &FileContext<'_>) -> DokanResult<()> {
        let _ = (path, ctx);
        not_supported(OperationKind::DeleteDirectory)
    }

    fn move_file(
        &self,
        path: &DokanPath,
        new_path: &DokanPath,
        replace_if_existing: bool,
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, new_path, replace_if_existing, ctx);
        not_supported(OperationKind::MoveFile)
    }

    /// Truncate or extend to `length`.
    fn set_end_of_file(&self, path: &DokanPath, length: u64, ctx: &FileContext<'_>) -> DokanResult<()> {
        let _ = (path, length, ctx);
        not_supported(OperationKind::SetEndOfFile)
    }

    fn set_allocation_size(
        &self,
        path: &DokanPath,
        size: u64,
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, size, ctx);
        not_supported(OperationKind::SetAllocationSize)
    }

    /// Byte-range lock (only with `FILELOCK_USER_MODE`).
    fn lock_file(
        &self,
        path: &DokanPath,
        offset: u64,
        length: u64,
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, offset, length, ctx);
        not_supported(OperationKind::LockFile)
    }

    fn unlock_file(
        &self,
        path: &DokanPath,
        offset: u64,
        length: u64,
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, offset, length, ctx);
        not_supported(OperationKind::UnlockFile)
    }

    fn get_disk_free_space(&self, ctx: &FileContext<'_>) -> DokanResult<DiskSpace> {
        let _ = ctx;
        not_supported(OperationKind::GetDiskFreeSpace)
    }

    fn get_volume_information(&self, ctx: &FileContext<'_>) -> DokanResult<VolumeInformation> {
        let _ = ctx;
        not_supported(OperationKind::GetVolumeInformation)
    }

    /// The volume is visible at `mount_point`.
    fn mounted(&self, mount_point: &str, ctx: &FileContext<'_>) -> DokanResult<()> {
        let _ = (mount_point, ctx);
        Ok(())
    }

    /// The volume has been detached.
    fn unmounted(&self, ctx: &FileContext<'_>) -> DokanResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Copy the self-relative security descriptor into `buffer`.
    ///
    /// Returns the full descriptor length; when it exceeds `buffer.len()`
    /// the dispatcher reports `STATUS_BUFFER_OVERFLOW`.
    fn get_file_security(
        &self,
        path: &DokanPath,
        security_information: u32,
        buffer: &mut [u8],
        ctx: &FileContext<'_>,
    ) -> DokanResult<usize> {
        let _ = (path, security_information, buffer, ctx);
        not_supported(OperationKind::GetFileSecurity)
    }

    fn set_file_security(
        &self,
        path: &DokanPath,
        security_information: u32,
        descriptor: &[u8],
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, security_information, descriptor, ctx);
        not_supported(OperationKind::SetFileSecurity)
    }

    /// List alternate data streams (only with `ALT_STREAM`).
    fn find_streams(
        &self,
        path: &DokanPath,
        fill: &mut FillFindStreamData<'_>,
        ctx: &FileContext<'_>,
    ) -> DokanResult<()> {
        let _ = (path, fill, ctx);
        not_supported(OperationKind::FindStreams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusClass;

    struct Nothing;

    impl DokanFileSystem for Nothing {}

    #[test]
    fn test_defaults_are_not_supported() {
        let cancelled = AtomicBool::new(false);
        let ctx = FileContext::new(RequestId::new(1), 0, RequestFlags::empty(), None, &cancelled);
        let fs = Nothing;
        let root = DokanPath::root();

        let err = fs
            .create(&root, &CreateRequest::open(AccessMask::GENERIC_READ), &ctx)
            .unwrap_err();
        assert_eq!(err.class(), StatusClass::NotSupported);
        assert!(matches!(
            fs.read(&root, &mut [0; 4], 0, &ctx),
            Err(DokanError::NotSupported(OperationKind::ReadFile))
        ));
        assert!(matches!(
            fs.get_volume_information(&ctx),
            Err(DokanError::NotSupported(OperationKind::GetVolumeInformation))
        ));
        assert!(fs.mounted("M:\\", &ctx).is_ok());
        assert!(fs.unmounted(&ctx).is_ok());
    }

    #[test]
    fn test_volume_context_has_no_handle() {
        let cancelled = AtomicBool::new(true);
        let ctx = FileContext::new(
            RequestId::new(1),
            77,
            RequestFlags::WRITE_TO_END_OF_FILE,
            None,
            &cancelled,
        );
        assert_eq!(ctx.handle(), HandleId::NONE);
        assert_eq!(ctx.user_context(), 0);
        ctx.set_user_context(5);
        assert_eq!(ctx.user_context(), 0);
        assert_eq!(ctx.process_id(), 77);
        assert!(ctx.write_to_end_of_file());
        assert!(ctx.is_cancelled());
    }
}
