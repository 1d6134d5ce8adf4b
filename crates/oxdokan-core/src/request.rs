//! Callback requests as they flow from the trampoline to the dispatcher.
//!
//! A [`CallbackRequest`] is created for every driver invocation and discarded
//! once the reply has crossed back to native code. Payload buffers are borrowed
//! from the driver for exactly that long.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::driver::TimeoutReset;
use crate::error::DokanResult;
use crate::flags::{AccessMask, CreateDisposition, CreateOptions, FileAttributes, ShareAccess};
use crate::handle_table::HandleId;
use crate::info::{DiskSpace, FileInformation, FileTimes, FindData, StreamData, VolumeInformation};
use crate::path::DokanPath;

/// Threading contract of an operation.
///
/// The dispatcher takes the per-handle lock in the matching mode. Distinct
/// handles never contend with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Contract {
    /// Read-only; may run concurrently on the same handle.
    Shared,
    /// Mutating; strictly ordered per handle.
    Serialized,
    /// Volume lifecycle notification; excludes every other request.
    Lifecycle,
}

/// The 25 driver callbacks, in `DOKAN_OPERATIONS` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum OperationKind {
    CreateFile = 0,
    Cleanup,
    CloseFile,
    ReadFile,
    WriteFile,
    FlushFileBuffers,
    GetFileInformation,
    FindFiles,
    FindFilesWithPattern,
    SetFileAttributes,
    SetFileTime,
    DeleteFile,
    DeleteDirectory,
    MoveFile,
    SetEndOfFile,
    SetAllocationSize,
    LockFile,
    UnlockFile,
    GetDiskFreeSpace,
    GetVolumeInformation,
    Mounted,
    Unmounted,
    GetFileSecurity,
    SetFileSecurity,
    FindStreams,
}

impl OperationKind {
    /// Number of operation kinds.
    pub const COUNT: usize = 25;

    /// Every kind, in table order.
    pub const ALL: [OperationKind; Self::COUNT] = [
        Self::CreateFile,
        Self::Cleanup,
        Self::CloseFile,
        Self::ReadFile,
        Self::WriteFile,
        Self::FlushFileBuffers,
        Self::GetFileInformation,
        Self::FindFiles,
        Self::FindFilesWithPattern,
        Self::SetFileAttributes,
        Self::SetFileTime,
        Self::DeleteFile,
        Self::DeleteDirectory,
        Self::MoveFile,
        Self::SetEndOfFile,
        Self::SetAllocationSize,
        Self::LockFile,
        Self::UnlockFile,
        Self::GetDiskFreeSpace,
        Self::GetVolumeInformation,
        Self::Mounted,
        Self::Unmounted,
        Self::GetFileSecurity,
        Self::SetFileSecurity,
        Self::FindStreams,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateFile => "ZwCreateFile",
            Self::Cleanup => "Cleanup",
            Self::CloseFile => "CloseFile",
            Self::ReadFile => "ReadFile",
            Self::WriteFile => "WriteFile",
            Self::FlushFileBuffers => "FlushFileBuffers",
            Self::GetFileInformation => "GetFileInformation",
            Self::FindFiles => "FindFiles",
            Self::FindFilesWithPattern => "FindFilesWithPattern",
            Self::SetFileAttributes => "SetFileAttributes",
            Self::SetFileTime => "SetFileTime",
            Self::DeleteFile => "DeleteFile",
            Self::DeleteDirectory => "DeleteDirectory",
            Self::MoveFile => "MoveFile",
            Self::SetEndOfFile => "SetEndOfFile",
            Self::SetAllocationSize => "SetAllocationSize",
            Self::LockFile => "LockFile",
            Self::UnlockFile => "UnlockFile",
            Self::GetDiskFreeSpace => "GetDiskFreeSpace",
            Self::GetVolumeInformation => "GetVolumeInformation",
            Self::Mounted => "Mounted",
            Self::Unmounted => "Unmounted",
            Self::GetFileSecurity => "GetFileSecurity",
            Self::SetFileSecurity => "SetFileSecurity",
            Self::FindStreams => "FindStreams",
        }
    }

    pub fn contract(self) -> Contract {
        match self {
            Self::Mounted | Self::Unmounted => Contract::Lifecycle,
            Self::CreateFile
            | Self::ReadFile
            | Self::GetFileInformation
            | Self::FindFiles
            | Self::FindFilesWithPattern
            | Self::GetDiskFreeSpace
            | Self::GetVolumeInformation
            | Self::GetFileSecurity
            | Self::FindStreams => Contract::Shared,
            _ => Contract::Serialized,
        }
    }

    /// True if the operation changes volume contents.
    ///
    /// These are rejected on write-protected mounts.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::WriteFile
                | Self::SetFileAttributes
                | Self::SetFileTime
                | Self::DeleteFile
                | Self::DeleteDirectory
                | Self::MoveFile
                | Self::SetEndOfFile
                | Self::SetAllocationSize
                | Self::SetFileSecurity
        )
    }

    /// True if the operation acts on an open handle.
    pub fn targets_handle(self) -> bool {
        !matches!(
            self,
            Self::CreateFile
                | Self::GetDiskFreeSpace
                | Self::GetVolumeInformation
                | Self::Mounted
                | Self::Unmounted
        )
    }

    /// True if the operation may still arrive after `Cleanup`.
    ///
    /// Memory-mapped files flush through paging I/O after the last user
    /// handle is gone.
    pub fn allowed_after_cleanup(self) -> bool {
        matches!(
            self,
            Self::CloseFile
                | Self::ReadFile
                | Self::WriteFile
                | Self::FlushFileBuffers
                | Self::GetFileInformation
                | Self::SetEndOfFile
                | Self::SetAllocationSize
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of operation kinds.
///
/// Filesystems declare their capabilities with this; the trampoline only
/// registers callbacks in the set and the dispatcher answers the rest with
/// `STATUS_NOT_IMPLEMENTED`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationSet(u32);

impl OperationSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self((1 << OperationKind::COUNT) - 1)
    }

    /// Everything except mutating operations.
    pub fn read_only() -> Self {
        OperationKind::ALL
            .into_iter()
            .filter(|kind| !kind.is_mutating())
            .collect()
    }

    #[must_use]
    pub const fn with(self, kind: OperationKind) -> Self {
        Self(self.0 | (1 << kind as u32))
    }

    #[must_use]
    pub const fn without(self, kind: OperationKind) -> Self {
        Self(self.0 & !(1 << kind as u32))
    }

    pub const fn contains(self, kind: OperationKind) -> bool {
        self.0 & (1 << kind as u32) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = OperationKind> {
        OperationKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl Default for OperationSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<OperationKind> for OperationSet {
    fn from_iter<I: IntoIterator<Item = OperationKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl fmt::Debug for OperationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Unique identifier for a callback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Create a new request ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Atomic request ID generator.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next request ID.
    pub fn next(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Per-request flags from `DOKAN_FILE_INFO`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u8 {
        /// Request comes from the memory manager.
        const PAGING_IO = 1;
        /// Caller opened the file for synchronous I/O.
        const SYNCHRONOUS_IO = 1 << 1;
        /// Bypass caches.
        const NO_CACHE = 1 << 2;
        /// Append: ignore the offset and write at end of file.
        const WRITE_TO_END_OF_FILE = 1 << 3;
    }
}

/// Parameters of `ZwCreateFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateRequest {
    pub access: AccessMask,
    pub attributes: FileAttributes,
    pub share: ShareAccess,
    pub disposition: CreateDisposition,
    pub options: CreateOptions,
}

impl CreateRequest {
    /// Plain open of an existing file with the given access.
    pub fn open(access: AccessMask) -> Self {
        Self {
            access,
            attributes: FileAttributes::NORMAL,
            share: ShareAccess::all(),
            disposition: CreateDisposition::Open,
            options: CreateOptions::empty(),
        }
    }

    #[must_use]
    pub fn disposition(mut self, disposition: CreateDisposition) -> Self {
        self.disposition = disposition;
        self
    }

    #[must_use]
    pub fn options(mut self, options: CreateOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn share(mut self, share: ShareAccess) -> Self {
        self.share = share;
        self
    }

    #[must_use]
    pub fn attributes(mut self, attributes: FileAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// True if the request may change volume contents.
    pub fn is_mutating(&self) -> bool {
        self.disposition != CreateDisposition::Open
            || self.options.contains(CreateOptions::DELETE_ON_CLOSE)
            || self
                .access
                .mapped()
                .intersects(AccessMask::FILE_WRITE_DATA | AccessMask::FILE_APPEND_DATA | AccessMask::DELETE)
    }
}

/// Sink for directory entries.
///
/// Returns an error when the consumer can take no more entries.
pub type FillFindData<'a> = dyn FnMut(&FindData) -> DokanResult<()> + 'a;

/// Sink for stream entries.
pub type FillFindStreamData<'a> = dyn FnMut(&StreamData) -> DokanResult<()> + 'a;

/// Operation-specific arguments.
pub enum Payload<'a> {
    Create(CreateRequest),
    Cleanup,
    Close,
    Read {
        offset: u64,
        buffer: &'a mut [u8],
    },
    Write {
        offset: u64,
        data: &'a [u8],
    },
    Flush,
    GetFileInformation,
    FindFiles {
        fill: &'a mut FillFindData<'a>,
    },
    FindFilesWithPattern {
        pattern: String,
        fill: &'a mut FillFindData<'a>,
    },
    SetFileAttributes(FileAttributes),
    SetFileTime(FileTimes),
    DeleteFile,
    DeleteDirectory,
    MoveFile {
        new_path: DokanPath,
        replace_if_existing: bool,
    },
    SetEndOfFile(u64),
    SetAllocationSize(u64),
    LockFile {
        offset: u64,
        length: u64,
    },
    UnlockFile {
        offset: u64,
        length: u64,
    },
    GetDiskFreeSpace,
    GetVolumeInformation,
    Mounted {
        mount_point: String,
    },
    Unmounted,
    GetFileSecurity {
        security_information: u32,
        buffer: &'a mut [u8],
    },
    SetFileSecurity {
        security_information: u32,
        descriptor: &'a [u8],
    },
    FindStreams {
        fill: &'a mut FillFindStreamData<'a>,
    },
}

impl Payload<'_> {
    pub fn kind(&self) -> OperationKind {
        match self {
            Payload::Create(_) => OperationKind::CreateFile,
            Payload::Cleanup => OperationKind::Cleanup,
            Payload::Close => OperationKind::CloseFile,
            Payload::Read { .. } => OperationKind::ReadFile,
            Payload::Write { .. } => OperationKind::WriteFile,
            Payload::Flush => OperationKind::FlushFileBuffers,
            Payload::GetFileInformation => OperationKind::GetFileInformation,
            Payload::FindFiles { .. } => OperationKind::FindFiles,
            Payload::FindFilesWithPattern { .. } => OperationKind::FindFilesWithPattern,
            Payload::SetFileAttributes(_) => OperationKind::SetFileAttributes,
            Payload::SetFileTime(_) => OperationKind::SetFileTime,
            Payload::DeleteFile => OperationKind::DeleteFile,
            Payload::DeleteDirectory => OperationKind::DeleteDirectory,
            Payload::MoveFile { .. } => OperationKind::MoveFile,
            Payload::SetEndOfFile(_) => OperationKind::SetEndOfFile,
            Payload::SetAllocationSize(_) => OperationKind::SetAllocationSize,
            Payload::LockFile { .. } => OperationKind::LockFile,
            Payload::UnlockFile { .. } => OperationKind::UnlockFile,
            Payload::GetDiskFreeSpace => OperationKind::GetDiskFreeSpace,
            Payload::GetVolumeInformation => OperationKind::GetVolumeInformation,
            Payload::Mounted { .. } => OperationKind::Mounted,
            Payload::Unmounted => OperationKind::Unmounted,
            Payload::GetFileSecurity { .. } => OperationKind::GetFileSecurity,
            Payload::SetFileSecurity { .. } => OperationKind::SetFileSecurity,
            Payload::FindStreams { .. } => OperationKind::FindStreams,
        }
    }
}

/// One driver invocation.
pub struct CallbackRequest<'a> {
    pub id: RequestId,
    /// Target path; the root for volume-level operations.
    pub path: DokanPath,
    /// Open handle, for operations that act on one.
    pub handle: Option<HandleId>,
    pub flags: RequestFlags,
    /// Originating process.
    pub process_id: u32,
    pub payload: Payload<'a>,
    /// Lets the filesystem extend the driver's deadline for this request.
    pub timeout_reset: Option<TimeoutReset>,
}

impl<'a> CallbackRequest<'a> {
    pub fn new(id: RequestId, path: DokanPath, payload: Payload<'a>) -> Self {
        Self {
            id,
            path,
            handle: None,
            flags: RequestFlags::empty(),
            process_id: 0,
            payload,
            timeout_reset: None,
        }
    }

    #[must_use]
    pub fn with_handle(mut self, handle: HandleId) -> Self {
        self.handle = Some(handle);
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_process_id(mut self, process_id: u32) -> Self {
        self.process_id = process_id;
        self
    }

    #[must_use]
    pub fn with_timeout_reset(mut self, reset: TimeoutReset) -> Self {
        self.timeout_reset = Some(reset);
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }
}

impl fmt::Debug for CallbackRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRequest")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("path", &self.path)
            .field("handle", &self.handle)
            .field("flags", &self.flags)
            .field("process_id", &self.process_id)
            .finish_non_exhaustive()
    }
}

/// What `ZwCreateFile` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateAction {
    Opened,
    Created,
    Overwritten,
    Superseded,
}

/// Successful result of a dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// No data beyond success.
    Done,
    Created {
        handle: HandleId,
        is_directory: bool,
        action: CreateAction,
    },
    Read(usize),
    Written(usize),
    FileInformation(FileInformation),
    /// Number of entries handed to the fill callback.
    Listed(usize),
    DiskSpace(DiskSpace),
    Volume(VolumeInformation),
    /// Bytes needed for the full descriptor; the buffer holds it when it fits.
    Security {
        length_needed: usize,
    },
}
