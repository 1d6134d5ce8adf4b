//! User-mode filesystem front end for the Dokan driver.
//!
//! A consumer implements [`DokanFileSystem`] and mounts it with a
//! [`Mounter`]. The crate supplies everything between the driver and that
//! trait:
//!
//! - [`trampoline`]: `extern "system"` entry points that decode raw driver
//!   arguments and never let a panic escape.
//! - [`Dispatcher`]: admission, capability and write-protect checks, handle
//!   resolution and the per-operation threading contract.
//! - [`HandleTable`]: opaque handle ids, share access and reference-counted
//!   eviction.
//! - [`MountSession`]: the Unmounted → Mounting → Active → Unmounting
//!   lifecycle, including draining in-flight callbacks on unmount.
//!
//! [`InProcessDriver`] stands in for the kernel driver: it calls the
//! registered entry points from its own `dokan-N` threads, which is how the
//! test suite and the `oxdokan-memfs` demo exercise the stack.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use oxdokan_core::{
//!     DokanFileSystem, DokanResult, FileContext, InProcessDriver, Mounter, VolumeInformation,
//! };
//!
//! struct Blank;
//!
//! impl DokanFileSystem for Blank {
//!     fn get_volume_information(&self, _ctx: &FileContext<'_>) -> DokanResult<VolumeInformation> {
//!         Ok(VolumeInformation {
//!             volume_name: String::new(),
//!             ..VolumeInformation::default()
//!         })
//!     }
//! }
//!
//! let driver = Arc::new(InProcessDriver::new());
//! let session = Mounter::new("B:\\")
//!     .volume_label("BLANK")
//!     .mount(Arc::new(Blank), driver.clone())
//!     .unwrap();
//!
//! let volume = driver.get_volume_information().unwrap();
//! assert_eq!(volume.volume_name, "BLANK");
//!
//! let report = session.unmount().unwrap();
//! assert_eq!(report.stats.leaked_handles(), 0);
//! ```

pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod ffi;
pub mod filesystem;
pub mod flags;
pub mod handle_table;
pub mod info;
pub mod lifecycle;
pub mod path;
pub mod pattern;
pub mod request;
pub mod session;
pub mod stats;
pub mod status;
pub mod trampoline;

pub use config::MountConfig;
pub use dispatch::Dispatcher;
pub use driver::{DriverFile, InProcessDriver, NativeDriver, Notification, SecurityReply, TimeoutReset};
pub use error::{DokanError, DokanResult, ErrorCategory, MountError};
pub use filesystem::{CreateOutcome, DokanFileSystem, FileContext};
pub use flags::{
    AccessMask, CreateDisposition, CreateOptions, FileAttributes, FileSystemFlags, MountFlags, ShareAccess,
};
pub use handle_table::{HandleId, HandleTable, OpenFile};
pub use info::{DiskSpace, FileInformation, FileTimes, FindData, StreamData, VolumeInformation};
pub use path::DokanPath;
pub use request::{
    CallbackRequest, CreateAction, CreateRequest, FillFindData, FillFindStreamData, OperationKind, OperationSet,
    Payload, Reply, RequestFlags, RequestId,
};
pub use session::{MountSession, MountState, Mounter, UnmountReport};
pub use stats::{DispatchStats, DispatchStatsSnapshot};
pub use status::{NtStatus, StatusClass};
pub use trampoline::SessionId;
