//! In-memory volume for `oxdokan-core`.
//!
//! [`MemoryFs`] implements the full data path of
//! [`DokanFileSystem`](oxdokan_core::DokanFileSystem): NT create
//! dispositions, delete-on-close, renames of whole subtrees, byte-range
//! locks and a fixed capacity. It is what the `oxdokan-memfs` binary mounts
//! and what the integration tests drive through the in-process driver.
//!
//! ```
//! use std::sync::Arc;
//! use oxdokan_core::{AccessMask, CreateDisposition, CreateRequest, InProcessDriver};
//! use oxdokan_memfs::{FileConfig, MemoryFs, mounter};
//!
//! let config = FileConfig::default();
//! let fs = Arc::new(MemoryFs::new(config.volume.clone()));
//! let driver = Arc::new(InProcessDriver::new());
//! let session = mounter(&config).mount(fs.clone(), driver.clone()).unwrap();
//!
//! let file = driver
//!     .create(
//!         "\\hello.txt",
//!         &CreateRequest::open(AccessMask::GENERIC_WRITE).disposition(CreateDisposition::Create),
//!     )
//!     .unwrap();
//! driver.write(&file, 0, b"hello").unwrap();
//! driver.cleanup(&file).unwrap();
//! driver.close(file).unwrap();
//!
//! assert_eq!(fs.contents("\\hello.txt").unwrap(), b"hello");
//! session.unmount().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod locks;
pub mod memory_fs;
mod node;
pub mod workload;

pub use config::{FileConfig, MemFsConfig};
pub use error::MemFsError;
pub use memory_fs::MemoryFs;
pub use workload::{Workload, WorkloadSummary};

use oxdokan_core::{DokanPath, MountFlags, MountSession, Mounter};

/// A [`Mounter`] for `config`, with mount flags matching the volume settings.
pub fn mounter(config: &FileConfig) -> Mounter {
    let mut flags = MountFlags::empty();
    if config.volume.read_only {
        flags |= MountFlags::WRITE_PROTECT;
    }
    if config.volume.case_sensitive {
        flags |= MountFlags::CASE_SENSITIVE;
    }
    Mounter::from_config(config.mount.clone()).flags(flags)
}

/// Add a file to a mounted volume and tell the OS it appeared.
pub fn publish_file(session: &MountSession, fs: &MemoryFs, path: &str, contents: &[u8]) -> Result<(), MemFsError> {
    let publish = |source| MemFsError::Publish {
        path: path.to_string(),
        source,
    };
    let parsed = DokanPath::parse(path).map_err(publish)?;
    fs.insert_file(parsed.as_str(), contents).map_err(publish)?;
    session.notify_create(&parsed, false)?;
    Ok(())
}
