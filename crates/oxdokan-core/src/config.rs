//! Mount configuration.
//!
//! Mirrors `DOKAN_OPTIONS` plus the timeouts the session applies on top of
//! the driver. Deserialisable so a front end can load it from a file; every
//! field has a default, so partial documents are fine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MountError;
use crate::ffi::VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE;
use crate::flags::MountFlags;

/// Driver interface version this crate speaks.
pub const DOKAN_VERSION: u16 = 210;

/// Oldest interface version the driver still accepts.
pub const DOKAN_MINIMUM_VERSION: u16 = 200;

/// Driver-side request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on any per-handle lock wait.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long unmount waits for in-flight requests before forcing.
pub const DEFAULT_UNMOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a forced unmount waits for straggling references.
pub const DEFAULT_FORCE_GRACE: Duration = Duration::from_secs(2);

/// Configuration for one mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Drive letter (`M:\`) or empty NTFS directory.
    pub mount_point: String,
    /// UNC name for network drives, e.g. `\myfs\share`.
    pub unc_name: Option<String>,
    pub volume_label: String,
    pub flags: MountFlags,
    /// Serialise every callback globally.
    pub single_thread: bool,
    /// Callback threads started by the driver.
    pub thread_count: usize,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub unmount_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub force_grace: Duration,
    pub allocation_unit_size: u32,
    pub sector_size: u32,
    pub version: u16,
    /// Self-relative security descriptor applied to the volume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_descriptor: Option<Vec<u8>>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_point: "M:\\".to_string(),
            unc_name: None,
            volume_label: "DOKAN".to_string(),
            flags: MountFlags::MOUNT_MANAGER,
            single_thread: false,
            thread_count: 5,
            timeout: DEFAULT_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            unmount_timeout: DEFAULT_UNMOUNT_TIMEOUT,
            force_grace: DEFAULT_FORCE_GRACE,
            allocation_unit_size: 4096,
            sector_size: 4096,
            version: DOKAN_VERSION,
            security_descriptor: None,
        }
    }
}

impl MountConfig {
    pub fn new(mount_point: impl Into<String>) -> Self {
        Self {
            mount_point: mount_point.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn mount_point(mut self, mount_point: impl Into<String>) -> Self {
        self.mount_point = mount_point.into();
        self
    }

    #[must_use]
    pub fn unc_name(mut self, unc_name: impl Into<String>) -> Self {
        self.unc_name = Some(unc_name.into());
        self
    }

    #[must_use]
    pub fn volume_label(mut self, label: impl Into<String>) -> Self {
        self.volume_label = label.into();
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: MountFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Adds `flags` to the current set.
    #[must_use]
    pub fn with_flags(mut self, flags: MountFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[must_use]
    pub fn single_thread(mut self, single_thread: bool) -> Self {
        self.single_thread = single_thread;
        self
    }

    #[must_use]
    pub fn thread_count(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn unmount_timeout(mut self, timeout: Duration) -> Self {
        self.unmount_timeout = timeout;
        self
    }

    #[must_use]
    pub fn force_grace(mut self, grace: Duration) -> Self {
        self.force_grace = grace;
        self
    }

    #[must_use]
    pub fn allocation_unit_size(mut self, size: u32) -> Self {
        self.allocation_unit_size = size;
        self
    }

    #[must_use]
    pub fn sector_size(mut self, size: u32) -> Self {
        self.sector_size = size;
        self
    }

    /// Volume security descriptor, in self-relative form.
    #[must_use]
    pub fn security_descriptor(mut self, descriptor: impl Into<Vec<u8>>) -> Self {
        self.security_descriptor = Some(descriptor.into());
        self
    }

    pub fn case_sensitive(&self) -> bool {
        self.flags.contains(MountFlags::CASE_SENSITIVE)
    }

    pub fn write_protected(&self) -> bool {
        self.flags.contains(MountFlags::WRITE_PROTECT)
    }

    /// Threads the driver should run; 1 in single-thread mode.
    pub fn effective_threads(&self) -> usize {
        if self.single_thread { 1 } else { self.thread_count }
    }

    /// Reject configurations the driver would refuse.
    pub fn validate(&self) -> Result<(), MountError> {
        if self.mount_point.trim().is_empty() {
            return Err(MountError::MountPoint("mount point is empty".to_string()));
        }
        if self.version < DOKAN_MINIMUM_VERSION {
            return Err(MountError::Version);
        }
        if self.flags.contains(MountFlags::NETWORK)
            && self.unc_name.as_deref().is_none_or(str::is_empty)
        {
            return Err(MountError::Config(
                "network mounts need a UNC name".to_string(),
            ));
        }
        if self.sector_size == 0 || self.allocation_unit_size == 0 {
            return Err(MountError::Config(
                "sector and allocation unit sizes must be non-zero".to_string(),
            ));
        }
        if self.allocation_unit_size % self.sector_size != 0 {
            return Err(MountError::Config(format!(
                "allocation unit size {} is not a multiple of sector size {}",
                self.allocation_unit_size, self.sector_size
            )));
        }
        if !self.single_thread && self.thread_count == 0 {
            return Err(MountError::Config(
                "thread count must be at least 1".to_string(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(MountError::Config("lock timeout must be non-zero".to_string()));
        }
        if let Some(descriptor) = &self.security_descriptor {
            validate_security_descriptor(descriptor)?;
        }
        Ok(())
    }
}

/// `SECURITY_DESCRIPTOR_RELATIVE` header size.
const SECURITY_DESCRIPTOR_HEADER: usize = 20;
const SECURITY_DESCRIPTOR_REVISION: u8 = 1;
const SE_SELF_RELATIVE: u16 = 0x8000;

fn validate_security_descriptor(descriptor: &[u8]) -> Result<(), MountError> {
    if descriptor.len() > VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE {
        return Err(MountError::Config(format!(
            "security descriptor is {} bytes; the driver accepts at most {VOLUME_SECURITY_DESCRIPTOR_MAX_SIZE}",
            descriptor.len()
        )));
    }
    let [revision, _, low, high, ..] = *descriptor else {
        return Err(MountError::Config("security descriptor is truncated".to_string()));
    };
    if descriptor.len() < SECURITY_DESCRIPTOR_HEADER || revision != SECURITY_DESCRIPTOR_REVISION {
        return Err(MountError::Config("security descriptor has no valid header".to_string()));
    }
    if u16::from_le_bytes([low, high]) & SE_SELF_RELATIVE == 0 {
        return Err(MountError::Config(
            "security descriptor must be self-relative".to_string(),
        ));
    }
    Ok(())
}
