//! Mount session: attach a filesystem to a mount point and tear it down.
//!
//! A [`MountSession`] owns the dispatcher (and with it the handle table) for
//! one mounted volume. The driver only ever sees the session's
//! [`SessionId`] through `GlobalContext`; the registry in
//! [`crate::trampoline`] keeps a weak reference, so dropping the session is
//! enough to make late callbacks fail with a lifecycle status.
//!
//! # Unmount
//!
//! 1. The gate moves to `Unmounting`; new requests other than cleanup and
//!    close are rejected.
//! 2. In-flight requests get `unmount_timeout` to finish.
//! 3. Handles the driver left open are cleaned up and closed.
//! 4. If the drain timed out or references remain, the cancellation flag is
//!    raised and every handle is force-closed. References still held after
//!    `force_grace` fail the unmount with [`MountError::Busy`]; the session
//!    stays `Unmounting` and the call may be retried.
//! 5. The driver is detached (which delivers `Unmounted`) and the session is
//!    deregistered.
//!
//! Dropping a session whose unmount fails still detaches the driver, within
//! the volume timeout, but leaves the state at `Unmounting`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use widestring::U16CString;

use crate::config::MountConfig;
use crate::dispatch::Dispatcher;
use crate::driver::{NativeDriver, Notification};
use crate::error::MountError;
use crate::ffi::{DokanOperations, RawOptions};
use crate::filesystem::DokanFileSystem;
use crate::flags::MountFlags;
use crate::path::DokanPath;
use crate::request::OperationSet;
use crate::stats::{DispatchStats, DispatchStatsSnapshot};
use crate::trampoline::{self, SessionId};

pub use crate::lifecycle::MountState;

/// Builder for a [`MountSession`].
#[derive(Debug, Clone, Default)]
pub struct Mounter {
    config: MountConfig,
}

impl Mounter {
    pub fn new(mount_point: impl Into<String>) -> Self {
        Self {
            config: MountConfig::new(mount_point),
        }
    }

    pub fn from_config(config: MountConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    #[must_use]
    pub fn unc_name(mut self, unc_name: impl Into<String>) -> Self {
        self.config = self.config.unc_name(unc_name);
        self
    }

    #[must_use]
    pub fn volume_label(mut self, label: impl Into<String>) -> Self {
        self.config = self.config.volume_label(label);
        self
    }

    /// Add mount flags to the current set.
    #[must_use]
    pub fn flags(mut self, flags: MountFlags) -> Self {
        self.config = self.config.with_flags(flags);
        self
    }

    #[must_use]
    pub fn single_thread(mut self, single_thread: bool) -> Self {
        self.config = self.config.single_thread(single_thread);
        self
    }

    #[must_use]
    pub fn thread_count(mut self, count: usize) -> Self {
        self.config = self.config.thread_count(count);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.timeout(timeout);
        self
    }

    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.lock_timeout(timeout);
        self
    }

    #[must_use]
    pub fn unmount_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.unmount_timeout(timeout);
        self
    }

    #[must_use]
    pub fn force_grace(mut self, grace: Duration) -> Self {
        self.config = self.config.force_grace(grace);
        self
    }

    #[must_use]
    pub fn allocation_unit_size(mut self, size: u32) -> Self {
        self.config = self.config.allocation_unit_size(size);
        self
    }

    #[must_use]
    pub fn sector_size(mut self, size: u32) -> Self {
        self.config = self.config.sector_size(size);
        self
    }

    /// Self-relative security descriptor for the volume.
    #[must_use]
    pub fn security_descriptor(mut self, descriptor: impl Into<Vec<u8>>) -> Self {
        self.config = self.config.security_descriptor(descriptor);
        self
    }

    /// Attach `fs` through `driver`.
    ///
    /// The filesystem's `mounted` callback has run by the time this returns.
    pub fn mount(
        self,
        fs: Arc<dyn DokanFileSystem>,
        driver: Arc<dyn NativeDriver>,
    ) -> Result<MountSession, MountError> {
        let config = self.config;
        config.validate()?;

        let dispatcher = Arc::new(Dispatcher::new(fs, &config));
        let mut native = NativeOptions::new(&config, dispatcher.registered_operations())?;

        dispatcher.gate().transition(MountState::Mounting)?;
        let id = trampoline::register(&dispatcher, &driver);
        native.options.global_context = id.raw();

        debug!(
            session = %id,
            mount_point = %config.mount_point,
            operations = dispatcher.registered_operations().len(),
            "Attaching volume"
        );
        let code = driver.create_file_system(&native.options, &native.operations);
        if let Err(e) = MountError::check_driver_result(code, &config.mount_point) {
            warn!(session = %id, code, error = %e, "Driver refused the volume");
            trampoline::deregister(id);
            dispatcher.gate().transition(MountState::Unmounted)?;
            return Err(e);
        }
        dispatcher.gate().transition(MountState::Active)?;
        info!(session = %id, mount_point = %config.mount_point, "Volume mounted");

        Ok(MountSession {
            id,
            config,
            dispatcher,
            driver,
            native,
            mounted_at: Instant::now(),
            unmount_lock: Mutex::new(()),
        })
    }
}

/// `DOKAN_OPTIONS` and the strings it points at; the driver may keep
/// pointers into them until the volume is detached.
struct NativeOptions {
    options: Box<RawOptions>,
    _mount_point: U16CString,
    _unc_name: Option<U16CString>,
    operations: DokanOperations,
}

impl NativeOptions {
    fn new(config: &MountConfig, operations: OperationSet) -> Result<Self, MountError> {
        let mount_point = U16CString::from_str(&config.mount_point)
            .map_err(|_| MountError::MountPoint(config.mount_point.clone()))?;
        let unc_name = config
            .unc_name
            .as_deref()
            .map(U16CString::from_str)
            .transpose()
            .map_err(|_| MountError::Config("UNC name contains NUL".to_string()))?;

        let mut options = Box::new(RawOptions::default());
        options.version = config.version;
        options.single_thread = u8::from(config.single_thread);
        options.options = config.flags.bits();
        options.mount_point = mount_point.as_ptr();
        options.unc_name = unc_name.as_ref().map_or(std::ptr::null(), |name| name.as_ptr());
        options.timeout = u32::try_from(config.timeout.as_millis()).unwrap_or(u32::MAX);
        options.allocation_unit_size = config.allocation_unit_size;
        options.sector_size = config.sector_size;
        if let Some(descriptor) = &config.security_descriptor {
            let too_large = || MountError::Config("security descriptor too large".to_string());
            options
                .volume_security_descriptor
                .get_mut(..descriptor.len())
                .ok_or_else(too_large)?
                .copy_from_slice(descriptor);
            options.volume_security_descriptor_length = u32::try_from(descriptor.len()).map_err(|_| too_large())?;
        }

        Ok(Self {
            options,
            _mount_point: mount_point,
            _unc_name: unc_name,
            operations: trampoline::operations_for(operations),
        })
    }
}

/// Outcome of a completed unmount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmountReport {
    /// The drain timed out or references outlived the graceful phase.
    pub forced: bool,
    /// Handles the session closed on the driver's behalf.
    pub released_handles: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    pub stats: DispatchStatsSnapshot,
}

/// One mounted volume.
pub struct MountSession {
    id: SessionId,
    config: MountConfig,
    dispatcher: Arc<Dispatcher>,
    driver: Arc<dyn NativeDriver>,
    native: NativeOptions,
    mounted_at: Instant,
    unmount_lock: Mutex<()>,
}

impl MountSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn mount_point(&self) -> &str {
        &self.config.mount_point
    }

    pub fn volume_label(&self) -> &str {
        &self.config.volume_label
    }

    pub fn flags(&self) -> MountFlags {
        self.config.flags
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn state(&self) -> MountState {
        self.dispatcher.gate().state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == MountState::Active
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(self.dispatcher.stats())
    }

    /// Handles the driver has not closed yet.
    pub fn open_handles(&self) -> usize {
        self.dispatcher.table().open_handles().len()
    }

    pub fn uptime(&self) -> Duration {
        self.mounted_at.elapsed()
    }

    /// Tell the OS that `path` appeared without going through the volume.
    pub fn notify_create(&self, path: &DokanPath, is_directory: bool) -> Result<(), MountError> {
        self.notify(Notification::Create {
            path: self.absolute(path),
            is_directory,
        })
    }

    pub fn notify_delete(&self, path: &DokanPath, is_directory: bool) -> Result<(), MountError> {
        self.notify(Notification::Delete {
            path: self.absolute(path),
            is_directory,
        })
    }

    /// Attributes, size or times of `path` changed.
    pub fn notify_update(&self, path: &DokanPath) -> Result<(), MountError> {
        self.notify(Notification::Update {
            path: self.absolute(path),
        })
    }

    pub fn notify_xattr_update(&self, path: &DokanPath) -> Result<(), MountError> {
        self.notify(Notification::XattrUpdate {
            path: self.absolute(path),
        })
    }

    pub fn notify_rename(&self, from: &DokanPath, to: &DokanPath, is_directory: bool) -> Result<(), MountError> {
        self.notify(Notification::Rename {
            old_path: self.absolute(from),
            new_path: self.absolute(to),
            is_directory,
            same_directory: from.parent() == to.parent(),
        })
    }

    fn notify(&self, notification: Notification) -> Result<(), MountError> {
        if !self.is_running() {
            return Err(MountError::NotMounted);
        }
        if self.driver.notify(&notification) {
            debug!(session = %self.id, ?notification, "Notified driver");
            Ok(())
        } else {
            Err(MountError::NotifyRejected(notification.path().to_string()))
        }
    }

    /// `path` prefixed with the mount point, as the driver expects it.
    fn absolute(&self, path: &DokanPath) -> String {
        format!("{}{path}", self.config.mount_point.trim_end_matches('\\'))
    }

    /// Drain, release and detach the volume.
    pub fn unmount(&self) -> Result<UnmountReport, MountError> {
        let _serial = self.unmount_lock.lock();
        let gate = self.dispatcher.gate();
        match gate.state() {
            MountState::Active => {
                gate.transition(MountState::Unmounting)?;
                info!(session = %self.id, mount_point = %self.config.mount_point, "Unmounting volume");
            }
            MountState::Unmounting => debug!(session = %self.id, "Retrying unmount"),
            MountState::Unmounted => return Err(MountError::NotMounted),
            MountState::Mounting => {
                return Err(MountError::InvalidTransition {
                    from: MountState::Mounting,
                    to: MountState::Unmounting,
                });
            }
        }

        let started = Instant::now();
        let table = self.dispatcher.table();
        let drained = gate.wait_idle(self.config.unmount_timeout);
        let released = if drained { self.dispatcher.release_all() } else { 0 };
        let mut forced = false;

        if !drained || !table.wait_until_empty(self.config.force_grace) {
            forced = true;
            warn!(
                session = %self.id,
                in_flight = gate.in_flight(),
                handles = table.len(),
                "Graceful unmount timed out; forcing"
            );
            gate.cancel();
            let referenced = table.force_close_all(self.config.lock_timeout);
            if referenced > 0 {
                debug!(referenced, "Waiting for in-flight references");
            }
            if !table.wait_until_empty(self.config.force_grace) {
                let handles = table.len();
                warn!(session = %self.id, handles, "Unmount aborted; handles still referenced");
                return Err(MountError::Busy { handles });
            }
        }

        self.detach()?;
        let report = UnmountReport {
            forced,
            released_handles: released,
            duration: started.elapsed(),
            uptime: self.uptime(),
            stats: self.dispatcher.stats().snapshot(),
        };
        info!(
            session = %self.id,
            forced,
            released,
            leaked = report.stats.leaked_handles(),
            "Volume unmounted"
        );
        Ok(report)
    }

    fn detach(&self) -> Result<(), MountError> {
        self.driver.close_file_system();
        trampoline::deregister(self.id);
        self.dispatcher.gate().transition(MountState::Unmounted)?;
        Ok(())
    }

    /// Detach the driver and leave the registry without completing the
    /// unmount. The gate stays `Unmounting`: requests still holding handles
    /// finish against the dispatcher they already resolved.
    fn abandon(&self) {
        self.dispatcher.gate().cancel();
        self.driver.close_file_system();
        trampoline::deregister(self.id);
    }
}

impl std::fmt::Debug for MountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSession")
            .field("id", &self.id)
            .field("mount_point", &self.config.mount_point)
            .field("state", &self.state())
            .field("options", &self.native.options)
            .finish_non_exhaustive()
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        match self.state() {
            MountState::Active | MountState::Unmounting => {}
            MountState::Unmounted | MountState::Mounting => return,
        }
        debug!(session = %self.id, "Unmounting on drop");
        if let Err(e) = self.unmount() {
            warn!(
                session = %self.id,
                error = %e,
                handles = self.dispatcher.table().len(),
                "Unmount on drop failed; detaching with references outstanding"
            );
            // The driver must not outlive the options it points into.
            self.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::InProcessDriver;
    use crate::error::DOKAN_MOUNT_POINT_ERROR;

    /// Header-only self-relative descriptor.
    fn self_relative_descriptor() -> Vec<u8> {
        let mut descriptor = vec![0u8; 20];
        descriptor[0] = 1;
        descriptor[3] = 0x80;
        descriptor
    }

    struct Empty;

    impl DokanFileSystem for Empty {}

    fn mounter() -> Mounter {
        Mounter::new("T:\\")
            .unmount_timeout(Duration::from_millis(200))
            .force_grace(Duration::from_millis(100))
    }

    #[test]
    fn test_mount_and_unmount() {
        let driver = Arc::new(InProcessDriver::new());
        let session = mounter().mount(Arc::new(Empty), driver.clone()).unwrap();
        assert!(session.is_running());
        assert!(driver.is_attached());
        assert_eq!(driver.global_context(), Some(session.id().raw()));

        let report = session.unmount().unwrap();
        assert!(!report.forced);
        assert_eq!(report.stats.leaked_handles(), 0);
        assert_eq!(session.state(), MountState::Unmounted);
        assert!(!driver.is_attached());
        assert!(trampoline::resolve(session.id().raw()).is_none());
    }

    #[test]
    fn test_unmount_twice_is_not_mounted() {
        let session = mounter()
            .mount(Arc::new(Empty), Arc::new(InProcessDriver::new()))
            .unwrap();
        session.unmount().unwrap();
        assert!(matches!(session.unmount(), Err(MountError::NotMounted)));
    }

    #[test]
    fn test_driver_failure_maps_code() {
        let err = mounter()
            .mount(Arc::new(Empty), Arc::new(InProcessDriver::failing(DOKAN_MOUNT_POINT_ERROR)))
            .unwrap_err();
        assert!(matches!(err, MountError::MountPoint(ref mp) if mp == "T:\\"));
    }

    #[test]
    fn test_invalid_config_rejected_before_attach() {
        let driver = Arc::new(InProcessDriver::new());
        let err = Mounter::new("")
            .mount(Arc::new(Empty), driver.clone())
            .unwrap_err();
        assert!(matches!(err, MountError::MountPoint(_)));
        assert!(!driver.is_attached());
    }

    #[test]
    fn test_drop_unmounts() {
        let driver = Arc::new(InProcessDriver::new());
        let session = mounter().mount(Arc::new(Empty), driver.clone()).unwrap();
        let id = session.id();
        drop(session);
        assert!(!driver.is_attached());
        assert!(trampoline::resolve(id.raw()).is_none());
    }

    #[test]
    fn test_security_descriptor_reaches_driver() {
        let driver = Arc::new(InProcessDriver::new());
        let descriptor = self_relative_descriptor();
        let session = mounter()
            .security_descriptor(descriptor.clone())
            .mount(Arc::new(Empty), driver.clone())
            .unwrap();
        assert_eq!(session.native.options.volume_security_descriptor_length, 20);
        assert_eq!(driver.volume_security_descriptor(), Some(descriptor));
        session.unmount().unwrap();

        let plain = mounter().mount(Arc::new(Empty), driver.clone()).unwrap();
        assert_eq!(driver.volume_security_descriptor(), None);
        drop(plain);
    }

    #[test]
    fn test_malformed_security_descriptor_rejected() {
        let driver = Arc::new(InProcessDriver::new());
        let err = mounter()
            .security_descriptor(vec![1u8, 0, 0])
            .mount(Arc::new(Empty), driver.clone())
            .unwrap_err();
        assert!(matches!(err, MountError::Config(_)));
        assert!(!driver.is_attached());
    }

    #[test]
    fn test_notifications_use_absolute_paths() {
        let driver = Arc::new(InProcessDriver::new());
        let session = mounter().mount(Arc::new(Empty), driver.clone()).unwrap();
        let file = DokanPath::parse("\\docs\\a.txt").unwrap();
        let renamed = DokanPath::parse("\\docs\\b.txt").unwrap();
        let moved = DokanPath::parse("\\c.txt").unwrap();

        session.notify_create(&file, false).unwrap();
        session.notify_update(&file).unwrap();
        session.notify_xattr_update(&file).unwrap();
        session.notify_rename(&file, &renamed, false).unwrap();
        session.notify_rename(&renamed, &moved, false).unwrap();
        session.notify_delete(&moved, false).unwrap();

        let seen = driver.notifications();
        assert_eq!(seen.len(), 6);
        assert_eq!(
            seen[0],
            Notification::Create {
                path: "T:\\docs\\a.txt".to_string(),
                is_directory: false,
            }
        );
        assert_eq!(seen[2], Notification::XattrUpdate { path: "T:\\docs\\a.txt".to_string() });
        assert!(matches!(
            &seen[3],
            Notification::Rename { new_path, same_directory: true, .. } if new_path == "T:\\docs\\b.txt"
        ));
        assert!(matches!(&seen[4], Notification::Rename { same_directory: false, .. }));
        assert_eq!(seen[5].path(), "T:\\c.txt");

        session.unmount().unwrap();
        assert!(matches!(session.notify_update(&file), Err(MountError::NotMounted)));
        assert_eq!(driver.notifications().len(), 6);
    }

    #[test]
    fn test_mounter_passes_options() {
        let mounter = mounter()
            .volume_label("MEMFS")
            .flags(MountFlags::CASE_SENSITIVE)
            .single_thread(true);
        assert_eq!(mounter.config().volume_label, "MEMFS");
        assert!(mounter.config().flags.contains(MountFlags::MOUNT_MANAGER | MountFlags::CASE_SENSITIVE));

        let session = mounter
            .mount(Arc::new(Empty), Arc::new(InProcessDriver::new()))
            .unwrap();
        assert_eq!(session.native.options.options, session.flags().bits());
        assert_eq!(session.native.options.single_thread, 1);
        assert_eq!(session.volume_label(), "MEMFS");
    }
}
