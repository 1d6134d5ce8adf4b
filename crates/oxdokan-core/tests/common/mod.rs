//! Shared fixtures for the integration tests: a filesystem that records
//! how the dispatcher drives it, and helpers to mount it in-process.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use oxdokan_core::{
    CreateOptions, CreateOutcome, CreateRequest, DokanError, DokanFileSystem, DokanPath, DokanResult,
    FileAttributes, FileContext, FileInformation, FillFindData, FindData, InProcessDriver, MountSession,
    Mounter, VolumeInformation,
};
use parking_lot::{Condvar, Mutex};

/// A gate callbacks can park on until the test opens it.
#[derive(Default)]
pub struct Latch {
    closed: Mutex<bool>,
    opened: Condvar,
}

impl Latch {
    pub fn close(&self) {
        *self.closed.lock() = true;
    }

    pub fn open(&self) {
        *self.closed.lock() = false;
        self.opened.notify_all();
    }

    fn pass(&self) {
        let mut closed = self.closed.lock();
        while *closed {
            self.opened.wait(&mut closed);
        }
    }
}

/// In-memory filesystem instrumented for the dispatcher tests.
#[derive(Default)]
pub struct RecordingFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
    pub entries: Mutex<Vec<String>>,
    pub write_delay: Mutex<Duration>,
    /// Asked of the driver before each write's delay.
    pub write_extension: Mutex<Option<Duration>>,
    pub extensions_granted: AtomicUsize,
    pub write_latch: Latch,
    pub writes_entered: AtomicUsize,
    active_writes: AtomicUsize,
    pub max_active_writes: AtomicUsize,
    pub worker_threads: Mutex<Vec<String>>,
    pub panic_on_read: AtomicBool,
    pub mounted: AtomicUsize,
    pub unmounted: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub closes: AtomicUsize,
}

impl RecordingFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_entries(names: &[&str]) -> Arc<Self> {
        let fs = Self::default();
        *fs.entries.lock() = names.iter().map(|name| (*name).to_string()).collect();
        Arc::new(fs)
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Block until `count` writes have entered the filesystem.
    pub fn wait_for_writes(&self, count: usize) {
        while self.writes_entered.load(Ordering::SeqCst) < count {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn info(size: u64, attributes: FileAttributes) -> FileInformation {
        FileInformation {
            attributes,
            creation_time: SystemTime::UNIX_EPOCH,
            last_access_time: SystemTime::UNIX_EPOCH,
            last_write_time: SystemTime::UNIX_EPOCH,
            file_size: size,
            number_of_links: 1,
            file_index: 0,
        }
    }
}

impl DokanFileSystem for RecordingFs {
    fn create(&self, path: &DokanPath, request: &CreateRequest, _ctx: &FileContext<'_>) -> DokanResult<CreateOutcome> {
        if path.is_root() || request.options.contains(CreateOptions::DIRECTORY_FILE) {
            return Ok(CreateOutcome::opened(true));
        }
        let mut files = self.files.lock();
        if files.contains_key(path.as_str()) {
            Ok(CreateOutcome::opened(false))
        } else {
            files.insert(path.as_str().to_string(), Vec::new());
            Ok(CreateOutcome::created(false))
        }
    }

    fn cleanup(&self, _path: &DokanPath, _ctx: &FileContext<'_>) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self, _path: &DokanPath, _ctx: &FileContext<'_>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self, path: &DokanPath, buffer: &mut [u8], offset: u64, _ctx: &FileContext<'_>) -> DokanResult<usize> {
        assert!(!self.panic_on_read.load(Ordering::SeqCst), "read exploded");
        let files = self.files.lock();
        let data = files
            .get(path.as_str())
            .ok_or_else(|| DokanError::not_found(path.to_string()))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buffer.len().min(data.len() - start);
        buffer[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write(&self, path: &DokanPath, data: &[u8], offset: u64, ctx: &FileContext<'_>) -> DokanResult<usize> {
        self.writes_entered.fetch_add(1, Ordering::SeqCst);
        let active = self.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_writes.fetch_max(active, Ordering::SeqCst);
        if let Some(name) = thread::current().name() {
            self.worker_threads.lock().push(name.to_string());
        }

        self.write_latch.pass();
        let extension = *self.write_extension.lock();
        if extension.is_some_and(|extension| ctx.reset_timeout(extension)) {
            self.extensions_granted.fetch_add(1, Ordering::SeqCst);
        }
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut files = self.files.lock();
        let file = files.entry(path.as_str().to_string()).or_default();
        let start = if ctx.write_to_end_of_file() {
            file.len()
        } else {
            usize::try_from(offset).unwrap_or(usize::MAX)
        };
        let end = start + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(data);
        drop(files);

        self.active_writes.fetch_sub(1, Ordering::SeqCst);
        Ok(data.len())
    }

    fn get_file_information(&self, path: &DokanPath, ctx: &FileContext<'_>) -> DokanResult<FileInformation> {
        if ctx.is_directory() {
            return Ok(Self::info(0, FileAttributes::DIRECTORY));
        }
        let size = self
            .files
            .lock()
            .get(path.as_str())
            .map(|data| data.len() as u64)
            .ok_or_else(|| DokanError::not_found(path.to_string()))?;
        Ok(Self::info(size, FileAttributes::NORMAL))
    }

    fn find_files(&self, _path: &DokanPath, fill: &mut FillFindData<'_>, _ctx: &FileContext<'_>) -> DokanResult<()> {
        let names = self.entries.lock().clone();
        for name in names {
            fill(&FindData::from_info(name, &Self::info(0, FileAttributes::NORMAL)))?;
        }
        Ok(())
    }

    fn get_volume_information(&self, _ctx: &FileContext<'_>) -> DokanResult<VolumeInformation> {
        Ok(VolumeInformation::default())
    }

    fn mounted(&self, _mount_point: &str, _ctx: &FileContext<'_>) -> DokanResult<()> {
        self.mounted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmounted(&self, _ctx: &FileContext<'_>) -> DokanResult<()> {
        self.unmounted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mounter with short unmount timeouts.
pub fn quick_mounter() -> Mounter {
    Mounter::new("T:\\")
        .unmount_timeout(Duration::from_millis(300))
        .force_grace(Duration::from_millis(100))
        .lock_timeout(Duration::from_millis(100))
}

/// Mount `fs` on a fresh in-process driver.
pub fn mount(fs: &Arc<RecordingFs>) -> (MountSession, Arc<InProcessDriver>) {
    mount_with(fs, quick_mounter(), InProcessDriver::new())
}

pub fn mount_with(
    fs: &Arc<RecordingFs>,
    mounter: Mounter,
    driver: InProcessDriver,
) -> (MountSession, Arc<InProcessDriver>) {
    let driver = Arc::new(driver);
    let session = mounter
        .mount(Arc::clone(fs) as Arc<dyn DokanFileSystem>, driver.clone())
        .expect("mount");
    (session, driver)
}
