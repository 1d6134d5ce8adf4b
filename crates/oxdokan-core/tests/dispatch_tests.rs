//! Request dispatch through the native entry points: threading contract,
//! panic containment, share modes, write protection and listing.

mod common;

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use common::*;
use oxdokan_core::{
    AccessMask, CreateDisposition, CreateOptions, CreateRequest, FileSystemFlags, InProcessDriver, MountFlags,
    NtStatus, ShareAccess, StatusClass,
};

fn writable() -> CreateRequest {
    CreateRequest::open(AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE).disposition(CreateDisposition::OpenIf)
}

fn directory() -> CreateRequest {
    CreateRequest::open(AccessMask::GENERIC_READ).options(CreateOptions::DIRECTORY_FILE)
}

// =============================================================================
// Driver timeouts
// =============================================================================

#[test]
fn test_slow_write_extends_driver_timeout() {
    let fs = RecordingFs::new();
    *fs.write_delay.lock() = Duration::from_millis(250);
    let (session, driver) = mount_with(
        &fs,
        quick_mounter().timeout(Duration::from_millis(100)),
        InProcessDriver::new(),
    );

    let late = driver.create("\\late.txt", &writable()).unwrap();
    assert_eq!(driver.write(&late, 0, b"late"), Err(NtStatus::IO_TIMEOUT));

    *fs.write_extension.lock() = Some(Duration::from_secs(2));
    let slow = driver.create("\\slow.txt", &writable()).unwrap();
    assert_eq!(driver.write(&slow, 0, b"in time"), Ok(7));
    assert_eq!(fs.extensions_granted.load(Ordering::SeqCst), 1);
    assert_eq!(driver.timeout_resets(), [Duration::from_secs(2)]);

    session.unmount().unwrap();
}

// =============================================================================
// Threading contract
// =============================================================================

#[test]
fn test_distinct_handles_write_concurrently() {
    let fs = RecordingFs::new();
    *fs.write_delay.lock() = Duration::from_millis(50);
    let (session, driver) = mount(&fs);

    let files: Vec<_> = (0..4)
        .map(|i| driver.create(&format!("\\f{i}.bin"), &writable()).unwrap())
        .collect();
    thread::scope(|s| {
        for file in &files {
            let driver = &driver;
            s.spawn(move || driver.write(file, 0, b"data").unwrap());
        }
    });

    assert!(fs.max_active_writes.load(Ordering::SeqCst) > 1);
    session.unmount().unwrap();
}

#[test]
fn test_same_handle_writes_are_serialized() {
    let fs = RecordingFs::new();
    *fs.write_delay.lock() = Duration::from_millis(20);
    let (session, driver) = mount_with(
        &fs,
        quick_mounter().lock_timeout(Duration::from_secs(2)),
        InProcessDriver::new(),
    );
    let file = driver.create("\\one.bin", &writable()).unwrap();

    thread::scope(|s| {
        for i in 0..4i64 {
            let (driver, file) = (&driver, &file);
            s.spawn(move || driver.write(file, i * 2, b"ab").unwrap());
        }
    });

    assert_eq!(fs.max_active_writes.load(Ordering::SeqCst), 1);
    assert_eq!(fs.contents("\\one.bin").map(|data| data.len()), Some(8));
    session.unmount().unwrap();
}

#[test]
fn test_single_thread_mount_serializes_everything() {
    let fs = RecordingFs::new();
    *fs.write_delay.lock() = Duration::from_millis(20);
    let (session, driver) = mount_with(
        &fs,
        quick_mounter().single_thread(true).lock_timeout(Duration::from_secs(2)),
        InProcessDriver::new(),
    );

    let files: Vec<_> = (0..3)
        .map(|i| driver.create(&format!("\\s{i}.bin"), &writable()).unwrap())
        .collect();
    thread::scope(|s| {
        for file in &files {
            let driver = &driver;
            s.spawn(move || driver.write(file, 0, b"x").unwrap());
        }
    });

    assert_eq!(fs.max_active_writes.load(Ordering::SeqCst), 1);
    session.unmount().unwrap();
}

#[test]
fn test_callbacks_run_on_driver_threads() {
    let fs = RecordingFs::new();
    let (session, driver) = mount_with(&fs, quick_mounter(), InProcessDriver::new().with_workers(2));
    let file = driver.create("\\t.bin", &writable()).unwrap();
    for _ in 0..4 {
        driver.append(&file, b"z").unwrap();
    }

    let names = fs.worker_threads.lock().clone();
    assert_eq!(names.len(), 4);
    assert!(names.iter().all(|name| name == "dokan-0" || name == "dokan-1"), "{names:?}");
    assert_eq!(fs.contents("\\t.bin").as_deref(), Some(&b"zzzz"[..]));
    session.unmount().unwrap();
}

// =============================================================================
// Failure containment
// =============================================================================

#[test]
fn test_panicking_callback_becomes_internal_error() {
    let fs = RecordingFs::new();
    let (session, driver) = mount(&fs);
    let file = driver.create("\\boom.txt", &writable()).unwrap();

    fs.panic_on_read.store(true, Ordering::SeqCst);
    let status = driver.read(&file, 0, 8).unwrap_err();
    assert_eq!(status, NtStatus::INTERNAL_ERROR);
    assert_eq!(status.class(), StatusClass::IoError);
    assert_eq!(session.stats().panics(), 1);

    fs.panic_on_read.store(false, Ordering::SeqCst);
    assert!(session.is_running());
    assert_eq!(driver.write(&file, 0, b"ok").unwrap(), 2);
    assert_eq!(driver.read(&file, 0, 8).unwrap(), b"ok");
    session.unmount().unwrap();
}

#[test]
fn test_unknown_handle_is_invalid() {
    let fs = RecordingFs::new();
    let (session, driver) = mount(&fs);
    let bogus = oxdokan_core::DriverFile::from_raw("\\ghost.txt", 4242).unwrap();

    assert_eq!(driver.read(&bogus, 0, 4).unwrap_err(), NtStatus::INVALID_HANDLE);
    assert_eq!(driver.close(bogus), Ok(()));
    session.unmount().unwrap();
}

#[test]
fn test_negative_offset_rejected() {
    let fs = RecordingFs::new();
    let (session, driver) = mount(&fs);
    let file = driver.create("\\neg.txt", &writable()).unwrap();

    assert_eq!(driver.read(&file, -5, 4).unwrap_err(), NtStatus::INVALID_PARAMETER);
    session.unmount().unwrap();
}

#[test]
fn test_unimplemented_operation_reports_not_implemented() {
    let fs = RecordingFs::new();
    let (session, driver) = mount(&fs);
    let file = driver.create("\\plain.txt", &writable()).unwrap();

    let status = driver.flush(&file).unwrap_err();
    assert_eq!(status, NtStatus::NOT_IMPLEMENTED);
    assert_eq!(status.class(), StatusClass::NotSupported);
    session.unmount().unwrap();
}

// =============================================================================
// Access checks
// =============================================================================

#[test]
fn test_share_mode_conflict() {
    let fs = RecordingFs::new();
    let (session, driver) = mount(&fs);

    let exclusive = driver
        .create("\\locked.txt", &writable().share(ShareAccess::empty()))
        .unwrap();
    let status = driver
        .create("\\LOCKED.TXT", &CreateRequest::open(AccessMask::GENERIC_READ))
        .unwrap_err();
    assert_eq!(status, NtStatus::SHARING_VIOLATION);

    driver.cleanup(&exclusive).unwrap();
    let reader = driver
        .create("\\locked.txt", &CreateRequest::open(AccessMask::GENERIC_READ))
        .unwrap();
    driver.close(exclusive).unwrap();
    driver.cleanup(&reader).unwrap();
    driver.close(reader).unwrap();
    session.unmount().unwrap();
}

#[test]
fn test_write_requires_write_access() {
    let fs = RecordingFs::new();
    let (session, driver) = mount(&fs);
    let _seed = driver.create("\\ro.txt", &writable()).unwrap();
    let reader = driver
        .create("\\ro.txt", &CreateRequest::open(AccessMask::GENERIC_READ))
        .unwrap();

    assert_eq!(driver.write(&reader, 0, b"no").unwrap_err(), NtStatus::ACCESS_DENIED);
    session.unmount().unwrap();
}

#[test]
fn test_write_protected_volume() {
    let fs = RecordingFs::new();
    let (session, driver) = mount_with(
        &fs,
        quick_mounter().flags(MountFlags::WRITE_PROTECT),
        InProcessDriver::new(),
    );

    let status = driver.create("\\new.txt", &writable()).unwrap_err();
    assert_eq!(status, NtStatus::MEDIA_WRITE_PROTECTED);
    let root = driver.create("\\", &directory()).unwrap();
    assert!(root.is_directory());

    let volume = driver.get_volume_information().unwrap();
    assert!(volume.file_system_flags.contains(FileSystemFlags::READ_ONLY_VOLUME));
    session.unmount().unwrap();
}

// =============================================================================
// Listing
// =============================================================================

#[test]
fn test_pattern_listing_falls_back_to_filtering() {
    let fs = RecordingFs::with_entries(&["a.txt", "b.log", "c.TXT", "notes"]);
    let (session, driver) = mount(&fs);
    let root = driver.create("\\", &directory()).unwrap();

    let all = driver.find_files(&root).unwrap();
    assert_eq!(all.len(), 4);

    let mut names: Vec<_> = driver
        .find_files_with_pattern(&root, "*.txt")
        .unwrap()
        .into_iter()
        .map(|entry| entry.file_name)
        .collect();
    names.sort();
    assert_eq!(names, ["a.txt", "c.TXT"]);
    session.unmount().unwrap();
}

#[test]
fn test_full_listing_buffer_overflows() {
    let fs = RecordingFs::with_entries(&["1", "2", "3", "4", "5"]);
    let (session, driver) = mount_with(&fs, quick_mounter(), InProcessDriver::new().with_find_capacity(2));
    let root = driver.create("\\", &directory()).unwrap();

    assert_eq!(driver.find_files(&root).unwrap_err(), NtStatus::BUFFER_OVERFLOW);
    session.unmount().unwrap();
}

#[test]
fn test_listing_a_file_handle_is_invalid_state() {
    let fs = RecordingFs::with_entries(&["x"]);
    let (session, driver) = mount(&fs);
    let file = driver.create("\\x", &writable()).unwrap();

    let status = driver.find_files(&file).unwrap_err();
    assert_eq!(status.class(), StatusClass::InvalidState);
    session.unmount().unwrap();
}
