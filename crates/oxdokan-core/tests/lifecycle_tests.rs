//! Mount lifecycle through the in-process driver: notifications, admission
//! while unmounting, graceful drain and forced teardown.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use oxdokan_core::{
    AccessMask, CreateDisposition, CreateRequest, InProcessDriver, MountError, MountSession, MountState, NtStatus,
    StatusClass,
};

fn writable() -> CreateRequest {
    CreateRequest::open(AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE).disposition(CreateDisposition::OpenIf)
}

fn wait_for_state(session: &MountSession, state: MountState) {
    while session.state() != state {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_open_write_close_leaves_no_handles() {
    let fs = RecordingFs::new();
    let (session, driver) = mount(&fs);
    assert_eq!(fs.mounted.load(Ordering::SeqCst), 1);

    let file = driver.create("\\a.txt", &writable()).unwrap();
    assert_ne!(file.context(), 0);
    assert_eq!(driver.write(&file, 0, b"hello").unwrap(), 5);
    assert_eq!(driver.read(&file, 0, 16).unwrap(), b"hello");
    driver.cleanup(&file).unwrap();
    driver.close(file).unwrap();

    assert_eq!(session.open_handles(), 0);
    let report = session.unmount().unwrap();
    assert!(!report.forced);
    assert_eq!(report.released_handles, 0);
    assert_eq!(report.stats.leaked_handles(), 0);
    assert_eq!(fs.unmounted.load(Ordering::SeqCst), 1);
    assert_eq!(fs.contents("\\a.txt").as_deref(), Some(&b"hello"[..]));
}

#[test]
fn test_unmount_releases_handles_left_open() {
    let fs = RecordingFs::new();
    let (session, driver) = mount(&fs);

    let _first = driver.create("\\one.txt", &writable()).unwrap();
    let _second = driver.create("\\two.txt", &writable()).unwrap();
    assert_eq!(session.open_handles(), 2);

    let report = session.unmount().unwrap();
    assert!(!report.forced);
    assert_eq!(report.released_handles, 2);
    assert_eq!(fs.cleanups.load(Ordering::SeqCst), 2);
    assert_eq!(fs.closes.load(Ordering::SeqCst), 2);
    assert_eq!(session.open_handles(), 0);
}

#[test]
fn test_requests_rejected_while_unmounting() {
    let fs = RecordingFs::new();
    let (session, driver) = mount_with(
        &fs,
        quick_mounter().unmount_timeout(Duration::from_secs(5)),
        InProcessDriver::new(),
    );
    let file = driver.create("\\slow.txt", &writable()).unwrap();

    fs.write_latch.close();
    thread::scope(|s| {
        let writer = s.spawn(|| driver.write(&file, 0, b"late"));
        fs.wait_for_writes(1);

        let unmounter = s.spawn(|| session.unmount());
        wait_for_state(&session, MountState::Unmounting);

        let rejected = driver.create("\\new.txt", &writable()).unwrap_err();
        assert_eq!(rejected, NtStatus::INVALID_DEVICE_STATE);
        assert_eq!(rejected.class(), StatusClass::InvalidState);
        assert_eq!(driver.read(&file, 0, 4).unwrap_err(), NtStatus::INVALID_DEVICE_STATE);

        fs.write_latch.open();
        assert_eq!(writer.join().unwrap(), Ok(4));
        let report = unmounter.join().unwrap().unwrap();
        assert!(!report.forced);
        assert_eq!(report.released_handles, 1);
    });
    assert_eq!(session.state(), MountState::Unmounted);
    assert!(session.stats().snapshot().rejected >= 2);
}

#[test]
fn test_unmount_waits_for_in_flight_write() {
    let fs = RecordingFs::new();
    *fs.write_delay.lock() = Duration::from_millis(100);
    let (session, driver) = mount(&fs);
    let file = driver.create("\\drain.txt", &writable()).unwrap();

    thread::scope(|s| {
        let writer = s.spawn(|| driver.write(&file, 0, b"drained"));
        fs.wait_for_writes(1);
        let report = session.unmount().unwrap();
        assert!(!report.forced);
        assert_eq!(writer.join().unwrap(), Ok(7));
    });
    assert_eq!(fs.contents("\\drain.txt").as_deref(), Some(&b"drained"[..]));
}

#[test]
fn test_forced_unmount_reports_busy_then_completes() {
    let fs = RecordingFs::new();
    let (session, driver) = mount_with(
        &fs,
        quick_mounter()
            .unmount_timeout(Duration::from_millis(50))
            .force_grace(Duration::from_millis(50))
            .lock_timeout(Duration::from_millis(20)),
        InProcessDriver::new(),
    );
    let file = driver.create("\\stuck.txt", &writable()).unwrap();

    fs.write_latch.close();
    thread::scope(|s| {
        let writer = s.spawn(|| driver.write(&file, 0, b"x"));
        fs.wait_for_writes(1);

        let err = session.unmount().unwrap_err();
        assert!(matches!(err, MountError::Busy { handles: 1 }), "got {err:?}");
        assert_eq!(session.state(), MountState::Unmounting);

        fs.write_latch.open();
        assert!(writer.join().unwrap().is_ok());
    });

    let report = session.unmount().unwrap();
    assert_eq!(report.stats.leaked_handles(), 0);
    assert_eq!(session.state(), MountState::Unmounted);
    assert!(!driver.is_attached());
}

#[test]
fn test_forced_unmount_after_drain_timeout() {
    let fs = RecordingFs::new();
    *fs.write_delay.lock() = Duration::from_millis(120);
    let (session, driver) = mount_with(
        &fs,
        quick_mounter()
            .unmount_timeout(Duration::from_millis(20))
            .force_grace(Duration::from_millis(500))
            .lock_timeout(Duration::from_millis(500)),
        InProcessDriver::new(),
    );
    let file = driver.create("\\late.txt", &writable()).unwrap();

    thread::scope(|s| {
        let writer = s.spawn(|| driver.write(&file, 0, b"abc"));
        fs.wait_for_writes(1);
        let report = session.unmount().unwrap();
        assert!(report.forced);
        assert_eq!(report.released_handles, 0);
        assert!(writer.join().unwrap().is_ok());
    });
    assert_eq!(session.open_handles(), 0);
}

#[test]
fn test_drop_with_stuck_callback_detaches_within_timeout() {
    let fs = RecordingFs::new();
    let (session, driver) = mount_with(
        &fs,
        quick_mounter()
            .timeout(Duration::from_millis(300))
            .unmount_timeout(Duration::from_millis(50))
            .force_grace(Duration::from_millis(50))
            .lock_timeout(Duration::from_millis(20)),
        InProcessDriver::new(),
    );
    let dispatcher = Arc::clone(session.dispatcher());
    let file = driver.create("\\wedged.txt", &writable()).unwrap();

    fs.write_latch.close();
    let writer = {
        let driver = Arc::clone(&driver);
        thread::spawn(move || driver.write(&file, 0, b"x"))
    };
    fs.wait_for_writes(1);

    let dropper = thread::spawn(move || drop(session));
    let started = Instant::now();
    while !dropper.is_finished() && started.elapsed() < Duration::from_secs(3) {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(dropper.is_finished(), "dropping the session blocked on a stuck callback");
    dropper.join().unwrap();

    assert!(!driver.is_attached());
    assert_eq!(fs.unmounted.load(Ordering::SeqCst), 1);
    // The write still references its handle, so the unmount is not complete.
    assert_eq!(dispatcher.gate().state(), MountState::Unmounting);
    assert_eq!(writer.join().unwrap(), Err(NtStatus::IO_TIMEOUT));

    fs.write_latch.open();
    let started = Instant::now();
    while dispatcher.table().len() > 0 && started.elapsed() < Duration::from_secs(3) {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(dispatcher.table().len(), 0);
    assert_eq!(fs.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_remount_after_unmount_uses_new_session() {
    let fs = RecordingFs::new();
    let (first, _driver) = mount(&fs);
    let first_id = first.id();
    first.unmount().unwrap();

    let (second, driver) = mount(&fs);
    assert_ne!(second.id(), first_id);
    assert_eq!(driver.global_context(), Some(second.id().raw()));
    assert_eq!(fs.mounted.load(Ordering::SeqCst), 2);
    drop(second);
    assert_eq!(fs.unmounted.load(Ordering::SeqCst), 2);
}
