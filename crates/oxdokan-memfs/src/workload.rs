//! A concurrent exercise of a mounted volume through the driver.
//!
//! Each writer works in its own directory: it creates files, writes a
//! payload, reads it back, lists the directory, renames every file and then
//! deletes everything it made. Writers run on their own threads, so the
//! dispatcher sees overlapping requests on distinct handles.

use std::thread;
use std::time::{Duration, Instant};

use oxdokan_core::{AccessMask, CreateDisposition, CreateOptions, CreateRequest, DriverFile, InProcessDriver};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::MemFsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    pub writers: usize,
    pub files_per_writer: usize,
    pub payload_size: usize,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            writers: 4,
            files_per_writer: 16,
            payload_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadSummary {
    pub files: usize,
    pub bytes_written: u64,
    pub bytes_verified: u64,
    /// Entries returned by directory listings.
    pub entries_listed: usize,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl WorkloadSummary {
    fn merge(&mut self, other: &WorkloadSummary) {
        self.files += other.files;
        self.bytes_written += other.bytes_written;
        self.bytes_verified += other.bytes_verified;
        self.entries_listed += other.entries_listed;
    }
}

/// Run `workload` against the volume attached to `driver`.
pub fn run(driver: &InProcessDriver, workload: &Workload) -> Result<WorkloadSummary, MemFsError> {
    let started = Instant::now();
    info!(
        writers = workload.writers,
        files = workload.files_per_writer,
        payload = workload.payload_size,
        "Starting workload"
    );

    let results: Vec<Result<WorkloadSummary, MemFsError>> = thread::scope(|scope| {
        let workers: Vec<_> = (0..workload.writers)
            .map(|writer| {
                thread::Builder::new()
                    .name(format!("writer-{writer}"))
                    .spawn_scoped(scope, move || run_writer(driver, workload, writer))
            })
            .collect();
        workers
            .into_iter()
            .enumerate()
            .map(|(writer, spawned)| match spawned {
                Ok(handle) => handle
                    .join()
                    .unwrap_or(Err(MemFsError::WriterPanicked(writer))),
                Err(e) => Err(MemFsError::Spawn(e)),
            })
            .collect()
    });

    let mut summary = WorkloadSummary::default();
    for result in results {
        summary.merge(&result?);
    }
    summary.elapsed = started.elapsed();
    info!(
        files = summary.files,
        bytes = summary.bytes_written,
        elapsed = ?summary.elapsed,
        "Workload finished"
    );
    Ok(summary)
}

fn run_writer(driver: &InProcessDriver, workload: &Workload, writer: usize) -> Result<WorkloadSummary, MemFsError> {
    let dir = format!("\\writer-{writer}");
    let mut summary = WorkloadSummary::default();

    let handle = open(
        driver,
        &dir,
        CreateRequest::open(AccessMask::GENERIC_READ)
            .disposition(CreateDisposition::OpenIf)
            .options(CreateOptions::DIRECTORY_FILE),
    )?;
    release(driver, handle, &dir)?;

    for index in 0..workload.files_per_writer {
        let path = format!("{dir}\\file-{index:04}.bin");
        let payload = payload(writer, index, workload.payload_size);

        let file = open(
            driver,
            &path,
            CreateRequest::open(AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE)
                .disposition(CreateDisposition::Create)
                .options(CreateOptions::NON_DIRECTORY_FILE),
        )?;
        let written = driver
            .write(&file, 0, &payload)
            .map_err(MemFsError::request("WriteFile", &path))?;
        let read = driver
            .read(&file, 0, payload.len())
            .map_err(MemFsError::request("ReadFile", &path))?;
        if read != payload {
            return Err(MemFsError::Mismatch {
                path,
                expected: payload.len(),
                actual: read.len(),
            });
        }
        release(driver, file, &path)?;

        summary.files += 1;
        summary.bytes_written += written as u64;
        summary.bytes_verified += read.len() as u64;
    }

    let listing = open(
        driver,
        &dir,
        CreateRequest::open(AccessMask::GENERIC_READ).options(CreateOptions::DIRECTORY_FILE),
    )?;
    let entries = driver
        .find_files(&listing)
        .map_err(MemFsError::request("FindFiles", &dir))?;
    release(driver, listing, &dir)?;
    summary.entries_listed = entries.len();
    debug!(writer, entries = entries.len(), "Listed");

    for entry in &entries {
        let from = format!("{dir}\\{}", entry.file_name);
        let to = format!("{from}.done");
        let file = open(
            driver,
            &from,
            CreateRequest::open(AccessMask::DELETE | AccessMask::GENERIC_READ),
        )?;
        driver
            .move_file(&file, &to, false)
            .map_err(MemFsError::request("MoveFile", &from))?;
        driver
            .delete_file(&file)
            .map_err(MemFsError::request("DeleteFile", &to))?;
        release(driver, file, &to)?;
    }

    let handle = open(
        driver,
        &dir,
        CreateRequest::open(AccessMask::DELETE | AccessMask::GENERIC_READ).options(CreateOptions::DIRECTORY_FILE),
    )?;
    driver
        .delete_directory(&handle)
        .map_err(MemFsError::request("DeleteDirectory", &dir))?;
    release(driver, handle, &dir)?;

    Ok(summary)
}

fn open(driver: &InProcessDriver, path: &str, request: CreateRequest) -> Result<DriverFile, MemFsError> {
    driver
        .create(path, &request)
        .map_err(MemFsError::request("CreateFile", path))
}

fn release(driver: &InProcessDriver, file: DriverFile, path: &str) -> Result<(), MemFsError> {
    driver
        .cleanup(&file)
        .map_err(MemFsError::request("Cleanup", path))?;
    driver
        .close(file)
        .map_err(MemFsError::request("CloseFile", path))
}

/// Deterministic content, distinct per writer and file.
fn payload(writer: usize, index: usize, size: usize) -> Vec<u8> {
    let seed = writer.wrapping_mul(31).wrapping_add(index);
    (0..size).map(|i| (i.wrapping_add(seed) % 251) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads_differ_between_files() {
        let a = payload(0, 0, 64);
        let b = payload(0, 1, 64);
        let c = payload(1, 0, 64);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, payload(0, 0, 64));
    }

    #[test]
    fn test_summary_merge() {
        let mut total = WorkloadSummary::default();
        let part = WorkloadSummary {
            files: 2,
            bytes_written: 10,
            bytes_verified: 10,
            entries_listed: 2,
            elapsed: Duration::ZERO,
        };
        total.merge(&part);
        total.merge(&part);
        assert_eq!(total.files, 4);
        assert_eq!(total.bytes_written, 20);
        assert_eq!(total.entries_listed, 4);
    }
}
