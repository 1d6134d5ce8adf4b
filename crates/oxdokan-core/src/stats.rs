//! Dispatch statistics.
//!
//! Lock-free counters updated on every callback. A [`DispatchStatsSnapshot`]
//! is a serialisable copy for reporting.
//!
//! ```
//! use oxdokan_core::stats::DispatchStats;
//! use oxdokan_core::request::OperationKind;
//! use oxdokan_core::status::NtStatus;
//! use std::time::Duration;
//!
//! let stats = DispatchStats::new();
//! stats.record(OperationKind::ReadFile, NtStatus::SUCCESS, Duration::from_micros(40));
//! stats.record_read(4096);
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.total_requests, 1);
//! assert_eq!(snapshot.bytes_read, 4096);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::request::OperationKind;
use crate::status::{NtStatus, StatusClass};

/// Total latency and count for computing averages.
#[derive(Debug, Default)]
pub struct LatencyStats {
    total_nanos: AtomicU64,
    count: AtomicU64,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average latency in nanoseconds; 0.0 when nothing was recorded.
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_nanos(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_nanos.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn avg_micros(&self) -> f64 {
        self.avg_nanos() / 1000.0
    }

    pub fn reset(&self) {
        self.total_nanos.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

const CLASS_COUNT: usize = 6;

fn class_index(class: StatusClass) -> usize {
    match class {
        StatusClass::Success => 0,
        StatusClass::NotFound => 1,
        StatusClass::AccessDenied => 2,
        StatusClass::NotSupported => 3,
        StatusClass::InvalidState => 4,
        StatusClass::IoError => 5,
    }
}

const CLASSES: [StatusClass; CLASS_COUNT] = [
    StatusClass::Success,
    StatusClass::NotFound,
    StatusClass::AccessDenied,
    StatusClass::NotSupported,
    StatusClass::InvalidState,
    StatusClass::IoError,
];

/// Counters for one mount session.
#[derive(Debug)]
pub struct DispatchStats {
    per_kind: [AtomicU64; OperationKind::COUNT],
    per_class: [AtomicU64; CLASS_COUNT],
    latency: [LatencyStats; OperationKind::COUNT],
    panics: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    handles_opened: AtomicU64,
    handles_closed: AtomicU64,
    session_start: SystemTime,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self {
            per_kind: std::array::from_fn(|_| AtomicU64::new(0)),
            per_class: std::array::from_fn(|_| AtomicU64::new(0)),
            latency: std::array::from_fn(|_| LatencyStats::new()),
            panics: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            handles_opened: AtomicU64::new(0),
            handles_closed: AtomicU64::new(0),
            session_start: SystemTime::now(),
        }
    }

    /// Count one completed callback.
    pub fn record(&self, kind: OperationKind, status: NtStatus, elapsed: Duration) {
        self.per_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
        self.per_class[class_index(status.class())].fetch_add(1, Ordering::Relaxed);
        self.latency[kind.index()].record(elapsed);
        if status == NtStatus::IO_TIMEOUT {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    /// A request refused by the lifecycle gate.
    #[inline]
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_handle_opened(&self) {
        self.handles_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_handle_closed(&self) {
        self.handles_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, kind: OperationKind) -> u64 {
        self.per_kind[kind.index()].load(Ordering::Relaxed)
    }

    pub fn class_count(&self, class: StatusClass) -> u64 {
        self.per_class[class_index(class)].load(Ordering::Relaxed)
    }

    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn latency(&self, kind: OperationKind) -> &LatencyStats {
        &self.latency[kind.index()]
    }

    /// Handles opened and not yet evicted.
    pub fn open_handles(&self) -> u64 {
        self.handles_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.handles_closed.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        let requests: BTreeMap<String, u64> = OperationKind::ALL
            .iter()
            .filter_map(|kind| {
                let count = self.count(*kind);
                (count > 0).then(|| (kind.name().to_string(), count))
            })
            .collect();
        let statuses: BTreeMap<String, u64> = CLASSES
            .iter()
            .filter_map(|class| {
                let count = self.class_count(*class);
                (count > 0).then(|| (format!("{class:?}"), count))
            })
            .collect();
        let avg_latency_us: BTreeMap<String, f64> = OperationKind::ALL
            .iter()
            .filter(|kind| self.latency(**kind).count() > 0)
            .map(|kind| (kind.name().to_string(), self.latency(*kind).avg_micros()))
            .collect();

        DispatchStatsSnapshot {
            total_requests: requests.values().sum(),
            requests,
            statuses,
            avg_latency_us,
            panics: self.panics(),
            timeouts: self.timeouts(),
            rejected: self.rejected.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            handles_opened: self.handles_opened.load(Ordering::Relaxed),
            handles_closed: self.handles_closed.load(Ordering::Relaxed),
            session_start: self.session_start,
        }
    }
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialisable copy of [`DispatchStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    pub total_requests: u64,
    /// Completed callbacks by operation name.
    pub requests: BTreeMap<String, u64>,
    /// Completed callbacks by status class.
    pub statuses: BTreeMap<String, u64>,
    pub avg_latency_us: BTreeMap<String, f64>,
    pub panics: u64,
    pub timeouts: u64,
    /// Refused while unmounting or unmounted.
    pub rejected: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub handles_opened: u64,
    pub handles_closed: u64,
    #[serde(with = "humantime_serde")]
    pub session_start: SystemTime,
}

impl DispatchStatsSnapshot {
    /// Handles that were opened but never evicted.
    pub fn leaked_handles(&self) -> u64 {
        self.handles_opened.saturating_sub(self.handles_closed)
    }
}
