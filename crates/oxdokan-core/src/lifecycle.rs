//! Mount state machine and request admission.
//!
//! Every callback passes through [`LifecycleGate::admit`] before it reaches
//! the filesystem. The returned [`InFlight`] guard keeps the request counted
//! until it completes, which lets the session drain in-flight work before it
//! tears the volume down.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DokanError, DokanResult, MountError};
use crate::request::OperationKind;

/// Lifecycle state of a mount session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    Mounting,
    Active,
    Unmounting,
}

impl MountState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// `Mounting -> Unmounted` covers a failed driver attach.
    pub fn can_transition_to(self, next: MountState) -> bool {
        matches!(
            (self, next),
            (MountState::Unmounted, MountState::Mounting)
                | (MountState::Mounting, MountState::Active | MountState::Unmounted)
                | (MountState::Active, MountState::Unmounting)
                | (MountState::Unmounting, MountState::Unmounted)
        )
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MountState::Unmounted => "unmounted",
            MountState::Mounting => "mounting",
            MountState::Active => "active",
            MountState::Unmounting => "unmounting",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct GateState {
    state: MountState,
    in_flight: usize,
}

/// Admission control shared by the dispatcher and the session.
#[derive(Debug)]
pub struct LifecycleGate {
    inner: Mutex<GateState>,
    idle: Condvar,
    cancelled: Arc<AtomicBool>,
}

impl LifecycleGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateState {
                state: MountState::Unmounted,
                in_flight: 0,
            }),
            idle: Condvar::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> MountState {
        self.inner.lock().state
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&self, next: MountState) -> Result<MountState, MountError> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if !from.can_transition_to(next) {
            return Err(MountError::InvalidTransition { from, to: next });
        }
        inner.state = next;
        if next == MountState::Mounting {
            self.cancelled.store(false, Ordering::Release);
        }
        debug!(%from, to = %next, "Mount state transition");
        Ok(from)
    }

    /// Count a request in, or reject it for the current state.
    ///
    /// While unmounting only `Cleanup`, `CloseFile` and `Unmounted` pass, so
    /// the driver can still release its handles.
    pub fn admit(&self, kind: OperationKind) -> DokanResult<InFlight<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            MountState::Mounting | MountState::Active => {}
            MountState::Unmounting
                if matches!(
                    kind,
                    OperationKind::Cleanup | OperationKind::CloseFile | OperationKind::Unmounted
                ) => {}
            MountState::Unmounting => return Err(DokanError::Unmounting),
            MountState::Unmounted => return Err(DokanError::NotMounted),
        }
        inner.in_flight += 1;
        Ok(InFlight { gate: self })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Wait for the in-flight count to reach zero.
    ///
    /// Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.in_flight > 0 {
            if self.idle.wait_until(&mut inner, deadline).timed_out() {
                return inner.in_flight == 0;
            }
        }
        true
    }

    /// Raise the cooperative cancellation flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Shared handle on the cancellation flag.
    pub(crate) fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self::new()
    }
}

/// An admitted request; dropping it counts the request out.
#[derive(Debug)]
pub struct InFlight<'a> {
    gate: &'a LifecycleGate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut inner = self.gate.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.in_flight == 0 {
            self.gate.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn active_gate() -> LifecycleGate {
        let gate = LifecycleGate::new();
        gate.transition(MountState::Mounting).unwrap();
        gate.transition(MountState::Active).unwrap();
        gate
    }

    #[test]
    fn test_legal_transitions() {
        let gate = active_gate();
        assert_eq!(gate.transition(MountState::Unmounting).unwrap(), MountState::Active);
        assert_eq!(gate.transition(MountState::Unmounted).unwrap(), MountState::Unmounting);
        assert_eq!(gate.state(), MountState::Unmounted);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let gate = LifecycleGate::new();
        let err = gate.transition(MountState::Active).unwrap_err();
        assert!(matches!(
            err,
            MountError::InvalidTransition {
                from: MountState::Unmounted,
                to: MountState::Active
            }
        ));
        assert_eq!(gate.state(), MountState::Unmounted);
    }

    #[test]
    fn test_admission_by_state() {
        let gate = LifecycleGate::new();
        assert!(matches!(gate.admit(OperationKind::ReadFile), Err(DokanError::NotMounted)));

        let gate = active_gate();
        assert!(gate.admit(OperationKind::ReadFile).is_ok());

        gate.transition(MountState::Unmounting).unwrap();
        assert!(matches!(gate.admit(OperationKind::ReadFile), Err(DokanError::Unmounting)));
        assert!(matches!(gate.admit(OperationKind::CreateFile), Err(DokanError::Unmounting)));
        assert!(gate.admit(OperationKind::Cleanup).is_ok());
        assert!(gate.admit(OperationKind::CloseFile).is_ok());
    }

    #[test]
    fn test_in_flight_counting() {
        let gate = active_gate();
        let a = gate.admit(OperationKind::ReadFile).unwrap();
        let b = gate.admit(OperationKind::WriteFile).unwrap();
        assert_eq!(gate.in_flight(), 2);
        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(!gate.wait_idle(Duration::from_millis(10)));
        drop(b);
        assert!(gate.wait_idle(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_idle_wakes_on_completion() {
        let gate = Arc::new(active_gate());
        let worker = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _request = gate.admit(OperationKind::ReadFile).unwrap();
                thread::sleep(Duration::from_millis(50));
            })
        };
        while gate.in_flight() == 0 && !worker.is_finished() {
            thread::yield_now();
        }
        assert!(gate.wait_idle(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn test_remount_clears_cancellation() {
        let gate = active_gate();
        gate.cancel();
        assert!(gate.is_cancelled());
        gate.transition(MountState::Unmounting).unwrap();
        gate.transition(MountState::Unmounted).unwrap();
        gate.transition(MountState::Mounting).unwrap();
        assert!(!gate.is_cancelled());
    }
}
