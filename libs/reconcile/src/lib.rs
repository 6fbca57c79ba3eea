//! Lifecycle primitives for the metal machine driver.
//!
//! The driver never stores machine state. Each call observes the
//! infrastructure API and derives where a logical machine stands:
//!
//! - **Phase**: `Absent`, `Provisioning` or `Allocated`, computed from what
//!   the API reports, never remembered between calls.
//! - **Creation guard**: the one piece of process-local state, a cool-down
//!   per machine name that suppresses duplicate allocations.
//!
//! # Invariants
//!
//! - Phases are derived only from API observations and explicit events
//! - The guard is advisory; it narrows duplicate-provisioning races but
//!   cannot close them without a server-side idempotency key

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The event is not valid in the current phase.
    #[error("invalid transition from {from:?} on {event:?}")]
    InvalidTransition {
        from: MachinePhase,
        event: PhaseEvent,
    },
}

/// Lifecycle phase of a logical machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachinePhase {
    /// No instance backs the machine (never created, released or disowned).
    Absent,

    /// An allocation request is in flight.
    Provisioning,

    /// An instance is allocated to this cluster.
    Allocated,
}

/// Events that move a machine between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// An allocation request was submitted.
    AllocationRequested,

    /// The API confirmed the allocation.
    AllocationSucceeded,

    /// The allocation request failed.
    AllocationFailed,

    /// The instance was freed.
    Released,
}

/// What a single API lookup revealed about an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// The API returned an instance for the id.
    pub exists: bool,

    /// The instance carries an allocation record.
    pub allocated: bool,

    /// The instance carries this cluster's ownership tag.
    pub owned: bool,
}

impl MachinePhase {
    /// Derive the phase from an API observation.
    ///
    /// Anything short of "exists, allocated and owned" is `Absent` from the
    /// caller's point of view.
    pub fn observe(observation: Observation) -> Self {
        if observation.exists && observation.allocated && observation.owned {
            Self::Allocated
        } else {
            Self::Absent
        }
    }

    /// Apply an event.
    pub fn transition(self, event: PhaseEvent) -> Result<Self, ReconcileError> {
        use MachinePhase::*;
        use PhaseEvent::*;

        match (self, event) {
            (Absent, AllocationRequested) => Ok(Provisioning),
            (Provisioning, AllocationSucceeded) => Ok(Allocated),
            (Provisioning, AllocationFailed) => Ok(Absent),
            (Allocated, Released) => Ok(Absent),
            (from, event) => Err(ReconcileError::InvalidTransition { from, event }),
        }
    }

    /// Returns true if an instance currently backs the machine.
    pub fn is_allocated(&self) -> bool {
        matches!(self, Self::Allocated)
    }

    /// Returns true if no instance backs the machine.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Default cool-down between accepted creations of the same machine.
pub const DEFAULT_CREATE_BACKOFF: Duration = Duration::from_secs(5);

/// Per-name creation cool-down.
///
/// Entries older than the window are evicted whenever a new attempt is
/// recorded, so the map only holds names created within the last window.
#[derive(Debug)]
pub struct CreationGuard {
    /// Cool-down window.
    window: Duration,

    /// Tracked attempts: machine name -> time of last accepted attempt.
    attempts: Mutex<BTreeMap<String, Instant>>,
}

impl CreationGuard {
    /// Create a guard with the given cool-down window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            attempts: Mutex::new(BTreeMap::new()),
        }
    }

    /// The cool-down window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true if an attempt for `name` was recorded within the window.
    pub fn should_throttle(&self, name: &str, now: Instant) -> bool {
        self.remaining(name, now).is_some()
    }

    /// Time left until `name` may be created again, if it is throttled.
    pub fn remaining(&self, name: &str, now: Instant) -> Option<Duration> {
        let attempts = self.attempts();
        let last = attempts.get(name)?;
        let elapsed = now.saturating_duration_since(*last);
        (elapsed < self.window).then(|| self.window - elapsed)
    }

    /// Record an accepted attempt for `name`.
    pub fn record_attempt(&self, name: &str, now: Instant) {
        let mut attempts = self.attempts();
        attempts.retain(|_, last| now.saturating_duration_since(*last) < self.window);
        attempts.insert(name.to_string(), now);
    }

    /// Drop the record for `name` (the attempt did not go through).
    pub fn forget(&self, name: &str) {
        self.attempts().remove(name);
    }

    /// Evict expired entries.
    pub fn prune(&self, now: Instant) {
        self.attempts()
            .retain(|_, last| now.saturating_duration_since(*last) < self.window);
    }

    /// Clear all entries.
    pub fn reset(&self) {
        self.attempts().clear();
    }

    /// Number of tracked names.
    pub fn len(&self) -> usize {
        self.attempts().len()
    }

    /// Check if no names are tracked.
    pub fn is_empty(&self) -> bool {
        self.attempts().is_empty()
    }

    fn attempts(&self) -> MutexGuard<'_, BTreeMap<String, Instant>> {
        // The map stays consistent even if a holder panicked mid-call.
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CreationGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CREATE_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe() {
        let allocated = Observation {
            exists: true,
            allocated: true,
            owned: true,
        };
        assert_eq!(MachinePhase::observe(allocated), MachinePhase::Allocated);

        let released = Observation {
            allocated: false,
            ..allocated
        };
        assert!(MachinePhase::observe(released).is_absent());

        let foreign = Observation {
            owned: false,
            ..allocated
        };
        assert!(MachinePhase::observe(foreign).is_absent());
    }

    #[test]
    fn test_full_lifecycle() {
        let phase = MachinePhase::Absent
            .transition(PhaseEvent::AllocationRequested)
            .unwrap();
        assert_eq!(phase, MachinePhase::Provisioning);

        let phase = phase.transition(PhaseEvent::AllocationSucceeded).unwrap();
        assert!(phase.is_allocated());

        let phase = phase.transition(PhaseEvent::Released).unwrap();
        assert!(phase.is_absent());
    }

    #[test]
    fn test_failed_allocation_returns_to_absent() {
        let phase = MachinePhase::Provisioning
            .transition(PhaseEvent::AllocationFailed)
            .unwrap();
        assert!(phase.is_absent());
    }

    #[test]
    fn test_invalid_transition() {
        let err = MachinePhase::Absent
            .transition(PhaseEvent::Released)
            .unwrap_err();
        assert_eq!(
            err,
            ReconcileError::InvalidTransition {
                from: MachinePhase::Absent,
                event: PhaseEvent::Released,
            }
        );
    }

    #[test]
    fn test_guard_throttles_within_window() {
        let guard = CreationGuard::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(!guard.should_throttle("worker-a", t0));
        guard.record_attempt("worker-a", t0);

        assert!(guard.should_throttle("worker-a", t0 + Duration::from_secs(4)));
        assert!(!guard.should_throttle("worker-a", t0 + Duration::from_secs(5)));
        assert!(!guard.should_throttle("worker-b", t0));
    }

    #[test]
    fn test_guard_remaining() {
        let guard = CreationGuard::new(Duration::from_secs(5));
        let t0 = Instant::now();
        guard.record_attempt("worker-a", t0);

        assert_eq!(
            guard.remaining("worker-a", t0 + Duration::from_secs(2)),
            Some(Duration::from_secs(3))
        );
        assert_eq!(guard.remaining("worker-a", t0 + Duration::from_secs(6)), None);
    }

    #[test]
    fn test_guard_evicts_expired_on_record() {
        let guard = CreationGuard::new(Duration::from_secs(5));
        let t0 = Instant::now();

        guard.record_attempt("worker-a", t0);
        guard.record_attempt("worker-b", t0 + Duration::from_secs(1));
        assert_eq!(guard.len(), 2);

        guard.record_attempt("worker-c", t0 + Duration::from_secs(10));
        assert_eq!(guard.len(), 1);
        assert!(!guard.should_throttle("worker-a", t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_guard_forget_and_reset() {
        let guard = CreationGuard::default();
        let t0 = Instant::now();

        guard.record_attempt("worker-a", t0);
        guard.record_attempt("worker-b", t0);
        guard.forget("worker-a");
        assert!(!guard.should_throttle("worker-a", t0));
        assert!(guard.should_throttle("worker-b", t0));

        guard.reset();
        assert!(guard.is_empty());
    }

    #[test]
    fn test_guard_prune() {
        let guard = CreationGuard::new(Duration::from_secs(1));
        let t0 = Instant::now();
        guard.record_attempt("worker-a", t0);

        guard.prune(t0 + Duration::from_secs(2));
        assert!(guard.is_empty());
    }
}
