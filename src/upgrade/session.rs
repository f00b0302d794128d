//! Record of a single upgrade attempt.
//!
//! # State Transitions
//! ```text
//! Pending → Succeeded: successor reported ready
//! Pending → Failed:    spawn, handoff, readiness timeout or early successor exit
//! ```
//! Finished sessions never change again.

use std::time::{Duration, Instant, SystemTime};

use crate::upgrade::error::UpgradeError;

/// Outcome of an upgrade attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Pending,
    Succeeded,
    Failed(String),
}

/// One upgrade attempt, from trigger to outcome.
#[derive(Debug, Clone)]
pub struct UpgradeSession {
    triggered_at: SystemTime,
    started: Instant,
    finished: Option<Instant>,
    successor_pid: Option<u32>,
    outcome: SessionOutcome,
}

impl UpgradeSession {
    pub(crate) fn begin() -> Self {
        Self {
            triggered_at: SystemTime::now(),
            started: Instant::now(),
            finished: None,
            successor_pid: None,
            outcome: SessionOutcome::Pending,
        }
    }

    pub fn triggered_at(&self) -> SystemTime {
        self.triggered_at
    }

    pub fn successor_pid(&self) -> Option<u32> {
        self.successor_pid
    }

    pub fn outcome(&self) -> &SessionOutcome {
        &self.outcome
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == SessionOutcome::Pending
    }

    /// Time from trigger to outcome, or until now while pending.
    pub fn elapsed(&self) -> Duration {
        self.finished.unwrap_or_else(Instant::now) - self.started
    }

    pub(crate) fn attach_successor(&mut self, pid: Option<u32>) {
        if self.is_pending() {
            self.successor_pid = pid;
        }
    }

    pub(crate) fn succeed(&mut self) {
        self.finish(SessionOutcome::Succeeded);
    }

    pub(crate) fn fail(&mut self, error: &UpgradeError) {
        self.finish(SessionOutcome::Failed(error.to_string()));
    }

    fn finish(&mut self, outcome: SessionOutcome) {
        if self.is_pending() {
            self.outcome = outcome;
            self.finished = Some(Instant::now());
        }
    }
}
