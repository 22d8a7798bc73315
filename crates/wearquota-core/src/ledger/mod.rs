//! Lifetime write budget ledger.

use serde::Serialize;
use tracing::warn;

/// Tracks the remaining device write budget and the lifetime slack pool.
///
/// The ledger is a pair of counters with no apportionment logic of its
/// own; the [`PeriodScheduler`](crate::period::PeriodScheduler) is
/// responsible for moving slack between the pool and the active periods.
/// Both counters are in KiB. `slack_left` may go negative transiently
/// when periods overspend; later rollovers re-apportion the remaining
/// lifetime and pull it back toward baseline.
#[derive(Debug, Clone, Serialize)]
pub struct LifetimeLedger {
    w_left: f64,
    slack_left: f64,
}

impl LifetimeLedger {
    /// Creates a ledger holding the full lifetime budget and initial slack.
    #[must_use]
    pub const fn new(w_max_kib: f64, initial_slack_kib: f64) -> Self {
        Self {
            w_left: w_max_kib,
            slack_left: initial_slack_kib,
        }
    }

    /// Remaining lifetime write budget, in KiB. Non-increasing.
    #[must_use]
    pub const fn w_left(&self) -> f64 {
        self.w_left
    }

    /// Lifetime slack pool, in KiB.
    #[must_use]
    pub const fn slack_left(&self) -> f64 {
        self.slack_left
    }

    /// Consumes observed writes from the lifetime budget.
    ///
    /// Exhaustion is a terminal condition owned by the caller's loop
    /// configuration; the ledger only logs the crossing.
    pub fn consume(&mut self, kib: f64) {
        let before = self.w_left;
        self.w_left -= kib;
        if before > 0.0 && self.w_left <= 0.0 {
            warn!(
                w_left_kib = self.w_left,
                "lifetime write budget exhausted"
            );
        }
    }

    /// Banks recycled allowance into the slack pool.
    pub fn bank_slack(&mut self, kib: f64) {
        self.slack_left += kib;
    }

    /// Withdraws an apportioned share from the slack pool. May drive the
    /// pool negative; callers own apportionment correctness.
    pub fn withdraw_slack(&mut self, kib: f64) {
        self.slack_left -= kib;
    }
}
