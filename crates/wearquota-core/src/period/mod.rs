//! Nested quota periods and slack apportionment.
//!
//! Two recurring quota periods share the device's lifetime budget: a
//! foreground period and a background period strictly nested inside it.
//! At each rollover the expiring period's unused slack is recycled one
//! level up (foreground leftovers return to the lifetime pool, background
//! leftovers fold back into the parent foreground period) and the new
//! period receives an equal share of whatever remains, spread over the
//! periods left in the lifetime. Overspend borrows against that future
//! share; underspend leaves more for the periods that follow.
//!
//! The foreground rollover must be evaluated first on any tick where both
//! trigger: it resets the background period's remaining life and slack
//! bank, so a background rollover never crosses a foreground boundary
//! with stale allocations.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::LifetimeLedger;

/// Fraction of a tick's throughput shortfall that widens the ratelimit
/// threshold, easing enforcement after sustained underspend.
pub const THRESHOLD_GROWTH_FACTOR: f64 = 0.5;

/// The activity class an actor is attributed to for one tick.
///
/// Class membership is dynamic: the same actor may be foreground on one
/// tick and background on the next, depending on what is foregrounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityClass {
    /// Interactive writes attributed to the foregrounded actor and its
    /// service-table auxiliaries.
    Foreground,
    /// Everything else.
    Background,
}

impl ActivityClass {
    /// Both classes, foreground first.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Foreground, Self::Background]
    }

    /// Stable index for per-class storage.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Foreground => 0,
            Self::Background => 1,
        }
    }

    /// Short label for logs and telemetry.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Foreground => "fg",
            Self::Background => "bg",
        }
    }
}

impl std::fmt::Display for ActivityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one recurring quota period.
///
/// All byte quantities are KiB; rates are KiB/s; times are seconds.
#[derive(Debug, Clone, Serialize)]
pub struct ClassPeriod {
    class: ActivityClass,
    period_secs: f64,
    threshold_rate: f64,
    /// Wall-clock start of the current period. Negative infinity until the
    /// first rollover, so the first poll always starts a period regardless
    /// of the caller's clock base.
    checkpoint: f64,
    /// Remaining lifetime for this class, in seconds. For the background
    /// class this is reset to one foreground period at every foreground
    /// rollover.
    life_left: f64,
    /// Periods remaining until the class's lifetime ends.
    period_left: f64,
    /// Allowance banked for the current period. Drained as actors overspend
    /// and credited back as the aggregate underspends.
    slack_period: f64,
    /// Slack-debt ceiling that arms enforcement for this period.
    ratelimit_threshold: f64,
    /// Instantaneous fair-share baseline rate for the period.
    target_rate: f64,
    /// Background only: the allocation granted by the parent foreground
    /// period at its last rollover, drawn down across nested rollovers.
    slack_bank: f64,
}

impl ClassPeriod {
    fn new(class: ActivityClass, period_secs: f64, threshold_rate: f64, life_secs: f64) -> Self {
        Self {
            class,
            period_secs,
            threshold_rate,
            checkpoint: f64::NEG_INFINITY,
            life_left: life_secs,
            period_left: 0.0,
            slack_period: 0.0,
            ratelimit_threshold: 0.0,
            target_rate: 0.0,
            slack_bank: 0.0,
        }
    }

    /// The class this period belongs to.
    #[must_use]
    pub const fn class(&self) -> ActivityClass {
        self.class
    }

    /// Allowance banked for the current period, in KiB.
    #[must_use]
    pub const fn slack_period(&self) -> f64 {
        self.slack_period
    }

    /// Slack-debt ceiling that arms enforcement, in KiB.
    #[must_use]
    pub const fn ratelimit_threshold(&self) -> f64 {
        self.ratelimit_threshold
    }

    /// Fair-share baseline rate for the period, in KiB/s.
    #[must_use]
    pub const fn target_rate(&self) -> f64 {
        self.target_rate
    }

    /// Periods remaining until the class's lifetime ends.
    #[must_use]
    pub const fn period_left(&self) -> f64 {
        self.period_left
    }

    /// Remaining lifetime for this class, in seconds.
    #[must_use]
    pub const fn life_left(&self) -> f64 {
        self.life_left
    }

    fn due(&self, now: f64) -> bool {
        now - self.checkpoint >= self.period_secs
    }

    /// Folds one tick's aggregate throughput into the period: the gap to
    /// the target rate is credited to (or debited from) the period slack,
    /// and a shortfall additionally widens the ratelimit threshold so a
    /// long idle stretch does not end in premature throttling.
    pub fn absorb_tick(&mut self, total_throughput: f64) {
        let shortfall = self.target_rate - total_throughput;
        self.slack_period += shortfall;
        if shortfall > 0.0 {
            self.ratelimit_threshold += shortfall * THRESHOLD_GROWTH_FACTOR;
        }
    }

    /// Periods remaining, clamped for the terminal stretch of life where
    /// the horizon has run out but the loop is still being driven.
    fn remaining_periods(&self) -> f64 {
        let left = self.life_left / self.period_secs;
        if left > 0.0 {
            left
        } else {
            warn!(class = %self.class, "lifetime horizon exhausted, treating remainder as one period");
            1.0
        }
    }
}

/// Which classes rolled over on a given tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloverSet {
    /// The foreground period started anew.
    pub foreground: bool,
    /// The background period started anew.
    pub background: bool,
}

/// Manages the two nested quota periods and their rollovers.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodScheduler {
    foreground: ClassPeriod,
    background: ClassPeriod,
}

impl PeriodScheduler {
    /// Creates a scheduler with both periods unstarted.
    ///
    /// `life_secs` is the device's target lifetime; the background class
    /// initially inherits it and is re-anchored to one foreground period
    /// at the first foreground rollover.
    #[must_use]
    pub fn new(
        life_secs: f64,
        foreground_period_secs: f64,
        background_period_secs: f64,
        threshold_rate_fg: f64,
        threshold_rate_bg: f64,
    ) -> Self {
        Self {
            foreground: ClassPeriod::new(
                ActivityClass::Foreground,
                foreground_period_secs,
                threshold_rate_fg,
                life_secs,
            ),
            background: ClassPeriod::new(
                ActivityClass::Background,
                background_period_secs,
                threshold_rate_bg,
                life_secs,
            ),
        }
    }

    /// The period for one activity class.
    #[must_use]
    pub const fn period(&self, class: ActivityClass) -> &ClassPeriod {
        match class {
            ActivityClass::Foreground => &self.foreground,
            ActivityClass::Background => &self.background,
        }
    }

    /// Mutable access for tick-level slack absorption.
    pub fn period_mut(&mut self, class: ActivityClass) -> &mut ClassPeriod {
        match class {
            ActivityClass::Foreground => &mut self.foreground,
            ActivityClass::Background => &mut self.background,
        }
    }

    /// Evaluates both rollover conditions for the current tick, foreground
    /// first, and returns which classes started a new period. Callers must
    /// reset per-actor slack debts for every class reported here.
    pub fn poll(&mut self, now: f64, ledger: &mut LifetimeLedger) -> RolloverSet {
        let mut rolled = RolloverSet::default();
        if self.foreground.due(now) {
            self.roll_foreground(now, ledger);
            rolled.foreground = true;
        }
        if self.background.due(now) {
            self.roll_background(now);
            rolled.background = true;
        }
        rolled
    }

    /// Starts a new foreground period.
    ///
    /// Leftover foreground slack is recycled into the lifetime pool, the
    /// new period receives an equal share of the remaining pool, and the
    /// nested background class is re-anchored: its remaining life becomes
    /// one foreground period and its slack bank becomes the fresh
    /// foreground allocation.
    fn roll_foreground(&mut self, now: f64, ledger: &mut LifetimeLedger) {
        let Self {
            foreground: fg,
            background: bg,
        } = self;

        fg.checkpoint = now;
        if fg.slack_period > 0.0 {
            ledger.bank_slack(fg.slack_period);
        }
        fg.period_left = fg.remaining_periods();
        fg.slack_period = ledger.slack_left() / fg.period_left;
        ledger.withdraw_slack(fg.slack_period);
        fg.ratelimit_threshold = fg.slack_period * fg.threshold_rate;
        fg.life_left -= fg.period_secs;

        bg.life_left = fg.period_secs;
        bg.slack_bank = fg.slack_period;

        fg.target_rate = (ledger.w_left() - ledger.slack_left()) / fg.life_left;

        info!(
            period_left = fg.period_left,
            slack_period_kib = fg.slack_period,
            ratelimit_threshold_kib = fg.ratelimit_threshold,
            target_rate_kib_s = fg.target_rate,
            "new foreground quota period"
        );
    }

    /// Starts a new background period, drawing from the parent foreground
    /// allocation rather than the lifetime pool.
    fn roll_background(&mut self, now: f64) {
        let Self {
            foreground: fg,
            background: bg,
        } = self;

        bg.checkpoint = now;
        if bg.slack_period > 0.0 {
            fg.slack_period += bg.slack_period;
        }
        bg.period_left = bg.remaining_periods();
        bg.slack_period = bg.slack_bank / bg.period_left;
        fg.slack_period -= bg.slack_period;
        bg.ratelimit_threshold = bg.slack_period * bg.threshold_rate;
        bg.life_left -= bg.period_secs;

        // FIXME: the background target rate is a stand-in for a rate derived
        // from the background class's own allocation.
        bg.target_rate = fg.target_rate;

        info!(
            period_left = bg.period_left,
            slack_period_kib = bg.slack_period,
            ratelimit_threshold_kib = bg.ratelimit_threshold,
            target_rate_kib_s = bg.target_rate,
            "new background quota period"
        );
    }
}
