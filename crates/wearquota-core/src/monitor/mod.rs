//! The per-tick control loop.
//!
//! `Monitor` owns every ledger by value and drives one tick at a time:
//! period rollovers first (foreground before background, since the
//! foreground rollover re-anchors the background allocation), then
//! foreground classification, per-actor debt accounting, enforcement
//! decisions, period slack absorption, lifetime consumption, and finally
//! telemetry. Timers and sampling I/O live with the caller; a tick that
//! has no sample batch simply never reaches `tick()`, so ledgers are
//! untouched by sampling failures.
//!
//! Shutdown goes through [`Monitor::finish`], which consumes the monitor:
//! the finalizer cannot run twice, and nothing can tick after it.

use std::collections::BTreeSet;

use tracing::warn;

use crate::actor::{ActorId, ActorLedger};
use crate::config::MonitorConfig;
use crate::enforce::{Enforcer, EnforcementController};
use crate::foreground::{ForegroundProbe, ForegroundTracker};
use crate::ledger::LifetimeLedger;
use crate::period::{ActivityClass, PeriodScheduler, RolloverSet};
use crate::sample::SampleBatch;
use crate::store::ActorStore;
use crate::telemetry::{ActorSeries, TelemetryError, TelemetrySink, TickSeries};

/// What one tick computed, for callers and tests.
#[derive(Debug, Clone, Copy)]
pub struct TickSummary {
    /// Tick index, starting at 1.
    pub tick: u64,
    /// Which classes rolled over at the start of the tick.
    pub rolled: RolloverSet,
    /// Aggregate write rate across both classes, KiB/s.
    pub total_rate: f64,
    /// Aggregate foreground write rate, KiB/s.
    pub total_rate_fg: f64,
    /// Aggregate background write rate, KiB/s.
    pub total_rate_bg: f64,
    /// The class whose period absorbed this tick's throughput.
    pub active_class: ActivityClass,
}

/// The control loop state machine.
///
/// Generic over the injected collaborators so the algorithm runs against
/// fakes in tests and against process-invoking adapters in the daemon.
#[derive(Debug)]
pub struct Monitor<P, E, T>
where
    P: ForegroundProbe,
    E: Enforcer,
    T: TelemetrySink,
{
    ledger: LifetimeLedger,
    scheduler: PeriodScheduler,
    actors: ActorLedger,
    foreground: ForegroundTracker,
    controller: EnforcementController,
    whitelist: BTreeSet<ActorId>,
    probe: P,
    enforcer: E,
    sink: T,
    tick: u64,
}

impl<P, E, T> Monitor<P, E, T>
where
    P: ForegroundProbe,
    E: Enforcer,
    T: TelemetrySink,
{
    /// Builds a monitor from the static policy and the persisted store,
    /// with both quota periods unstarted. Actors from the store are
    /// preloaded so their birthdays, carryover totals, and population
    /// count survive restarts.
    #[must_use]
    pub fn new(config: &MonitorConfig, store: &ActorStore, probe: P, enforcer: E, sink: T) -> Self {
        let mut actors = ActorLedger::new();
        for (id, record) in store.entries() {
            actors.preload(*id, record.birthday, record.cumulative_kib, record.name.clone());
        }
        Self {
            ledger: LifetimeLedger::new(
                config.device.w_max_kib as f64,
                config.device.initial_slack(),
            ),
            scheduler: PeriodScheduler::new(
                config.device.life_secs as f64,
                config.periods.foreground_secs as f64,
                config.periods.background_secs as f64,
                config.periods.ratelimit_threshold_rate_fg,
                config.periods.ratelimit_threshold_rate_bg,
            ),
            actors,
            foreground: ForegroundTracker::new(
                config.sampling.foreground_refresh_delay_ticks,
                config.service_map(),
            ),
            controller: EnforcementController::new(config.enforcement.rate_scale),
            whitelist: config.whitelist_set(),
            probe,
            enforcer,
            sink,
            tick: 0,
        }
    }

    /// Runs one tick against a sample batch.
    pub fn tick(&mut self, now: f64, batch: &SampleBatch) -> TickSummary {
        let rolled = self.scheduler.poll(now, &mut self.ledger);
        if rolled.foreground {
            self.actors.reset_debts(ActivityClass::Foreground);
        }
        if rolled.background {
            self.actors.reset_debts(ActivityClass::Background);
        }

        self.tick += 1;
        self.foreground.refresh(&mut self.probe);

        // Per-actor instantaneous rates and the tick's aggregate.
        let mut contributions: Vec<(ActorId, f64)> = Vec::with_capacity(batch.records.len());
        let mut total_rate = 0.0;
        for record in &batch.records {
            if self.whitelist.contains(&record.actor) {
                continue;
            }
            self.actors
                .observe_sample(record.actor, record.cumulative_kib, now as u64);
            let rate = record.delta_kib / batch.elapsed_secs;
            total_rate += rate;
            contributions.push((record.actor, rate));
        }

        // Classify, attribute overshoot, and decide enforcement per actor.
        let mut total_rate_fg = 0.0;
        let mut total_rate_bg = 0.0;
        let mut device_active = false;
        for &(actor, rate) in &contributions {
            let class = self.foreground.classify(actor);
            match class {
                ActivityClass::Foreground => {
                    device_active = true;
                    total_rate_fg += rate;
                },
                ActivityClass::Background => total_rate_bg += rate,
            }

            let period = self.scheduler.period(class);
            let target_rate = period.target_rate();
            let threshold = period.ratelimit_threshold();

            if total_rate > target_rate {
                let debt =
                    self.actors
                        .attribute_overshoot(actor, class, rate, total_rate, target_rate);
                if EnforcementController::over_threshold(debt, threshold) {
                    self.controller.leash(
                        &mut self.enforcer,
                        actor,
                        class,
                        target_rate,
                        self.actors.distinct_actors(),
                        self.tick,
                    );
                } else if self.controller.is_leashed(actor) {
                    self.controller.unleash(&mut self.enforcer, actor);
                }
            } else if self.controller.is_leashed(actor) {
                // Aggregate pressure subsided; release regardless of debt.
                self.controller.unleash(&mut self.enforcer, actor);
            }
        }

        // The owning class absorbs the tick: foreground while the device
        // is interactively active, background otherwise (idle included).
        let active_class = if device_active {
            ActivityClass::Foreground
        } else {
            ActivityClass::Background
        };
        self.scheduler.period_mut(active_class).absorb_tick(total_rate);

        // Lifetime budget shrinks by the bytes actually observed.
        let consumed_kib = batch.delta_sum_kib(|actor| !self.whitelist.contains(&actor));
        self.ledger.consume(consumed_kib);

        let summary = TickSummary {
            tick: self.tick,
            rolled,
            total_rate,
            total_rate_fg,
            total_rate_bg,
            active_class,
        };
        let series = self.build_series(now, batch, &contributions, &summary);
        if let Err(err) = self.sink.record(&series) {
            warn!(tick = self.tick, "telemetry sink failed: {err}");
        }
        summary
    }

    /// Finishes the run: flushes the telemetry sink and returns the merged
    /// actor store snapshot for the caller to persist. Consuming `self`
    /// makes this the exactly-once finalizer.
    ///
    /// # Errors
    ///
    /// Returns an error if the telemetry sink fails to flush.
    pub fn finish(mut self) -> Result<ActorStore, TelemetryError> {
        self.sink.finish()?;
        Ok(ActorStore::from_ledger(&self.actors))
    }

    /// Ticks completed so far.
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.tick
    }

    /// The lifetime ledger.
    #[must_use]
    pub const fn ledger(&self) -> &LifetimeLedger {
        &self.ledger
    }

    /// The period scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &PeriodScheduler {
        &self.scheduler
    }

    /// The actor ledger.
    #[must_use]
    pub const fn actors(&self) -> &ActorLedger {
        &self.actors
    }

    /// The enforcement controller.
    #[must_use]
    pub const fn controller(&self) -> &EnforcementController {
        &self.controller
    }

    fn build_series(
        &self,
        now: f64,
        batch: &SampleBatch,
        contributions: &[(ActorId, f64)],
        summary: &TickSummary,
    ) -> TickSeries {
        let actors = contributions
            .iter()
            .map(|&(actor, rate)| ActorSeries {
                actor,
                rate_kib_s: rate,
                cumulative_kib: self
                    .actors
                    .record(actor)
                    .map_or(0.0, |record| record.cumulative_kib),
                debt_fg_kib: self.actors.debt(actor, ActivityClass::Foreground),
                debt_bg_kib: self.actors.debt(actor, ActivityClass::Background),
                leashed: self.controller.is_leashed(actor),
            })
            .collect();
        let fg = self.scheduler.period(ActivityClass::Foreground);
        let bg = self.scheduler.period(ActivityClass::Background);
        TickSeries {
            tick: summary.tick,
            timestamp: now,
            total_rate: summary.total_rate,
            total_rate_fg: summary.total_rate_fg,
            total_rate_bg: summary.total_rate_bg,
            device_total_kib: batch.device_total_kib,
            w_left_kib: self.ledger.w_left(),
            slack_left_kib: self.ledger.slack_left(),
            slack_period_fg_kib: fg.slack_period(),
            slack_period_bg_kib: bg.slack_period(),
            ratelimit_threshold_fg_kib: fg.ratelimit_threshold(),
            ratelimit_threshold_bg_kib: bg.ratelimit_threshold(),
            target_rate_fg: fg.target_rate(),
            target_rate_bg: bg.target_rate(),
            actors,
            leash_onset_ticks: self.controller.first_leash_ticks().clone(),
        }
    }
}
