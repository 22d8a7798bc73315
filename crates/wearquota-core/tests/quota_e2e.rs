//! End-to-end scenarios driving the monitor with fake collaborators.

use std::cell::RefCell;
use std::rc::Rc;

use wearquota_core::actor::ActorId;
use wearquota_core::config::MonitorConfig;
use wearquota_core::enforce::{EnforceError, Enforcer};
use wearquota_core::foreground::{ForegroundProbe, ProbeError};
use wearquota_core::monitor::Monitor;
use wearquota_core::period::ActivityClass;
use wearquota_core::sample::{SampleBatch, SampleRecord};
use wearquota_core::store::{ActorStore, StoredActor};
use wearquota_core::telemetry::MemorySink;

/// Probe whose answer the test can change mid-run.
#[derive(Clone)]
struct SharedProbe(Rc<RefCell<Option<ActorId>>>);

impl SharedProbe {
    fn new(foreground: Option<u32>) -> Self {
        Self(Rc::new(RefCell::new(foreground.map(ActorId))))
    }

    fn set(&self, foreground: Option<u32>) {
        *self.0.borrow_mut() = foreground.map(ActorId);
    }
}

impl ForegroundProbe for SharedProbe {
    fn current_foreground(&mut self) -> Result<Option<ActorId>, ProbeError> {
        Ok(*self.0.borrow())
    }
}

/// Enforcer that records every command it receives.
#[derive(Clone, Default)]
struct SharedEnforcer(Rc<RefCell<Vec<(ActorId, Option<f64>)>>>);

impl SharedEnforcer {
    fn commands(&self) -> Vec<(ActorId, Option<f64>)> {
        self.0.borrow().clone()
    }
}

impl Enforcer for SharedEnforcer {
    fn install(&mut self, actor: ActorId, rate: f64) -> Result<(), EnforceError> {
        self.0.borrow_mut().push((actor, Some(rate)));
        Ok(())
    }

    fn remove(&mut self, actor: ActorId) -> Result<(), EnforceError> {
        self.0.borrow_mut().push((actor, None));
        Ok(())
    }
}

/// Policy from the reference scenario: 1000 KiB budget over a 1000 s
/// lifetime, 100 s foreground periods, ten nested background periods,
/// half the budget banked as slack.
fn scenario_config() -> MonitorConfig {
    MonitorConfig::from_toml(
        "[device]\n\
         w_max_kib = 1000\n\
         life_secs = 1000\n\
         slack_rate = 0.5\n\
         [periods]\n\
         foreground_secs = 100\n\
         background_secs = 10\n\
         ratelimit_threshold_rate_fg = 0.5\n\
         ratelimit_threshold_rate_bg = 0.5\n\
         [sampling]\n\
         interval_secs = 1\n\
         foreground_refresh_delay_ticks = 0\n",
    )
    .expect("scenario config should parse")
}

struct BatchBuilder {
    seq: u64,
    cumulative: std::collections::BTreeMap<u32, f64>,
}

impl BatchBuilder {
    fn new() -> Self {
        Self {
            seq: 0,
            cumulative: std::collections::BTreeMap::new(),
        }
    }

    /// Builds the next one-second snapshot from per-actor deltas.
    fn next(&mut self, deltas: &[(u32, f64)]) -> SampleBatch {
        self.seq += 1;
        let records = deltas
            .iter()
            .map(|&(actor, delta)| {
                let cumulative = self.cumulative.entry(actor).or_insert(0.0);
                *cumulative += delta;
                SampleRecord {
                    actor: ActorId(actor),
                    cumulative_kib: *cumulative,
                    delta_kib: delta,
                }
            })
            .collect();
        SampleBatch {
            seq: self.seq,
            timestamp: self.seq,
            elapsed_secs: 1.0,
            device_total_kib: None,
            records,
        }
    }
}

#[test]
fn double_rate_foreground_writer_is_leashed_within_the_first_period() {
    let config = scenario_config();
    let probe = SharedProbe::new(Some(1005));
    let enforcer = SharedEnforcer::default();
    let mut monitor = Monitor::new(
        &config,
        &ActorStore::default(),
        probe.clone(),
        enforcer.clone(),
        MemorySink::default(),
    );

    // The fair-share target after the first rollover is well under
    // 1 KiB/s; a steady 2 KiB/s foreground writer must trip the leash
    // before the 100-tick period ends.
    let mut batches = BatchBuilder::new();
    let mut leashed_at = None;
    for tick in 1..=100u64 {
        let now = 1_000.0 + tick as f64;
        monitor.tick(now, &batches.next(&[(1005, 2.0)]));
        if monitor.controller().is_leashed(ActorId(1005)) {
            leashed_at = Some(tick);
            break;
        }
    }
    let leashed_at = leashed_at.expect("writer should be leashed within the first period");
    assert!(leashed_at < 100, "leashed at tick {leashed_at}");

    let commands = enforcer.commands();
    let (actor, rate) = (
        commands[0].0,
        commands[0].1.expect("first command should install a limit"),
    );
    assert_eq!(actor, ActorId(1005));
    // One distinct actor: the leash rate is the scaled class target.
    let target = monitor
        .scheduler()
        .period(ActivityClass::Foreground)
        .target_rate();
    assert!((rate - target * 1024.0).abs() < 1e-6);

    // Dropping to the target rate for one tick releases the leash.
    let now = 1_000.0 + (leashed_at + 1) as f64;
    monitor.tick(now, &batches.next(&[(1005, 0.5)]));
    assert!(!monitor.controller().is_leashed(ActorId(1005)));
    assert_eq!(enforcer.commands().last(), Some(&(ActorId(1005), None)));
}

#[test]
fn w_left_decreases_by_observed_deltas_only() {
    let mut config = scenario_config();
    config.whitelist = vec![0];
    let probe = SharedProbe::new(None);
    let mut monitor = Monitor::new(
        &config,
        &ActorStore::default(),
        probe,
        SharedEnforcer::default(),
        MemorySink::default(),
    );

    let mut batches = BatchBuilder::new();
    let w_before = monitor.ledger().w_left();
    // Actor 0 is whitelisted; its writes never touch the budget.
    monitor.tick(1_000.0, &batches.next(&[(1005, 3.0), (0, 50.0)]));
    monitor.tick(1_001.0, &batches.next(&[(1005, 4.5), (0, 50.0)]));
    assert!((monitor.ledger().w_left() - (w_before - 7.5)).abs() < 1e-9);
}

#[test]
fn service_table_actor_counts_as_foreground() {
    let mut config = scenario_config();
    config.service_table = vec![wearquota_core::config::ServiceRoute {
        owner: 10040,
        services: vec![1013],
    }];
    let probe = SharedProbe::new(Some(10040));
    let mut monitor = Monitor::new(
        &config,
        &ActorStore::default(),
        probe,
        SharedEnforcer::default(),
        MemorySink::default(),
    );

    let mut batches = BatchBuilder::new();
    // 1013 is not the foreground actor, but serves it.
    let summary = monitor.tick(1_000.0, &batches.next(&[(1013, 2.0), (2000, 1.0)]));
    assert!((summary.total_rate_fg - 2.0).abs() < 1e-9);
    assert!((summary.total_rate_bg - 1.0).abs() < 1e-9);
    assert_eq!(summary.active_class, ActivityClass::Foreground);
}

#[test]
fn idle_ticks_accrue_background_slack() {
    let config = scenario_config();
    let probe = SharedProbe::new(None);
    let mut monitor = Monitor::new(
        &config,
        &ActorStore::default(),
        probe,
        SharedEnforcer::default(),
        MemorySink::default(),
    );

    let mut batches = BatchBuilder::new();
    let first = monitor.tick(1_000.0, &batches.next(&[]));
    assert_eq!(first.active_class, ActivityClass::Background);
    let bg_slack_after_rollover = monitor
        .scheduler()
        .period(ActivityClass::Background)
        .slack_period();

    monitor.tick(1_001.0, &batches.next(&[]));
    let bg = monitor.scheduler().period(ActivityClass::Background);
    // A fully idle tick credits the whole target rate to the period.
    assert!(bg.slack_period() > bg_slack_after_rollover);
}

#[test]
fn class_debts_reset_at_their_rollover() {
    let config = scenario_config();
    let probe = SharedProbe::new(Some(1005));
    let mut monitor = Monitor::new(
        &config,
        &ActorStore::default(),
        probe.clone(),
        SharedEnforcer::default(),
        MemorySink::default(),
    );

    let mut batches = BatchBuilder::new();
    // Overshoot in both classes: 1005 foreground, 2000 background.
    for tick in 1..=5u64 {
        let now = 1_000.0 + tick as f64;
        monitor.tick(now, &batches.next(&[(1005, 2.0), (2000, 2.0)]));
    }
    assert!(monitor.actors().debt(ActorId(1005), ActivityClass::Foreground) > 0.0);
    assert!(monitor.actors().debt(ActorId(2000), ActivityClass::Background) > 0.0);

    // Jump past the next background boundary; its debt map clears while
    // the foreground debt survives.
    let summary = monitor.tick(1_011.0, &batches.next(&[]));
    assert!(summary.rolled.background);
    assert!(!summary.rolled.foreground);
    assert_eq!(
        monitor.actors().debt(ActorId(2000), ActivityClass::Background),
        0.0
    );
    assert!(monitor.actors().debt(ActorId(1005), ActivityClass::Foreground) > 0.0);

    // And the foreground boundary clears the rest.
    let summary = monitor.tick(1_101.0, &batches.next(&[]));
    assert!(summary.rolled.foreground);
    assert_eq!(
        monitor.actors().debt(ActorId(1005), ActivityClass::Foreground),
        0.0
    );
}

#[test]
fn repeated_over_threshold_ticks_keep_a_single_leash_entry() {
    let config = scenario_config();
    let probe = SharedProbe::new(Some(1005));
    let enforcer = SharedEnforcer::default();
    let mut monitor = Monitor::new(
        &config,
        &ActorStore::default(),
        probe,
        enforcer.clone(),
        MemorySink::default(),
    );

    let mut batches = BatchBuilder::new();
    let mut first_leash_tick = None;
    for tick in 1..=40u64 {
        let now = 1_000.0 + tick as f64;
        monitor.tick(now, &batches.next(&[(1005, 4.0)]));
        if first_leash_tick.is_none() && monitor.controller().is_leashed(ActorId(1005)) {
            first_leash_tick = Some(tick);
        }
    }
    let first_leash_tick = first_leash_tick.expect("actor should be leashed");

    // Still one membership entry after many over-threshold ticks, with
    // the onset recorded once.
    assert_eq!(monitor.controller().leashed().len(), 1);
    assert_eq!(
        monitor.controller().first_leash_ticks().get(&ActorId(1005)),
        Some(&first_leash_tick)
    );
    // Every over-threshold tick reissued the install command.
    let installs = enforcer
        .commands()
        .iter()
        .filter(|(_, rate)| rate.is_some())
        .count();
    assert!(installs > 1);
}

#[test]
fn foreground_switch_reclassifies_actors() {
    let config = scenario_config();
    let probe = SharedProbe::new(Some(1005));
    let mut monitor = Monitor::new(
        &config,
        &ActorStore::default(),
        probe.clone(),
        SharedEnforcer::default(),
        MemorySink::default(),
    );

    let mut batches = BatchBuilder::new();
    let summary = monitor.tick(1_000.0, &batches.next(&[(1005, 1.0)]));
    assert!((summary.total_rate_fg - 1.0).abs() < 1e-9);

    probe.set(None);
    let summary = monitor.tick(1_001.0, &batches.next(&[(1005, 1.0)]));
    assert!((summary.total_rate_bg - 1.0).abs() < 1e-9);
    assert_eq!(summary.active_class, ActivityClass::Background);
}

#[test]
fn finish_merges_store_and_flushes_sink_exactly_once() {
    let config = scenario_config();
    let mut store = ActorStore::default();
    store.insert(
        ActorId(1005),
        StoredActor {
            birthday: 42,
            cumulative_kib: 100.0,
            name: Some("AUDIO".to_string()),
        },
    );

    let probe = SharedProbe::new(Some(1005));
    let mut monitor = Monitor::new(
        &config,
        &store,
        probe,
        SharedEnforcer::default(),
        MemorySink::default(),
    );

    let mut batches = BatchBuilder::new();
    monitor.tick(1_000.0, &batches.next(&[(1005, 2.0)]));
    monitor.tick(1_001.0, &batches.next(&[(1005, 3.0)]));

    let snapshot = monitor.finish().expect("finish should flush");
    let merged = &snapshot.entries()[&ActorId(1005)];
    // Carryover plus this run's counter, original birthday and name kept.
    assert!((merged.cumulative_kib - 105.0).abs() < 1e-9);
    assert_eq!(merged.birthday, 42);
    assert_eq!(merged.name.as_deref(), Some("AUDIO"));
}

#[test]
fn load_then_finish_without_ticks_reproduces_the_store() {
    let config = scenario_config();
    let mut store = ActorStore::default();
    store.insert(
        ActorId(1005),
        StoredActor {
            birthday: 42,
            cumulative_kib: 100.0,
            name: None,
        },
    );
    store.insert(
        ActorId(10040),
        StoredActor {
            birthday: 77,
            cumulative_kib: 3.5,
            name: Some("mail".to_string()),
        },
    );

    let monitor = Monitor::new(
        &config,
        &store,
        SharedProbe::new(None),
        SharedEnforcer::default(),
        MemorySink::default(),
    );
    let snapshot = monitor.finish().expect("finish should flush");
    assert_eq!(snapshot, store);
}

#[test]
fn preloaded_population_divides_the_leash_rate() {
    let config = scenario_config();
    let mut store = ActorStore::default();
    for id in [1u32, 2, 3] {
        store.insert(
            ActorId(id),
            StoredActor {
                birthday: 1,
                cumulative_kib: 0.0,
                name: None,
            },
        );
    }

    let probe = SharedProbe::new(Some(1005));
    let enforcer = SharedEnforcer::default();
    let mut monitor = Monitor::new(
        &config,
        &store,
        probe,
        enforcer.clone(),
        MemorySink::default(),
    );

    let mut batches = BatchBuilder::new();
    for tick in 1..=60u64 {
        let now = 1_000.0 + tick as f64;
        monitor.tick(now, &batches.next(&[(1005, 4.0)]));
        if monitor.controller().is_leashed(ActorId(1005)) {
            break;
        }
    }
    assert!(monitor.controller().is_leashed(ActorId(1005)));

    // Three preloaded actors plus the writer: the divisor is four.
    let target = monitor
        .scheduler()
        .period(ActivityClass::Foreground)
        .target_rate();
    let rate = enforcer.commands()[0].1.unwrap();
    assert!((rate - target / 4.0 * 1024.0).abs() < 1e-6);
}

/// Sink handle the test can inspect while the monitor owns a clone.
#[derive(Clone, Default)]
struct SharedSink(Rc<RefCell<MemorySink>>);

impl wearquota_core::telemetry::TelemetrySink for SharedSink {
    fn record(
        &mut self,
        series: &wearquota_core::telemetry::TickSeries,
    ) -> Result<(), wearquota_core::telemetry::TelemetryError> {
        self.0.borrow_mut().record(series)
    }

    fn finish(&mut self) -> Result<(), wearquota_core::telemetry::TelemetryError> {
        self.0.borrow_mut().finish()
    }
}

#[test]
fn telemetry_reports_every_sampled_actor() {
    let config = scenario_config();
    let probe = SharedProbe::new(Some(1005));
    let sink = SharedSink::default();
    let mut monitor = Monitor::new(
        &config,
        &ActorStore::default(),
        probe,
        SharedEnforcer::default(),
        sink.clone(),
    );

    let mut batches = BatchBuilder::new();
    let mut batch = batches.next(&[(1005, 2.0), (2000, 1.0)]);
    batch.device_total_kib = Some(3.0);
    monitor.tick(1_000.0, &batch);
    monitor.finish().expect("finish should flush");

    let inner = sink.0.borrow();
    assert!(inner.finished);
    assert_eq!(inner.ticks.len(), 1);
    let row = &inner.ticks[0];
    assert_eq!(row.tick, 1);
    assert_eq!(row.actors.len(), 2);
    assert_eq!(row.device_total_kib, Some(3.0));
    assert!((row.total_rate - 3.0).abs() < 1e-9);
    // Slack and threshold series reflect the freshly rolled periods.
    assert!(row.ratelimit_threshold_fg_kib > 0.0);
    assert!(row.slack_period_bg_kib > 0.0);
}
