//! Per-tick telemetry series.
//!
//! Every tick emits the full set of computed fields to an external sink
//! for later rendering or export. The core only ever writes this data;
//! nothing is read back.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::actor::ActorId;

/// Errors surfaced by telemetry sinks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TelemetryError {
    /// Writing to the sink failed.
    #[error("failed to write telemetry: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing a series row failed.
    #[error("failed to serialize telemetry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One actor's series values for one tick.
#[derive(Debug, Clone, Serialize)]
pub struct ActorSeries {
    /// The actor.
    pub actor: ActorId,
    /// Instantaneous write rate, KiB/s.
    pub rate_kib_s: f64,
    /// Cumulative KiB written this boot.
    pub cumulative_kib: f64,
    /// Foreground slack debt, KiB.
    pub debt_fg_kib: f64,
    /// Background slack debt, KiB.
    pub debt_bg_kib: f64,
    /// Whether the actor is currently leashed.
    pub leashed: bool,
}

/// The full computed field set for one tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickSeries {
    /// Tick index, starting at 1.
    pub tick: u64,
    /// Wall-clock seconds of the tick.
    pub timestamp: f64,
    /// Aggregate write rate across both classes, KiB/s.
    pub total_rate: f64,
    /// Aggregate foreground write rate, KiB/s.
    pub total_rate_fg: f64,
    /// Aggregate background write rate, KiB/s.
    pub total_rate_bg: f64,
    /// Device-wide cumulative total from the sample sentinel, KiB.
    pub device_total_kib: Option<f64>,
    /// Remaining lifetime write budget, KiB.
    pub w_left_kib: f64,
    /// Lifetime slack pool, KiB.
    pub slack_left_kib: f64,
    /// Foreground period slack, KiB.
    pub slack_period_fg_kib: f64,
    /// Background period slack, KiB.
    pub slack_period_bg_kib: f64,
    /// Foreground ratelimit threshold, KiB.
    pub ratelimit_threshold_fg_kib: f64,
    /// Background ratelimit threshold, KiB.
    pub ratelimit_threshold_bg_kib: f64,
    /// Foreground target rate, KiB/s.
    pub target_rate_fg: f64,
    /// Background target rate, KiB/s.
    pub target_rate_bg: f64,
    /// Per-actor series for every actor sampled this tick.
    pub actors: Vec<ActorSeries>,
    /// First tick at which each ever-leashed actor was leashed.
    pub leash_onset_ticks: BTreeMap<ActorId, u64>,
}

/// Receives the computed series, one call per tick, plus a final flush.
pub trait TelemetrySink {
    /// Records one tick's series values.
    ///
    /// # Errors
    ///
    /// Returns an error if the row could not be written. Failures are
    /// tick-local; the control loop logs and keeps going.
    fn record(&mut self, series: &TickSeries) -> Result<(), TelemetryError>;

    /// Flushes the sink at shutdown. Called exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush failed.
    fn finish(&mut self) -> Result<(), TelemetryError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&mut self, _series: &TickSeries) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Buffers every recorded tick in memory. Intended for tests and
/// single-shot inspection.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    /// Recorded ticks, in order.
    pub ticks: Vec<TickSeries>,
    /// Whether `finish` has run.
    pub finished: bool,
}

impl TelemetrySink for MemorySink {
    fn record(&mut self, series: &TickSeries) -> Result<(), TelemetryError> {
        self.ticks.push(series.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TelemetryError> {
        self.finished = true;
        Ok(())
    }
}
