//! wearquota-core - write-endurance quota ledger and admission control.
//!
//! This crate implements the budget algorithm behind `wearquotad`: a
//! hierarchical ledger that apportions a device's lifetime write allowance
//! into recurring foreground and background quota periods, tracks per-actor
//! overshoot against each period's target rate, banks unused allowance as
//! slack, and decides when individual actors should be throttled.
//!
//! # Architecture
//!
//! ```text
//! SampleSource ──▶ Monitor::tick ──▶ PeriodScheduler (rollover, slack)
//!                      │                    │
//!                      │                    ▼
//!                      ├──▶ ForegroundTracker (classify fg/bg)
//!                      ├──▶ ActorLedger (rates, slack debt)
//!                      ├──▶ EnforcementController ──▶ Enforcer
//!                      └──▶ TelemetrySink
//! ```
//!
//! The crate is a pure library: all I/O seams (`SampleSource`,
//! `ForegroundProbe`, `Enforcer`, `TelemetrySink`) are traits injected at
//! construction, so the control algorithm is testable with fakes. The real
//! adapters live in the `wearquota-daemon` crate.
//!
//! # Key Concepts
//!
//! - **Lifetime ledger**: remaining write budget (`w_left`) and the banked
//!   slack pool shared by all future periods.
//! - **Quota period**: a recurring window per activity class. Background
//!   periods are strictly nested inside foreground periods.
//! - **Slack debt**: an actor's accumulated share of aggregate overshoot,
//!   attributed proportionally to its contribution.
//! - **Leash**: the throttled state of an actor, entered near the period's
//!   ratelimit threshold and exited when aggregate pressure subsides.

pub mod actor;
pub mod config;
pub mod enforce;
pub mod foreground;
pub mod ledger;
pub mod monitor;
pub mod period;
pub mod sample;
pub mod store;
pub mod telemetry;

pub use actor::{ActorId, ActorLedger};
pub use config::{ConfigError, MonitorConfig};
pub use enforce::{EnforceError, Enforcer, EnforcementController};
pub use foreground::{ForegroundProbe, ForegroundTracker, ProbeError};
pub use ledger::LifetimeLedger;
pub use monitor::{Monitor, TickSummary};
pub use period::{ActivityClass, PeriodScheduler};
pub use sample::{SampleBatch, SampleError, SampleRecord, SampleSource};
pub use store::{ActorStore, StoreError, StoredActor};
pub use telemetry::{TelemetryError, TelemetrySink, TickSeries};
