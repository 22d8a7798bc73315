//! Per-actor bookkeeping: identity, running totals, and slack debt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::period::ActivityClass;

/// Numeric identity of a writing actor (e.g. a per-UID I/O accounting
/// domain). Actors are externally keyed; the ledger never invents IDs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ActorId(pub u32);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ActorId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// One actor's running state.
#[derive(Debug, Clone, Serialize)]
pub struct ActorRecord {
    /// Unix seconds when the actor was first observed (or the value loaded
    /// from the persisted store).
    pub birthday: u64,
    /// Cumulative KiB written this boot, as last sampled.
    pub cumulative_kib: f64,
    /// Lifetime KiB carried over from the persisted store. Sample counters
    /// reset at boot, so the flushed total is carryover plus cumulative.
    pub carryover_kib: f64,
    /// Human-readable name, if one was ever learned.
    pub name: Option<String>,
    /// Slack debt per activity class, reset at that class's rollover.
    debt: [f64; 2],
}

impl ActorRecord {
    /// Slack debt for one activity class, in KiB.
    #[must_use]
    pub const fn debt(&self, class: ActivityClass) -> f64 {
        self.debt[class.index()]
    }

    /// Lifetime total: persisted carryover plus this boot's counter.
    #[must_use]
    pub fn lifetime_kib(&self) -> f64 {
        self.carryover_kib + self.cumulative_kib
    }
}

/// Ledger of every actor observed since startup (plus actors preloaded
/// from the persisted store). Actors are never removed while the process
/// runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActorLedger {
    actors: BTreeMap<ActorId, ActorRecord>,
}

impl ActorLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an actor loaded from the persisted store. Preloaded
    /// actors count toward the distinct-actor population even before they
    /// write anything this boot.
    pub fn preload(&mut self, id: ActorId, birthday: u64, carryover_kib: f64, name: Option<String>) {
        self.actors.entry(id).or_insert(ActorRecord {
            birthday,
            cumulative_kib: 0.0,
            carryover_kib,
            name,
            debt: [0.0; 2],
        });
    }

    /// Records one sampled counter value for an actor, creating the record
    /// on first sight with `now_secs` as its birthday.
    pub fn observe_sample(&mut self, id: ActorId, cumulative_kib: f64, now_secs: u64) {
        let record = self.actors.entry(id).or_insert(ActorRecord {
            birthday: now_secs,
            cumulative_kib: 0.0,
            carryover_kib: 0.0,
            name: None,
            debt: [0.0; 2],
        });
        record.cumulative_kib = cumulative_kib;
    }

    /// Number of distinct actors ever seen, preloaded actors included.
    /// This is the divisor of the leash-rate formula.
    #[must_use]
    pub fn distinct_actors(&self) -> usize {
        self.actors.len()
    }

    /// Attributes one tick's aggregate overshoot to an actor in proportion
    /// to its contribution and returns the actor's updated debt.
    ///
    /// With aggregate throughput `total` above the class target `target`,
    /// the actor's share is `(total - target) / total * throughput`:
    /// actors that write less accrue less debt even while the class as a
    /// whole is over budget. Callers must only invoke this when
    /// `total > target` and the actor was observed this tick.
    pub fn attribute_overshoot(
        &mut self,
        id: ActorId,
        class: ActivityClass,
        throughput: f64,
        total: f64,
        target: f64,
    ) -> f64 {
        let share = (total - target) / total * throughput;
        let record = self
            .actors
            .get_mut(&id)
            .expect("overshoot attributed to an unobserved actor");
        record.debt[class.index()] += share;
        record.debt[class.index()]
    }

    /// Slack debt of one actor for one class. Zero for unknown actors.
    #[must_use]
    pub fn debt(&self, id: ActorId, class: ActivityClass) -> f64 {
        self.actors.get(&id).map_or(0.0, |r| r.debt(class))
    }

    /// Resets every actor's debt for one class. Called exactly at that
    /// class's period rollover.
    pub fn reset_debts(&mut self, class: ActivityClass) {
        for record in self.actors.values_mut() {
            record.debt[class.index()] = 0.0;
        }
    }

    /// The record for one actor, if it exists.
    #[must_use]
    pub fn record(&self, id: ActorId) -> Option<&ActorRecord> {
        self.actors.get(&id)
    }

    /// Iterates all records in actor-ID order.
    pub fn records(&self) -> impl Iterator<Item = (ActorId, &ActorRecord)> {
        self.actors.iter().map(|(id, record)| (*id, record))
    }
}
