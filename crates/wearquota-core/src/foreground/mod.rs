//! Foreground actor tracking and activity classification.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, warn};

use crate::actor::ActorId;
use crate::period::ActivityClass;

/// Errors produced by foreground probes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProbeError {
    /// The probe command could not be run.
    #[error("foreground probe '{command}' failed: {reason}")]
    Command {
        /// The command that was invoked.
        command: String,
        /// Why it failed.
        reason: String,
    },

    /// The probe produced unparseable output.
    #[error("foreground probe output '{output}' is not an actor id")]
    Parse {
        /// The output that did not parse.
        output: String,
    },
}

/// Reports the currently foregrounded actor.
pub trait ForegroundProbe {
    /// Returns the current foreground actor, or `None` when nothing is
    /// foregrounded.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe cannot be queried; the tracker keeps
    /// its last known answer in that case.
    fn current_foreground(&mut self) -> Result<Option<ActorId>, ProbeError>;
}

/// Debounced foreground state with service-table classification.
///
/// The probe is an external process invocation, so it is only re-queried
/// once every `refresh_delay_ticks` ticks; in between, the last known
/// foreground actor is reused. The service table maps a foregroundable
/// actor to auxiliary actors (e.g. a media service) that count as
/// foreground whenever their owner is.
#[derive(Debug, Clone)]
pub struct ForegroundTracker {
    refresh_delay_ticks: u32,
    ticks_until_refresh: u32,
    current: Option<ActorId>,
    service_table: BTreeMap<ActorId, BTreeSet<ActorId>>,
}

impl ForegroundTracker {
    /// Creates a tracker with no known foreground actor.
    #[must_use]
    pub fn new(
        refresh_delay_ticks: u32,
        service_table: BTreeMap<ActorId, BTreeSet<ActorId>>,
    ) -> Self {
        Self {
            refresh_delay_ticks,
            ticks_until_refresh: 0,
            current: None,
            service_table,
        }
    }

    /// Per-tick update: queries the probe when the debounce counter has
    /// elapsed, otherwise reuses the last known foreground actor.
    pub fn refresh<P: ForegroundProbe>(&mut self, probe: &mut P) {
        if self.ticks_until_refresh > 0 {
            self.ticks_until_refresh -= 1;
            return;
        }
        match probe.current_foreground() {
            Ok(foreground) => {
                if foreground != self.current {
                    debug!(?foreground, previous = ?self.current, "foreground actor changed");
                }
                self.current = foreground;
            },
            Err(err) => {
                warn!(last_known = ?self.current, "foreground probe failed, keeping last known: {err}");
            },
        }
        self.ticks_until_refresh = self.refresh_delay_ticks;
    }

    /// The last known foreground actor.
    #[must_use]
    pub const fn current(&self) -> Option<ActorId> {
        self.current
    }

    /// Classifies an actor for this tick: foreground iff it is the current
    /// foreground actor or one of its service-table auxiliaries.
    #[must_use]
    pub fn classify(&self, actor: ActorId) -> ActivityClass {
        match self.current {
            Some(foreground)
                if actor == foreground || self.is_service_of(foreground, actor) =>
            {
                ActivityClass::Foreground
            },
            _ => ActivityClass::Background,
        }
    }

    fn is_service_of(&self, owner: ActorId, actor: ActorId) -> bool {
        self.service_table
            .get(&owner)
            .is_some_and(|services| services.contains(&actor))
    }
}
