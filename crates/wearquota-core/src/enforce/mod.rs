//! Leash decisions and the enforcement seam.
//!
//! The controller decides which actors are throttled and at what rate;
//! the injected [`Enforcer`] carries the decision to whatever mechanism
//! actually limits I/O (a cgroup script, a kernel control file). The
//! controller's leash set is the source of truth: enforcer failures are
//! logged and the decision stands, to be reissued on the next tick the
//! actor stays over threshold.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::actor::ActorId;
use crate::period::ActivityClass;

/// Debt fraction of the ratelimit threshold at which an actor is leashed.
/// A deliberate near-threshold trip point, not an off-by-one.
pub const LEASH_TRIP_FACTOR: f64 = 0.99;

/// Errors surfaced by enforcement backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnforceError {
    /// The limiter command could not be run or reported failure.
    #[error("enforcer command '{command}' failed for actor {actor}: {reason}")]
    Command {
        /// The command that was invoked.
        command: String,
        /// The actor being limited.
        actor: ActorId,
        /// Why it failed.
        reason: String,
    },

    /// Writing the kernel control file failed.
    #[error("failed to write ratelimit control file '{path}': {source}")]
    ControlWrite {
        /// The control file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Mechanism that physically installs and removes per-actor rate limits.
///
/// Fire-and-forget from the controller's perspective: a failed command is
/// not retried until the next tick re-evaluates the same decision.
pub trait Enforcer {
    /// Installs or updates a throttle for an actor. The rate is already
    /// scaled to the enforcer's native unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit could not be applied.
    fn install(&mut self, actor: ActorId, rate: f64) -> Result<(), EnforceError>;

    /// Removes an actor's throttle.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit could not be removed.
    fn remove(&mut self, actor: ActorId) -> Result<(), EnforceError>;
}

/// Hysteresis-based leash/unleash state per actor.
///
/// Leashing trips when an actor's class debt reaches
/// [`LEASH_TRIP_FACTOR`] of the period's ratelimit threshold. Unleashing
/// is driven by relief of aggregate pressure, not by the actor's debt
/// decaying (debt only resets at rollover). Both transitions are
/// idempotent: re-leashing updates the rate without duplicate
/// registration or a new first-leash record, unleashing a non-member is
/// a logged no-op.
#[derive(Debug, Clone, Default)]
pub struct EnforcementController {
    rate_scale: f64,
    leashed: BTreeMap<ActorId, f64>,
    first_leash_tick: BTreeMap<ActorId, u64>,
}

impl EnforcementController {
    /// Creates a controller with an empty leash set.
    ///
    /// `rate_scale` converts the class target rate (KiB/s) into the
    /// enforcer's native unit.
    #[must_use]
    pub fn new(rate_scale: f64) -> Self {
        Self {
            rate_scale,
            leashed: BTreeMap::new(),
            first_leash_tick: BTreeMap::new(),
        }
    }

    /// Whether an actor's debt has crossed the trip point.
    #[must_use]
    pub fn over_threshold(debt: f64, ratelimit_threshold: f64) -> bool {
        debt >= LEASH_TRIP_FACTOR * ratelimit_threshold
    }

    /// Whether an actor is currently leashed.
    #[must_use]
    pub fn is_leashed(&self, actor: ActorId) -> bool {
        self.leashed.contains_key(&actor)
    }

    /// Leashes an actor at its fair share of the class target rate.
    ///
    /// The assigned rate divides the class target across every distinct
    /// actor ever seen. Already-leashed actors get their rate updated and
    /// the command reissued; the first-leash tick is recorded only once.
    pub fn leash<E: Enforcer>(
        &mut self,
        enforcer: &mut E,
        actor: ActorId,
        class: ActivityClass,
        class_target_rate: f64,
        distinct_actors: usize,
        tick: u64,
    ) {
        let rate = class_target_rate / distinct_actors.max(1) as f64 * self.rate_scale;
        if let Some(previous) = self.leashed.insert(actor, rate) {
            info!(%actor, %class, previous_rate = previous, rate, "updating leash rate");
        } else {
            self.first_leash_tick.entry(actor).or_insert(tick);
            info!(%actor, %class, rate, tick, "leashing actor");
        }
        if let Err(err) = enforcer.install(actor, rate) {
            // The leash set stays authoritative; the next over-threshold
            // tick reissues the command.
            warn!(%actor, "enforcer install failed: {err}");
        }
    }

    /// Unleashes an actor. A no-op (logged, not an error) if the actor is
    /// not leashed.
    pub fn unleash<E: Enforcer>(&mut self, enforcer: &mut E, actor: ActorId) {
        if self.leashed.remove(&actor).is_none() {
            info!(%actor, "ignoring unleash of non-leashed actor");
            return;
        }
        info!(%actor, "unleashing actor");
        if let Err(err) = enforcer.remove(actor) {
            warn!(%actor, "enforcer release failed: {err}");
        }
    }

    /// The current leash set with assigned rates.
    #[must_use]
    pub const fn leashed(&self) -> &BTreeMap<ActorId, f64> {
        &self.leashed
    }

    /// First tick at which each actor was ever leashed, for telemetry.
    #[must_use]
    pub const fn first_leash_ticks(&self) -> &BTreeMap<ActorId, u64> {
        &self.first_leash_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct RecordingEnforcer {
        commands: Vec<(ActorId, Option<f64>)>,
        fail: bool,
    }

    impl Enforcer for RecordingEnforcer {
        fn install(&mut self, actor: ActorId, rate: f64) -> Result<(), EnforceError> {
            self.commands.push((actor, Some(rate)));
            if self.fail {
                return Err(EnforceError::Command {
                    command: "fake".to_string(),
                    actor,
                    reason: "injected".to_string(),
                });
            }
            Ok(())
        }

        fn remove(&mut self, actor: ActorId) -> Result<(), EnforceError> {
            self.commands.push((actor, None));
            Ok(())
        }
    }

    #[test]
    fn trip_point_sits_just_under_the_threshold() {
        assert!(!EnforcementController::over_threshold(24.0, 25.0));
        assert!(EnforcementController::over_threshold(24.75, 25.0));
        assert!(EnforcementController::over_threshold(25.0, 25.0));
    }

    #[test]
    fn leash_installs_fair_share_rate() {
        let mut controller = EnforcementController::new(1024.0);
        let mut enforcer = RecordingEnforcer::default();
        controller.leash(
            &mut enforcer,
            ActorId(1005),
            ActivityClass::Foreground,
            10.0,
            5,
            3,
        );

        assert!(controller.is_leashed(ActorId(1005)));
        assert_eq!(controller.first_leash_ticks().get(&ActorId(1005)), Some(&3));
        let (actor, rate) = (enforcer.commands[0].0, enforcer.commands[0].1.unwrap());
        assert_eq!(actor, ActorId(1005));
        assert!((rate - 2048.0).abs() < f64::EPSILON);
    }

    #[test]
    fn releash_updates_rate_without_new_onset_record() {
        let mut controller = EnforcementController::new(1.0);
        let mut enforcer = RecordingEnforcer::default();
        controller.leash(
            &mut enforcer,
            ActorId(7),
            ActivityClass::Background,
            8.0,
            2,
            1,
        );
        controller.leash(
            &mut enforcer,
            ActorId(7),
            ActivityClass::Background,
            6.0,
            2,
            9,
        );

        // Single membership, updated rate, original onset tick.
        assert_eq!(controller.leashed().len(), 1);
        assert!((controller.leashed()[&ActorId(7)] - 3.0).abs() < f64::EPSILON);
        assert_eq!(controller.first_leash_ticks().get(&ActorId(7)), Some(&1));
        // The command was reissued both times.
        assert_eq!(enforcer.commands.len(), 2);
    }

    #[test]
    fn unleash_of_non_member_is_a_no_op() {
        let mut controller = EnforcementController::new(1.0);
        let mut enforcer = RecordingEnforcer::default();
        controller.unleash(&mut enforcer, ActorId(42));
        assert!(enforcer.commands.is_empty());
        assert!(!controller.is_leashed(ActorId(42)));
    }

    #[test]
    fn enforcer_failure_does_not_roll_back_the_decision() {
        let mut controller = EnforcementController::new(1.0);
        let mut enforcer = RecordingEnforcer {
            fail: true,
            ..RecordingEnforcer::default()
        };
        controller.leash(
            &mut enforcer,
            ActorId(1),
            ActivityClass::Foreground,
            4.0,
            1,
            1,
        );
        assert!(controller.is_leashed(ActorId(1)));
    }

    #[test]
    fn unleash_removes_and_commands_release() {
        let mut controller = EnforcementController::new(1.0);
        let mut enforcer = RecordingEnforcer::default();
        controller.leash(
            &mut enforcer,
            ActorId(1),
            ActivityClass::Foreground,
            4.0,
            1,
            1,
        );
        controller.unleash(&mut enforcer, ActorId(1));
        assert!(!controller.is_leashed(ActorId(1)));
        assert_eq!(enforcer.commands.last(), Some(&(ActorId(1), None)));
    }

    #[test]
    fn zero_population_does_not_divide_by_zero() {
        let mut controller = EnforcementController::new(1.0);
        let mut enforcer = RecordingEnforcer::default();
        controller.leash(
            &mut enforcer,
            ActorId(1),
            ActivityClass::Foreground,
            4.0,
            0,
            1,
        );
        let rate = enforcer.commands[0].1.unwrap();
        assert!(rate.is_finite());
    }
}
