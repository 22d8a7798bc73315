//! Configuration parsing and validation.
//!
//! This module handles parsing of the monitor policy file (TOML) that fixes
//! every parameter before the control loop starts: the device write budget,
//! quota period lengths, enforcement thresholds, sampling cadence, the
//! foreground service table, and the adapter backends the daemon should
//! wire up.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actor::ActorId;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration contents.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize the configuration.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration is semantically invalid.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Device write budget parameters.
    pub device: DeviceBudget,

    /// Quota period lengths and enforcement threshold fractions.
    #[serde(default)]
    pub periods: PeriodPolicy,

    /// Sampling cadence and foreground probe debounce.
    #[serde(default)]
    pub sampling: SamplingPolicy,

    /// Enforcement backend selection and rate scaling.
    #[serde(default)]
    pub enforcement: EnforcementPolicy,

    /// Sample source backend.
    #[serde(default)]
    pub source: SourcePolicy,

    /// Foreground probe backend.
    #[serde(default)]
    pub probe: ProbePolicy,

    /// Actor stats persistence.
    #[serde(default)]
    pub store: StorePolicy,

    /// Actor IDs exempt from accounting and enforcement.
    #[serde(default)]
    pub whitelist: Vec<u32>,

    /// Auxiliary actors treated as foreground when their owner is
    /// foregrounded (e.g. a media service writing on behalf of an app).
    #[serde(default)]
    pub service_table: Vec<ServiceRoute>,
}

/// Device write budget parameters.
///
/// The baseline rate `B = w_max_kib / life_secs` is the average write rate
/// the device can sustain for its target lifetime; the initial slack pool
/// is `w_max_kib * slack_rate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceBudget {
    /// Estimated lifetime write endurance, in KiB.
    pub w_max_kib: u64,

    /// Target device lifetime, in seconds.
    pub life_secs: u64,

    /// Fraction of the lifetime budget banked as slack up front.
    #[serde(default = "default_slack_rate")]
    pub slack_rate: f64,
}

impl DeviceBudget {
    /// Baseline sustainable write rate, in KiB/s.
    #[must_use]
    pub fn baseline_rate(&self) -> f64 {
        self.w_max_kib as f64 / self.life_secs as f64
    }

    /// Initial lifetime slack pool, in KiB.
    #[must_use]
    pub fn initial_slack(&self) -> f64 {
        self.w_max_kib as f64 * self.slack_rate
    }
}

/// Quota period lengths and ratelimit threshold fractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodPolicy {
    /// Foreground quota period length, in seconds.
    #[serde(default = "default_period_fg")]
    pub foreground_secs: u64,

    /// Background quota period length, in seconds. Must not exceed the
    /// foreground period; background periods are nested inside it.
    #[serde(default = "default_period_bg")]
    pub background_secs: u64,

    /// Fraction of the foreground period slack that arms the foreground
    /// ratelimit threshold at rollover.
    #[serde(default = "default_threshold_rate")]
    pub ratelimit_threshold_rate_fg: f64,

    /// Fraction of the background period slack that arms the background
    /// ratelimit threshold at rollover.
    #[serde(default = "default_threshold_rate")]
    pub ratelimit_threshold_rate_bg: f64,
}

impl Default for PeriodPolicy {
    fn default() -> Self {
        Self {
            foreground_secs: default_period_fg(),
            background_secs: default_period_bg(),
            ratelimit_threshold_rate_fg: default_threshold_rate(),
            ratelimit_threshold_rate_bg: default_threshold_rate(),
        }
    }
}

/// Sampling cadence and foreground probe debounce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingPolicy {
    /// Polling interval between ticks, in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Ticks to wait between foreground probe queries. The last known
    /// foreground actor is reused while the counter drains.
    #[serde(default = "default_fg_refresh_delay")]
    pub foreground_refresh_delay_ticks: u32,

    /// Stop the daemon after this many seconds of monitoring.
    /// Zero means run until signalled.
    #[serde(default)]
    pub run_secs: u64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            foreground_refresh_delay_ticks: default_fg_refresh_delay(),
            run_secs: 0,
        }
    }
}

/// Enforcement backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcerKind {
    /// Log leash decisions without acting on them.
    None,
    /// Invoke an external limiter script with `<uid> <rate>` arguments.
    Script,
    /// Write `<uid> <rate>` into a kernel control file.
    Procfile,
}

/// Enforcement backend configuration and rate scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementPolicy {
    /// Which enforcement mechanism the daemon should drive.
    #[serde(default = "default_enforcer_kind")]
    pub backend: EnforcerKind,

    /// Limiter script path, required for the `script` backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,

    /// Kernel control file path, required for the `procfile` backend.
    #[serde(default = "default_ratelimit_proc_path")]
    pub proc_path: PathBuf,

    /// Multiplier applied to the per-actor leash rate before it is handed
    /// to the enforcer, converting KiB/s into the enforcer's native unit.
    #[serde(default = "default_rate_scale")]
    pub rate_scale: f64,
}

impl Default for EnforcementPolicy {
    fn default() -> Self {
        Self {
            backend: default_enforcer_kind(),
            script: None,
            proc_path: default_ratelimit_proc_path(),
            rate_scale: default_rate_scale(),
        }
    }
}

/// Sample source backend configuration.
///
/// Exactly one of `file` or `command` must be set: either the daemon
/// re-reads a local per-actor write-stats file each tick, or it invokes an
/// external command and parses its stdout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcePolicy {
    /// Local stats file to re-read each tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// External command producing the stats snapshot on stdout.
    #[serde(default)]
    pub command: Vec<String>,
}

/// Foreground probe backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbePolicy {
    /// External command printing the current foreground actor ID.
    /// Empty means no probe; every actor is classified as background.
    #[serde(default)]
    pub command: Vec<String>,
}

/// Actor stats persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorePolicy {
    /// Path of the persisted actor stats store.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Whether to flush the store at shutdown.
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            persist: true,
        }
    }
}

/// One service table entry: auxiliary actors that follow their owner into
/// the foreground class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRoute {
    /// The foregroundable owner actor.
    pub owner: u32,

    /// Actors treated as foreground whenever the owner is foregrounded.
    pub services: Vec<u32>,
}

impl MonitorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The whitelist as a typed set.
    #[must_use]
    pub fn whitelist_set(&self) -> BTreeSet<ActorId> {
        self.whitelist.iter().copied().map(ActorId).collect()
    }

    /// The service table as a typed owner-to-services map.
    #[must_use]
    pub fn service_map(&self) -> BTreeMap<ActorId, BTreeSet<ActorId>> {
        self.service_table
            .iter()
            .map(|route| {
                (
                    ActorId(route.owner),
                    route.services.iter().copied().map(ActorId).collect(),
                )
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.device.w_max_kib == 0 {
            return Err(ConfigError::Validation(
                "device.w_max_kib must be positive".to_string(),
            ));
        }
        if self.device.life_secs == 0 {
            return Err(ConfigError::Validation(
                "device.life_secs must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.device.slack_rate) {
            return Err(ConfigError::Validation(format!(
                "device.slack_rate must be within [0, 1], got {}",
                self.device.slack_rate
            )));
        }
        if self.periods.foreground_secs == 0 || self.periods.background_secs == 0 {
            return Err(ConfigError::Validation(
                "quota period lengths must be positive".to_string(),
            ));
        }
        if self.periods.background_secs > self.periods.foreground_secs {
            return Err(ConfigError::Validation(format!(
                "background period ({} s) must not exceed the foreground period ({} s)",
                self.periods.background_secs, self.periods.foreground_secs
            )));
        }
        if self.periods.ratelimit_threshold_rate_fg < 0.0
            || self.periods.ratelimit_threshold_rate_bg < 0.0
        {
            return Err(ConfigError::Validation(
                "ratelimit threshold rates must be non-negative".to_string(),
            ));
        }
        if self.sampling.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sampling.interval_secs must be positive".to_string(),
            ));
        }
        if self.source.file.is_some() && !self.source.command.is_empty() {
            return Err(ConfigError::Validation(
                "source.file and source.command are mutually exclusive".to_string(),
            ));
        }
        if self.enforcement.backend == EnforcerKind::Script && self.enforcement.script.is_none() {
            return Err(ConfigError::Validation(
                "enforcement.script is required for the script backend".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_slack_rate() -> f64 {
    0.5
}

fn default_period_fg() -> u64 {
    24 * 3600
}

fn default_period_bg() -> u64 {
    3600
}

fn default_threshold_rate() -> f64 {
    0.5
}

fn default_interval() -> u64 {
    1
}

fn default_fg_refresh_delay() -> u32 {
    5
}

fn default_enforcer_kind() -> EnforcerKind {
    EnforcerKind::None
}

fn default_ratelimit_proc_path() -> PathBuf {
    PathBuf::from("/proc/ratelimit_uid")
}

fn default_rate_scale() -> f64 {
    1024.0
}

fn default_store_path() -> PathBuf {
    PathBuf::from("actor_stats.json")
}

fn default_true() -> bool {
    true
}
