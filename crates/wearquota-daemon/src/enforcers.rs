//! Enforcement backends.
//!
//! The controller's leash decisions are carried out by one of three
//! mechanisms: nothing (log-only dry runs), an external limiter script
//! invoked with `<uid> <rate>` (and `<uid> -1` to release), or a direct
//! write of `<uid> <rate>` into a kernel control file.

use std::path::PathBuf;
use std::process::Command;

use tracing::info;
use wearquota_core::actor::ActorId;
use wearquota_core::config::{EnforcerKind, MonitorConfig};
use wearquota_core::enforce::{EnforceError, Enforcer};

/// Rate value that releases a limit on the script and procfile backends.
const RELEASE_RATE: i64 = -1;

/// Logs decisions without acting on them.
#[derive(Debug, Default)]
pub struct NullEnforcer;

impl Enforcer for NullEnforcer {
    fn install(&mut self, actor: ActorId, rate: f64) -> Result<(), EnforceError> {
        info!(%actor, rate, "dry-run: would install rate limit");
        Ok(())
    }

    fn remove(&mut self, actor: ActorId) -> Result<(), EnforceError> {
        info!(%actor, "dry-run: would remove rate limit");
        Ok(())
    }
}

/// Invokes an external limiter script.
#[derive(Debug)]
pub struct ScriptEnforcer {
    script: PathBuf,
}

impl ScriptEnforcer {
    /// Creates an enforcer driving the given script.
    #[must_use]
    pub const fn new(script: PathBuf) -> Self {
        Self { script }
    }

    fn run(&self, actor: ActorId, rate: i64) -> Result<(), EnforceError> {
        let command = self.script.display().to_string();
        let status = Command::new(&self.script)
            .arg(actor.to_string())
            .arg(rate.to_string())
            .status()
            .map_err(|err| EnforceError::Command {
                command: command.clone(),
                actor,
                reason: err.to_string(),
            })?;
        if !status.success() {
            return Err(EnforceError::Command {
                command,
                actor,
                reason: format!("exited with {status}"),
            });
        }
        Ok(())
    }
}

impl Enforcer for ScriptEnforcer {
    fn install(&mut self, actor: ActorId, rate: f64) -> Result<(), EnforceError> {
        self.run(actor, rate as i64)
    }

    fn remove(&mut self, actor: ActorId) -> Result<(), EnforceError> {
        self.run(actor, RELEASE_RATE)
    }
}

/// Writes `<uid> <rate>` into a kernel control file.
#[derive(Debug)]
pub struct ProcFileEnforcer {
    path: PathBuf,
}

impl ProcFileEnforcer {
    /// Creates an enforcer writing the given control file.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write(&self, actor: ActorId, rate: i64) -> Result<(), EnforceError> {
        std::fs::write(&self.path, format!("{actor} {rate}\n")).map_err(|source| {
            EnforceError::ControlWrite {
                path: self.path.display().to_string(),
                source,
            }
        })
    }
}

impl Enforcer for ProcFileEnforcer {
    fn install(&mut self, actor: ActorId, rate: f64) -> Result<(), EnforceError> {
        self.write(actor, rate as i64)
    }

    fn remove(&mut self, actor: ActorId) -> Result<(), EnforceError> {
        self.write(actor, RELEASE_RATE)
    }
}

/// The configured enforcement backend.
#[derive(Debug)]
pub enum EnforcerBackend {
    /// Log-only dry run.
    Null(NullEnforcer),
    /// External limiter script.
    Script(ScriptEnforcer),
    /// Kernel control file.
    ProcFile(ProcFileEnforcer),
}

impl EnforcerBackend {
    /// Builds the backend selected by the policy.
    ///
    /// The script path is validated by [`MonitorConfig::from_toml`], so a
    /// `script` backend always carries one here.
    #[must_use]
    pub fn from_config(config: &MonitorConfig) -> Self {
        match config.enforcement.backend {
            EnforcerKind::None => Self::Null(NullEnforcer),
            EnforcerKind::Script => {
                let script = config
                    .enforcement
                    .script
                    .clone()
                    .unwrap_or_default();
                Self::Script(ScriptEnforcer::new(script))
            },
            EnforcerKind::Procfile => {
                Self::ProcFile(ProcFileEnforcer::new(config.enforcement.proc_path.clone()))
            },
        }
    }
}

impl Enforcer for EnforcerBackend {
    fn install(&mut self, actor: ActorId, rate: f64) -> Result<(), EnforceError> {
        match self {
            Self::Null(e) => e.install(actor, rate),
            Self::Script(e) => e.install(actor, rate),
            Self::ProcFile(e) => e.install(actor, rate),
        }
    }

    fn remove(&mut self, actor: ActorId) -> Result<(), EnforceError> {
        match self {
            Self::Null(e) => e.remove(actor),
            Self::Script(e) => e.remove(actor),
            Self::ProcFile(e) => e.remove(actor),
        }
    }
}
