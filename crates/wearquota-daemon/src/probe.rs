//! Foreground probe backend.

use std::process::Command;

use wearquota_core::actor::ActorId;
use wearquota_core::foreground::{ForegroundProbe, ProbeError};

/// Runs an external command and reads the foreground actor ID from its
/// stdout. Empty output or `-1` means no foreground actor.
#[derive(Debug)]
pub struct CommandForegroundProbe {
    argv: Vec<String>,
}

impl CommandForegroundProbe {
    /// Creates a probe running the given argv.
    #[must_use]
    pub const fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn rendered(&self) -> String {
        self.argv.join(" ")
    }
}

impl ForegroundProbe for CommandForegroundProbe {
    fn current_foreground(&mut self) -> Result<Option<ActorId>, ProbeError> {
        let output = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .output()
            .map_err(|err| ProbeError::Command {
                command: self.rendered(),
                reason: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(ProbeError::Command {
                command: self.rendered(),
                reason: format!("exited with {}", output.status),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let text = text.trim();
        if text.is_empty() || text == "-1" {
            return Ok(None);
        }
        text.parse::<u32>()
            .map(|id| Some(ActorId(id)))
            .map_err(|_| ProbeError::Parse {
                output: text.to_string(),
            })
    }
}

/// Probe for deployments without foreground detection: everything is
/// classified as background.
#[derive(Debug, Default)]
pub struct NoForegroundProbe;

impl ForegroundProbe for NoForegroundProbe {
    fn current_foreground(&mut self) -> Result<Option<ActorId>, ProbeError> {
        Ok(None)
    }
}

/// The configured probe backend.
#[derive(Debug)]
pub enum ProbeBackend {
    /// External command invocation.
    Command(CommandForegroundProbe),
    /// No probe configured.
    Disabled(NoForegroundProbe),
}

impl ProbeBackend {
    /// Builds the backend selected by the policy.
    #[must_use]
    pub fn from_config(config: &wearquota_core::config::MonitorConfig) -> Self {
        if config.probe.command.is_empty() {
            Self::Disabled(NoForegroundProbe)
        } else {
            Self::Command(CommandForegroundProbe::new(config.probe.command.clone()))
        }
    }
}

impl ForegroundProbe for ProbeBackend {
    fn current_foreground(&mut self) -> Result<Option<ActorId>, ProbeError> {
        match self {
            Self::Command(probe) => probe.current_foreground(),
            Self::Disabled(probe) => probe.current_foreground(),
        }
    }
}
