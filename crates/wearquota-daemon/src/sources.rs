//! Sample source backends.
//!
//! Both backends produce the same text snapshot format and share the
//! core parser: one re-reads a local stats file each tick, the other
//! invokes an external command (e.g. `adb shell cat /proc/...`) and
//! parses its stdout.

use std::path::PathBuf;
use std::process::Command;

use wearquota_core::config::{MonitorConfig, SourcePolicy};
use wearquota_core::sample::{SampleBatch, SampleError, SampleSource};

/// Default local stats export path.
pub const DEFAULT_STATS_PATH: &str = "/proc/diskstats_uid_global";

/// Re-reads a local per-actor write-stats file each tick.
#[derive(Debug)]
pub struct FileSampleSource {
    path: PathBuf,
}

impl FileSampleSource {
    /// Creates a source for the given stats file.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SampleSource for FileSampleSource {
    fn sample(&mut self) -> Result<SampleBatch, SampleError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| SampleError::Read {
            source_name: self.path.display().to_string(),
            source,
        })?;
        SampleBatch::parse(&text)
    }
}

/// Invokes an external command and parses its stdout as a snapshot.
#[derive(Debug)]
pub struct CommandSampleSource {
    argv: Vec<String>,
}

impl CommandSampleSource {
    /// Creates a source running the given argv.
    #[must_use]
    pub const fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn rendered(&self) -> String {
        self.argv.join(" ")
    }
}

impl SampleSource for CommandSampleSource {
    fn sample(&mut self) -> Result<SampleBatch, SampleError> {
        let output = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .output()
            .map_err(|err| SampleError::Command {
                command: self.rendered(),
                reason: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(SampleError::Command {
                command: self.rendered(),
                reason: format!("exited with {}", output.status),
            });
        }
        let text = String::from_utf8(output.stdout).map_err(|_| SampleError::Command {
            command: self.rendered(),
            reason: "stdout is not valid UTF-8".to_string(),
        })?;
        SampleBatch::parse(&text)
    }
}

/// The configured sample source backend.
#[derive(Debug)]
pub enum SourceBackend {
    /// Local file re-read.
    File(FileSampleSource),
    /// External command invocation.
    Command(CommandSampleSource),
}

impl SourceBackend {
    /// Builds the backend selected by the policy. With neither a file nor
    /// a command configured, the default local stats path is used.
    #[must_use]
    pub fn from_config(config: &MonitorConfig) -> Self {
        let SourcePolicy { file, command } = &config.source;
        if !command.is_empty() {
            return Self::Command(CommandSampleSource::new(command.clone()));
        }
        let path = file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATS_PATH));
        Self::File(FileSampleSource::new(path))
    }
}

impl SampleSource for SourceBackend {
    fn sample(&mut self) -> Result<SampleBatch, SampleError> {
        match self {
            Self::File(source) => source.sample(),
            Self::Command(source) => source.sample(),
        }
    }
}
