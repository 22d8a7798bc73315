//! JSONL telemetry series writer.
//!
//! Appends one JSON object per tick to a series file named after the
//! monitor start time, for later rendering or export. The daemon never
//! reads this data back.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;
use wearquota_core::telemetry::{TelemetryError, TelemetrySink, TickSeries};

/// Writes tick series rows as JSON lines.
#[derive(Debug)]
pub struct JsonlSeriesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSeriesSink {
    /// Creates `<prefix>series-<start_secs>.jsonl` in the given directory
    /// position. The prefix may carry a path component.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(prefix: &str, start_secs: u64) -> Result<Self, TelemetryError> {
        let path = PathBuf::from(format!("{prefix}series-{start_secs}.jsonl"));
        let writer = BufWriter::new(File::create(&path)?);
        info!(path = %path.display(), "telemetry series sink opened");
        Ok(Self { path, writer })
    }

    /// The series file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonlSeriesSink {
    fn record(&mut self, series: &TickSeries) -> Result<(), TelemetryError> {
        serde_json::to_writer(&mut self.writer, series)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TelemetryError> {
        self.writer.flush()?;
        info!(path = %self.path.display(), "telemetry series flushed");
        Ok(())
    }
}
