//! Per-actor write-stats samples and their wire format.
//!
//! A sample batch is one snapshot of the kernel's per-actor cumulative
//! write counters. The text export format is:
//!
//! ```text
//! <seq> <timestamp> <elapsed>
//! <actor> <sectors> <sectors_delta>
//! <actor> <sectors> <sectors_delta>
//! -1 <sectors> <sectors_delta>
//! ```
//!
//! The header carries a sequence number, the snapshot timestamp, and the
//! elapsed seconds since the previous snapshot. Each row reports one
//! actor's cumulative written 512-byte sectors and the delta since the
//! previous snapshot; sectors are halved into KiB on parse. The sentinel
//! actor `-1` is the device-wide total: it is surfaced to telemetry but
//! excluded from per-actor accounting.

use thiserror::Error;

use crate::actor::ActorId;

/// Sentinel actor ID marking the device-wide total row.
pub const DEVICE_TOTAL_SENTINEL: i64 = -1;

/// Errors produced by sample sources and the batch parser.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SampleError {
    /// Failed to read the stats source.
    #[error("failed to read sample source '{source_name}': {source}")]
    Read {
        /// The file or descriptor that failed.
        source_name: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An external sampling command failed.
    #[error("sample command '{command}' failed: {reason}")]
    Command {
        /// The command that was invoked.
        command: String,
        /// Why it failed.
        reason: String,
    },

    /// The snapshot had no header line.
    #[error("sample snapshot is missing its header line")]
    MissingHeader,

    /// A snapshot line did not parse.
    #[error("failed to parse sample line '{line}': {reason}")]
    Parse {
        /// The offending line.
        line: String,
        /// Why it did not parse.
        reason: String,
    },
}

/// One actor's counters from a sample batch, in KiB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRecord {
    /// The writing actor.
    pub actor: ActorId,
    /// Cumulative KiB written this boot.
    pub cumulative_kib: f64,
    /// KiB written since the previous snapshot.
    pub delta_kib: f64,
}

/// One snapshot of every actor's write counters.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    /// Snapshot sequence number.
    pub seq: u64,
    /// Snapshot timestamp, source-defined units.
    pub timestamp: u64,
    /// Seconds since the previous snapshot. Always positive.
    pub elapsed_secs: f64,
    /// Device-wide cumulative total from the sentinel row, in KiB.
    pub device_total_kib: Option<f64>,
    /// Per-actor counters, sentinel excluded.
    pub records: Vec<SampleRecord>,
}

impl SampleBatch {
    /// Parses one snapshot from its text export.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is missing or any line is malformed,
    /// naming the offending line.
    pub fn parse(text: &str) -> Result<Self, SampleError> {
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());

        let header = lines.next().ok_or(SampleError::MissingHeader)?;
        let mut fields = header.split_whitespace();
        let seq = parse_field::<u64>(&mut fields, header, "sequence number")?;
        let timestamp = parse_field::<u64>(&mut fields, header, "timestamp")?;
        let elapsed = parse_field::<u64>(&mut fields, header, "elapsed seconds")?;
        if elapsed == 0 {
            return Err(SampleError::Parse {
                line: header.to_string(),
                reason: "elapsed seconds must be positive".to_string(),
            });
        }

        let mut device_total_kib = None;
        let mut records = Vec::new();
        for line in lines {
            let mut fields = line.split_whitespace();
            let actor = parse_field::<i64>(&mut fields, line, "actor id")?;
            let sectors = parse_field::<u64>(&mut fields, line, "cumulative sectors")?;
            let sectors_delta = parse_field::<u64>(&mut fields, line, "sector delta")?;

            // 512-byte sectors to KiB.
            let cumulative_kib = sectors as f64 / 2.0;
            let delta_kib = sectors_delta as f64 / 2.0;

            if actor == DEVICE_TOTAL_SENTINEL {
                device_total_kib = Some(cumulative_kib);
                continue;
            }
            let actor = u32::try_from(actor).map_err(|_| SampleError::Parse {
                line: line.to_string(),
                reason: format!("actor id {actor} out of range"),
            })?;
            records.push(SampleRecord {
                actor: ActorId(actor),
                cumulative_kib,
                delta_kib,
            });
        }

        Ok(Self {
            seq,
            timestamp,
            elapsed_secs: elapsed as f64,
            device_total_kib,
            records,
        })
    }

    /// Sum of per-actor byte deltas, in KiB, excluding actors the
    /// predicate rejects.
    #[must_use]
    pub fn delta_sum_kib<F: Fn(ActorId) -> bool>(&self, keep: F) -> f64 {
        self.records
            .iter()
            .filter(|record| keep(record.actor))
            .map(|record| record.delta_kib)
            .sum()
    }
}

fn parse_field<'a, T: std::str::FromStr>(
    fields: &mut impl Iterator<Item = &'a str>,
    line: &str,
    what: &str,
) -> Result<T, SampleError> {
    fields
        .next()
        .ok_or_else(|| SampleError::Parse {
            line: line.to_string(),
            reason: format!("missing {what}"),
        })?
        .parse()
        .map_err(|_| SampleError::Parse {
            line: line.to_string(),
            reason: format!("invalid {what}"),
        })
}

/// Source of per-actor write-stats snapshots, one per tick.
pub trait SampleSource {
    /// Produces the next snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read or parsed. A failed
    /// sample fails only its tick; callers log and continue.
    fn sample(&mut self) -> Result<SampleBatch, SampleError>;
}
