//! wearquota-daemon - adapters and wiring for `wearquotad`.
//!
//! The daemon binary drives the `wearquota-core` control loop against
//! real collaborators: a kernel stats export (read locally or through an
//! external command), a foreground probe command, a configurable
//! enforcement backend, and a JSONL telemetry series writer.

pub mod enforcers;
pub mod probe;
pub mod series;
pub mod sources;
