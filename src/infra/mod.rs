//! Process plumbing: telemetry, infrastructure errors and the HTTP surface.

pub mod error;
pub mod http;
pub mod telemetry;
