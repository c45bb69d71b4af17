//! Runtime bootstrap shared by the binary and tooling.

pub mod error;
pub mod telemetry;
