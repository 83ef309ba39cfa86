//! # Kiln Core
//!
//! Error and telemetry definitions shared by every Kiln crate.

pub mod error;
pub mod telemetry;

pub use error::*;
pub use telemetry::{init_tracing, TelemetryConfig};
