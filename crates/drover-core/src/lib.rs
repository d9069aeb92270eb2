//! # Drover Core
//!
//! Error types and tracing bootstrap shared by every Drover crate.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
