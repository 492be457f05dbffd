//! Shared utilities.

pub mod clock;
pub mod telemetry;

pub use clock::{now_ms, StartMark};
pub use telemetry::{init_tracing, init_tracing_with};
