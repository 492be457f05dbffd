//! Outcome sinks: where the final report of every unit is delivered.

pub mod memory;

pub use memory::{DeliveredReport, InMemoryOutcomeSink};
