//! Builders that wire the core from a [`CoreConfig`](crate::config::CoreConfig).

pub mod core_builder;

pub use core_builder::{build_core, build_core_with, ServiceCore, REQUEST_RATE_LIMITER};
