//! Tests for utility functions

use std::time::Duration;

use prometheus_command_bus::util::{init_tracing, init_tracing_with, now_ms, StartMark};

#[test]
fn test_now_ms_is_monotonic_enough() {
    let a = now_ms();
    let b = now_ms();
    assert!(b >= a);
    assert!(a > 1_600_000_000_000);
}

#[test]
fn test_start_mark_elapsed() {
    let mark = StartMark::now();
    std::thread::sleep(Duration::from_millis(5));
    assert!(mark.elapsed() >= Duration::from_millis(5));
    assert!(StartMark::now() > mark);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing_with("debug");
    init_tracing();
    tracing::info!("tracing installed twice without panicking");
}
