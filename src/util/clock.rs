//! Wall-clock and monotonic time helpers.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Returns 0 if the system clock is set
/// before 1970.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Monotonic marker captured when a unit of work starts consuming a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StartMark(Instant);

impl StartMark {
    /// Capture the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// Time elapsed since the mark was taken.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    /// The underlying instant.
    #[must_use]
    pub const fn instant(&self) -> Instant {
        self.0
    }
}
