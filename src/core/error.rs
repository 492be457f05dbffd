//! Error types for admission, election and dispatch.

use thiserror::Error;

/// Errors produced by the admission layer and its configuration.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The partition queue cannot park any more work.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// A unit of work waited longer than its configured maximum for a slot.
    #[error("admission timed out at priority level {level} after {waited_ms}ms")]
    AdmissionTimeout {
        /// Priority level the unit was waiting on.
        level: usize,
        /// How long the unit waited before giving up.
        waited_ms: u128,
    },
    /// The requested priority level has no reservation.
    #[error("unknown priority level {0}")]
    UnknownPriorityLevel(usize),
    /// No partition is registered for the unit's channel and priority.
    #[error("no partition configured for {0}")]
    UnknownPartition(String),
    /// Configuration failed validation; fatal at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The component has been shut down.
    #[error("shut down")]
    Shutdown,
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors produced by the command dispatch pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No registered handler matches the unit's filter.
    #[error("handler not resolved for {channel_id}/{message_type}/{action_type}")]
    HandlerNotResolved {
        /// Channel the unit arrived on.
        channel_id: String,
        /// Message type segment.
        message_type: String,
        /// Action type segment.
        action_type: String,
    },
    /// A handler is already registered for the same filter.
    #[error("a handler is already registered for {0}")]
    DuplicateRegistration(String),
    /// The handler failed and the exception policy re-throws.
    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
