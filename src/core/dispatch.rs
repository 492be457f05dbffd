//! Command dispatch: resolve a unit to its handler, run it, apply the
//! exception policy and keep per-handler statistics.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::DispatchError;
use crate::core::events::{CoreEvent, SharedEventSink};
use crate::util::clock::now_ms;

/// Handler routing key. All segments are stored lowercased; a `None`
/// segment matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFilter {
    channel_id: String,
    message_type: Option<String>,
    action_type: Option<String>,
}

impl MessageFilter {
    /// Filter with optional wildcard segments.
    #[must_use]
    pub fn new(channel_id: &str, message_type: Option<&str>, action_type: Option<&str>) -> Self {
        Self {
            channel_id: channel_id.to_lowercase(),
            message_type: message_type.map(str::to_lowercase),
            action_type: action_type.map(str::to_lowercase),
        }
    }

    /// Filter matching exactly one `(channel, message type, action type)`.
    #[must_use]
    pub fn exact(channel_id: &str, message_type: &str, action_type: &str) -> Self {
        Self::new(channel_id, Some(message_type), Some(action_type))
    }

    /// Filter matching everything on a channel.
    #[must_use]
    pub fn channel(channel_id: &str) -> Self {
        Self::new(channel_id, None, None)
    }

    /// Lowercased channel id.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// True when the filter accepts the given segments, ignoring case.
    ///
    /// Segments are lowercased the same way as the stored key, so `matches`
    /// agrees with registry lookups for non-ASCII ids too.
    #[must_use]
    pub fn matches(&self, channel_id: &str, message_type: &str, action_type: &str) -> bool {
        self.channel_id == channel_id.to_lowercase()
            && self
                .message_type
                .as_deref()
                .is_none_or(|m| m == message_type.to_lowercase())
            && self
                .action_type
                .as_deref()
                .is_none_or(|a| a == action_type.to_lowercase())
    }

    /// Candidate keys for a lookup, most specific first.
    fn candidates(channel_id: &str, message_type: &str, action_type: &str) -> [Self; 4] {
        [
            Self::new(channel_id, Some(message_type), Some(action_type)),
            Self::new(channel_id, Some(message_type), None),
            Self::new(channel_id, None, Some(action_type)),
            Self::new(channel_id, None, None),
        ]
    }
}

impl fmt::Display for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.channel_id,
            self.message_type.as_deref().unwrap_or("*"),
            self.action_type.as_deref().unwrap_or("*")
        )
    }
}

/// Acknowledgement state set on a unit by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// The unit is acknowledged.
    Success,
    /// The unit is failed back to the fabric.
    Failure,
}

/// The unit of work moved through admission and dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionUnit {
    /// Message identity.
    pub id: Uuid,
    /// Target channel.
    pub channel_id: String,
    /// Target message type.
    pub message_type: String,
    /// Target action type.
    pub action_type: String,
    /// Priority level used for admission.
    pub priority: usize,
    /// Opaque body.
    pub payload: serde_json::Value,
    /// Channel responses are routed to; the request channel when unset.
    pub response_channel: Option<String>,
    /// Id of the request this unit answers.
    pub correlation_id: Option<String>,
    /// Response status code, e.g. `"500"`.
    pub status: Option<String>,
    /// Human readable status.
    pub status_description: Option<String>,
    /// Set by the pipeline once the unit is settled.
    pub signal: Option<Signal>,
    /// Creation time in milliseconds since the epoch.
    pub created_at_ms: u128,
}

impl TransmissionUnit {
    /// New request unit at priority 0 with a null payload.
    #[must_use]
    pub fn request(channel_id: &str, message_type: &str, action_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.to_string(),
            message_type: message_type.to_string(),
            action_type: action_type.to_string(),
            priority: 0,
            payload: serde_json::Value::Null,
            response_channel: None,
            correlation_id: None,
            status: None,
            status_description: None,
            signal: None,
            created_at_ms: now_ms(),
        }
    }

    /// Set the priority level.
    #[must_use]
    pub const fn with_priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the response channel.
    #[must_use]
    pub fn with_response_channel(mut self, channel: &str) -> Self {
        self.response_channel = Some(channel.to_string());
        self
    }

    /// Build a response addressed back to this unit's originator.
    #[must_use]
    pub fn response(&self, status: &str, status_description: &str) -> Self {
        let channel = self
            .response_channel
            .as_deref()
            .unwrap_or(&self.channel_id);
        let mut response = Self::request(channel, &self.message_type, &self.action_type)
            .with_priority(self.priority);
        response.correlation_id = Some(self.id.to_string());
        response.status = Some(status.to_string());
        response.status_description = Some(status_description.to_string());
        response
    }
}

/// Code run for a resolved unit. Errors are the pipeline's exceptions.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle `request`, pushing any responses onto `responses`.
    async fn handle(
        &self,
        request: &TransmissionUnit,
        responses: &mut Vec<TransmissionUnit>,
    ) -> anyhow::Result<()>;
}

/// Adapts a synchronous closure into a [`CommandHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&TransmissionUnit, &mut Vec<TransmissionUnit>) -> anyhow::Result<()> + Send + Sync,
{
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&TransmissionUnit, &mut Vec<TransmissionUnit>) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(
        &self,
        request: &TransmissionUnit,
        responses: &mut Vec<TransmissionUnit>,
    ) -> anyhow::Result<()> {
        (self.0)(request, responses)
    }
}

/// What the dispatcher does when a handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExceptionPolicy {
    /// Swallow the error; the unit is left unsignalled.
    DoNothing,
    /// Acknowledge the unit and push one `"500"` response carrying the error.
    SignalSuccessAndSend500ErrorResponse,
    /// Fail the unit back; no response.
    SignalFailAndDoNothing,
    /// Return the error to the caller.
    #[default]
    Rethrow,
}

impl ExceptionPolicy {
    /// Parse a policy name, ignoring case and underscores. Unrecognized names
    /// map to [`Self::Rethrow`].
    #[must_use]
    pub fn parse(name: &str) -> Self {
        let key: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "donothing" => Self::DoNothing,
            "signalsuccessandsend500errorresponse" => Self::SignalSuccessAndSend500ErrorResponse,
            "signalfailanddonothing" => Self::SignalFailAndDoNothing,
            _ => Self::Rethrow,
        }
    }

    /// Canonical snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DoNothing => "do_nothing",
            Self::SignalSuccessAndSend500ErrorResponse => {
                "signal_success_and_send_500_error_response"
            }
            Self::SignalFailAndDoNothing => "signal_fail_and_do_nothing",
            Self::Rethrow => "rethrow",
        }
    }
}

impl From<String> for ExceptionPolicy {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl From<ExceptionPolicy> for String {
    fn from(policy: ExceptionPolicy) -> Self {
        policy.as_str().to_string()
    }
}

/// How a resolved unit finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The handler succeeded and the unit was acknowledged.
    Completed,
    /// The handler failed and the error was swallowed.
    Swallowed,
    /// The handler failed; the unit was acknowledged and a 500 response queued.
    ErrorResponded,
    /// The handler failed and the unit was failed back.
    Failed,
}

/// Live counters of one registered handler.
#[derive(Debug)]
pub struct HandlerStatistics {
    reference_id: String,
    active: AtomicI64,
    processed: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`HandlerStatistics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStatisticsSnapshot {
    /// Handler reference id.
    pub reference_id: String,
    /// Requests currently executing.
    pub active: i64,
    /// Requests finished.
    pub processed: u64,
    /// Requests whose handler failed.
    pub errors: u64,
}

impl HandlerStatistics {
    fn new(reference_id: &str) -> Self {
        Self {
            reference_id: reference_id.to_string(),
            active: AtomicI64::new(0),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Copy the counters.
    #[must_use]
    pub fn snapshot(&self) -> HandlerStatisticsSnapshot {
        HandlerStatisticsSnapshot {
            reference_id: self.reference_id.clone(),
            active: self.active.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Acquire),
            errors: self.errors.load(Ordering::Acquire),
        }
    }
}

/// Decrements the active count when dropped, whatever the outcome.
struct ActiveGuard<'a>(&'a HandlerStatistics);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a HandlerStatistics) -> Self {
        stats.active.fetch_add(1, Ordering::AcqRel);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
        self.0.processed.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn CommandHandler>,
    stats: Arc<HandlerStatistics>,
}

/// Handler table keyed by [`MessageFilter`].
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<MessageFilter, Registration>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// # Errors
    ///
    /// [`DispatchError::DuplicateRegistration`] when the filter is taken.
    pub fn register(
        &self,
        filter: MessageFilter,
        handler: Arc<dyn CommandHandler>,
        reference_id: &str,
    ) -> Result<(), DispatchError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&filter) {
            return Err(DispatchError::DuplicateRegistration(filter.to_string()));
        }
        tracing::debug!(filter = %filter, reference_id, "registered handler");
        handlers.insert(
            filter,
            Registration {
                handler,
                stats: Arc::new(HandlerStatistics::new(reference_id)),
            },
        );
        Ok(())
    }

    /// Remove a handler; false when nothing was registered for the filter.
    pub fn unregister(&self, filter: &MessageFilter) -> bool {
        self.handlers.write().remove(filter).is_some()
    }

    /// Reference id of the handler that would serve the segments.
    #[must_use]
    pub fn resolve(&self, channel_id: &str, message_type: &str, action_type: &str) -> Option<String> {
        self.lookup(channel_id, message_type, action_type)
            .map(|r| r.stats.reference_id.clone())
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    fn lookup(&self, channel_id: &str, message_type: &str, action_type: &str) -> Option<Registration> {
        let handlers = self.handlers.read();
        MessageFilter::candidates(channel_id, message_type, action_type)
            .iter()
            .find_map(|key| handlers.get(key).cloned())
    }

    fn statistics(&self) -> Vec<HandlerStatisticsSnapshot> {
        self.handlers
            .read()
            .values()
            .map(|r| r.stats.snapshot())
            .collect()
    }
}

/// Runs resolved units under an exception policy.
pub struct CommandDispatcher {
    registry: Arc<HandlerRegistry>,
    policy: ExceptionPolicy,
    sink: SharedEventSink,
    unresolved: AtomicU64,
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .field("unresolved", &self.unresolved_count())
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    /// Create a dispatcher over a registry.
    #[must_use]
    pub const fn new(
        registry: Arc<HandlerRegistry>,
        policy: ExceptionPolicy,
        sink: SharedEventSink,
    ) -> Self {
        Self {
            registry,
            policy,
            sink,
            unresolved: AtomicU64::new(0),
        }
    }

    /// The registry this dispatcher resolves against.
    #[must_use]
    pub const fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Configured policy.
    #[must_use]
    pub const fn policy(&self) -> ExceptionPolicy {
        self.policy
    }

    /// Resolve and run a unit.
    ///
    /// # Errors
    ///
    /// [`DispatchError::HandlerNotResolved`] when nothing matches, and
    /// [`DispatchError::Handler`] when the handler fails under
    /// [`ExceptionPolicy::Rethrow`].
    pub async fn process_request(
        &self,
        unit: &mut TransmissionUnit,
        responses: &mut Vec<TransmissionUnit>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(registration) =
            self.registry
                .lookup(&unit.channel_id, &unit.message_type, &unit.action_type)
        else {
            self.unresolved.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                unit_id = %unit.id,
                channel_id = %unit.channel_id,
                message_type = %unit.message_type,
                action_type = %unit.action_type,
                "no handler resolved"
            );
            self.sink.record(CoreEvent::UnresolvedRequest {
                unit_id: unit.id,
                channel_id: unit.channel_id.clone(),
                message_type: unit.message_type.clone(),
                action_type: unit.action_type.clone(),
            });
            return Err(DispatchError::HandlerNotResolved {
                channel_id: unit.channel_id.clone(),
                message_type: unit.message_type.clone(),
                action_type: unit.action_type.clone(),
            });
        };

        let stats = &registration.stats;
        let result = {
            let _active = ActiveGuard::enter(stats);
            registration.handler.handle(unit, responses).await
        };

        let outcome = match result {
            Ok(()) => {
                unit.signal = Some(Signal::Success);
                Ok(DispatchOutcome::Completed)
            }
            Err(error) => {
                stats.errors.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(
                    unit_id = %unit.id,
                    reference_id = %stats.reference_id,
                    policy = self.policy.as_str(),
                    error = %error,
                    "handler failed"
                );
                self.apply_policy(unit, responses, error)
            }
        };

        let snapshot = stats.snapshot();
        self.sink.record(CoreEvent::Handler {
            reference_id: snapshot.reference_id,
            active: snapshot.active,
            processed: snapshot.processed,
            errors: snapshot.errors,
        });
        outcome
    }

    fn apply_policy(
        &self,
        unit: &mut TransmissionUnit,
        responses: &mut Vec<TransmissionUnit>,
        error: anyhow::Error,
    ) -> Result<DispatchOutcome, DispatchError> {
        match self.policy {
            ExceptionPolicy::DoNothing => Ok(DispatchOutcome::Swallowed),
            ExceptionPolicy::SignalSuccessAndSend500ErrorResponse => {
                unit.signal = Some(Signal::Success);
                responses.push(unit.response("500", &error.to_string()));
                Ok(DispatchOutcome::ErrorResponded)
            }
            ExceptionPolicy::SignalFailAndDoNothing => {
                unit.signal = Some(Signal::Failure);
                Ok(DispatchOutcome::Failed)
            }
            ExceptionPolicy::Rethrow => Err(DispatchError::Handler(error)),
        }
    }

    /// Counters of every registered handler.
    #[must_use]
    pub fn statistics(&self) -> Vec<HandlerStatisticsSnapshot> {
        self.registry.statistics()
    }

    /// Units for which no handler resolved.
    #[must_use]
    pub fn unresolved_count(&self) -> u64 {
        self.unresolved.load(Ordering::Relaxed)
    }
}
