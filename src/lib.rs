//! # Prometheus Command Bus
//!
//! Coordination and admission core for services built from channels and
//! commands.
//!
//! Four parts cooperate:
//!
//! - **Resource health tracking** ([`core::resource_tracker`]): every call to
//!   a downstream resource is bracketed by a handle. Retries and exceptions
//!   in a sliding window turn into a rate-limit adjustment in `[0, 1]`.
//! - **Priority bulkhead admission** ([`core::bulkhead`],
//!   [`core::admission_pool`]): a global concurrency ceiling shared by
//!   priority levels with reserved minimums and maximums. Work that cannot
//!   run yet is parked and woken highest level first, weighted round-robin
//!   across partitions within a level.
//! - **Master-job election** ([`core::master_job`]): instances of a command
//!   negotiate over a broadcast channel so that at most one runs its
//!   singleton schedules ([`core::schedule`]) once the system is stable.
//! - **Command dispatch** ([`core::dispatch`]): units are routed to handlers
//!   by case-insensitive `(channel, message type, action type)`, and handler
//!   errors follow a configurable [`core::dispatch::ExceptionPolicy`].
//!
//! ## Wiring
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_command_bus::builders::build_core;
//! use prometheus_command_bus::config::{ChannelConfig, CoreConfig};
//! use prometheus_command_bus::core::{FnHandler, MessageFilter, TracingEventSink, TransmissionUnit};
//! use prometheus_command_bus::infra::InMemoryOutcomeSink;
//! use prometheus_command_bus::runtime::TokioSpawner;
//! use prometheus_command_bus::util::now_ms;
//!
//! let cfg = CoreConfig::default().with_channel(ChannelConfig::with_priorities("orders", &[0, 1]));
//! let core = build_core(
//!     &cfg,
//!     TokioSpawner::current()?,
//!     Arc::new(InMemoryOutcomeSink::new()),
//!     Arc::new(TracingEventSink),
//! )?;
//! core.registry.register(
//!     MessageFilter::exact("orders", "order", "create"),
//!     Arc::new(FnHandler::new(|req, out| {
//!         out.push(req.response("200", "created"));
//!         Ok(())
//!     })),
//!     "create-order",
//! )?;
//! core.pool.submit(TransmissionUnit::request("Orders", "Order", "Create"), now_ms())?;
//! ```
//!
//! Transports are reached through [`infra::fabric::TransportFabric`]; the
//! in-memory adapters are enough for tests and single-process use. To admit
//! responses through the bulkhead as well, build with
//! [`builders::build_core_with`] and attach the core's
//! [`infra::OutboundGate`] to a [`infra::FabricOutcomeSink`].

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders that wire the core from configuration.
pub mod builders;
/// Configuration models for admission, health tracking, election and channels.
pub mod config;
/// Resource tracking, admission, election, dispatch and schedules.
pub mod core;
/// Transport fabric, partition queue and outcome adapters.
pub mod infra;
/// Tokio spawner and the listener pump.
pub mod runtime;
/// Clock and telemetry helpers.
pub mod util;
