//! Coordination and admission core: resource health, bulkhead admission,
//! master-job election, command dispatch and schedules.

pub mod admission_pool;
pub mod bulkhead;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod master_job;
pub mod resource_tracker;
pub mod schedule;

pub use admission_pool::{
    AdmissionPool, OutcomeSink, ParkedUnit, PartitionQueue, Spawn, SubmitStatus, UnitOutcome,
    UnitReport,
};
pub use bulkhead::{
    AdmissionVerdict, BulkheadScheduler, DeferReason, DemandGuard, SchedulerSnapshot, SlotPermit,
    WeightedRoundRobin,
};
pub use dispatch::{
    CommandDispatcher, CommandHandler, DispatchOutcome, ExceptionPolicy, FnHandler,
    HandlerRegistry, MessageFilter, Signal, TransmissionUnit,
};
pub use error::{AppResult, DispatchError, SchedulerError};
pub use events::{
    CoreEvent, EventSink, InMemoryEventSink, NullEventSink, SharedEventSink, TracingEventSink,
};
pub use master_job::{
    MasterJobCoordinator, MasterJobGate, MasterJobNegotiator, MasterJobState, NegotiationAction,
    NegotiationChannel, NegotiationMessage,
};
pub use resource_tracker::{
    RateLimiter, ResourceConsumer, ResourceGuard, ResourceMetric, ResourceProfile,
    ResourceRequestResult, ResourceTracker,
};
pub use schedule::{CommandJobSchedule, FnJob, ScheduleHost, ScheduleJob, ScheduleStatistics};
