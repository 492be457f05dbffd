//! Configuration models for the scheduler, resource tracker, election and channels.

pub mod election;
pub mod partition;
pub mod scheduler;
pub mod service;
pub mod tracker;

pub use election::ElectionConfig;
pub use partition::{ChannelConfig, ListenerPartitionConfig, SenderPartitionConfig};
pub use scheduler::{PriorityLevelReservation, SchedulerConfig};
pub use service::CoreConfig;
pub use tracker::ResourceTrackerConfig;
