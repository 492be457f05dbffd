//! Infrastructure adapters: transport fabric, partition queues, outcome sinks.

pub mod fabric;
pub mod outcome;
pub mod queue;

pub use fabric::{
    FabricOutcomeSink, InMemoryFabric, InMemoryNegotiationBus, OutboundGate, TransportFabric,
};
pub use outcome::InMemoryOutcomeSink;
pub use queue::InMemoryPartitionQueue;
