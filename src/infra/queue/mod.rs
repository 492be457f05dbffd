//! Partition queue backends.

pub mod memory;

pub use memory::InMemoryPartitionQueue;
