//! Runtime adapters: spawning on tokio and pumping the fabric.

pub mod listener;
pub mod tokio_spawner;

pub use listener::{ListenerPump, PumpHandle, PumpStats};
pub use tokio_spawner::TokioSpawner;
