//! In-process negotiation transport with partition simulation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::core::master_job::{NegotiationChannel, NegotiationMessage};

const ENDPOINT_CAPACITY: usize = 256;

#[derive(Default)]
struct Registry {
    peers: HashMap<String, mpsc::Sender<NegotiationMessage>>,
    isolated: HashSet<String>,
}

/// Fan-out bus connecting negotiators in one process.
///
/// Delivery is best effort: a full or closed inbox drops the message, and an
/// isolated member neither sends nor receives.
#[derive(Clone, Default)]
pub struct InMemoryNegotiationBus {
    registry: Arc<RwLock<Registry>>,
}

impl std::fmt::Debug for InMemoryNegotiationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("InMemoryNegotiationBus")
            .field("members", &registry.peers.len())
            .field("isolated", &registry.isolated.len())
            .finish()
    }
}

impl InMemoryNegotiationBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join as `originator_id`. Rejoining replaces the previous inbox.
    #[must_use]
    pub fn join(&self, originator_id: &str) -> (Arc<BusEndpoint>, mpsc::Receiver<NegotiationMessage>) {
        let (tx, rx) = mpsc::channel(ENDPOINT_CAPACITY);
        self.registry
            .write()
            .peers
            .insert(originator_id.to_string(), tx);
        let endpoint = BusEndpoint {
            originator_id: originator_id.to_string(),
            registry: Arc::clone(&self.registry),
        };
        (Arc::new(endpoint), rx)
    }

    /// Cut a member off from everyone else.
    pub fn isolate(&self, originator_id: &str) {
        tracing::debug!(originator_id, "negotiation member isolated");
        self.registry
            .write()
            .isolated
            .insert(originator_id.to_string());
    }

    /// Reconnect a member.
    pub fn heal(&self, originator_id: &str) {
        self.registry.write().isolated.remove(originator_id);
    }

    /// Reconnect every member.
    pub fn heal_all(&self) {
        self.registry.write().isolated.clear();
    }

    /// Number of joined members.
    #[must_use]
    pub fn members(&self) -> usize {
        self.registry.read().peers.len()
    }
}

/// One member's sending half of an [`InMemoryNegotiationBus`].
pub struct BusEndpoint {
    originator_id: String,
    registry: Arc<RwLock<Registry>>,
}

impl std::fmt::Debug for BusEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusEndpoint")
            .field("originator_id", &self.originator_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NegotiationChannel for BusEndpoint {
    async fn broadcast(&self, message: NegotiationMessage) -> anyhow::Result<()> {
        let registry = self.registry.read();
        if registry.isolated.contains(&self.originator_id) {
            return Ok(());
        }
        for (peer, tx) in &registry.peers {
            if *peer == self.originator_id || registry.isolated.contains(peer) {
                continue;
            }
            if tx.try_send(message.clone()).is_err() {
                tracing::trace!(peer = %peer, "negotiation message dropped");
            }
        }
        Ok(())
    }
}
