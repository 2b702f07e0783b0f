//! Helpers for building an allocator over an in-memory store pool.

use std::sync::Arc;

use crate::allocator::{Allocator, AllocatorSettings};
use crate::clock::ManualClock;
use crate::liveness::NodeLivenessStatus;
use crate::store_pool::{NodeLivenessFn, StorePool, StorePoolConfig};
use crate::types::{NodeDescriptor, NodeId, StoreDescriptor, StoreId};

/// Start time for test clocks. Far enough from zero that "time ago"
/// arithmetic never saturates.
pub const TEST_START_MS: u64 = 1_700_000_000_000;

/// Feeds store descriptors into a store pool the way gossip would.
#[derive(Clone)]
pub struct StoreGossiper {
    store_pool: Arc<StorePool>,
}

impl StoreGossiper {
    pub fn new(store_pool: Arc<StorePool>) -> Self {
        Self { store_pool }
    }

    pub fn gossip_stores(&self, stores: &[StoreDescriptor]) {
        for store in stores {
            self.store_pool.ingest_descriptor(store.clone());
        }
    }

    /// A bare store descriptor with no attributes or locality.
    pub fn store(store_id: StoreId, node_id: NodeId) -> StoreDescriptor {
        StoreDescriptor {
            store_id,
            node: NodeDescriptor {
                node_id,
                ..NodeDescriptor::default()
            },
            ..StoreDescriptor::default()
        }
    }
}

/// Store pool, allocator, clock and gossiper for tests. Nodes
/// `1..=num_nodes` are live; anything else is unknown.
pub fn create_test_allocator(
    num_nodes: usize,
    deterministic: bool,
) -> (Arc<StorePool>, Allocator, Arc<ManualClock>, StoreGossiper) {
    let max_node = num_nodes as NodeId;
    let liveness: NodeLivenessFn = Arc::new(move |node_id, _, _| {
        if (1..=max_node).contains(&node_id) {
            NodeLivenessStatus::Live
        } else {
            NodeLivenessStatus::Unknown
        }
    });
    let clock = Arc::new(ManualClock::new(TEST_START_MS));
    let store_pool = StorePool::new(StorePoolConfig::default(), clock.clone(), liveness);
    let allocator = Allocator::new(AllocatorSettings::default(), deterministic);
    let gossiper = StoreGossiper::new(store_pool.clone());
    (store_pool, allocator, clock, gossiper)
}
