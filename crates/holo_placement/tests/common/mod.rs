//! Store and range fixtures shared by the integration tests.

#![allow(dead_code)]

use holo_placement::types::{
    Attributes, Constraint, ConstraintsConjunction, Locality, NodeDescriptor, NodeId,
    ReplicaDescriptor, SpanConfig, StoreCapacity, StoreDescriptor, StoreId, Tier,
};

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

pub fn with_node_attrs(mut store: StoreDescriptor, attrs: &[&str]) -> StoreDescriptor {
    store.node.attrs = Attributes::new(attrs.iter().copied());
    store
}

pub fn with_store_attrs(mut store: StoreDescriptor, attrs: &[&str]) -> StoreDescriptor {
    store.attrs = Attributes::new(attrs.iter().copied());
    store
}

pub fn with_locality(mut store: StoreDescriptor, tiers: &[(&str, &str)]) -> StoreDescriptor {
    store.node.locality = Locality::new(tiers.iter().map(|(k, v)| Tier::new(*k, *v)).collect());
    store
}

pub fn with_range_count(mut store: StoreDescriptor, range_count: u32) -> StoreDescriptor {
    store.capacity = StoreCapacity {
        range_count,
        ..store.capacity
    };
    store
}

/// s1 on n1, node attribute "a", store attribute "ssd".
pub fn single_store() -> Vec<StoreDescriptor> {
    vec![with_store_attrs(with_node_attrs(store(1, 1), &["a"]), &["ssd"])]
}

/// s1..s3 on n1..n3, no attributes.
pub fn three_stores() -> Vec<StoreDescriptor> {
    (1..=3).map(|id| store(id, id)).collect()
}

/// Six SSD stores; nodes 1-3 carry attribute "a", nodes 4-6 carry "b".
pub fn two_dc_stores() -> Vec<StoreDescriptor> {
    (1..=6)
        .map(|id| {
            let dc = if id <= 3 { "a" } else { "b" };
            with_store_attrs(with_node_attrs(store(id, id), &[dc]), &["ssd"])
        })
        .collect()
}

/// Requires `attrs` on `num_replicas` replicas; zero means every replica.
pub fn constrain_to(num_replicas: u32, attrs: &[&str]) -> ConstraintsConjunction {
    ConstraintsConjunction {
        num_replicas,
        constraints: attrs.iter().map(|a| Constraint::required(*a)).collect(),
    }
}

pub fn simple_config(num_replicas: u32) -> SpanConfig {
    SpanConfig {
        num_replicas,
        ..SpanConfig::default()
    }
}

/// Voters on `(node, store)` pairs with replica IDs 1, 2, ...
pub fn voters(placements: &[(NodeId, StoreId)]) -> Vec<ReplicaDescriptor> {
    placements
        .iter()
        .enumerate()
        .map(|(i, (node_id, store_id))| ReplicaDescriptor::new(*node_id, *store_id, i as u64 + 1))
        .collect()
}
