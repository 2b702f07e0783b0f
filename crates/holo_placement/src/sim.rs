//! In-memory cluster for driving the replicate queue without a consensus
//! layer.
//!
//! `SimCluster` owns range descriptors and span configs, applies replica
//! changes instantly, and re-gossips store descriptors with updated range
//! counts after every change. `SimLiveness` runs one heartbeat loop per
//! node against shared in-memory liveness storage.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::allocator::{Allocator, AllocatorAction};
use crate::clock::{duration_ms, Clock};
use crate::liveness::{
    Liveness, LivenessConfig, MemLivenessStorage, MembershipStatus, NodeLiveness,
};
use crate::replicate_queue::{ReplicaChange, ReplicaChanger, SpanConfigSource};
use crate::store_pool::{AllocatorStorePool, StorePool};
use crate::types::{
    NodeId, RangeDescriptor, RangeId, RangeUsageInfo, ReplicaDescriptor, ReplicaType,
    ReplicationStatus, SpanConfig, StoreDescriptor, StoreId,
};

/// Cluster layout loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    pub stores: Vec<StoreDescriptor>,
    #[serde(default)]
    pub ranges: Vec<ScenarioRange>,
    /// Nodes to mark decommissioning once liveness is up.
    #[serde(default)]
    pub decommissioning: Vec<NodeId>,
    /// Nodes whose liveness expired long ago.
    #[serde(default)]
    pub dead: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioRange {
    pub range_id: RangeId,
    #[serde(default)]
    pub replicas: Vec<ReplicaDescriptor>,
    #[serde(default)]
    pub config: SpanConfig,
    #[serde(default)]
    pub usage: RangeUsageInfo,
}

impl Scenario {
    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        serde_json::from_str(data).context("parse scenario")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read scenario {}", path.display()))?;
        Self::from_json(&data)
    }

    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.stores.iter().map(|s| s.node_id()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangePlacement {
    pub range_id: RangeId,
    pub replicas: Vec<ReplicaDescriptor>,
}

struct SimRange {
    desc: RangeDescriptor,
    conf: SpanConfig,
    usage: RangeUsageInfo,
}

#[derive(Default)]
struct SimState {
    ranges: BTreeMap<RangeId, SimRange>,
    // As loaded; range counts here are load from outside the simulation.
    stores: BTreeMap<StoreId, StoreDescriptor>,
    failing: HashSet<StoreId>,
}

pub struct SimCluster {
    store_pool: Arc<StorePool>,
    state: Mutex<SimState>,
}

impl SimCluster {
    pub fn new(scenario: &Scenario, store_pool: Arc<StorePool>) -> anyhow::Result<Arc<Self>> {
        let mut state = SimState::default();
        for store in &scenario.stores {
            if state.stores.insert(store.store_id, store.clone()).is_some() {
                anyhow::bail!("duplicate store s{}", store.store_id);
            }
        }
        for range in &scenario.ranges {
            let desc = RangeDescriptor::new(range.range_id, range.replicas.clone());
            desc.validate()?;
            for replica in &desc.replicas {
                if !state.stores.contains_key(&replica.store_id) {
                    anyhow::bail!(
                        "r{}: replica on unknown store s{}",
                        range.range_id,
                        replica.store_id
                    );
                }
            }
            let sim_range = SimRange {
                desc,
                conf: range.config.clone(),
                usage: range.usage,
            };
            if state.ranges.insert(range.range_id, sim_range).is_some() {
                anyhow::bail!("duplicate range r{}", range.range_id);
            }
        }
        let sim = Arc::new(Self {
            store_pool,
            state: Mutex::new(state),
        });
        sim.gossip();
        Ok(sim)
    }

    /// Publishes every store's descriptor with the ranges it currently holds.
    pub fn gossip(&self) {
        let descriptors: Vec<StoreDescriptor> = {
            let state = self.state.lock().unwrap();
            state
                .stores
                .values()
                .map(|base| {
                    let mut desc = base.clone();
                    for range in state.ranges.values() {
                        if range.desc.replica_on_store(base.store_id).is_some() {
                            desc.capacity.range_count += 1;
                            desc.capacity.logical_bytes += range.usage.logical_bytes;
                        }
                    }
                    desc
                })
                .collect()
        };
        for desc in descriptors {
            self.store_pool.ingest_descriptor(desc);
        }
    }

    /// Makes changes that add a replica to `store_id` fail.
    pub fn set_store_failing(&self, store_id: StoreId, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing.insert(store_id);
        } else {
            state.failing.remove(&store_id);
        }
    }

    pub fn add_store(&self, store: StoreDescriptor) {
        self.state
            .lock()
            .unwrap()
            .stores
            .insert(store.store_id, store);
        self.gossip();
    }

    pub fn placement(&self) -> Vec<RangePlacement> {
        self.state
            .lock()
            .unwrap()
            .ranges
            .values()
            .map(|r| RangePlacement {
                range_id: r.desc.range_id,
                replicas: r.desc.replicas.clone(),
            })
            .collect()
    }

    /// Ranges that still need a structural change.
    pub fn pending_actions(
        &self,
        allocator: &Allocator,
        sp: &dyn AllocatorStorePool,
    ) -> Vec<(RangeId, AllocatorAction)> {
        let ranges: Vec<(RangeDescriptor, SpanConfig)> = self
            .state
            .lock()
            .unwrap()
            .ranges
            .values()
            .map(|r| (r.desc.clone(), r.conf.clone()))
            .collect();
        ranges
            .into_iter()
            .filter_map(|(desc, conf)| {
                let (action, _) = allocator.compute_action(sp, &conf, &desc);
                match action {
                    AllocatorAction::ConsiderRebalance => None,
                    action => Some((desc.range_id, action)),
                }
            })
            .collect()
    }
}

impl SpanConfigSource for SimCluster {
    fn span_config(&self, range_id: RangeId) -> anyhow::Result<SpanConfig> {
        self.state
            .lock()
            .unwrap()
            .ranges
            .get(&range_id)
            .map(|r| r.conf.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown range r{range_id}"))
    }
}

#[async_trait]
impl ReplicaChanger for SimCluster {
    async fn range_ids(&self) -> anyhow::Result<Vec<RangeId>> {
        Ok(self.state.lock().unwrap().ranges.keys().copied().collect())
    }

    async fn range_descriptor(&self, range_id: RangeId) -> anyhow::Result<RangeDescriptor> {
        self.state
            .lock()
            .unwrap()
            .ranges
            .get(&range_id)
            .map(|r| r.desc.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown range r{range_id}"))
    }

    async fn replication_status(
        &self,
        range_id: RangeId,
    ) -> anyhow::Result<Option<ReplicationStatus>> {
        let desc = self.range_descriptor(range_id).await?;
        // The first voter leads; changes apply instantly so everyone is caught up.
        Ok(desc
            .voters()
            .first()
            .map(|leader| ReplicationStatus::caught_up(leader.replica_id, 1, &desc.replicas)))
    }

    async fn range_usage(&self, range_id: RangeId) -> anyhow::Result<RangeUsageInfo> {
        self.state
            .lock()
            .unwrap()
            .ranges
            .get(&range_id)
            .map(|r| r.usage)
            .ok_or_else(|| anyhow::anyhow!("unknown range r{range_id}"))
    }

    async fn change_replicas(
        &self,
        range_id: RangeId,
        expected: &RangeDescriptor,
        changes: &[ReplicaChange],
    ) -> anyhow::Result<RangeDescriptor> {
        let updated = {
            let mut state = self.state.lock().unwrap();
            for change in changes {
                if let ReplicaChange::Add { target, .. } = change {
                    if state.failing.contains(&target.store_id) {
                        anyhow::bail!("s{}: failed to send snapshot", target.store_id);
                    }
                }
            }
            let range = state
                .ranges
                .get_mut(&range_id)
                .ok_or_else(|| anyhow::anyhow!("unknown range r{range_id}"))?;
            if range.desc != *expected {
                anyhow::bail!("r{range_id}: descriptor changed");
            }
            let mut next = range.desc.clone();
            for change in changes {
                match change {
                    ReplicaChange::Add {
                        target,
                        replica_type,
                    } => {
                        next.add_replica(*target, *replica_type)?;
                    }
                    ReplicaChange::Remove { target } => {
                        next.remove_replica(target.store_id)?;
                    }
                }
            }
            range.desc = next.clone();
            next
        };
        self.gossip();
        Ok(updated)
    }

    async fn finalize_atomic_change(
        &self,
        range_id: RangeId,
        expected: &RangeDescriptor,
    ) -> anyhow::Result<RangeDescriptor> {
        let updated = {
            let mut state = self.state.lock().unwrap();
            let range = state
                .ranges
                .get_mut(&range_id)
                .ok_or_else(|| anyhow::anyhow!("unknown range r{range_id}"))?;
            if range.desc != *expected {
                anyhow::bail!("r{range_id}: descriptor changed");
            }
            range.desc.replicas.retain(|r| {
                !matches!(
                    r.replica_type,
                    ReplicaType::VoterOutgoing | ReplicaType::VoterDemotingLearner
                )
            });
            for replica in &mut range.desc.replicas {
                replica.replica_type = match replica.replica_type {
                    ReplicaType::VoterIncoming => ReplicaType::Voter,
                    ReplicaType::VoterDemotingNonVoter => ReplicaType::NonVoter,
                    other => other,
                };
            }
            range.desc.clone()
        };
        self.gossip();
        Ok(updated)
    }
}

/// Heartbeat loops for every live node plus the observer cache the store
/// pool reads.
pub struct SimLiveness {
    pub local: Arc<NodeLiveness>,
    nodes: Vec<Arc<NodeLiveness>>,
    handles: Vec<JoinHandle<()>>,
}

impl SimLiveness {
    /// Writes a liveness record for every node, starts heartbeats for the
    /// live ones and applies decommissioning.
    pub async fn start(
        scenario: &Scenario,
        clock: Arc<dyn Clock>,
        local_node: NodeId,
        dead_after: Duration,
    ) -> anyhow::Result<Self> {
        let storage = Arc::new(MemLivenessStorage::new());
        let dead: BTreeSet<NodeId> = scenario.dead.iter().copied().collect();
        let mut nodes = Vec::new();
        let mut handles = Vec::new();
        let mut local = None;

        for node_id in scenario.node_ids() {
            if dead.contains(&node_id) {
                let mut record = Liveness::new(node_id);
                record.expiration_ms = clock
                    .now_ms()
                    .saturating_sub(duration_ms(dead_after) + 1_000);
                storage.force_write(record).await;
                continue;
            }
            let nl = NodeLiveness::new(LivenessConfig::new(node_id), clock.clone(), storage.clone());
            nl.heartbeat()
                .await
                .with_context(|| format!("initial heartbeat for n{node_id}"))?;
            handles.push(nl.start()?);
            if node_id == local_node {
                local = Some(nl.clone());
            }
            nodes.push(nl);
        }
        let local = match local {
            Some(local) => local,
            None => NodeLiveness::new(LivenessConfig::new(local_node), clock, storage.clone()),
        };
        local.scan().await?;

        for node_id in &scenario.decommissioning {
            local
                .set_membership_status(*node_id, MembershipStatus::Decommissioning)
                .await
                .with_context(|| format!("decommission n{node_id}"))?;
        }

        // Other nodes' heartbeats reach the local cache by re-reading storage,
        // twice per heartbeat so a cached record never outlives its expiration.
        let observer = local.clone();
        let interval = LivenessConfig::new(local_node).heartbeat_interval / 2;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = observer.scan().await {
                    tracing::warn!(error = ?err, "liveness scan failed");
                }
            }
        }));

        Ok(Self {
            local,
            nodes,
            handles,
        })
    }

    pub fn stop(self) {
        for nl in &self.nodes {
            nl.stop();
        }
        for handle in self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "stores": [
            {"store_id": 1, "node": {"node_id": 1}},
            {"store_id": 2, "node": {"node_id": 2}, "capacity": {"range_count": 7}}
        ],
        "ranges": [
            {"range_id": 1, "replicas": [{"node_id": 1, "store_id": 1, "replica_id": 1}],
             "config": {"num_replicas": 3}}
        ],
        "decommissioning": [2]
    }"#;

    #[test]
    fn scenario_parses_with_defaults() {
        let scenario = Scenario::from_json(SCENARIO).expect("parse");
        assert_eq!(scenario.stores.len(), 2);
        assert_eq!(scenario.stores[1].capacity.range_count, 7);
        assert_eq!(scenario.ranges[0].config.num_replicas, 3);
        assert_eq!(scenario.ranges[0].replicas[0].replica_type, ReplicaType::Voter);
        assert!(scenario.dead.is_empty());
        assert_eq!(scenario.node_ids().len(), 2);
    }

    #[test]
    fn unknown_store_is_rejected() {
        let mut scenario = Scenario::from_json(SCENARIO).expect("parse");
        scenario.ranges[0].replicas[0].store_id = 9;
        let (sp, _allocator, _clock, _gossiper) = crate::testutil::create_test_allocator(2, true);
        assert!(SimCluster::new(&scenario, sp).is_err());
    }
}
