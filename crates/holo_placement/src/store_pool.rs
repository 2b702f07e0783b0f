//! Queryable view of store capacity, liveness and throttling.
//!
//! Descriptors arrive from the gossip feed and replace the previous one
//! wholesale. Liveness is not stored here; each query asks the configured
//! liveness function, which is how `OverrideStorePool` can substitute node
//! health for simulation without touching the gossiped state.
//!
//! A single mutex guards the details map. It is held only for map reads and
//! writes; callers get cloned snapshots and do all scoring outside the lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::clock::{duration_ms, Clock};
use crate::liveness::{NodeLiveness, NodeLivenessStatus};
use crate::types::{NodeId, RangeUsageInfo, ReplicaDescriptor, StoreDescriptor, StoreId};

/// Answers "what is the status of node N at time T", given the duration after
/// which an unreachable node counts as dead.
pub type NodeLivenessFn = Arc<dyn Fn(NodeId, u64, Duration) -> NodeLivenessStatus + Send + Sync>;

/// Liveness function backed by a `NodeLiveness` cache.
pub fn liveness_fn_from(nl: Arc<NodeLiveness>) -> NodeLivenessFn {
    Arc::new(move |node_id, now_ms, dead_after| nl.liveness_status(node_id, now_ms, dead_after))
}

#[derive(Clone, Copy, Debug)]
pub struct StorePoolConfig {
    /// A store whose node is unreachable, or whose descriptor has not been
    /// refreshed, for this long is dead.
    pub time_until_store_dead: Duration,
    /// Throttle applied when a store declines a replica.
    pub declined_reservations_timeout: Duration,
    /// Throttle applied when sending a replica to a store fails.
    pub failed_reservations_timeout: Duration,
}

impl Default for StorePoolConfig {
    fn default() -> Self {
        Self {
            time_until_store_dead: Duration::from_secs(5 * 60),
            declined_reservations_timeout: Duration::from_secs(1),
            failed_reservations_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Unknown,
    Dead,
    Decommissioning,
    Draining,
    Throttled,
    Available,
}

/// Which non-available stores `get_store_list` may still return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFilter {
    None,
    Throttled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    Declined,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct StoreDetail {
    pub desc: Option<StoreDescriptor>,
    pub throttled_until_ms: u64,
    pub throttled_because: String,
    pub last_updated_ms: u64,
}

/// Human-readable reasons for each throttled store skipped by a listing.
pub type ThrottledStoreReasons = Vec<String>;

/// A set of store descriptors with the means the scorer compares against.
#[derive(Debug, Clone, Default)]
pub struct StoreList {
    pub stores: Vec<StoreDescriptor>,
    pub mean_range_count: f64,
    pub mean_logical_bytes: f64,
    pub mean_fraction_used: f64,
}

impl StoreList {
    pub fn new(stores: Vec<StoreDescriptor>) -> Self {
        if stores.is_empty() {
            return Self::default();
        }
        let n = stores.len() as f64;
        let mean_range_count = stores
            .iter()
            .map(|s| f64::from(s.capacity.range_count))
            .sum::<f64>()
            / n;
        let mean_logical_bytes = stores
            .iter()
            .map(|s| s.capacity.logical_bytes as f64)
            .sum::<f64>()
            / n;
        let mean_fraction_used = stores
            .iter()
            .map(|s| s.capacity.fraction_used())
            .sum::<f64>()
            / n;
        Self {
            stores,
            mean_range_count,
            mean_logical_bytes,
            mean_fraction_used,
        }
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn find(&self, store_id: StoreId) -> Option<&StoreDescriptor> {
        self.stores.iter().find(|s| s.store_id == store_id)
    }

    /// Subset of this list, recomputing the means.
    pub fn subset(&self, store_ids: &[StoreId]) -> StoreList {
        StoreList::new(
            self.stores
                .iter()
                .filter(|s| store_ids.contains(&s.store_id))
                .cloned()
                .collect(),
        )
    }
}

/// The store pool surface the allocator and replicate queue consume.
pub trait AllocatorStorePool: Send + Sync {
    fn now_ms(&self) -> u64;

    fn get_store_descriptor(&self, store_id: StoreId) -> Option<StoreDescriptor>;

    /// Every store with a descriptor, regardless of status.
    fn known_stores(&self) -> Vec<StoreDescriptor>;

    /// Available stores (plus throttled ones under `StoreFilter::None`), the
    /// number of alive stores, and why throttled stores were skipped.
    fn get_store_list(&self, filter: StoreFilter) -> (StoreList, usize, ThrottledStoreReasons);

    fn get_store_list_from_ids(
        &self,
        store_ids: &[StoreId],
        filter: StoreFilter,
    ) -> (StoreList, usize, ThrottledStoreReasons);

    /// Splits replicas into live and dead. Replicas on stores of unknown
    /// status are in neither list.
    fn live_and_dead_replicas(
        &self,
        replicas: &[ReplicaDescriptor],
    ) -> (Vec<ReplicaDescriptor>, Vec<ReplicaDescriptor>);

    fn decommissioning_replicas(&self, replicas: &[ReplicaDescriptor]) -> Vec<ReplicaDescriptor>;

    /// Nodes that can hold replicas: known, not dead, not leaving.
    fn available_node_count(&self) -> usize;
}

pub struct StorePool {
    cfg: StorePoolConfig,
    clock: Arc<dyn Clock>,
    liveness: NodeLivenessFn,
    details: Mutex<BTreeMap<StoreId, StoreDetail>>,
    changes: watch::Sender<u64>,
}

impl StorePool {
    pub fn new(cfg: StorePoolConfig, clock: Arc<dyn Clock>, liveness: NodeLivenessFn) -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            cfg,
            clock,
            liveness,
            details: Mutex::new(BTreeMap::new()),
            changes,
        })
    }

    pub fn config(&self) -> StorePoolConfig {
        self.cfg
    }

    /// Gossip callback: replaces the store's descriptor.
    pub fn ingest_descriptor(&self, desc: StoreDescriptor) {
        let now = self.clock.now_ms();
        {
            let mut details = self.details.lock().unwrap();
            let detail = details.entry(desc.store_id).or_default();
            detail.desc = Some(desc);
            detail.last_updated_ms = now;
        }
        self.changes.send_modify(|generation| *generation += 1);
    }

    pub fn remove_store(&self, store_id: StoreId) -> bool {
        let removed = self.details.lock().unwrap().remove(&store_id).is_some();
        if removed {
            self.changes.send_modify(|generation| *generation += 1);
        }
        removed
    }

    /// Receiver that observes a new generation after every descriptor change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Temporarily excludes a store from candidate lists.
    pub fn throttle(&self, reason: ThrottleReason, why: &str, store_id: StoreId) {
        let timeout = match reason {
            ThrottleReason::Declined => self.cfg.declined_reservations_timeout,
            ThrottleReason::Failed => self.cfg.failed_reservations_timeout,
        };
        let until = self.clock.now_ms().saturating_add(duration_ms(timeout));
        let mut details = self.details.lock().unwrap();
        let detail = details.entry(store_id).or_default();
        detail.throttled_until_ms = until;
        detail.throttled_because = why.to_string();
        tracing::debug!(store_id, ?reason, why, until_ms = until, "throttled store");
    }

    pub fn set_throttled_until(&self, store_id: StoreId, until_ms: u64, why: &str) -> bool {
        let mut details = self.details.lock().unwrap();
        let Some(detail) = details.get_mut(&store_id) else {
            return false;
        };
        detail.throttled_until_ms = until_ms;
        detail.throttled_because = why.to_string();
        true
    }

    pub fn store_detail(&self, store_id: StoreId) -> Option<StoreDetail> {
        self.details.lock().unwrap().get(&store_id).cloned()
    }

    pub fn store_status(&self, store_id: StoreId) -> StoreStatus {
        self.status_with(store_id, &self.liveness)
    }

    /// Projects a completed replica change onto the local descriptor so that
    /// decisions made before the next gossip round see it.
    pub fn apply_replica_change(&self, store_id: StoreId, usage: RangeUsageInfo, added: bool) {
        let mut details = self.details.lock().unwrap();
        let Some(desc) = details.get_mut(&store_id).and_then(|d| d.desc.as_mut()) else {
            return;
        };
        let cap = &mut desc.capacity;
        if added {
            cap.range_count = cap.range_count.saturating_add(1);
            cap.logical_bytes = cap.logical_bytes.saturating_add(usage.logical_bytes);
        } else {
            cap.range_count = cap.range_count.saturating_sub(1);
            cap.logical_bytes = cap.logical_bytes.saturating_sub(usage.logical_bytes);
        }
    }

    fn status_with(&self, store_id: StoreId, liveness: &NodeLivenessFn) -> StoreStatus {
        let now = self.clock.now_ms();
        let details = self.details.lock().unwrap();
        match details.get(&store_id) {
            Some(detail) => detail_status(detail, now, self.cfg.time_until_store_dead, liveness),
            None => StoreStatus::Unknown,
        }
    }

    fn snapshot(&self) -> Vec<(StoreId, StoreDetail)> {
        self.details
            .lock()
            .unwrap()
            .iter()
            .map(|(id, d)| (*id, d.clone()))
            .collect()
    }

    fn store_list_with(
        &self,
        store_ids: Option<&[StoreId]>,
        filter: StoreFilter,
        liveness: &NodeLivenessFn,
    ) -> (StoreList, usize, ThrottledStoreReasons) {
        let now = self.clock.now_ms();
        let mut stores = Vec::new();
        let mut alive = 0usize;
        let mut throttled = Vec::new();
        for (store_id, detail) in self.snapshot() {
            if let Some(ids) = store_ids {
                if !ids.contains(&store_id) {
                    continue;
                }
            }
            let Some(desc) = detail.desc.clone() else {
                continue;
            };
            match detail_status(&detail, now, self.cfg.time_until_store_dead, liveness) {
                StoreStatus::Available => {
                    alive += 1;
                    stores.push(desc);
                }
                StoreStatus::Throttled => {
                    alive += 1;
                    throttled.push(format!("s{store_id}: {}", detail.throttled_because));
                    if filter == StoreFilter::None {
                        stores.push(desc);
                    }
                }
                StoreStatus::Dead
                | StoreStatus::Decommissioning
                | StoreStatus::Draining
                | StoreStatus::Unknown => {}
            }
        }
        (StoreList::new(stores), alive, throttled)
    }

    fn live_and_dead_with(
        &self,
        replicas: &[ReplicaDescriptor],
        liveness: &NodeLivenessFn,
    ) -> (Vec<ReplicaDescriptor>, Vec<ReplicaDescriptor>) {
        let mut live = Vec::new();
        let mut dead = Vec::new();
        for replica in replicas {
            match self.status_with(replica.store_id, liveness) {
                StoreStatus::Dead => dead.push(*replica),
                StoreStatus::Available
                | StoreStatus::Throttled
                | StoreStatus::Draining
                | StoreStatus::Decommissioning => live.push(*replica),
                StoreStatus::Unknown => {}
            }
        }
        (live, dead)
    }

    fn decommissioning_with(
        &self,
        replicas: &[ReplicaDescriptor],
        liveness: &NodeLivenessFn,
    ) -> Vec<ReplicaDescriptor> {
        replicas
            .iter()
            .copied()
            .filter(|r| self.status_with(r.store_id, liveness) == StoreStatus::Decommissioning)
            .collect()
    }

    fn available_nodes_with(&self, liveness: &NodeLivenessFn) -> usize {
        let now = self.clock.now_ms();
        let dead_after = self.cfg.time_until_store_dead;
        let nodes: BTreeSet<NodeId> = self
            .snapshot()
            .into_iter()
            .filter_map(|(_, d)| d.desc.map(|desc| desc.node_id()))
            .collect();
        // Only nodes that can take a replica right now count.
        nodes
            .into_iter()
            .filter(|node_id| liveness(*node_id, now, dead_after) == NodeLivenessStatus::Live)
            .count()
    }

    fn known_with(&self) -> Vec<StoreDescriptor> {
        self.snapshot().into_iter().filter_map(|(_, d)| d.desc).collect()
    }
}

fn detail_status(
    detail: &StoreDetail,
    now_ms: u64,
    time_until_store_dead: Duration,
    liveness: &NodeLivenessFn,
) -> StoreStatus {
    let Some(desc) = &detail.desc else {
        return StoreStatus::Unknown;
    };
    if now_ms.saturating_sub(detail.last_updated_ms) >= duration_ms(time_until_store_dead) {
        return StoreStatus::Dead;
    }
    match liveness(desc.node_id(), now_ms, time_until_store_dead) {
        NodeLivenessStatus::Dead => return StoreStatus::Dead,
        NodeLivenessStatus::Decommissioning | NodeLivenessStatus::Decommissioned => {
            return StoreStatus::Decommissioning
        }
        NodeLivenessStatus::Unknown | NodeLivenessStatus::Unavailable => {
            return StoreStatus::Unknown
        }
        NodeLivenessStatus::Draining => return StoreStatus::Draining,
        NodeLivenessStatus::Live => {}
    }
    if detail.throttled_until_ms > now_ms {
        return StoreStatus::Throttled;
    }
    StoreStatus::Available
}

impl AllocatorStorePool for StorePool {
    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn get_store_descriptor(&self, store_id: StoreId) -> Option<StoreDescriptor> {
        self.details
            .lock()
            .unwrap()
            .get(&store_id)
            .and_then(|d| d.desc.clone())
    }

    fn known_stores(&self) -> Vec<StoreDescriptor> {
        self.known_with()
    }

    fn get_store_list(&self, filter: StoreFilter) -> (StoreList, usize, ThrottledStoreReasons) {
        self.store_list_with(None, filter, &self.liveness)
    }

    fn get_store_list_from_ids(
        &self,
        store_ids: &[StoreId],
        filter: StoreFilter,
    ) -> (StoreList, usize, ThrottledStoreReasons) {
        self.store_list_with(Some(store_ids), filter, &self.liveness)
    }

    fn live_and_dead_replicas(
        &self,
        replicas: &[ReplicaDescriptor],
    ) -> (Vec<ReplicaDescriptor>, Vec<ReplicaDescriptor>) {
        self.live_and_dead_with(replicas, &self.liveness)
    }

    fn decommissioning_replicas(&self, replicas: &[ReplicaDescriptor]) -> Vec<ReplicaDescriptor> {
        self.decommissioning_with(replicas, &self.liveness)
    }

    fn available_node_count(&self) -> usize {
        self.available_nodes_with(&self.liveness)
    }
}

/// A store pool sharing another pool's gossiped state but answering liveness
/// questions with its own function.
pub struct OverrideStorePool {
    base: Arc<StorePool>,
    liveness: NodeLivenessFn,
}

impl OverrideStorePool {
    pub fn new<F>(base: Arc<StorePool>, liveness: F) -> Self
    where
        F: Fn(NodeId, u64, Duration) -> NodeLivenessStatus + Send + Sync + 'static,
    {
        Self {
            base,
            liveness: Arc::new(liveness),
        }
    }
}

impl AllocatorStorePool for OverrideStorePool {
    fn now_ms(&self) -> u64 {
        self.base.now_ms()
    }

    fn get_store_descriptor(&self, store_id: StoreId) -> Option<StoreDescriptor> {
        self.base.get_store_descriptor(store_id)
    }

    fn known_stores(&self) -> Vec<StoreDescriptor> {
        self.base.known_with()
    }

    fn get_store_list(&self, filter: StoreFilter) -> (StoreList, usize, ThrottledStoreReasons) {
        self.base.store_list_with(None, filter, &self.liveness)
    }

    fn get_store_list_from_ids(
        &self,
        store_ids: &[StoreId],
        filter: StoreFilter,
    ) -> (StoreList, usize, ThrottledStoreReasons) {
        self.base.store_list_with(Some(store_ids), filter, &self.liveness)
    }

    fn live_and_dead_replicas(
        &self,
        replicas: &[ReplicaDescriptor],
    ) -> (Vec<ReplicaDescriptor>, Vec<ReplicaDescriptor>) {
        self.base.live_and_dead_with(replicas, &self.liveness)
    }

    fn decommissioning_replicas(&self, replicas: &[ReplicaDescriptor]) -> Vec<ReplicaDescriptor> {
        self.base.decommissioning_with(replicas, &self.liveness)
    }

    fn available_node_count(&self) -> usize {
        self.base.available_nodes_with(&self.liveness)
    }
}
