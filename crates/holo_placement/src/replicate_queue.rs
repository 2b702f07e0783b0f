//! Replicate queue: decides what each range needs and carries it out.
//!
//! `check_range_action` is the pure decision step. The queue around it
//! feeds ranges from a periodic scan into a bounded worker pool, executes
//! the chosen change through `ReplicaChanger`, parks ranges that found no
//! eligible store in purgatory, and stops on the first invariant violation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify, Semaphore};

use crate::allocator::{filter_unremovable_replicas, Allocator, AllocatorAction};
use crate::clock::Clock;
use crate::error::{is_fatal, is_purgatory_error};
use crate::purgatory::Purgatory;
use crate::store_pool::{AllocatorStorePool, StoreFilter, StorePool, ThrottleReason};
use crate::types::{
    RangeDescriptor, RangeId, RangeUsageInfo, ReplicaDescriptor, ReplicaType, ReplicationStatus,
    ReplicationTarget, SpanConfig, StoreId,
};

/// Span configuration lookup.
pub trait SpanConfigSource: Send + Sync {
    fn span_config(&self, range_id: RangeId) -> anyhow::Result<SpanConfig>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaChange {
    Add {
        target: ReplicationTarget,
        replica_type: ReplicaType,
    },
    Remove {
        target: ReplicationTarget,
    },
}

/// The consensus layer as seen by the queue: range snapshots in, replica
/// changes out.
#[async_trait]
pub trait ReplicaChanger: Send + Sync {
    async fn range_ids(&self) -> anyhow::Result<Vec<RangeId>>;

    async fn range_descriptor(&self, range_id: RangeId) -> anyhow::Result<RangeDescriptor>;

    /// Leader-side progress, if this node currently leads the range.
    async fn replication_status(&self, range_id: RangeId)
        -> anyhow::Result<Option<ReplicationStatus>>;

    async fn range_usage(&self, range_id: RangeId) -> anyhow::Result<RangeUsageInfo>;

    /// Applies `changes` atomically if the range still matches `expected`.
    async fn change_replicas(
        &self,
        range_id: RangeId,
        expected: &RangeDescriptor,
        changes: &[ReplicaChange],
    ) -> anyhow::Result<RangeDescriptor>;

    /// Leaves the joint configuration of an in-flight atomic change.
    async fn finalize_atomic_change(
        &self,
        range_id: RangeId,
        expected: &RangeDescriptor,
    ) -> anyhow::Result<RangeDescriptor>;
}

/// Outcome of `check_range_action`. An allocation failure is reported next
/// to the action that needed it rather than replacing it.
#[derive(Debug)]
pub struct RangeCheck {
    pub action: AllocatorAction,
    pub priority: f64,
    pub target: ReplicationTarget,
    /// The dead or decommissioning replica a replace action stands in for.
    pub replacing: Option<ReplicaDescriptor>,
    pub error: Option<anyhow::Error>,
}

impl RangeCheck {
    fn without_target(action: AllocatorAction, priority: f64) -> Self {
        Self {
            action,
            priority,
            target: ReplicationTarget::default(),
            replacing: None,
            error: None,
        }
    }
}

/// Decides what `desc` needs next under `conf`. Adds and replacements come
/// with a target; removals and rebalancing are resolved at execution time.
pub fn check_range_action(
    allocator: &Allocator,
    sp: &dyn AllocatorStorePool,
    desc: &RangeDescriptor,
    conf: &SpanConfig,
) -> RangeCheck {
    if let Err(violation) = desc.validate() {
        let mut check = RangeCheck::without_target(AllocatorAction::Noop, 0.0);
        check.error = Some(violation.into());
        return check;
    }
    let (action, priority) = allocator.compute_action(sp, conf, desc);
    let voters = desc.voters();
    let non_voters = desc.non_voters();
    let usage = RangeUsageInfo::default();

    let replacing = match action {
        AllocatorAction::ReplaceDeadVoter => sp.live_and_dead_replicas(&voters).1.first().copied(),
        AllocatorAction::ReplaceDeadNonVoter => {
            sp.live_and_dead_replicas(&non_voters).1.first().copied()
        }
        AllocatorAction::ReplaceDecommissioningVoter => {
            sp.decommissioning_replicas(&voters).first().copied()
        }
        AllocatorAction::ReplaceDecommissioningNonVoter => {
            sp.decommissioning_replicas(&non_voters).first().copied()
        }
        _ => None,
    };
    let allocated = match action {
        AllocatorAction::AddVoter
        | AllocatorAction::ReplaceDeadVoter
        | AllocatorAction::ReplaceDecommissioningVoter => allocator.allocate_voter(
            sp,
            conf,
            &voters,
            &non_voters,
            replacing.as_ref(),
            &usage,
        ),
        AllocatorAction::AddNonVoter
        | AllocatorAction::ReplaceDeadNonVoter
        | AllocatorAction::ReplaceDecommissioningNonVoter => allocator.allocate_non_voter(
            sp,
            conf,
            &voters,
            &non_voters,
            replacing.as_ref(),
            &usage,
        ),
        _ => return RangeCheck::without_target(action, priority),
    };

    let mut check = RangeCheck::without_target(action, priority);
    check.replacing = replacing;
    match allocated {
        Ok((target, _details)) => check.target = target,
        Err(err) => check.error = Some(err),
    }
    check
}

#[derive(Clone, Copy, Debug)]
pub struct ReplicateQueueConfig {
    /// Store this queue runs on. Used to find the local leaseholder.
    pub store_id: StoreId,
    /// Ranges processed concurrently.
    pub workers: usize,
    /// How often every range is re-queued.
    pub scan_interval: Duration,
    /// Fallback retry for purgatory when the store pool stays quiet.
    pub purgatory_interval: Duration,
}

impl ReplicateQueueConfig {
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            workers: 4,
            scan_interval: Duration::from_secs(10),
            purgatory_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing to do, or nothing safe to do right now.
    Noop,
    Changed(AllocatorAction),
    Purgatory,
}

pub struct ReplicateQueue {
    cfg: ReplicateQueueConfig,
    allocator: Arc<Allocator>,
    store_pool: Arc<StorePool>,
    changer: Arc<dyn ReplicaChanger>,
    configs: Arc<dyn SpanConfigSource>,
    clock: Arc<dyn Clock>,
    purgatory: Purgatory,
    // Ranges queued or being processed.
    queued: Mutex<HashSet<RangeId>>,
    work_tx: mpsc::UnboundedSender<RangeId>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<RangeId>>>,
    shutdown: Notify,
}

impl ReplicateQueue {
    pub fn new(
        cfg: ReplicateQueueConfig,
        allocator: Arc<Allocator>,
        store_pool: Arc<StorePool>,
        changer: Arc<dyn ReplicaChanger>,
        configs: Arc<dyn SpanConfigSource>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            cfg,
            allocator,
            store_pool,
            changer,
            configs,
            clock,
            purgatory: Purgatory::new(),
            queued: Mutex::new(HashSet::new()),
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            shutdown: Notify::new(),
        })
    }

    pub fn check_range_action(&self, desc: &RangeDescriptor, conf: &SpanConfig) -> RangeCheck {
        check_range_action(&self.allocator, self.store_pool.as_ref(), desc, conf)
    }

    /// Queues a range unless it is already queued or waiting in purgatory.
    pub fn maybe_add(&self, range_id: RangeId) -> bool {
        if self.purgatory.contains(range_id) {
            return false;
        }
        if !self.queued.lock().unwrap().insert(range_id) {
            return false;
        }
        if self.work_tx.send(range_id).is_err() {
            self.queued.lock().unwrap().remove(&range_id);
            return false;
        }
        true
    }

    pub fn purgatory_len(&self) -> usize {
        self.purgatory.len()
    }

    pub fn in_purgatory(&self, range_id: RangeId) -> bool {
        self.purgatory.contains(range_id)
    }

    /// Stops `run`. Workers already spawned finish their current range.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Drives the queue until `stop` or an invariant violation, which is
    /// returned as the error.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut work_rx = self
            .work_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("replicate queue for s{} already running", self.cfg.store_id))?;
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<anyhow::Error>();
        let workers = Arc::new(Semaphore::new(self.cfg.workers.max(1)));
        let mut scan = tokio::time::interval(self.cfg.scan_interval);
        let mut purgatory_tick = tokio::time::interval(self.cfg.purgatory_interval);
        purgatory_tick.reset();
        let mut store_changes = self.store_pool.subscribe();

        loop {
            tokio::select! {
                biased;
                Some(err) = fatal_rx.recv() => {
                    tracing::error!(
                        store_id = self.cfg.store_id,
                        error = ?err,
                        "replicate queue stopping on invariant violation"
                    );
                    return Err(err);
                }
                _ = self.shutdown.notified() => return Ok(()),
                _ = scan.tick() => {
                    if let Err(err) = self.scan_ranges().await {
                        tracing::warn!(error = ?err, "replicate queue scan failed");
                    }
                }
                res = store_changes.changed() => {
                    if res.is_ok() {
                        self.retry_purgatory("store pool changed");
                    }
                }
                _ = purgatory_tick.tick() => self.retry_purgatory("interval"),
                Some(range_id) = work_rx.recv() => {
                    // Waiting for a worker happens off the loop so a stuck
                    // change cannot hold up shutdown.
                    let workers = workers.clone();
                    let this = self.clone();
                    let fatal_tx = fatal_tx.clone();
                    tokio::spawn(async move {
                        let Ok(_permit) = workers.acquire_owned().await else {
                            this.queued.lock().unwrap().remove(&range_id);
                            return;
                        };
                        let res = this.process_one(range_id).await;
                        this.queued.lock().unwrap().remove(&range_id);
                        match res {
                            Ok(ProcessOutcome::Changed(action)) => {
                                tracing::debug!(range_id, %action, "range changed; requeueing");
                                this.maybe_add(range_id);
                            }
                            Ok(_) => {}
                            Err(err) if is_fatal(&err) => {
                                let _ = fatal_tx.send(err);
                            }
                            Err(err) => {
                                tracing::warn!(range_id, error = ?err, "failed to process range");
                            }
                        }
                    });
                }
            }
        }
    }

    async fn scan_ranges(&self) -> anyhow::Result<()> {
        let range_ids = self.changer.range_ids().await?;
        let mut added = 0usize;
        for range_id in range_ids {
            if self.maybe_add(range_id) {
                added += 1;
            }
        }
        tracing::trace!(added, "replicate queue scan");
        Ok(())
    }

    fn retry_purgatory(&self, reason: &str) {
        let parked = self.purgatory.drain();
        if parked.is_empty() {
            return;
        }
        tracing::debug!(ranges = parked.len(), reason, "retrying ranges in purgatory");
        for range_id in parked {
            self.maybe_add(range_id);
        }
    }

    /// Decides and executes the next step for one range.
    pub async fn process_one(&self, range_id: RangeId) -> anyhow::Result<ProcessOutcome> {
        let desc = self.changer.range_descriptor(range_id).await?;
        let conf = self.configs.span_config(range_id)?;
        let check = self.check_range_action(&desc, &conf);

        if let Some(err) = check.error {
            if is_fatal(&err) {
                return Err(err);
            }
            if is_purgatory_error(&err) {
                let now = self.clock.now_ms();
                if self.purgatory.insert(range_id, &err, now) {
                    tracing::warn!(
                        range_id,
                        action = %check.action,
                        error = %err,
                        "range entered purgatory"
                    );
                }
                return Ok(ProcessOutcome::Purgatory);
            }
            return Err(err.context(format!("r{range_id}: {}", check.action)));
        }
        self.purgatory.remove(range_id);

        let usage = self.changer.range_usage(range_id).await?;
        let status = self.changer.replication_status(range_id).await?;
        let leaseholder = status.as_ref().and_then(|s| leader_store(&desc, s));

        match check.action {
            AllocatorAction::Noop => Ok(ProcessOutcome::Noop),
            AllocatorAction::FinalizeAtomicReplicationChange => {
                self.changer.finalize_atomic_change(range_id, &desc).await?;
                tracing::info!(range_id, "finalized atomic replication change");
                Ok(ProcessOutcome::Changed(check.action))
            }
            AllocatorAction::AddVoter | AllocatorAction::AddNonVoter => {
                let replica_type = match check.action {
                    AllocatorAction::AddVoter => ReplicaType::Voter,
                    _ => ReplicaType::NonVoter,
                };
                let changes = [ReplicaChange::Add {
                    target: check.target,
                    replica_type,
                }];
                self.apply(range_id, &desc, &changes, &usage, check.action).await
            }
            AllocatorAction::ReplaceDeadVoter
            | AllocatorAction::ReplaceDeadNonVoter
            | AllocatorAction::ReplaceDecommissioningVoter
            | AllocatorAction::ReplaceDecommissioningNonVoter => {
                let replaced = check.replacing.ok_or_else(|| {
                    anyhow::anyhow!("r{range_id}: {} without a replica to replace", check.action)
                })?;
                desc.replica_index(replaced.store_id)?;
                let changes = [
                    ReplicaChange::Add {
                        target: check.target,
                        replica_type: replaced.replica_type,
                    },
                    ReplicaChange::Remove {
                        target: replaced.target(),
                    },
                ];
                self.apply(range_id, &desc, &changes, &usage, check.action).await
            }
            AllocatorAction::RemoveDeadVoter | AllocatorAction::RemoveDeadNonVoter => {
                let replicas = match check.action {
                    AllocatorAction::RemoveDeadVoter => desc.voters(),
                    _ => desc.non_voters(),
                };
                let (_, dead) = self.store_pool.live_and_dead_replicas(&replicas);
                self.remove_one(range_id, &desc, dead.first(), &usage, check.action)
                    .await
            }
            AllocatorAction::RemoveDecommissioningVoter
            | AllocatorAction::RemoveDecommissioningNonVoter => {
                let replicas = match check.action {
                    AllocatorAction::RemoveDecommissioningVoter => desc.voters(),
                    _ => desc.non_voters(),
                };
                let decommissioning = self.store_pool.decommissioning_replicas(&replicas);
                self.remove_one(range_id, &desc, decommissioning.first(), &usage, check.action)
                    .await
            }
            AllocatorAction::RemoveVoter => {
                let voters = desc.voters();
                let candidates = match &status {
                    Some(status) => filter_unremovable_replicas(status, &voters, None),
                    None => voters.clone(),
                };
                if candidates.is_empty() {
                    tracing::debug!(range_id, "no voter can be removed without losing quorum");
                    return Ok(ProcessOutcome::Noop);
                }
                let (target, details) = self.allocator.remove_voter(
                    self.store_pool.as_ref(),
                    &conf,
                    &candidates,
                    &voters,
                    &desc.non_voters(),
                    leaseholder,
                )?;
                tracing::debug!(range_id, store_id = target.store_id, %details, "removing voter");
                let removed = desc.replicas[desc.replica_index(target.store_id)?];
                self.remove_one(range_id, &desc, Some(&removed), &usage, check.action)
                    .await
            }
            AllocatorAction::RemoveNonVoter => {
                let non_voters = desc.non_voters();
                let (target, details) = self.allocator.remove_non_voter(
                    self.store_pool.as_ref(),
                    &conf,
                    &non_voters,
                    &desc.voters(),
                    &non_voters,
                )?;
                tracing::debug!(range_id, store_id = target.store_id, %details, "removing non-voter");
                let removed = desc.replicas[desc.replica_index(target.store_id)?];
                self.remove_one(range_id, &desc, Some(&removed), &usage, check.action)
                    .await
            }
            AllocatorAction::ConsiderRebalance => {
                self.consider_rebalance(range_id, &desc, &conf, status.as_ref(), leaseholder, &usage)
                    .await
            }
        }
    }

    async fn consider_rebalance(
        &self,
        range_id: RangeId,
        desc: &RangeDescriptor,
        conf: &SpanConfig,
        status: Option<&ReplicationStatus>,
        leaseholder: Option<StoreId>,
        usage: &RangeUsageInfo,
    ) -> anyhow::Result<ProcessOutcome> {
        let opts = self.allocator.scorer_options();
        let voters = desc.voters();
        let non_voters = desc.non_voters();
        let sp = self.store_pool.as_ref();

        let voter_move = self
            .allocator
            .rebalance_voter(
                sp,
                conf,
                status,
                &voters,
                &non_voters,
                usage,
                StoreFilter::Throttled,
                &opts,
            )
            .filter(|decision| {
                let removes_leaseholder = Some(decision.origin.store_id) == leaseholder;
                if removes_leaseholder {
                    tracing::debug!(
                        range_id,
                        origin = %decision.origin,
                        "skipping rebalance that would remove the leaseholder"
                    );
                }
                !removes_leaseholder
            });
        let (decision, replica_type) = match voter_move {
            Some(decision) => (decision, ReplicaType::Voter),
            None => match self.allocator.rebalance_non_voter(
                sp,
                conf,
                &voters,
                &non_voters,
                usage,
                StoreFilter::Throttled,
                &opts,
            ) {
                Some(decision) => (decision, ReplicaType::NonVoter),
                None => return Ok(ProcessOutcome::Noop),
            },
        };
        desc.replica_index(decision.origin.store_id)?;
        tracing::debug!(range_id, details = %decision.details, "rebalance candidates");
        let changes = [
            ReplicaChange::Add {
                target: decision.target,
                replica_type,
            },
            ReplicaChange::Remove {
                target: decision.origin,
            },
        ];
        self.apply(range_id, desc, &changes, usage, AllocatorAction::ConsiderRebalance)
            .await
    }

    async fn remove_one(
        &self,
        range_id: RangeId,
        desc: &RangeDescriptor,
        replica: Option<&ReplicaDescriptor>,
        usage: &RangeUsageInfo,
        action: AllocatorAction,
    ) -> anyhow::Result<ProcessOutcome> {
        let Some(replica) = replica else {
            tracing::debug!(range_id, %action, "replica to remove already gone");
            return Ok(ProcessOutcome::Noop);
        };
        desc.replica_index(replica.store_id)?;
        let changes = [ReplicaChange::Remove {
            target: replica.target(),
        }];
        self.apply(range_id, desc, &changes, usage, action).await
    }

    async fn apply(
        &self,
        range_id: RangeId,
        desc: &RangeDescriptor,
        changes: &[ReplicaChange],
        usage: &RangeUsageInfo,
        action: AllocatorAction,
    ) -> anyhow::Result<ProcessOutcome> {
        if let Err(err) = self.changer.change_replicas(range_id, desc, changes).await {
            for change in changes {
                if let ReplicaChange::Add { target, .. } = change {
                    self.store_pool
                        .throttle(ThrottleReason::Failed, &err.to_string(), target.store_id);
                }
            }
            return Err(err.context(format!("r{range_id}: {action}")));
        }
        for change in changes {
            match change {
                ReplicaChange::Add { target, .. } => {
                    self.store_pool
                        .apply_replica_change(target.store_id, *usage, true);
                }
                ReplicaChange::Remove { target } => {
                    self.store_pool
                        .apply_replica_change(target.store_id, *usage, false);
                }
            }
        }
        tracing::info!(range_id, %action, ?changes, "changed replicas");
        Ok(ProcessOutcome::Changed(action))
    }
}

fn leader_store(desc: &RangeDescriptor, status: &ReplicationStatus) -> Option<StoreId> {
    desc.replicas
        .iter()
        .find(|r| r.replica_id == status.leader)
        .map(|r| r.store_id)
}
