//! Node liveness: self heartbeating plus a cache of every node's record.
//!
//! Heartbeats extend this node's expiration with a conditional write against
//! the version last read. Records for other nodes arrive either from our own
//! writes or from passive observation (gossip) and only replace the cached
//! entry when they are newer.
//!
//! The heartbeat loop is owned by a spawned task and steered through a
//! control channel. It only reads control messages between heartbeats, so an
//! acknowledged pause proves no heartbeat is in flight and none will start
//! until the pause is released.

pub mod record;
pub mod storage;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::{duration_ms, Clock};
use crate::error::{EpochIncremented, LivenessConditionFailed, MembershipTransitionError};
use crate::types::NodeId;

pub use record::{Liveness, MembershipStatus, NodeLivenessStatus, Record};
pub use storage::{LivenessStorage, LivenessUpdate, MemLivenessStorage, UpdateOutcome};

use record::should_replace;

/// Conditional writes are attempted once more against a fresh read before
/// giving up.
const MAX_CONDITIONAL_ATTEMPTS: u32 = 2;

#[derive(Clone, Copy, Debug)]
pub struct LivenessConfig {
    pub node_id: NodeId,
    /// How far past "now" each heartbeat pushes the expiration.
    pub liveness_threshold: Duration,
    pub heartbeat_interval: Duration,
}

impl LivenessConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            liveness_threshold: Duration::from_millis(9_000),
            heartbeat_interval: Duration::from_millis(4_500),
        }
    }
}

/// Invoked when a node goes from not-live (or unknown) to live.
pub type OnLiveCallback = Arc<dyn Fn(&Liveness) + Send + Sync>;

enum LoopControl {
    Pause { ack: oneshot::Sender<()> },
    Resume,
    Shutdown,
}

pub struct NodeLiveness {
    cfg: LivenessConfig,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn LivenessStorage>,
    cache: Mutex<HashMap<NodeId, Record>>,
    callbacks: Mutex<Vec<OnLiveCallback>>,
    // Gate for writes to our own record vs. writes to other nodes' records.
    self_sem: Arc<Semaphore>,
    other_sem: Arc<Semaphore>,
    control: Mutex<Option<mpsc::UnboundedSender<LoopControl>>>,
}

impl NodeLiveness {
    pub fn new(
        cfg: LivenessConfig,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn LivenessStorage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            clock,
            storage,
            cache: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            self_sem: Arc::new(Semaphore::new(1)),
            other_sem: Arc::new(Semaphore::new(1)),
            control: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn liveness_threshold(&self) -> Duration {
        self.cfg.liveness_threshold
    }

    /// Spawns the heartbeat loop. The first heartbeat fires immediately.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut control = self.control.lock().unwrap();
            if control.is_some() {
                anyhow::bail!("heartbeat loop for n{} already started", self.cfg.node_id);
            }
            *control = Some(tx);
        }
        let this = self.clone();
        Ok(tokio::spawn(async move { this.heartbeat_loop(rx).await }))
    }

    /// Stops the heartbeat loop after any in-flight heartbeat finishes.
    pub fn stop(&self) {
        if let Some(tx) = self.control.lock().unwrap().take() {
            let _ = tx.send(LoopControl::Shutdown);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut control: mpsc::UnboundedReceiver<LoopControl>) {
        let mut ticker = tokio::time::interval(self.cfg.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                cmd = control.recv() => match cmd {
                    Some(LoopControl::Pause { ack }) => {
                        let _ = ack.send(());
                        if !wait_for_resume(&mut control).await {
                            return;
                        }
                        ticker.reset();
                    }
                    Some(LoopControl::Resume) => {}
                    Some(LoopControl::Shutdown) | None => return,
                },
                _ = ticker.tick() => {
                    match self.heartbeat().await {
                        Ok(liveness) => tracing::trace!(
                            node_id = liveness.node_id,
                            epoch = liveness.epoch,
                            expiration_ms = liveness.expiration_ms,
                            "heartbeat"
                        ),
                        Err(err) => tracing::warn!(
                            node_id = self.cfg.node_id,
                            error = ?err,
                            "failed node liveness heartbeat"
                        ),
                    }
                }
            }
        }
    }

    /// Suspends the heartbeat loop. Returns once any in-flight heartbeat has
    /// drained; no heartbeat runs until the returned pause is released.
    pub async fn pause_heartbeat_loop(&self) -> anyhow::Result<HeartbeatPause> {
        let tx = self
            .control
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("heartbeat loop for n{} not running", self.cfg.node_id))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(LoopControl::Pause { ack: ack_tx })
            .map_err(|_| anyhow::anyhow!("heartbeat loop for n{} exited", self.cfg.node_id))?;
        ack_rx
            .await
            .map_err(|_| anyhow::anyhow!("heartbeat loop for n{} exited", self.cfg.node_id))?;
        Ok(HeartbeatPause { control: Some(tx) })
    }

    /// Blocks heartbeats issued outside the loop, for this node and for
    /// others, until the guard drops.
    pub async fn pause_synchronous_heartbeats(&self) -> anyhow::Result<SynchronousPause> {
        let self_permit = self.self_sem.clone().acquire_owned().await?;
        let other_permit = self.other_sem.clone().acquire_owned().await?;
        Ok(SynchronousPause {
            _self_permit: self_permit,
            _other_permit: other_permit,
        })
    }

    /// Loop first, so the loop can't be left waiting on a held gate.
    pub async fn pause_all_heartbeats(&self) -> anyhow::Result<(HeartbeatPause, SynchronousPause)> {
        let paused_loop = self.pause_heartbeat_loop().await?;
        let paused_sync = self.pause_synchronous_heartbeats().await?;
        Ok((paused_loop, paused_sync))
    }

    /// Extends this node's liveness.
    pub async fn heartbeat(&self) -> anyhow::Result<Liveness> {
        let _permit = self.self_sem.acquire().await?;
        let node_id = self.cfg.node_id;
        let mut expected = self.self_record().await?;
        for attempt in 1..=MAX_CONDITIONAL_ATTEMPTS {
            let mut next = expected.liveness.clone();
            next.expiration_ms = self
                .clock
                .now_ms()
                .saturating_add(duration_ms(self.cfg.liveness_threshold))
                .max(expected.liveness.expiration_ms);
            let outcome = self
                .storage
                .update(LivenessUpdate {
                    new_liveness: next.clone(),
                    expected: expected.clone(),
                })
                .await?;
            match outcome {
                UpdateOutcome::Committed(record) => {
                    self.maybe_update(record.clone());
                    return Ok(record.liveness);
                }
                UpdateOutcome::ConditionFailed(actual) => {
                    self.maybe_update(actual.clone());
                    if actual.liveness.epoch > next.epoch {
                        return Err(EpochIncremented {
                            node_id,
                            expected: next.epoch,
                            actual: actual.liveness.epoch,
                        }
                        .into());
                    }
                    if actual.liveness.epoch == next.epoch
                        && actual.liveness.expiration_ms >= next.expiration_ms
                    {
                        // A concurrent writer already extended us far enough.
                        return Ok(actual.liveness);
                    }
                    tracing::debug!(
                        node_id,
                        attempt,
                        expected_version = expected.version,
                        actual_version = actual.version,
                        "liveness heartbeat lost conditional write; retrying"
                    );
                    expected = actual;
                }
            }
        }
        Err(LivenessConditionFailed {
            node_id,
            attempts: MAX_CONDITIONAL_ATTEMPTS,
        }
        .into())
    }

    /// Bumps the epoch of a node whose liveness has expired, invalidating
    /// anything it holds under the old epoch.
    pub async fn increment_epoch(&self, node_id: NodeId) -> anyhow::Result<u64> {
        let _permit = self.sem(node_id).acquire().await?;
        let mut expected = self.read_record(node_id).await?;
        for attempt in 1..=MAX_CONDITIONAL_ATTEMPTS {
            if expected.liveness.is_live(self.clock.now_ms()) {
                anyhow::bail!("cannot increment epoch on live node n{node_id}");
            }
            let mut next = expected.liveness.clone();
            next.epoch += 1;
            match self
                .storage
                .update(LivenessUpdate {
                    new_liveness: next,
                    expected: expected.clone(),
                })
                .await?
            {
                UpdateOutcome::Committed(record) => {
                    tracing::info!(node_id, epoch = record.liveness.epoch, "incremented liveness epoch");
                    self.maybe_update(record.clone());
                    return Ok(record.liveness.epoch);
                }
                UpdateOutcome::ConditionFailed(actual) => {
                    self.maybe_update(actual.clone());
                    if actual.liveness.epoch > expected.liveness.epoch {
                        return Ok(actual.liveness.epoch);
                    }
                    tracing::debug!(node_id, attempt, "epoch increment lost conditional write; retrying");
                    expected = actual;
                }
            }
        }
        Err(LivenessConditionFailed {
            node_id,
            attempts: MAX_CONDITIONAL_ATTEMPTS,
        }
        .into())
    }

    /// Moves a node's membership forward. Returns `false` when the node is
    /// already at `target`.
    pub async fn set_membership_status(
        &self,
        node_id: NodeId,
        target: MembershipStatus,
    ) -> anyhow::Result<bool> {
        let _permit = self.sem(node_id).acquire().await?;
        let mut expected = self.read_record(node_id).await?;
        for attempt in 1..=MAX_CONDITIONAL_ATTEMPTS {
            let from = expected.liveness.membership;
            if from == target {
                return Ok(false);
            }
            if !from.can_transition_to(target) {
                return Err(MembershipTransitionError {
                    node_id,
                    from,
                    to: target,
                }
                .into());
            }
            let mut next = expected.liveness.clone();
            next.membership = target;
            match self
                .storage
                .update(LivenessUpdate {
                    new_liveness: next,
                    expected: expected.clone(),
                })
                .await?
            {
                UpdateOutcome::Committed(record) => {
                    tracing::info!(node_id, from = ?from, to = ?target, "membership status changed");
                    self.maybe_update(record);
                    return Ok(true);
                }
                UpdateOutcome::ConditionFailed(actual) => {
                    self.maybe_update(actual.clone());
                    tracing::debug!(node_id, attempt, "membership update lost conditional write; retrying");
                    expected = actual;
                }
            }
        }
        Err(LivenessConditionFailed {
            node_id,
            attempts: MAX_CONDITIONAL_ATTEMPTS,
        }
        .into())
    }

    pub async fn set_draining(&self, drain: bool) -> anyhow::Result<()> {
        let node_id = self.cfg.node_id;
        let _permit = self.self_sem.acquire().await?;
        let mut expected = self.read_record(node_id).await?;
        for _ in 1..=MAX_CONDITIONAL_ATTEMPTS {
            if expected.liveness.draining == drain {
                return Ok(());
            }
            let mut next = expected.liveness.clone();
            next.draining = drain;
            match self
                .storage
                .update(LivenessUpdate {
                    new_liveness: next,
                    expected: expected.clone(),
                })
                .await?
            {
                UpdateOutcome::Committed(record) => {
                    tracing::info!(node_id, drain, "draining flag changed");
                    self.maybe_update(record);
                    return Ok(());
                }
                UpdateOutcome::ConditionFailed(actual) => {
                    self.maybe_update(actual.clone());
                    expected = actual;
                }
            }
        }
        Err(LivenessConditionFailed {
            node_id,
            attempts: MAX_CONDITIONAL_ATTEMPTS,
        }
        .into())
    }

    /// Feeds a record learned from gossip into the cache.
    pub fn observe(&self, record: Record) -> bool {
        self.maybe_update(record)
    }

    /// Re-reads every record from storage into the cache.
    pub async fn scan(&self) -> anyhow::Result<Vec<Record>> {
        let records = self.storage.scan().await?;
        for record in &records {
            self.maybe_update(record.clone());
        }
        Ok(records)
    }

    pub fn get_liveness(&self, node_id: NodeId) -> Option<Record> {
        self.cache.lock().unwrap().get(&node_id).cloned()
    }

    pub fn is_live(&self, node_id: NodeId) -> bool {
        let now = self.clock.now_ms();
        self.cache
            .lock()
            .unwrap()
            .get(&node_id)
            .map(|r| r.liveness.is_live(now))
            .unwrap_or(false)
    }

    pub fn is_live_map(&self) -> HashMap<NodeId, bool> {
        let now = self.clock.now_ms();
        self.cache
            .lock()
            .unwrap()
            .iter()
            .map(|(id, r)| (*id, r.liveness.is_live(now)))
            .collect()
    }

    pub fn liveness_status(
        &self,
        node_id: NodeId,
        now_ms: u64,
        dead_threshold: Duration,
    ) -> NodeLivenessStatus {
        self.cache
            .lock()
            .unwrap()
            .get(&node_id)
            .map(|r| r.liveness.status(now_ms, dead_threshold))
            .unwrap_or(NodeLivenessStatus::Unknown)
    }

    pub fn register_on_live_callback(&self, cb: OnLiveCallback) {
        self.callbacks.lock().unwrap().push(cb);
    }

    /// Replaces the cached record if `record` is newer, firing on-live
    /// callbacks when the node transitions to live.
    fn maybe_update(&self, record: Record) -> bool {
        let now = self.clock.now_ms();
        let became_live = {
            let mut cache = self.cache.lock().unwrap();
            let old = cache.get(&record.liveness.node_id);
            if let Some(old) = old {
                let same_but_newer_version =
                    old.liveness == record.liveness && record.version > old.version;
                if !should_replace(&old.liveness, &record.liveness) && !same_but_newer_version {
                    return false;
                }
            }
            let was_live = old.map(|o| o.liveness.is_live(now)).unwrap_or(false);
            let became_live = !was_live && record.liveness.is_live(now);
            cache.insert(record.liveness.node_id, record.clone());
            became_live
        };
        if became_live {
            let callbacks = self.callbacks.lock().unwrap().clone();
            for cb in callbacks {
                cb(&record.liveness);
            }
        }
        true
    }

    async fn self_record(&self) -> anyhow::Result<Record> {
        if let Some(record) = self.get_liveness(self.cfg.node_id) {
            return Ok(record);
        }
        let node_id = self.cfg.node_id;
        if self.storage.get(node_id).await?.is_none() {
            self.storage.create(node_id).await?;
            tracing::info!(node_id, "created liveness record");
        }
        self.read_record(node_id).await
    }

    async fn read_record(&self, node_id: NodeId) -> anyhow::Result<Record> {
        let record = self
            .storage
            .get(node_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("liveness record for n{node_id} not found"))?;
        self.maybe_update(record.clone());
        Ok(record)
    }

    fn sem(&self, node_id: NodeId) -> &Semaphore {
        if node_id == self.cfg.node_id {
            &self.self_sem
        } else {
            &self.other_sem
        }
    }
}

/// Returns `false` if the loop should exit instead of resuming.
async fn wait_for_resume(control: &mut mpsc::UnboundedReceiver<LoopControl>) -> bool {
    let mut depth = 1usize;
    while let Some(cmd) = control.recv().await {
        match cmd {
            LoopControl::Pause { ack } => {
                depth += 1;
                let _ = ack.send(());
            }
            LoopControl::Resume => {
                depth -= 1;
                if depth == 0 {
                    return true;
                }
            }
            LoopControl::Shutdown => return false,
        }
    }
    false
}

/// Holds the heartbeat loop paused. Resumes on `resume` or drop.
pub struct HeartbeatPause {
    control: Option<mpsc::UnboundedSender<LoopControl>>,
}

impl HeartbeatPause {
    pub fn resume(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(tx) = self.control.take() {
            let _ = tx.send(LoopControl::Resume);
        }
    }
}

impl Drop for HeartbeatPause {
    fn drop(&mut self) {
        self.release();
    }
}

/// Holds both synchronous heartbeat gates.
pub struct SynchronousPause {
    _self_permit: OwnedSemaphorePermit,
    _other_permit: OwnedSemaphorePermit,
}
