//! The replicate queue against the in-memory cluster: ranges without
//! capacity wait in purgatory and come back when a store joins.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{simple_config, store, voters};
use holo_placement::clock::Clock;
use holo_placement::error::ThrottledStoresError;
use holo_placement::replicate_queue::{
    ProcessOutcome, ReplicaChange, ReplicaChanger, ReplicateQueue, ReplicateQueueConfig,
};
use holo_placement::sim::{Scenario, ScenarioRange, SimCluster};
use holo_placement::store_pool::{StorePool, StoreStatus};
use holo_placement::testutil::create_test_allocator;
use holo_placement::types::{
    RangeDescriptor, RangeId, RangeUsageInfo, ReplicationStatus,
};
use holo_placement::AllocatorAction;

struct Harness {
    sim: Arc<SimCluster>,
    store_pool: Arc<StorePool>,
    queue: Arc<ReplicateQueue>,
}

fn harness(num_stores: u64, cfg: ReplicateQueueConfig) -> Harness {
    let (store_pool, allocator, clock, _gossiper) = create_test_allocator(3, true);
    let scenario = Scenario {
        stores: (1..=num_stores).map(|id| store(id, id)).collect(),
        ranges: vec![ScenarioRange {
            range_id: 1,
            replicas: voters(&[(1, 1)]),
            config: simple_config(3),
            ..ScenarioRange::default()
        }],
        ..Scenario::default()
    };
    let sim = SimCluster::new(&scenario, store_pool.clone()).expect("scenario");
    let clock: Arc<dyn Clock> = clock;
    let queue = ReplicateQueue::new(
        cfg,
        Arc::new(allocator),
        store_pool.clone(),
        sim.clone(),
        sim.clone(),
        clock,
    );
    Harness {
        sim,
        store_pool,
        queue,
    }
}

fn replica_stores(sim: &SimCluster) -> Vec<u64> {
    sim.placement()[0]
        .replicas
        .iter()
        .map(|r| r.store_id)
        .collect()
}

#[tokio::test]
async fn range_waits_in_purgatory_until_a_store_joins() {
    let h = harness(2, ReplicateQueueConfig::new(1));

    let outcome = h.queue.process_one(1).await.expect("add s2");
    assert_eq!(outcome, ProcessOutcome::Changed(AllocatorAction::AddVoter));
    assert_eq!(replica_stores(&h.sim), vec![1, 2]);

    let outcome = h.queue.process_one(1).await.expect("no capacity");
    assert_eq!(outcome, ProcessOutcome::Purgatory);
    assert!(h.queue.in_purgatory(1));
    assert!(!h.queue.maybe_add(1), "parked ranges are not requeued");

    h.sim.add_store(store(3, 3));
    let outcome = h.queue.process_one(1).await.expect("add s3");
    assert_eq!(outcome, ProcessOutcome::Changed(AllocatorAction::AddVoter));
    assert!(!h.queue.in_purgatory(1));
    assert_eq!(replica_stores(&h.sim), vec![1, 2, 3]);

    let outcome = h.queue.process_one(1).await.expect("nothing to do");
    assert_eq!(outcome, ProcessOutcome::Noop);
}

#[tokio::test]
async fn store_pool_change_wakes_purgatory() {
    let mut cfg = ReplicateQueueConfig::new(1);
    cfg.scan_interval = Duration::from_millis(10);
    // Long enough that only the store pool signal can release the range.
    cfg.purgatory_interval = Duration::from_secs(600);
    let h = harness(2, cfg);
    let run = tokio::spawn(h.queue.clone().run());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.queue.in_purgatory(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("range reaches purgatory");
    assert_eq!(replica_stores(&h.sim), vec![1, 2]);

    h.sim.add_store(store(3, 3));
    tokio::time::timeout(Duration::from_secs(5), async {
        while replica_stores(&h.sim).len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("range upreplicated after store joined");
    assert!(!h.queue.in_purgatory(1));

    h.queue.stop();
    run.await.expect("join").expect("queue exits cleanly");
}

#[tokio::test]
async fn failed_change_throttles_the_target() {
    let h = harness(2, ReplicateQueueConfig::new(1));
    h.sim.set_store_failing(2, true);

    let err = h.queue.process_one(1).await.expect_err("snapshot to s2 fails");
    assert!(format!("{err:#}").contains("failed to send snapshot"));
    assert_eq!(h.store_pool.store_status(2), StoreStatus::Throttled);
    assert_eq!(replica_stores(&h.sim), vec![1]);

    // The only other store is throttled, which is not a capacity problem.
    let err = h.queue.process_one(1).await.expect_err("s2 throttled");
    assert!(err.chain().any(|e| e.is::<ThrottledStoresError>()), "{err:#}");
    assert!(!h.queue.in_purgatory(1));
}

#[test]
fn pending_actions_clear_once_replicated() {
    let (store_pool, allocator, _clock, _gossiper) = create_test_allocator(3, true);
    let scenario = Scenario {
        stores: (1..=3).map(|id| store(id, id)).collect(),
        ranges: vec![ScenarioRange {
            range_id: 1,
            replicas: voters(&[(1, 1), (2, 2), (3, 3)]),
            config: simple_config(3),
            ..ScenarioRange::default()
        }],
        ..Scenario::default()
    };
    let sim = SimCluster::new(&scenario, store_pool.clone()).expect("scenario");
    assert!(sim.pending_actions(&allocator, store_pool.as_ref()).is_empty());
    // Range counts come from the simulated placement.
    let desc = store_pool.store_detail(2).and_then(|d| d.desc).expect("s2");
    assert_eq!(desc.capacity.range_count, 1);
}

/// Reads come from the simulated cluster; every replica change hangs.
struct StuckChanger {
    sim: Arc<SimCluster>,
    entered: AtomicUsize,
}

#[async_trait]
impl ReplicaChanger for StuckChanger {
    async fn range_ids(&self) -> anyhow::Result<Vec<RangeId>> {
        self.sim.range_ids().await
    }

    async fn range_descriptor(&self, range_id: RangeId) -> anyhow::Result<RangeDescriptor> {
        self.sim.range_descriptor(range_id).await
    }

    async fn replication_status(
        &self,
        range_id: RangeId,
    ) -> anyhow::Result<Option<ReplicationStatus>> {
        self.sim.replication_status(range_id).await
    }

    async fn range_usage(&self, range_id: RangeId) -> anyhow::Result<RangeUsageInfo> {
        self.sim.range_usage(range_id).await
    }

    async fn change_replicas(
        &self,
        _range_id: RangeId,
        _expected: &RangeDescriptor,
        _changes: &[ReplicaChange],
    ) -> anyhow::Result<RangeDescriptor> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn finalize_atomic_change(
        &self,
        _range_id: RangeId,
        _expected: &RangeDescriptor,
    ) -> anyhow::Result<RangeDescriptor> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stop_returns_while_every_worker_is_stuck() {
    let (store_pool, allocator, clock, _gossiper) = create_test_allocator(3, true);
    let scenario = Scenario {
        stores: (1..=3).map(|id| store(id, id)).collect(),
        ranges: (1..=3)
            .map(|range_id| ScenarioRange {
                range_id,
                replicas: voters(&[(1, 1)]),
                config: simple_config(3),
                ..ScenarioRange::default()
            })
            .collect(),
        ..Scenario::default()
    };
    let sim = SimCluster::new(&scenario, store_pool.clone()).expect("scenario");
    let changer = Arc::new(StuckChanger {
        sim: sim.clone(),
        entered: AtomicUsize::new(0),
    });
    let mut cfg = ReplicateQueueConfig::new(1);
    cfg.workers = 1;
    cfg.scan_interval = Duration::from_millis(10);
    let clock: Arc<dyn Clock> = clock;
    let queue = ReplicateQueue::new(
        cfg,
        Arc::new(allocator),
        store_pool,
        changer.clone(),
        sim,
        clock,
    );
    let run = tokio::spawn(queue.clone().run());

    tokio::time::timeout(Duration::from_secs(5), async {
        while changer.entered.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first range reaches the changer");
    // Give the loop time to pick up the ranges that have no worker.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(changer.entered.load(Ordering::SeqCst), 1);

    queue.stop();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run returns after stop")
        .expect("join")
        .expect("queue exits cleanly");
}
