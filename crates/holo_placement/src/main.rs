use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;

use holo_placement::allocator::{Allocator, AllocatorSettings};
use holo_placement::clock::{Clock, SystemClock};
use holo_placement::replicate_queue::{ReplicateQueue, ReplicateQueueConfig};
use holo_placement::sim::{RangePlacement, Scenario, SimCluster, SimLiveness};
use holo_placement::store_pool::{liveness_fn_from, StorePool, StorePoolConfig};
use holo_placement::types::{RangeId, StoreId};

/// Replays a cluster scenario through the replicate queue and prints where
/// every replica ended up.
#[derive(Parser, Debug)]
#[command(name = "holo-placement")]
struct Args {
    /// JSON scenario: stores, ranges with their span configs, and nodes to
    /// mark dead or decommissioning.
    #[arg(long, env = "HOLO_PLACEMENT_SCENARIO")]
    scenario: PathBuf,

    /// Store the queue runs on; its node also observes liveness.
    #[arg(long, env = "HOLO_PLACEMENT_STORE_ID", default_value_t = 1)]
    store_id: StoreId,

    #[arg(long, env = "HOLO_PLACEMENT_WORKERS", default_value_t = 4)]
    workers: usize,

    #[arg(long, env = "HOLO_PLACEMENT_SCAN_INTERVAL_MS", default_value_t = 200)]
    scan_interval_ms: u64,

    #[arg(long, env = "HOLO_PLACEMENT_PURGATORY_INTERVAL_MS", default_value_t = 1_000)]
    purgatory_interval_ms: u64,

    #[arg(long, env = "HOLO_PLACEMENT_TIME_UNTIL_STORE_DEAD_MS", default_value_t = 300_000)]
    time_until_store_dead_ms: u64,

    /// Fraction of the mean range count a store may deviate before it is
    /// considered over- or underfull.
    #[arg(long, env = "HOLO_PLACEMENT_REBALANCE_THRESHOLD")]
    rebalance_threshold: Option<f64>,

    /// Break candidate ties by store ID instead of at random.
    #[arg(long, env = "HOLO_PLACEMENT_DETERMINISTIC", default_value_t = false)]
    deterministic: bool,

    /// Consecutive quiet scans required before the placement is reported.
    #[arg(long, env = "HOLO_PLACEMENT_SETTLE_SCANS", default_value_t = 3)]
    settle_scans: u32,

    /// Give up after this long without converging.
    #[arg(long, env = "HOLO_PLACEMENT_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,
}

#[derive(Serialize)]
struct Report {
    converged: bool,
    ranges: Vec<RangePlacement>,
    pending: Vec<PendingRange>,
}

#[derive(Serialize)]
struct PendingRange {
    range_id: RangeId,
    action: String,
    in_purgatory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    run(args, tokio::signal::ctrl_c()).await
}

async fn run<F>(args: Args, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let scenario = Scenario::load(&args.scenario)?;
    let local_node = scenario
        .stores
        .iter()
        .find(|s| s.store_id == args.store_id)
        .map(|s| s.node_id())
        .with_context(|| format!("store s{} is not in the scenario", args.store_id))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pool_cfg = StorePoolConfig {
        time_until_store_dead: Duration::from_millis(args.time_until_store_dead_ms),
        ..StorePoolConfig::default()
    };
    let liveness = SimLiveness::start(
        &scenario,
        clock.clone(),
        local_node,
        pool_cfg.time_until_store_dead,
    )
    .await?;
    let store_pool = StorePool::new(pool_cfg, clock.clone(), liveness_fn_from(liveness.local.clone()));

    let mut settings = AllocatorSettings::default();
    if let Some(threshold) = args.rebalance_threshold {
        settings.rebalance_threshold = threshold;
    }
    let allocator = Arc::new(Allocator::new(settings, args.deterministic));
    let sim = SimCluster::new(&scenario, store_pool.clone())?;

    let mut queue_cfg = ReplicateQueueConfig::new(args.store_id);
    queue_cfg.workers = args.workers;
    queue_cfg.scan_interval = Duration::from_millis(args.scan_interval_ms);
    queue_cfg.purgatory_interval = Duration::from_millis(args.purgatory_interval_ms);
    let queue = ReplicateQueue::new(
        queue_cfg,
        allocator.clone(),
        store_pool.clone(),
        sim.clone(),
        sim.clone(),
        clock.clone(),
    );
    tracing::info!(
        store_id = args.store_id,
        node_id = local_node,
        stores = scenario.stores.len(),
        ranges = scenario.ranges.len(),
        "starting replicate queue"
    );
    let mut queue_task = tokio::spawn(queue.clone().run());

    let deadline = tokio::time::sleep(Duration::from_millis(args.timeout_ms));
    tokio::pin!(deadline);
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(queue_cfg.scan_interval);
    let mut last_placement = sim.placement();
    let mut quiet_scans = 0u32;

    let converged = loop {
        tokio::select! {
            res = &mut queue_task => {
                liveness.stop();
                queue_exit(res)?;
                anyhow::bail!("replicate queue exited early");
            }
            _ = &mut shutdown => {
                tracing::info!("interrupted; reporting current placement");
                break false;
            }
            _ = &mut deadline => {
                tracing::warn!(timeout_ms = args.timeout_ms, "placement did not converge");
                break false;
            }
            _ = ticker.tick() => {
                // Keep descriptors fresh so quiet stores are not declared dead.
                sim.gossip();
                let placement = sim.placement();
                let pending = sim.pending_actions(&allocator, store_pool.as_ref());
                if placement == last_placement && pending.is_empty() && queue.purgatory_len() == 0 {
                    quiet_scans += 1;
                } else {
                    quiet_scans = 0;
                }
                last_placement = placement;
                if quiet_scans >= args.settle_scans {
                    break true;
                }
            }
        }
    };

    queue.stop();
    liveness.stop();
    // A violation found while draining still fails the run.
    queue_exit(queue_task.await)?;

    let pending = sim
        .pending_actions(&allocator, store_pool.as_ref())
        .into_iter()
        .map(|(range_id, action)| PendingRange {
            range_id,
            action: action.to_string(),
            in_purgatory: queue.in_purgatory(range_id),
        })
        .collect();
    let report = Report {
        converged,
        ranges: sim.placement(),
        pending,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !converged {
        anyhow::bail!("placement did not converge");
    }
    Ok(())
}

fn queue_exit(res: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.context("replicate queue failed")),
        Err(err) => Err(anyhow::Error::new(err).context("replicate queue task panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holo_placement::error::{is_fatal, InvariantViolation};

    #[tokio::test]
    async fn queue_exit_surfaces_late_violation() {
        let res = tokio::spawn(async {
            Err::<(), _>(anyhow::Error::new(InvariantViolation::new("r1: duplicate replicas on s1")))
        })
        .await;
        let err = queue_exit(res).expect_err("violation propagates");
        assert!(is_fatal(&err), "{err:#}");

        let res = tokio::spawn(async { Ok::<(), anyhow::Error>(()) }).await;
        queue_exit(res).expect("clean exit");
    }

    #[tokio::test]
    async fn queue_exit_reports_panics() {
        let res = tokio::spawn(async {
            if true {
                panic!("worker exploded");
            }
            Ok::<(), anyhow::Error>(())
        })
        .await;
        let err = queue_exit(res).expect_err("panic propagates");
        assert!(format!("{err:#}").contains("panicked"), "{err:#}");
    }
}
