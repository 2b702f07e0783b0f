//! Replica placement decisions.
//!
//! The allocator is pure with respect to the store pool it is handed: every
//! call reads a fresh snapshot through `AllocatorStorePool` and returns a
//! decision without mutating anything. Executing the decision is the
//! replicate queue's job.

pub mod scorer;

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Mutex, RwLock};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::{AllocationError, ConstraintUnsatisfiable, ThrottledStoresError};
use crate::store_pool::{AllocatorStorePool, StoreFilter, StoreList, ThrottledStoreReasons};
use crate::types::{
    NodeDescriptor, RangeDescriptor, RangeUsageInfo, ReplicaDescriptor, ReplicaId, ReplicaType,
    ReplicationStatus, ReplicationTarget, SpanConfig, StoreDescriptor, StoreId,
};

pub use scorer::{
    analyze_constraints, AnalyzedConstraints, BalanceScore, Candidate, PlacementConstraints,
    ScorerOptions,
};

use scorer::{
    concat, diversity_allocate_score, diversity_rebalance_from_score, diversity_remove_score,
    format_candidates, leading_ties, replica_localities, sort_best_first, sort_worst_first,
};

/// Replica ID given to the replica a rebalance simulation adds. Real replica
/// IDs start at 1.
const SIMULATED_REPLICA_ID: ReplicaId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorAction {
    Noop,
    FinalizeAtomicReplicationChange,
    AddVoter,
    AddNonVoter,
    ReplaceDeadVoter,
    ReplaceDeadNonVoter,
    RemoveDeadVoter,
    RemoveDeadNonVoter,
    ReplaceDecommissioningVoter,
    ReplaceDecommissioningNonVoter,
    RemoveDecommissioningVoter,
    RemoveDecommissioningNonVoter,
    RemoveVoter,
    RemoveNonVoter,
    ConsiderRebalance,
}

impl AllocatorAction {
    /// Base processing priority. Structural repairs outrank rebalancing.
    pub fn priority(self) -> f64 {
        match self {
            AllocatorAction::FinalizeAtomicReplicationChange => 12_002.0,
            AllocatorAction::ReplaceDeadVoter | AllocatorAction::ReplaceDeadNonVoter => 12_000.0,
            AllocatorAction::AddVoter => 10_000.0,
            AllocatorAction::AddNonVoter => 9_000.0,
            AllocatorAction::ReplaceDecommissioningVoter
            | AllocatorAction::ReplaceDecommissioningNonVoter => 5_000.0,
            AllocatorAction::RemoveDeadVoter | AllocatorAction::RemoveDeadNonVoter => 1_000.0,
            AllocatorAction::RemoveDecommissioningVoter
            | AllocatorAction::RemoveDecommissioningNonVoter => 900.0,
            AllocatorAction::RemoveVoter => 800.0,
            AllocatorAction::RemoveNonVoter => 700.0,
            AllocatorAction::Noop | AllocatorAction::ConsiderRebalance => 0.0,
        }
    }

    /// The kind of replica the action adds or removes, if any.
    pub fn target_replica_type(self) -> Option<TargetReplicaType> {
        match self {
            AllocatorAction::AddVoter
            | AllocatorAction::ReplaceDeadVoter
            | AllocatorAction::RemoveDeadVoter
            | AllocatorAction::ReplaceDecommissioningVoter
            | AllocatorAction::RemoveDecommissioningVoter
            | AllocatorAction::RemoveVoter => Some(TargetReplicaType::Voter),
            AllocatorAction::AddNonVoter
            | AllocatorAction::ReplaceDeadNonVoter
            | AllocatorAction::RemoveDeadNonVoter
            | AllocatorAction::ReplaceDecommissioningNonVoter
            | AllocatorAction::RemoveDecommissioningNonVoter
            | AllocatorAction::RemoveNonVoter => Some(TargetReplicaType::NonVoter),
            AllocatorAction::Noop
            | AllocatorAction::FinalizeAtomicReplicationChange
            | AllocatorAction::ConsiderRebalance => None,
        }
    }
}

impl fmt::Display for AllocatorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocatorAction::Noop => "noop",
            AllocatorAction::FinalizeAtomicReplicationChange => "finalize conf change",
            AllocatorAction::AddVoter => "add voter",
            AllocatorAction::AddNonVoter => "add non-voter",
            AllocatorAction::ReplaceDeadVoter => "replace dead voter",
            AllocatorAction::ReplaceDeadNonVoter => "replace dead non-voter",
            AllocatorAction::RemoveDeadVoter => "remove dead voter",
            AllocatorAction::RemoveDeadNonVoter => "remove dead non-voter",
            AllocatorAction::ReplaceDecommissioningVoter => "replace decommissioning voter",
            AllocatorAction::ReplaceDecommissioningNonVoter => "replace decommissioning non-voter",
            AllocatorAction::RemoveDecommissioningVoter => "remove decommissioning voter",
            AllocatorAction::RemoveDecommissioningNonVoter => "remove decommissioning non-voter",
            AllocatorAction::RemoveVoter => "remove voter",
            AllocatorAction::RemoveNonVoter => "remove non-voter",
            AllocatorAction::ConsiderRebalance => "consider rebalance",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetReplicaType {
    Voter,
    NonVoter,
}

impl TargetReplicaType {
    pub fn replica_type(self) -> ReplicaType {
        match self {
            TargetReplicaType::Voter => ReplicaType::Voter,
            TargetReplicaType::NonVoter => ReplicaType::NonVoter,
        }
    }
}

/// Voters a range should have given how many nodes can hold one. When the
/// cluster is too small for the configured count we fall back to an odd
/// count of at least three (never more than configured).
pub fn get_needed_voters(num_voters: u32, available_nodes: usize) -> usize {
    let configured = num_voters as usize;
    let mut need = configured.min(available_nodes);
    if need == configured {
        return need;
    }
    if need % 2 == 0 {
        need = need.saturating_sub(1);
    }
    need.max(3).min(configured)
}

/// Non-voters fill whatever nodes the voters leave over.
pub fn get_needed_non_voters(num_voters: usize, num_non_voters: u32, available_nodes: usize) -> usize {
    (num_non_voters as usize).min(available_nodes.saturating_sub(num_voters))
}

/// Cluster-wide allocator knobs that may change at runtime.
#[derive(Clone, Copy, Debug)]
pub struct AllocatorSettings {
    pub rebalance_threshold: f64,
    pub min_range_rebalance_threshold: f64,
    pub io_overload_threshold: f64,
    pub max_fraction_used: f64,
    pub diversity_weight: f64,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        let opts = ScorerOptions::default();
        Self {
            rebalance_threshold: opts.rebalance_threshold,
            min_range_rebalance_threshold: opts.min_range_rebalance_threshold,
            io_overload_threshold: opts.io_overload_threshold,
            max_fraction_used: opts.max_fraction_used,
            diversity_weight: opts.diversity_weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceDecision {
    pub target: ReplicationTarget,
    pub origin: ReplicationTarget,
    pub details: String,
}

pub struct Allocator {
    settings: RwLock<AllocatorSettings>,
    deterministic: bool,
    rng: Mutex<SmallRng>,
}

impl Allocator {
    pub fn new(settings: AllocatorSettings, deterministic: bool) -> Self {
        Self {
            settings: RwLock::new(settings),
            deterministic,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub fn update_settings(&self, update: impl FnOnce(&mut AllocatorSettings)) {
        update(&mut self.settings.write().unwrap());
    }

    pub fn scorer_options(&self) -> ScorerOptions {
        let settings = *self.settings.read().unwrap();
        ScorerOptions {
            rebalance_threshold: settings.rebalance_threshold,
            min_range_rebalance_threshold: settings.min_range_rebalance_threshold,
            io_overload_threshold: settings.io_overload_threshold,
            max_fraction_used: settings.max_fraction_used,
            diversity_weight: settings.diversity_weight,
            deterministic: self.deterministic,
        }
    }

    /// What the range needs next, with its processing priority.
    pub fn compute_action(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        desc: &RangeDescriptor,
    ) -> (AllocatorAction, f64) {
        use AllocatorAction::*;

        if desc
            .replicas
            .iter()
            .any(|r| r.replica_type.is_in_atomic_change())
        {
            return (
                FinalizeAtomicReplicationChange,
                FinalizeAtomicReplicationChange.priority(),
            );
        }

        let voters = desc.voters();
        let non_voters = desc.non_voters();
        let have_voters = voters.len();
        let have_non_voters = non_voters.len();

        let (live_voters, dead_voters) = sp.live_and_dead_replicas(&voters);
        if have_voters > 0 && live_voters.len() < quorum(have_voters) {
            tracing::debug!(
                range_id = desc.range_id,
                live_voters = live_voters.len(),
                voters = have_voters,
                "range unavailable; too few live voters to change replicas"
            );
            return (Noop, Noop.priority());
        }

        let available_nodes = sp.available_node_count();
        let needed_voters = get_needed_voters(conf.get_num_voters(), available_nodes);
        if have_voters < needed_voters {
            let priority = AddVoter.priority() + (needed_voters - have_voters) as f64;
            return (AddVoter, priority);
        }

        let needed_non_voters =
            get_needed_non_voters(have_voters, conf.get_num_non_voters(), available_nodes);
        if have_non_voters < needed_non_voters {
            let priority = AddNonVoter.priority() + (needed_non_voters - have_non_voters) as f64;
            return (AddNonVoter, priority);
        }

        if !dead_voters.is_empty() {
            let action = if have_voters == needed_voters {
                ReplaceDeadVoter
            } else {
                RemoveDeadVoter
            };
            return (action, action.priority());
        }
        let (_, dead_non_voters) = sp.live_and_dead_replicas(&non_voters);
        if !dead_non_voters.is_empty() {
            let action = if have_non_voters == needed_non_voters {
                ReplaceDeadNonVoter
            } else {
                RemoveDeadNonVoter
            };
            return (action, action.priority());
        }

        if !sp.decommissioning_replicas(&voters).is_empty() {
            let action = if have_voters == needed_voters {
                ReplaceDecommissioningVoter
            } else {
                RemoveDecommissioningVoter
            };
            return (action, action.priority());
        }
        if !sp.decommissioning_replicas(&non_voters).is_empty() {
            let action = if have_non_voters == needed_non_voters {
                ReplaceDecommissioningNonVoter
            } else {
                RemoveDecommissioningNonVoter
            };
            return (action, action.priority());
        }

        if have_voters > needed_voters {
            let priority = RemoveVoter.priority() + (have_voters - needed_voters) as f64;
            return (RemoveVoter, priority);
        }
        if have_non_voters > needed_non_voters {
            let priority = RemoveNonVoter.priority() + (have_non_voters - needed_non_voters) as f64;
            return (RemoveNonVoter, priority);
        }

        (ConsiderRebalance, ConsiderRebalance.priority())
    }

    /// Picks a store for a new voter. `replacing` is the replica the new one
    /// will stand in for; it no longer counts toward constraints or
    /// diversity, but its store is never chosen.
    pub fn allocate_voter(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
        replacing: Option<&ReplicaDescriptor>,
        usage: &RangeUsageInfo,
    ) -> anyhow::Result<(ReplicationTarget, String)> {
        self.allocate_target(
            sp,
            conf,
            existing_voters,
            existing_non_voters,
            replacing,
            usage,
            TargetReplicaType::Voter,
        )
    }

    pub fn allocate_non_voter(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
        replacing: Option<&ReplicaDescriptor>,
        usage: &RangeUsageInfo,
    ) -> anyhow::Result<(ReplicationTarget, String)> {
        self.allocate_target(
            sp,
            conf,
            existing_voters,
            existing_non_voters,
            replacing,
            usage,
            TargetReplicaType::NonVoter,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_target(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
        replacing: Option<&ReplicaDescriptor>,
        usage: &RangeUsageInfo,
        kind: TargetReplicaType,
    ) -> anyhow::Result<(ReplicationTarget, String)> {
        let opts = self.scorer_options();
        let remaining = |replicas: &[ReplicaDescriptor]| -> Vec<ReplicaDescriptor> {
            replicas
                .iter()
                .filter(|r| replacing.map_or(true, |x| x.store_id != r.store_id))
                .copied()
                .collect()
        };
        let voters = remaining(existing_voters);
        let non_voters = remaining(existing_non_voters);
        let constraints = placement_constraints(sp, conf, &voters, &non_voters, kind);
        let diversity_against = match kind {
            TargetReplicaType::Voter => replica_localities(sp, &voters),
            TargetReplicaType::NonVoter => replica_localities(sp, &concat(&voters, &non_voters)),
        };

        let (list, alive, throttled) = sp.get_store_list(StoreFilter::Throttled);
        let occupied: Vec<&ReplicaDescriptor> = existing_voters
            .iter()
            .chain(existing_non_voters)
            .chain(replacing)
            .collect();
        let mut candidates = Vec::new();
        for store in &list.stores {
            if occupied
                .iter()
                .any(|r| r.store_id == store.store_id || r.node_id == store.node_id())
            {
                continue;
            }
            let (valid, necessary) = constraints.allocate_check(store);
            if !valid {
                continue;
            }
            candidates.push(Candidate {
                store: store.clone(),
                valid,
                necessary,
                diversity_score: diversity_allocate_score(store, &diversity_against),
                full_disk: opts.is_full_disk(store, usage),
                io_overloaded: opts.is_io_overloaded(store),
                balance_score: opts.balance_score(store.capacity.range_count, list.mean_range_count),
                range_count: store.capacity.range_count,
            });
        }
        sort_best_first(&mut candidates, &opts);

        let Some(best) = self.pick(&candidates, &opts) else {
            return Err(self.no_candidates_error(
                sp,
                conf,
                kind,
                existing_voters.len(),
                existing_non_voters.len(),
                alive,
                throttled,
            ));
        };
        let details = format_candidates(&candidates);
        tracing::debug!(
            store_id = best.store_id(),
            kind = ?kind,
            candidates = %details,
            "allocating replica"
        );
        Ok((
            ReplicationTarget::new(best.store.node_id(), best.store_id()),
            details,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn no_candidates_error(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        kind: TargetReplicaType,
        existing_voters: usize,
        existing_non_voters: usize,
        alive_stores: usize,
        throttled: ThrottledStoreReasons,
    ) -> anyhow::Error {
        let known = sp.known_stores();
        let unconstrained = placement_constraints(sp, conf, &[], &[], kind);
        if !known.is_empty() && !known.iter().any(|s| unconstrained.allocate_check(s).0) {
            let mut constraints = conf.constraints.clone();
            if kind == TargetReplicaType::Voter {
                constraints.extend(conf.voter_constraints.iter().cloned());
            }
            return ConstraintUnsatisfiable {
                constraints,
                known_stores: known.len(),
            }
            .into();
        }
        if !throttled.is_empty() {
            return ThrottledStoresError { reasons: throttled }.into();
        }
        let voter_constraints = match kind {
            TargetReplicaType::Voter => conf.voter_constraints.clone(),
            TargetReplicaType::NonVoter => Vec::new(),
        };
        AllocationError {
            constraints: conf.constraints.clone(),
            voter_constraints,
            existing_voters,
            existing_non_voters,
            alive_stores,
            throttled_stores: 0,
        }
        .into()
    }

    /// Chooses which of `candidates` to drop. The leaseholder's replica is
    /// only chosen if it is the sole candidate.
    pub fn remove_voter(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        candidates: &[ReplicaDescriptor],
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
        leaseholder: Option<StoreId>,
    ) -> anyhow::Result<(ReplicationTarget, String)> {
        let opts = self.scorer_options();
        self.remove_target(
            sp,
            conf,
            candidates,
            existing_voters,
            existing_non_voters,
            leaseholder,
            TargetReplicaType::Voter,
            &opts,
            None,
        )
        .map(|(replica, details)| (replica.target(), details))
    }

    pub fn remove_non_voter(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        candidates: &[ReplicaDescriptor],
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
    ) -> anyhow::Result<(ReplicationTarget, String)> {
        let opts = self.scorer_options();
        self.remove_target(
            sp,
            conf,
            candidates,
            existing_voters,
            existing_non_voters,
            None,
            TargetReplicaType::NonVoter,
            &opts,
            None,
        )
        .map(|(replica, details)| (replica.target(), details))
    }

    /// Ranks `candidates` for removal and returns the worst. `added`, when
    /// set, is a store whose range count is projected one higher.
    #[allow(clippy::too_many_arguments)]
    fn remove_target(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        candidates: &[ReplicaDescriptor],
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
        leaseholder: Option<StoreId>,
        kind: TargetReplicaType,
        opts: &ScorerOptions,
        added: Option<StoreId>,
    ) -> anyhow::Result<(ReplicaDescriptor, String)> {
        if candidates.is_empty() {
            anyhow::bail!("must supply at least one candidate replica to remove");
        }
        let mut pool: Vec<ReplicaDescriptor> = candidates
            .iter()
            .filter(|r| Some(r.store_id) != leaseholder)
            .copied()
            .collect();
        if pool.is_empty() {
            pool = candidates.to_vec();
        }

        let constraints =
            placement_constraints(sp, conf, existing_voters, existing_non_voters, kind);
        let localities = match kind {
            TargetReplicaType::Voter => replica_localities(sp, existing_voters),
            TargetReplicaType::NonVoter => {
                replica_localities(sp, &concat(existing_voters, existing_non_voters))
            }
        };

        let ids: Vec<StoreId> = pool.iter().map(|r| r.store_id).collect();
        let (live, _, _) = sp.get_store_list_from_ids(&ids, StoreFilter::None);
        let stores: Vec<StoreDescriptor> = pool
            .iter()
            .map(|r| {
                let mut store = sp
                    .get_store_descriptor(r.store_id)
                    .unwrap_or_else(|| placeholder_store(r));
                if Some(r.store_id) == added {
                    store.capacity.range_count += 1;
                }
                store
            })
            .collect();
        let mean = StoreList::new(stores.clone()).mean_range_count;

        let mut scored: Vec<Candidate> = stores
            .into_iter()
            .map(|store| {
                let (valid, necessary) = constraints.remove_check(store.store_id);
                // Replicas on stores that aren't live are the first to go.
                let in_pool = live.find(store.store_id).is_some();
                Candidate {
                    valid: valid && in_pool,
                    necessary,
                    diversity_score: diversity_remove_score(store.store_id, &localities),
                    full_disk: opts.is_full_disk(&store, &RangeUsageInfo::default()),
                    io_overloaded: opts.is_io_overloaded(&store),
                    balance_score: opts.balance_score(store.capacity.range_count, mean),
                    range_count: store.capacity.range_count,
                    store,
                }
            })
            .collect();
        sort_worst_first(&mut scored, opts);

        let details = format_candidates(&scored);
        let worst = self
            .pick(&scored, opts)
            .ok_or_else(|| anyhow::anyhow!("no removable replica among {candidates:?}"))?;
        let replica = pool
            .iter()
            .find(|r| r.store_id == worst.store_id())
            .copied()
            .ok_or_else(|| anyhow::anyhow!("s{} vanished from candidates", worst.store_id()))?;
        Ok((replica, details))
    }

    /// Looks for a voter move that improves balance or placement. `None`
    /// when nothing should move; never random in that case.
    #[allow(clippy::too_many_arguments)]
    pub fn rebalance_voter(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        status: Option<&ReplicationStatus>,
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
        usage: &RangeUsageInfo,
        filter: StoreFilter,
        opts: &ScorerOptions,
    ) -> Option<RebalanceDecision> {
        self.rebalance_target(
            sp,
            conf,
            status,
            existing_voters,
            existing_non_voters,
            usage,
            filter,
            opts,
            TargetReplicaType::Voter,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn rebalance_non_voter(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
        usage: &RangeUsageInfo,
        filter: StoreFilter,
        opts: &ScorerOptions,
    ) -> Option<RebalanceDecision> {
        self.rebalance_target(
            sp,
            conf,
            None,
            existing_voters,
            existing_non_voters,
            usage,
            filter,
            opts,
            TargetReplicaType::NonVoter,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn rebalance_target(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        status: Option<&ReplicationStatus>,
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
        usage: &RangeUsageInfo,
        filter: StoreFilter,
        opts: &ScorerOptions,
        kind: TargetReplicaType,
    ) -> Option<RebalanceDecision> {
        let existing_kind = match kind {
            TargetReplicaType::Voter => existing_voters,
            TargetReplicaType::NonVoter => existing_non_voters,
        };
        if existing_kind.is_empty() {
            return None;
        }
        let (list, _, _) = sp.get_store_list(filter);
        let constraints =
            placement_constraints(sp, conf, existing_voters, existing_non_voters, kind);
        let all_replicas = concat(existing_voters, existing_non_voters);
        let localities = match kind {
            TargetReplicaType::Voter => replica_localities(sp, existing_voters),
            TargetReplicaType::NonVoter => replica_localities(sp, &all_replicas),
        };

        let mut targets: Vec<Candidate> = Vec::new();
        for replica in existing_kind {
            // A throttled store is filtered out of `list` but can still
            // give up a replica.
            let Some(store) = list
                .find(replica.store_id)
                .cloned()
                .or_else(|| sp.get_store_descriptor(replica.store_id))
            else {
                continue;
            };
            let (valid, necessary) = constraints.remove_check(replica.store_id);
            let existing = Candidate {
                valid,
                necessary,
                diversity_score: diversity_remove_score(replica.store_id, &localities),
                full_disk: opts.is_full_disk(&store, &RangeUsageInfo::default()),
                io_overloaded: opts.is_io_overloaded(&store),
                balance_score: BalanceScore::Moderate,
                range_count: store.capacity.range_count,
                store,
            };

            let mut comparable = Vec::new();
            for store in &list.stores {
                if all_replicas
                    .iter()
                    .any(|r| r.store_id == store.store_id || r.node_id == store.node_id())
                {
                    continue;
                }
                let (valid, necessary) = constraints.rebalance_from_check(store, replica.store_id);
                if !valid {
                    continue;
                }
                let cand = Candidate {
                    store: store.clone(),
                    valid,
                    necessary,
                    diversity_score: diversity_rebalance_from_score(
                        store,
                        replica.store_id,
                        &localities,
                    ),
                    full_disk: opts.is_full_disk(store, usage),
                    io_overloaded: opts.is_io_overloaded(store),
                    balance_score: BalanceScore::Moderate,
                    range_count: store.capacity.range_count,
                };
                if cand.compare_constraints_and_diversity(&existing, opts) != Ordering::Less {
                    comparable.push(cand);
                }
            }

            let mut comparable_stores: Vec<StoreDescriptor> =
                comparable.iter().map(|c| c.store.clone()).collect();
            comparable_stores.push(existing.store.clone());
            let comparable_list = StoreList::new(comparable_stores);
            let better = |c: &Candidate| {
                c.compare_constraints_and_diversity(&existing, opts) == Ordering::Greater
            };
            let should_rebalance = !existing.valid
                || existing.full_disk
                || comparable.iter().any(|c| better(c))
                || opts.should_rebalance_based_on_range_count(
                    existing.store_id(),
                    existing.range_count,
                    &comparable_list,
                );
            if !should_rebalance {
                continue;
            }

            let mean = comparable_list.mean_range_count;
            let overfull = opts.overfull_threshold(mean);
            for mut cand in comparable {
                let fits = f64::from(cand.range_count + 1) <= overfull
                    && cand.range_count < existing.range_count;
                if !better(&cand) && !fits {
                    continue;
                }
                cand.balance_score = opts.balance_score(cand.range_count, mean);
                targets.push(cand);
            }
        }

        // The same store can qualify against several existing replicas; keep
        // its best showing.
        sort_best_first(&mut targets, opts);
        let mut seen = Vec::new();
        targets.retain(|c| {
            if seen.contains(&c.store_id()) {
                return false;
            }
            seen.push(c.store_id());
            true
        });

        while !targets.is_empty() {
            let target = self.pick(&targets, opts)?.clone();
            let details = format_candidates(&targets);
            match self.simulate_removal(
                sp,
                conf,
                status,
                existing_voters,
                existing_non_voters,
                &target,
                kind,
                opts,
            ) {
                Some(origin) if origin.store_id != target.store_id() => {
                    tracing::debug!(
                        to_store = target.store_id(),
                        from_store = origin.store_id,
                        candidates = %details,
                        "rebalancing replica"
                    );
                    return Some(RebalanceDecision {
                        target: ReplicationTarget::new(target.store.node_id(), target.store_id()),
                        origin: origin.target(),
                        details,
                    });
                }
                _ => {
                    tracing::trace!(
                        to_store = target.store_id(),
                        "rebalance target would be removed immediately; trying next"
                    );
                    targets.retain(|c| c.store_id() != target.store_id());
                }
            }
        }
        None
    }

    /// Adds `target` to the range and returns whichever replica the removal
    /// rules would then drop.
    #[allow(clippy::too_many_arguments)]
    fn simulate_removal(
        &self,
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        status: Option<&ReplicationStatus>,
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
        target: &Candidate,
        kind: TargetReplicaType,
        opts: &ScorerOptions,
    ) -> Option<ReplicaDescriptor> {
        let added = ReplicaDescriptor {
            node_id: target.store.node_id(),
            store_id: target.store_id(),
            replica_id: SIMULATED_REPLICA_ID,
            replica_type: kind.replica_type(),
        };
        let mut voters = existing_voters.to_vec();
        let mut non_voters = existing_non_voters.to_vec();
        let candidates = match kind {
            TargetReplicaType::Voter => {
                voters.push(added);
                match status {
                    Some(status) => {
                        filter_unremovable_replicas(status, &voters, Some(SIMULATED_REPLICA_ID))
                    }
                    None => voters.clone(),
                }
            }
            TargetReplicaType::NonVoter => {
                non_voters.push(added);
                non_voters.clone()
            }
        };
        if candidates.is_empty() {
            tracing::debug!(
                to_store = target.store_id(),
                "no replica can be removed without losing quorum"
            );
            return None;
        }
        match self.remove_target(
            sp,
            conf,
            &candidates,
            &voters,
            &non_voters,
            None,
            kind,
            opts,
            Some(added.store_id),
        ) {
            Ok((replica, _)) => Some(replica),
            Err(err) => {
                tracing::debug!(error = ?err, "simulated removal failed");
                None
            }
        }
    }

    fn pick<'a>(&self, sorted: &'a [Candidate], opts: &ScorerOptions) -> Option<&'a Candidate> {
        let ties = leading_ties(sorted, opts);
        if ties <= 1 || opts.deterministic {
            return sorted.first();
        }
        let idx = self.rng.lock().unwrap().gen_range(0..ties);
        sorted.get(idx)
    }
}

fn placement_constraints(
    sp: &dyn AllocatorStorePool,
    conf: &SpanConfig,
    voters: &[ReplicaDescriptor],
    non_voters: &[ReplicaDescriptor],
    kind: TargetReplicaType,
) -> PlacementConstraints {
    match kind {
        TargetReplicaType::Voter => PlacementConstraints::for_voters(sp, conf, voters, non_voters),
        TargetReplicaType::NonVoter => {
            PlacementConstraints::for_non_voters(sp, conf, voters, non_voters)
        }
    }
}

fn placeholder_store(replica: &ReplicaDescriptor) -> StoreDescriptor {
    StoreDescriptor {
        store_id: replica.store_id,
        node: NodeDescriptor {
            node_id: replica.node_id,
            ..NodeDescriptor::default()
        },
        ..StoreDescriptor::default()
    }
}

fn quorum(voters: usize) -> usize {
    voters / 2 + 1
}

/// Replicas that can be removed without dropping the number of up-to-date
/// replicas below quorum. `brand_new` is a replica being added alongside the
/// removal; it counts as up to date.
pub fn filter_unremovable_replicas(
    status: &ReplicationStatus,
    replicas: &[ReplicaDescriptor],
    brand_new: Option<ReplicaId>,
) -> Vec<ReplicaDescriptor> {
    let up_to_date = |r: &ReplicaDescriptor| {
        Some(r.replica_id) == brand_new || status.is_up_to_date(r.replica_id)
    };
    let count = replicas.iter().filter(|r| up_to_date(r)).count();
    if replicas.is_empty() || count < quorum(replicas.len()) {
        return Vec::new();
    }
    if count > quorum(replicas.len() - 1) {
        return replicas.to_vec();
    }
    replicas.iter().filter(|r| !up_to_date(r)).copied().collect()
}
