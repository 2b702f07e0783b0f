//! Candidate scoring.
//!
//! A candidate store is ranked on, in order: constraint validity and
//! necessity, locality diversity against the other replicas, disk fullness,
//! I/O overload, range-count balance against the mean, and finally the raw
//! range count. Removal walks the same ranking from the other end.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use crate::store_pool::{AllocatorStorePool, StoreList};
use crate::types::{
    ConstraintsConjunction, Locality, RangeUsageInfo, ReplicaDescriptor, SpanConfig,
    StoreDescriptor, StoreId, MAX_DIVERSITY_SCORE,
};

const EPSILON: f64 = 1e-10;

/// Tunables for a single allocator decision.
#[derive(Clone, Copy, Debug)]
pub struct ScorerOptions {
    /// Fraction of the mean range count a store may deviate by before it is
    /// over- or underfull.
    pub rebalance_threshold: f64,
    /// Floor on that deviation, in ranges, so small clusters don't thrash.
    pub min_range_rebalance_threshold: f64,
    /// Stores whose I/O threshold exceeds this rank below healthy stores.
    pub io_overload_threshold: f64,
    /// Stores above this disk fraction rank below stores with room.
    pub max_fraction_used: f64,
    pub diversity_weight: f64,
    /// Break ties by ascending store ID instead of at random.
    pub deterministic: bool,
}

impl Default for ScorerOptions {
    fn default() -> Self {
        Self {
            rebalance_threshold: 0.05,
            min_range_rebalance_threshold: 2.0,
            io_overload_threshold: 0.8,
            max_fraction_used: 0.95,
            diversity_weight: 1.0,
            deterministic: false,
        }
    }
}

impl ScorerOptions {
    fn range_threshold(&self, mean: f64) -> f64 {
        (mean * self.rebalance_threshold).max(self.min_range_rebalance_threshold)
    }

    pub fn overfull_threshold(&self, mean: f64) -> f64 {
        mean + self.range_threshold(mean)
    }

    pub fn underfull_threshold(&self, mean: f64) -> f64 {
        mean - self.range_threshold(mean)
    }

    pub fn balance_score(&self, range_count: u32, mean: f64) -> BalanceScore {
        let count = f64::from(range_count);
        if count > self.overfull_threshold(mean) {
            BalanceScore::Overfull
        } else if count < self.underfull_threshold(mean) {
            BalanceScore::Underfull
        } else {
            BalanceScore::Moderate
        }
    }

    /// Whether a store holding `range_count` ranges should shed one, judged
    /// against the stores in `comparable` (which includes the store itself).
    pub fn should_rebalance_based_on_range_count(
        &self,
        store_id: StoreId,
        range_count: u32,
        comparable: &StoreList,
    ) -> bool {
        let mean = comparable.mean_range_count;
        let count = f64::from(range_count);
        if count > self.overfull_threshold(mean) {
            return true;
        }
        if count > mean {
            let underfull = self.underfull_threshold(mean);
            return comparable
                .stores
                .iter()
                .any(|s| s.store_id != store_id && f64::from(s.capacity.range_count) < underfull);
        }
        false
    }

    pub fn is_full_disk(&self, store: &StoreDescriptor, usage: &RangeUsageInfo) -> bool {
        let cap = &store.capacity;
        if cap.capacity == 0 {
            return false;
        }
        let used = cap
            .capacity
            .saturating_sub(cap.available)
            .saturating_add(usage.logical_bytes);
        used as f64 / cap.capacity as f64 > self.max_fraction_used
    }

    pub fn is_io_overloaded(&self, store: &StoreDescriptor) -> bool {
        store.capacity.io_threshold > self.io_overload_threshold
    }
}

/// Range-count balance of a store relative to the mean. Orders from worst to
/// best place for an additional replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BalanceScore {
    Overfull,
    Moderate,
    Underfull,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub store: StoreDescriptor,
    pub valid: bool,
    pub necessary: bool,
    pub diversity_score: f64,
    pub full_disk: bool,
    pub io_overloaded: bool,
    pub balance_score: BalanceScore,
    pub range_count: u32,
}

impl Candidate {
    pub fn store_id(&self) -> StoreId {
        self.store.store_id
    }

    /// `Greater` means `self` is the better home for a replica.
    pub fn compare(&self, other: &Candidate, opts: &ScorerOptions) -> Ordering {
        self.compare_constraints_and_diversity(other, opts)
            .then((!self.full_disk).cmp(&!other.full_disk))
            .then((!self.io_overloaded).cmp(&!other.io_overloaded))
            .then(self.balance_score.cmp(&other.balance_score))
            .then(other.range_count.cmp(&self.range_count))
    }

    /// The part of `compare` that decides whether a candidate is an
    /// acceptable substitute for an existing replica.
    pub fn compare_constraints_and_diversity(
        &self,
        other: &Candidate,
        opts: &ScorerOptions,
    ) -> Ordering {
        self.valid
            .cmp(&other.valid)
            .then(self.necessary.cmp(&other.necessary))
            .then_with(|| {
                cmp_f64(
                    self.diversity_score * opts.diversity_weight,
                    other.diversity_score * opts.diversity_weight,
                )
            })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s{} valid:{} necessary:{} diversity:{:.2} full-disk:{} io-overloaded:{} balance:{:?} ranges:{}",
            self.store.store_id,
            self.valid,
            self.necessary,
            self.diversity_score,
            self.full_disk,
            self.io_overloaded,
            self.balance_score,
            self.range_count
        )
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    if (a - b).abs() < EPSILON {
        return Ordering::Equal;
    }
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Sorts best first; equal candidates stay in ascending store ID order.
pub fn sort_best_first(candidates: &mut [Candidate], opts: &ScorerOptions) {
    candidates.sort_by(|a, b| b.compare(a, opts).then(a.store_id().cmp(&b.store_id())));
}

/// Sorts worst first; equal candidates stay in ascending store ID order.
pub fn sort_worst_first(candidates: &mut [Candidate], opts: &ScorerOptions) {
    candidates.sort_by(|a, b| a.compare(b, opts).then(a.store_id().cmp(&b.store_id())));
}

/// Number of leading candidates that tie with the first under `compare`.
pub fn leading_ties(candidates: &[Candidate], opts: &ScorerOptions) -> usize {
    let Some(first) = candidates.first() else {
        return 0;
    };
    candidates
        .iter()
        .take_while(|c| c.compare(first, opts) == Ordering::Equal)
        .count()
}

pub fn format_candidates(candidates: &[Candidate]) -> String {
    let parts: Vec<String> = candidates.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join("; "))
}

/// Which existing replicas satisfy each conjunction of one constraint list.
#[derive(Debug, Clone, Default)]
pub struct AnalyzedConstraints {
    pub conjunctions: Vec<ConstraintsConjunction>,
    pub satisfied_by: Vec<Vec<StoreId>>,
    pub satisfies: HashMap<StoreId, Vec<usize>>,
    /// Per-conjunction counts leave room for replicas that match none.
    pub unconstrained_replicas: bool,
}

pub fn analyze_constraints(
    sp: &dyn AllocatorStorePool,
    existing: &[ReplicaDescriptor],
    num_replicas: u32,
    conjunctions: &[ConstraintsConjunction],
) -> AnalyzedConstraints {
    let mut result = AnalyzedConstraints {
        conjunctions: conjunctions.to_vec(),
        satisfied_by: vec![Vec::new(); conjunctions.len()],
        ..AnalyzedConstraints::default()
    };
    let mut constrained = 0u32;
    for (i, conjunction) in conjunctions.iter().enumerate() {
        constrained += conjunction.num_replicas;
        for replica in existing {
            // A store we have no descriptor for is given the benefit of the
            // doubt so it isn't churned away while gossip catches up.
            let satisfied = sp
                .get_store_descriptor(replica.store_id)
                .map(|store| conjunction.satisfied_by(&store))
                .unwrap_or(true);
            if satisfied {
                result.satisfied_by[i].push(replica.store_id);
                result.satisfies.entry(replica.store_id).or_default().push(i);
            }
        }
    }
    result.unconstrained_replicas = constrained > 0 && constrained < num_replicas;
    result
}

impl AnalyzedConstraints {
    /// `(valid, necessary)` for adding a replica on `store`.
    pub fn allocate_check(&self, store: &StoreDescriptor) -> (bool, bool) {
        if self.conjunctions.is_empty() {
            return (true, false);
        }
        let mut valid = false;
        for (i, conjunction) in self.conjunctions.iter().enumerate() {
            if conjunction.satisfied_by(store) {
                valid = true;
                if self.satisfied_by[i].len() < conjunction.num_replicas as usize {
                    return (true, true);
                }
            }
        }
        (valid || self.unconstrained_replicas, false)
    }

    /// `(valid, necessary)` for keeping the existing replica on `store_id`.
    pub fn remove_check(&self, store_id: StoreId) -> (bool, bool) {
        if self.conjunctions.is_empty() {
            return (true, false);
        }
        let Some(indexes) = self.satisfies.get(&store_id).filter(|s| !s.is_empty()) else {
            return (self.unconstrained_replicas, false);
        };
        for &i in indexes {
            if self.satisfied_by[i].len() <= self.conjunctions[i].num_replicas as usize {
                return (true, true);
            }
        }
        (true, false)
    }

    /// `(valid, necessary)` for moving the replica on `from` onto `store`.
    pub fn rebalance_from_check(&self, store: &StoreDescriptor, from: StoreId) -> (bool, bool) {
        if self.conjunctions.is_empty() {
            return (true, false);
        }
        let mut valid = false;
        for (i, conjunction) in self.conjunctions.iter().enumerate() {
            if !conjunction.satisfied_by(store) {
                continue;
            }
            valid = true;
            let matching = &self.satisfied_by[i];
            let want = conjunction.num_replicas as usize;
            if matching.len() < want || (matching.len() == want && matching.contains(&from)) {
                return (true, true);
            }
        }
        (valid || self.unconstrained_replicas, false)
    }
}

/// Constraints that apply to one kind of replica: the range-wide list, plus
/// the voter-only list when placing voters.
#[derive(Debug, Clone)]
pub struct PlacementConstraints {
    overall: AnalyzedConstraints,
    voters: Option<AnalyzedConstraints>,
}

impl PlacementConstraints {
    pub fn for_voters(
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
    ) -> Self {
        let all = concat(existing_voters, existing_non_voters);
        Self {
            overall: analyze_constraints(sp, &all, conf.num_replicas, &conf.constraints),
            voters: Some(analyze_constraints(
                sp,
                existing_voters,
                conf.get_num_voters(),
                &conf.voter_constraints,
            )),
        }
    }

    pub fn for_non_voters(
        sp: &dyn AllocatorStorePool,
        conf: &SpanConfig,
        existing_voters: &[ReplicaDescriptor],
        existing_non_voters: &[ReplicaDescriptor],
    ) -> Self {
        let all = concat(existing_voters, existing_non_voters);
        Self {
            overall: analyze_constraints(sp, &all, conf.num_replicas, &conf.constraints),
            voters: None,
        }
    }

    pub fn allocate_check(&self, store: &StoreDescriptor) -> (bool, bool) {
        self.combine(|a| a.allocate_check(store))
    }

    pub fn remove_check(&self, store_id: StoreId) -> (bool, bool) {
        self.combine(|a| a.remove_check(store_id))
    }

    pub fn rebalance_from_check(&self, store: &StoreDescriptor, from: StoreId) -> (bool, bool) {
        self.combine(|a| a.rebalance_from_check(store, from))
    }

    fn combine(&self, check: impl Fn(&AnalyzedConstraints) -> (bool, bool)) -> (bool, bool) {
        let (valid, necessary) = check(&self.overall);
        match &self.voters {
            Some(voters) => {
                let (voter_valid, voter_necessary) = check(voters);
                (valid && voter_valid, necessary || voter_necessary)
            }
            None => (valid, necessary),
        }
    }
}

pub(crate) fn concat(a: &[ReplicaDescriptor], b: &[ReplicaDescriptor]) -> Vec<ReplicaDescriptor> {
    a.iter().chain(b.iter()).copied().collect()
}

/// Localities of the stores holding `replicas`. Replicas on stores without a
/// descriptor are skipped.
pub fn replica_localities(
    sp: &dyn AllocatorStorePool,
    replicas: &[ReplicaDescriptor],
) -> Vec<(StoreId, Locality)> {
    replicas
        .iter()
        .filter_map(|r| {
            sp.get_store_descriptor(r.store_id)
                .map(|s| (r.store_id, s.node.locality))
        })
        .collect()
}

/// Mean diversity of `store` against the existing replicas; a range with no
/// replicas is maximally diverse.
pub fn diversity_allocate_score(store: &StoreDescriptor, existing: &[(StoreId, Locality)]) -> f64 {
    mean_diversity(store.locality(), existing.iter().map(|(_, l)| l))
}

/// Mean diversity the replica on `store_id` contributes against the others.
/// Lower means it is the better one to remove.
pub fn diversity_remove_score(store_id: StoreId, existing: &[(StoreId, Locality)]) -> f64 {
    let Some((_, locality)) = existing.iter().find(|(id, _)| *id == store_id) else {
        return MAX_DIVERSITY_SCORE;
    };
    mean_diversity(
        locality,
        existing
            .iter()
            .filter(|(id, _)| *id != store_id)
            .map(|(_, l)| l),
    )
}

/// Diversity `store` would have if it replaced the replica on `from`.
pub fn diversity_rebalance_from_score(
    store: &StoreDescriptor,
    from: StoreId,
    existing: &[(StoreId, Locality)],
) -> f64 {
    mean_diversity(
        store.locality(),
        existing
            .iter()
            .filter(|(id, _)| *id != from && *id != store.store_id)
            .map(|(_, l)| l),
    )
}

fn mean_diversity<'a>(locality: &Locality, others: impl Iterator<Item = &'a Locality>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for other in others {
        sum += locality.diversity_score(other);
        count += 1;
    }
    if count == 0 {
        return MAX_DIVERSITY_SCORE;
    }
    sum / count as f64
}
