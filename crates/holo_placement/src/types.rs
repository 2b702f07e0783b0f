//! Placement data model: store, replica and range descriptors plus the
//! replication policy (span config) they are evaluated against.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InvariantViolation;

pub type NodeId = u64;
pub type StoreId = u64;
pub type RangeId = u64;
pub type ReplicaId = u64;

/// One level of a node's locality hierarchy, e.g. `region=us-east`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tier {
    pub key: String,
    pub value: String,
}

impl Tier {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered locality tiers, most significant first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locality {
    #[serde(default)]
    pub tiers: Vec<Tier>,
}

impl Locality {
    pub fn new(tiers: Vec<Tier>) -> Self {
        Self { tiers }
    }

    /// Returns the value of the tier with `key`, if any.
    pub fn find(&self, key: &str) -> Option<&str> {
        self.tiers
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    /// Diversity between two localities in `[0, 1]`.
    ///
    /// Localities that first differ at tier `i` of `n` comparable tiers score
    /// `(n - i) / n`, so a difference at the top tier scores 1. Identical
    /// prefixes with a different number of tiers score 0.25; identical
    /// localities score 0.
    pub fn diversity_score(&self, other: &Locality) -> f64 {
        let length = self.tiers.len().min(other.tiers.len());
        for i in 0..length {
            if self.tiers[i].value != other.tiers[i].value {
                return (length - i) as f64 / length as f64;
            }
        }
        if self.tiers.len() != other.tiers.len() {
            return MAX_DIVERSITY_SCORE / 4.0;
        }
        0.0
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tier) in self.tiers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", tier.key, tier.value)?;
        }
        Ok(())
    }
}

pub const MAX_DIVERSITY_SCORE: f64 = 1.0;

/// Free-form tags attached to a node or store (`ssd`, `a`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default)]
    pub attrs: Vec<String>,
}

impl Attributes {
    pub fn new<I, S>(attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attrs: attrs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.attrs.iter().any(|a| a == value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    #[serde(default)]
    pub locality: Locality,
    #[serde(default)]
    pub attrs: Attributes,
}

/// Capacity and load reported by a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreCapacity {
    pub capacity: u64,
    pub available: u64,
    pub logical_bytes: u64,
    pub range_count: u32,
    pub lease_count: u32,
    /// Normalized I/O pressure; 1.0 means the store is at its admission limit.
    pub io_threshold: f64,
}

impl StoreCapacity {
    /// Fraction of the disk in use. Stores that report no capacity are treated
    /// as empty.
    pub fn fraction_used(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        let used = self.capacity.saturating_sub(self.available);
        used as f64 / self.capacity as f64
    }
}

/// Latest gossiped view of one store. Replaced wholesale on every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub store_id: StoreId,
    pub node: NodeDescriptor,
    #[serde(default)]
    pub attrs: Attributes,
    #[serde(default)]
    pub capacity: StoreCapacity,
}

impl StoreDescriptor {
    pub fn node_id(&self) -> NodeId {
        self.node.node_id
    }

    pub fn locality(&self) -> &Locality {
        &self.node.locality
    }
}

/// Role of a replica in its range's consensus configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaType {
    #[default]
    Voter,
    NonVoter,
    VoterIncoming,
    VoterOutgoing,
    VoterDemotingLearner,
    VoterDemotingNonVoter,
}

impl ReplicaType {
    /// True for the transitional types that only exist while an atomic
    /// replication change is in flight.
    pub fn is_in_atomic_change(self) -> bool {
        matches!(
            self,
            ReplicaType::VoterIncoming
                | ReplicaType::VoterOutgoing
                | ReplicaType::VoterDemotingLearner
                | ReplicaType::VoterDemotingNonVoter
        )
    }

    /// Voter in the incoming (post-change) configuration.
    pub fn is_voter_new_config(self) -> bool {
        matches!(self, ReplicaType::Voter | ReplicaType::VoterIncoming)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
    #[serde(default)]
    pub replica_id: ReplicaId,
    #[serde(default, rename = "type")]
    pub replica_type: ReplicaType,
}

impl ReplicaDescriptor {
    pub fn new(node_id: NodeId, store_id: StoreId, replica_id: ReplicaId) -> Self {
        Self {
            node_id,
            store_id,
            replica_id,
            replica_type: ReplicaType::Voter,
        }
    }

    pub fn with_type(mut self, replica_type: ReplicaType) -> Self {
        self.replica_type = replica_type;
        self
    }

    pub fn target(&self) -> ReplicationTarget {
        ReplicationTarget::new(self.node_id, self.store_id)
    }
}

/// Replica set of one range. Store IDs are unique within `replicas`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    #[serde(default)]
    pub replicas: Vec<ReplicaDescriptor>,
    #[serde(default)]
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    pub fn new(range_id: RangeId, replicas: Vec<ReplicaDescriptor>) -> Self {
        let next_replica_id = replicas.iter().map(|r| r.replica_id).max().unwrap_or(0) + 1;
        Self {
            range_id,
            replicas,
            next_replica_id,
        }
    }

    pub fn voters(&self) -> Vec<ReplicaDescriptor> {
        self.replicas
            .iter()
            .copied()
            .filter(|r| r.replica_type.is_voter_new_config())
            .collect()
    }

    pub fn non_voters(&self) -> Vec<ReplicaDescriptor> {
        self.replicas
            .iter()
            .copied()
            .filter(|r| r.replica_type == ReplicaType::NonVoter)
            .collect()
    }

    pub fn has_replica_on_node(&self, node_id: NodeId) -> bool {
        self.replicas.iter().any(|r| r.node_id == node_id)
    }

    pub fn replica_on_store(&self, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.store_id == store_id)
    }

    /// Position of the replica on `store_id`. A missing replica means the
    /// caller's bookkeeping is corrupt.
    pub fn replica_index(&self, store_id: StoreId) -> Result<usize, InvariantViolation> {
        self.replicas
            .iter()
            .position(|r| r.store_id == store_id)
            .ok_or_else(|| {
                InvariantViolation::new(format!(
                    "r{}: no replica on s{store_id} in {:?}",
                    self.range_id, self.replicas
                ))
            })
    }

    /// Rejects descriptors that place two replicas on one store.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        for (i, replica) in self.replicas.iter().enumerate() {
            if self.replicas[..i]
                .iter()
                .any(|other| other.store_id == replica.store_id)
            {
                return Err(InvariantViolation::new(format!(
                    "r{}: duplicate replicas on s{}",
                    self.range_id, replica.store_id
                )));
            }
        }
        Ok(())
    }

    /// Appends a replica on `target`, assigning the next replica ID.
    pub fn add_replica(
        &mut self,
        target: ReplicationTarget,
        replica_type: ReplicaType,
    ) -> Result<ReplicaDescriptor, InvariantViolation> {
        if self.replica_on_store(target.store_id).is_some() {
            return Err(InvariantViolation::new(format!(
                "r{}: s{} already holds a replica",
                self.range_id, target.store_id
            )));
        }
        let replica_id = self.next_replica_id.max(1);
        self.next_replica_id = replica_id + 1;
        let replica = ReplicaDescriptor {
            node_id: target.node_id,
            store_id: target.store_id,
            replica_id,
            replica_type,
        };
        self.replicas.push(replica);
        Ok(replica)
    }

    pub fn remove_replica(
        &mut self,
        store_id: StoreId,
    ) -> Result<ReplicaDescriptor, InvariantViolation> {
        let idx = self.replica_index(store_id)?;
        Ok(self.replicas.remove(idx))
    }
}

/// A (node, store) pair a replica can be placed on. The zero value means "no
/// target".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicationTarget {
    pub node_id: NodeId,
    pub store_id: StoreId,
}

impl ReplicationTarget {
    pub fn new(node_id: NodeId, store_id: StoreId) -> Self {
        Self { node_id, store_id }
    }

    pub fn is_empty(&self) -> bool {
        self.store_id == 0 && self.node_id == 0
    }
}

impl fmt::Display for ReplicationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{},s{}", self.node_id, self.store_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintType {
    #[default]
    Required,
    Prohibited,
}

/// An attribute (empty `key`) or locality tier (`key=value`) predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default, rename = "type")]
    pub constraint_type: ConstraintType,
    #[serde(default)]
    pub key: String,
    pub value: String,
}

impl Constraint {
    pub fn required(value: impl Into<String>) -> Self {
        Self {
            constraint_type: ConstraintType::Required,
            key: String::new(),
            value: value.into(),
        }
    }

    pub fn prohibited(value: impl Into<String>) -> Self {
        Self {
            constraint_type: ConstraintType::Prohibited,
            key: String::new(),
            value: value.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Whether the store carries the attribute or locality tier, ignoring
    /// the constraint type.
    pub fn matches(&self, store: &StoreDescriptor) -> bool {
        if self.key.is_empty() {
            return store.attrs.contains(&self.value) || store.node.attrs.contains(&self.value);
        }
        store
            .locality()
            .tiers
            .iter()
            .any(|t| t.key == self.key && t.value == self.value)
    }

    pub fn satisfied_by(&self, store: &StoreDescriptor) -> bool {
        match self.constraint_type {
            ConstraintType::Required => self.matches(store),
            ConstraintType::Prohibited => !self.matches(store),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.constraint_type {
            ConstraintType::Required => "+",
            ConstraintType::Prohibited => "-",
        };
        if self.key.is_empty() {
            write!(f, "{prefix}{}", self.value)
        } else {
            write!(f, "{prefix}{}={}", self.key, self.value)
        }
    }
}

/// Constraints that must hold together for `num_replicas` replicas; zero
/// applies the conjunction to every replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintsConjunction {
    #[serde(default)]
    pub num_replicas: u32,
    pub constraints: Vec<Constraint>,
}

impl ConstraintsConjunction {
    pub fn satisfied_by(&self, store: &StoreDescriptor) -> bool {
        self.constraints.iter().all(|c| c.satisfied_by(store))
    }
}

/// Replication policy applied to a range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanConfig {
    pub num_replicas: u32,
    /// Zero means every replica is a voter.
    pub num_voters: u32,
    pub constraints: Vec<ConstraintsConjunction>,
    pub voter_constraints: Vec<ConstraintsConjunction>,
}

impl SpanConfig {
    pub fn get_num_voters(&self) -> u32 {
        if self.num_voters == 0 {
            self.num_replicas
        } else {
            self.num_voters
        }
    }

    pub fn get_num_non_voters(&self) -> u32 {
        self.num_replicas.saturating_sub(self.get_num_voters())
    }
}

/// Load attributed to a range, used to project store load after a move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeUsageInfo {
    pub logical_bytes: u64,
    pub queries_per_second: f64,
    pub writes_per_second: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressState {
    #[default]
    Probe,
    Replicate,
    Snapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub match_index: u64,
    pub state: ProgressState,
}

/// Leader-side replication progress for a range, as reported by the
/// consensus layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationStatus {
    pub leader: ReplicaId,
    pub commit: u64,
    pub progress: HashMap<ReplicaId, Progress>,
}

impl ReplicationStatus {
    /// Leader status where every replica is fully caught up.
    pub fn caught_up(leader: ReplicaId, commit: u64, replicas: &[ReplicaDescriptor]) -> Self {
        let progress = replicas
            .iter()
            .map(|r| {
                (
                    r.replica_id,
                    Progress {
                        match_index: commit,
                        state: ProgressState::Replicate,
                    },
                )
            })
            .collect();
        Self {
            leader,
            commit,
            progress,
        }
    }

    /// Whether the replica has every committed entry. The leader always does.
    pub fn is_up_to_date(&self, replica_id: ReplicaId) -> bool {
        if replica_id == self.leader {
            return true;
        }
        self.progress
            .get(&replica_id)
            .map(|p| p.state == ProgressState::Replicate && p.match_index >= self.commit)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locality(pairs: &[(&str, &str)]) -> Locality {
        Locality::new(pairs.iter().map(|(k, v)| Tier::new(*k, *v)).collect())
    }

    #[test]
    fn diversity_score_weights_top_tier_difference() {
        let a = locality(&[("region", "us"), ("zone", "a")]);
        let b = locality(&[("region", "us"), ("zone", "b")]);
        let c = locality(&[("region", "eu"), ("zone", "a")]);
        assert_eq!(a.diversity_score(&a), 0.0);
        assert_eq!(a.diversity_score(&b), 0.5);
        assert_eq!(a.diversity_score(&c), 1.0);
        assert_eq!(a.diversity_score(&locality(&[("region", "us")])), 0.25);
    }

    #[test]
    fn constraint_matches_attrs_and_tiers() {
        let store = StoreDescriptor {
            store_id: 1,
            node: NodeDescriptor {
                node_id: 1,
                locality: locality(&[("datacenter", "a")]),
                attrs: Attributes::new(["fast"]),
            },
            attrs: Attributes::new(["ssd"]),
            capacity: StoreCapacity::default(),
        };
        assert!(Constraint::required("ssd").satisfied_by(&store));
        assert!(Constraint::required("fast").satisfied_by(&store));
        assert!(!Constraint::prohibited("ssd").satisfied_by(&store));
        assert!(Constraint::required("a").with_key("datacenter").satisfied_by(&store));
        assert!(!Constraint::required("b").with_key("datacenter").satisfied_by(&store));
        assert_eq!(Constraint::prohibited("b").with_key("dc").to_string(), "-dc=b");
    }

    #[test]
    fn range_descriptor_tracks_replica_ids() {
        let mut desc = RangeDescriptor::new(7, vec![ReplicaDescriptor::new(2, 2, 1)]);
        let added = desc
            .add_replica(ReplicationTarget::new(3, 3), ReplicaType::NonVoter)
            .expect("add");
        assert_eq!(added.replica_id, 2);
        assert_eq!(desc.voters().len(), 1);
        assert_eq!(desc.non_voters().len(), 1);
        assert!(desc
            .add_replica(ReplicationTarget::new(3, 3), ReplicaType::Voter)
            .is_err());
        desc.remove_replica(2).expect("remove");
        assert!(desc.remove_replica(2).is_err());
    }

    #[test]
    fn duplicate_stores_fail_validation() {
        let desc = RangeDescriptor::new(
            1,
            vec![ReplicaDescriptor::new(1, 1, 1), ReplicaDescriptor::new(1, 1, 2)],
        );
        assert!(desc.validate().is_err());
    }

    #[test]
    fn span_config_defaults_voters_to_replicas() {
        let conf = SpanConfig {
            num_replicas: 5,
            ..SpanConfig::default()
        };
        assert_eq!(conf.get_num_voters(), 5);
        assert_eq!(conf.get_num_non_voters(), 0);
        let conf = SpanConfig {
            num_replicas: 5,
            num_voters: 3,
            ..SpanConfig::default()
        };
        assert_eq!(conf.get_num_non_voters(), 2);
    }
}
