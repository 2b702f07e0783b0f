use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::duration_ms;
use crate::types::NodeId;

/// Cluster membership of a node. Transitions only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    #[default]
    Active,
    Decommissioning,
    Decommissioned,
}

impl MembershipStatus {
    pub fn is_active(self) -> bool {
        self == MembershipStatus::Active
    }

    pub fn can_transition_to(self, to: MembershipStatus) -> bool {
        matches!(
            (self, to),
            (MembershipStatus::Active, MembershipStatus::Decommissioning)
                | (MembershipStatus::Decommissioning, MembershipStatus::Decommissioned)
        )
    }
}

/// Health of a node as seen by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeLivenessStatus {
    Unknown,
    Dead,
    Unavailable,
    Live,
    Decommissioning,
    Decommissioned,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liveness {
    pub node_id: NodeId,
    pub epoch: u64,
    pub expiration_ms: u64,
    #[serde(default)]
    pub draining: bool,
    #[serde(default)]
    pub membership: MembershipStatus,
}

impl Liveness {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            epoch: 1,
            expiration_ms: 0,
            draining: false,
            membership: MembershipStatus::Active,
        }
    }

    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expiration_ms
    }

    pub fn is_dead(&self, now_ms: u64, dead_threshold: Duration) -> bool {
        now_ms >= self.expiration_ms.saturating_add(duration_ms(dead_threshold))
    }

    pub fn status(&self, now_ms: u64, dead_threshold: Duration) -> NodeLivenessStatus {
        if self.is_dead(now_ms, dead_threshold) {
            if self.membership == MembershipStatus::Decommissioned {
                return NodeLivenessStatus::Decommissioned;
            }
            return NodeLivenessStatus::Dead;
        }
        match self.membership {
            MembershipStatus::Decommissioned => return NodeLivenessStatus::Decommissioned,
            MembershipStatus::Decommissioning => return NodeLivenessStatus::Decommissioning,
            MembershipStatus::Active => {}
        }
        if self.draining {
            return NodeLivenessStatus::Draining;
        }
        if self.is_live(now_ms) {
            NodeLivenessStatus::Live
        } else {
            NodeLivenessStatus::Unavailable
        }
    }
}

/// A liveness value together with the storage version it was read at. The
/// version is the compare-and-swap guard for the next write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub liveness: Liveness,
    pub version: u64,
}

/// Whether `new` supersedes `old` in the local cache: a higher epoch wins,
/// then a later expiration, then a changed membership or draining flag.
pub(crate) fn should_replace(old: &Liveness, new: &Liveness) -> bool {
    if old.epoch != new.epoch {
        return new.epoch > old.epoch;
    }
    if old.expiration_ms != new.expiration_ms {
        return new.expiration_ms > old.expiration_ms;
    }
    old.membership != new.membership || old.draining != new.draining
}
