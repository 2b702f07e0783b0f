//! Classified placement errors.
//!
//! Everything travels as `anyhow::Error`; callers that care about the class
//! use the `is_*` helpers, which look through any added context.

use std::fmt;

use crate::liveness::MembershipStatus;
use crate::types::{ConstraintsConjunction, NodeId};

/// No live, non-throttled store can take the replica right now. Ranges that
/// hit this are parked in purgatory until the cluster changes.
#[derive(Debug, Clone, Default)]
pub struct AllocationError {
    pub constraints: Vec<ConstraintsConjunction>,
    pub voter_constraints: Vec<ConstraintsConjunction>,
    pub existing_voters: usize,
    pub existing_non_voters: usize,
    pub alive_stores: usize,
    pub throttled_stores: usize,
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0 of {} live stores are able to take a new replica for the range \
             ({} throttled, {} already have a voter, {} already have a non-voter)",
            self.alive_stores, self.throttled_stores, self.existing_voters, self.existing_non_voters
        )?;
        if self.constraints.is_empty() && self.voter_constraints.is_empty() {
            return f.write_str("; likely not enough nodes in cluster");
        }
        write!(
            f,
            "; replicas must match constraints {}",
            format_conjunctions(&self.constraints)
        )?;
        if !self.voter_constraints.is_empty() {
            write!(
                f,
                "; voting replicas must match voter_constraints {}",
                format_conjunctions(&self.voter_constraints)
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for AllocationError {}

/// The pool knows about stores, but none of them, in any state, satisfies
/// the mandatory constraints. Only a topology or config change can fix this.
#[derive(Debug, Clone)]
pub struct ConstraintUnsatisfiable {
    pub constraints: Vec<ConstraintsConjunction>,
    pub known_stores: usize,
}

impl fmt::Display for ConstraintUnsatisfiable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "none of {} known stores satisfy constraints {}",
            self.known_stores,
            format_conjunctions(&self.constraints)
        )
    }
}

impl std::error::Error for ConstraintUnsatisfiable {}

/// Matching stores exist but are all temporarily throttled.
#[derive(Debug, Clone)]
pub struct ThrottledStoresError {
    pub reasons: Vec<String>,
}

impl fmt::Display for ThrottledStoresError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} matching stores are currently throttled: {:?}",
            self.reasons.len(),
            self.reasons
        )
    }
}

impl std::error::Error for ThrottledStoresError {}

/// Caller-maintained replica bookkeeping is inconsistent. Whoever receives
/// this must stop; continuing risks corrupting replication state.
#[derive(Debug, Clone)]
#[must_use]
pub struct InvariantViolation {
    pub message: String,
}

impl InvariantViolation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invariant violation: {}", self.message)
    }
}

impl std::error::Error for InvariantViolation {}

/// A conditional liveness write lost its race even after one retry against
/// a fresh read.
#[derive(Debug, Clone)]
pub struct LivenessConditionFailed {
    pub node_id: NodeId,
    pub attempts: u32,
}

impl fmt::Display for LivenessConditionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "liveness update for n{} failed its condition after {} attempts",
            self.node_id, self.attempts
        )
    }
}

impl std::error::Error for LivenessConditionFailed {}

/// Another writer advanced the node's epoch; the heartbeat must not retry.
#[derive(Debug, Clone)]
pub struct EpochIncremented {
    pub node_id: NodeId,
    pub expected: u64,
    pub actual: u64,
}

impl fmt::Display for EpochIncremented {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heartbeat for n{} failed: epoch incremented from {} to {}",
            self.node_id, self.expected, self.actual
        )
    }
}

impl std::error::Error for EpochIncremented {}

#[derive(Debug, Clone)]
pub struct MembershipTransitionError {
    pub node_id: NodeId,
    pub from: MembershipStatus,
    pub to: MembershipStatus,
}

impl fmt::Display for MembershipTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n{}: invalid membership transition {:?} -> {:?}",
            self.node_id, self.from, self.to
        )
    }
}

impl std::error::Error for MembershipTransitionError {}

pub fn is_purgatory_error(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<AllocationError>())
}

pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<InvariantViolation>())
}

pub fn is_constraint_unsatisfiable(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<ConstraintUnsatisfiable>())
}

pub fn is_liveness_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<LivenessConditionFailed>())
}

fn format_conjunctions(conjunctions: &[ConstraintsConjunction]) -> String {
    let parts = conjunctions
        .iter()
        .map(|c| {
            let inner = c
                .constraints
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            if c.num_replicas == 0 {
                format!("[{inner}]")
            } else {
                format!("{}:[{inner}]", c.num_replicas)
            }
        })
        .collect::<Vec<_>>();
    format!("{{{}}}", parts.join(" "))
}
