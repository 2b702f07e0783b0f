//! Replica placement for HoloStore ranges.
//!
//! The pieces, bottom up:
//! - `liveness`: epoch-based node liveness over conditional writes.
//! - `store_pool`: gossiped store descriptors plus liveness, exposed to the
//!   allocator as filtered store lists.
//! - `allocator`: decides what a range needs (add, remove, replace,
//!   rebalance) and scores stores to carry it out.
//! - `replicate_queue`: walks ranges, asks the allocator, and applies the
//!   resulting replica changes, parking ranges that can't make progress.
//! - `sim`: an in-memory cluster that drives the queue end to end.

pub mod allocator;
pub mod clock;
pub mod error;
pub mod liveness;
pub mod purgatory;
pub mod replicate_queue;
pub mod sim;
pub mod store_pool;
pub mod testutil;
pub mod types;

pub use allocator::{
    Allocator, AllocatorAction, AllocatorSettings, RebalanceDecision, TargetReplicaType,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use liveness::{LivenessConfig, NodeLiveness};
pub use replicate_queue::{ReplicateQueue, ReplicateQueueConfig};
pub use store_pool::{AllocatorStorePool, StoreFilter, StorePool, StorePoolConfig, StoreStatus};
