//! Allocation errors that distinguish "wait for capacity" from "wait for a
//! throttle" from "never going to work".

mod common;

use std::time::Duration;

use common::{constrain_to, single_store};
use holo_placement::clock::Clock;
use holo_placement::error::{
    is_constraint_unsatisfiable, is_purgatory_error, ThrottledStoresError,
};
use holo_placement::testutil::create_test_allocator;
use holo_placement::types::{RangeUsageInfo, SpanConfig};

fn single_replica_config(attrs: &[&str]) -> SpanConfig {
    SpanConfig {
        num_replicas: 1,
        constraints: vec![constrain_to(0, attrs)],
        ..SpanConfig::default()
    }
}

#[test]
fn throttled_store_is_reported_as_throttled() {
    let (sp, allocator, clock, gossiper) = create_test_allocator(10, false);
    let conf = single_replica_config(&["a", "ssd"]);
    let usage = RangeUsageInfo::default();

    // Nothing gossiped yet: wait for capacity.
    let err = allocator
        .allocate_voter(sp.as_ref(), &conf, &[], &[], None, &usage)
        .expect_err("empty store pool");
    assert!(is_purgatory_error(&err), "{err:#}");

    gossiper.gossip_stores(&single_store());
    let (target, _) = allocator
        .allocate_voter(sp.as_ref(), &conf, &[], &[], None, &usage)
        .expect("allocate onto s1");
    assert_eq!((target.node_id, target.store_id), (1, 1));

    let day = Duration::from_secs(24 * 60 * 60).as_millis() as u64;
    assert!(sp.set_throttled_until(1, clock.now_ms() + day, "too many snapshots"));
    let err = allocator
        .allocate_voter(sp.as_ref(), &conf, &[], &[], None, &usage)
        .expect_err("s1 is throttled");
    assert!(!is_purgatory_error(&err), "{err:#}");
    let throttled = err
        .downcast_ref::<ThrottledStoresError>()
        .expect("throttled stores error");
    assert_eq!(throttled.reasons.len(), 1);
    assert!(throttled.reasons[0].contains("too many snapshots"));

    // Once the throttle lapses the store is eligible again.
    clock.advance(Duration::from_millis(day + 1));
    gossiper.gossip_stores(&single_store());
    allocator
        .allocate_voter(sp.as_ref(), &conf, &[], &[], None, &usage)
        .expect("throttle expired");
}

#[test]
fn impossible_constraints_are_unsatisfiable() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(1, true);
    gossiper.gossip_stores(&single_store());
    let err = allocator
        .allocate_voter(
            sp.as_ref(),
            &single_replica_config(&["b"]),
            &[],
            &[],
            None,
            &RangeUsageInfo::default(),
        )
        .expect_err("no store has attribute b");
    assert!(is_constraint_unsatisfiable(&err), "{err:#}");
    assert!(!is_purgatory_error(&err));
}
