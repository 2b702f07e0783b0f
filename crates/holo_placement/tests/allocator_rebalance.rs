//! Allocation, removal and rebalancing decisions against a gossiped store
//! pool.

mod common;

use common::{
    constrain_to, simple_config, store, two_dc_stores, voters, with_locality, with_range_count,
};
use rand::seq::SliceRandom;

use holo_placement::clock::Clock;
use holo_placement::store_pool::StoreFilter;
use holo_placement::testutil::create_test_allocator;
use holo_placement::types::{RangeUsageInfo, SpanConfig};

#[test]
fn rebalance_moves_replica_off_busy_store_in_shared_locality() {
    // s1 shares dc "a" with s2 and s3; s4 and s5 are alone in their dcs and
    // far busier, but moving them would cost diversity.
    let cases = [
        (55, 55, None),
        (48, 48, None),
        (44, 55, Some((2, 1))),
    ];
    for (s2_count, s3_count, expected) in cases {
        // Random tie-breaking must not turn "stay put" into a move.
        let (sp, allocator, _clock, gossiper) = create_test_allocator(5, false);
        gossiper.gossip_stores(&[
            with_range_count(with_locality(store(1, 1), &[("dc", "a")]), 50),
            with_range_count(with_locality(store(2, 2), &[("dc", "a")]), s2_count),
            with_range_count(with_locality(store(3, 3), &[("dc", "a")]), s3_count),
            with_range_count(with_locality(store(4, 4), &[("dc", "b")]), 100),
            with_range_count(with_locality(store(5, 5), &[("dc", "c")]), 100),
        ]);
        let existing = voters(&[(1, 1), (4, 4), (5, 5)]);
        let opts = allocator.scorer_options();
        for i in 0..10 {
            let decision = allocator.rebalance_voter(
                sp.as_ref(),
                &simple_config(3),
                None,
                &existing,
                &[],
                &RangeUsageInfo::default(),
                StoreFilter::Throttled,
                &opts,
            );
            let got = decision.map(|d| (d.target.store_id, d.origin.store_id));
            assert_eq!(got, expected, "s2={s2_count} s3={s3_count} iteration {i}");
        }
    }
}

#[test]
fn allocate_prefers_diversity_over_range_count() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(3, true);
    gossiper.gossip_stores(&[
        with_locality(store(1, 1), &[("dc", "a")]),
        with_locality(store(2, 2), &[("dc", "a")]),
        with_range_count(with_locality(store(3, 3), &[("dc", "b")]), 10),
    ]);
    let (target, _) = allocator
        .allocate_voter(
            sp.as_ref(),
            &simple_config(3),
            &voters(&[(1, 1)]),
            &[],
            None,
            &RangeUsageInfo::default(),
        )
        .expect("allocate");
    assert_eq!(target.store_id, 3);
}

#[test]
fn allocate_honors_required_attributes() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(6, true);
    gossiper.gossip_stores(&two_dc_stores());
    let conf = SpanConfig {
        num_replicas: 3,
        constraints: vec![constrain_to(0, &["b", "ssd"])],
        ..SpanConfig::default()
    };
    let (target, _) = allocator
        .allocate_voter(sp.as_ref(), &conf, &[], &[], None, &RangeUsageInfo::default())
        .expect("allocate");
    assert!((4..=6).contains(&target.store_id), "got {target}");
}

#[test]
fn allocate_fills_per_count_constraints_first() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(6, true);
    let mut stores = two_dc_stores();
    // Make "a" stores the obvious choice on range count alone.
    for s in stores.iter_mut().filter(|s| s.store_id > 3) {
        s.capacity.range_count = 40;
    }
    gossiper.gossip_stores(&stores);
    let conf = SpanConfig {
        num_replicas: 3,
        constraints: vec![constrain_to(1, &["a"]), constrain_to(1, &["b"])],
        ..SpanConfig::default()
    };
    let (target, details) = allocator
        .allocate_voter(
            sp.as_ref(),
            &conf,
            &voters(&[(1, 1)]),
            &[],
            None,
            &RangeUsageInfo::default(),
        )
        .expect("allocate");
    assert!((4..=6).contains(&target.store_id), "got {target}: {details}");
}

#[test]
fn remove_voter_drops_duplicated_locality_but_spares_leaseholder() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(3, true);
    gossiper.gossip_stores(&[
        with_locality(store(1, 1), &[("dc", "a")]),
        with_locality(store(2, 2), &[("dc", "a")]),
        with_locality(store(3, 3), &[("dc", "b")]),
    ]);
    let existing = voters(&[(1, 1), (2, 2), (3, 3)]);
    let conf = simple_config(3);

    let (target, _) = allocator
        .remove_voter(sp.as_ref(), &conf, &existing, &existing, &[], Some(1))
        .expect("remove");
    assert_eq!(target.store_id, 2);

    let (target, _) = allocator
        .remove_voter(sp.as_ref(), &conf, &existing, &existing, &[], Some(2))
        .expect("remove");
    assert_eq!(target.store_id, 1);
}

#[test]
fn balanced_cluster_does_not_rebalance() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(4, true);
    gossiper.gossip_stores(&[
        with_range_count(store(1, 1), 10),
        with_range_count(store(2, 2), 11),
        with_range_count(store(3, 3), 10),
        with_range_count(store(4, 4), 9),
    ]);
    let existing = voters(&[(1, 1), (2, 2), (3, 3)]);
    let opts = allocator.scorer_options();
    let decision = allocator.rebalance_voter(
        sp.as_ref(),
        &simple_config(3),
        None,
        &existing,
        &[],
        &RangeUsageInfo::default(),
        StoreFilter::Throttled,
        &opts,
    );
    assert_eq!(decision, None);
}

#[test]
fn throttled_store_can_still_shed_a_replica() {
    let (sp, allocator, clock, gossiper) = create_test_allocator(4, true);
    gossiper.gossip_stores(&[
        with_range_count(store(1, 1), 100),
        with_range_count(store(2, 2), 10),
        with_range_count(store(3, 3), 10),
        with_range_count(store(4, 4), 10),
    ]);
    assert!(sp.set_throttled_until(1, clock.now_ms() + 60_000, "too many snapshots"));
    let existing = voters(&[(1, 1), (2, 2), (3, 3)]);
    let opts = allocator.scorer_options();
    let decision = allocator
        .rebalance_voter(
            sp.as_ref(),
            &simple_config(3),
            None,
            &existing,
            &[],
            &RangeUsageInfo::default(),
            StoreFilter::Throttled,
            &opts,
        )
        .expect("s1 is far above the mean");
    assert_eq!(decision.target.store_id, 4);
    assert_eq!(decision.origin.store_id, 1);
}

#[test]
fn allocation_never_picks_an_occupied_store() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(6, false);
    gossiper.gossip_stores(&two_dc_stores());
    let usage = RangeUsageInfo::default();
    let mut rng = rand::thread_rng();
    let mut ids: Vec<u64> = (1..=6).collect();

    for size in 0..=4 {
        for _ in 0..30 {
            ids.shuffle(&mut rng);
            let placed: Vec<(u64, u64)> = ids[..size].iter().map(|&id| (id, id)).collect();
            let existing = voters(&placed);
            let split = size / 2;
            let (existing_voters, existing_non_voters) = existing.split_at(split);

            for (kind, result) in [
                (
                    "voter",
                    allocator.allocate_voter(
                        sp.as_ref(),
                        &simple_config(3),
                        existing_voters,
                        existing_non_voters,
                        None,
                        &usage,
                    ),
                ),
                (
                    "non-voter",
                    allocator.allocate_non_voter(
                        sp.as_ref(),
                        &simple_config(3),
                        existing_voters,
                        existing_non_voters,
                        None,
                        &usage,
                    ),
                ),
            ] {
                let (target, _) = result.expect("free stores remain");
                assert!(
                    !ids[..size].contains(&target.store_id),
                    "{kind} landed on occupied s{} (existing {:?})",
                    target.store_id,
                    &ids[..size]
                );
            }
        }
    }
}
