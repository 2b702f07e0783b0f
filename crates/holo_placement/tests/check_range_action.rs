//! What the replicate queue decides for a single range, and the target it
//! picks when the decision needs one.

mod common;

use common::{
    constrain_to, simple_config, store, three_stores, two_dc_stores, voters, with_range_count,
};
use holo_placement::error::is_purgatory_error;
use holo_placement::liveness::NodeLivenessStatus;
use holo_placement::replicate_queue::check_range_action;
use holo_placement::store_pool::OverrideStorePool;
use holo_placement::testutil::create_test_allocator;
use holo_placement::types::{
    RangeDescriptor, ReplicaDescriptor, ReplicaType, ReplicationTarget, SpanConfig,
};
use holo_placement::AllocatorAction;

/// `num_replicas` replicas, all on nodes with attribute `attr`.
fn all_on(num_replicas: u32, attr: &str) -> SpanConfig {
    SpanConfig {
        num_replicas,
        constraints: vec![constrain_to(0, &[attr])],
        ..SpanConfig::default()
    }
}

#[test]
fn upreplicates_onto_least_loaded_store() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(3, true);
    gossiper.gossip_stores(&[
        store(1, 1),
        with_range_count(store(2, 2), 5),
        with_range_count(store(3, 3), 1),
    ]);
    let desc = RangeDescriptor::new(1, voters(&[(1, 1)]));
    let check = check_range_action(&allocator, sp.as_ref(), &desc, &simple_config(3));
    assert_eq!(check.action, AllocatorAction::AddVoter);
    assert!(check.error.is_none(), "{:?}", check.error);
    assert_eq!(check.target.store_id, 3);
    assert!(check.replacing.is_none());
}

#[test]
fn dead_voter_is_replaced_before_decommissioning_one() {
    let (base, allocator, _clock, gossiper) = create_test_allocator(5, true);
    gossiper.gossip_stores(&(1..=5).map(|id| store(id, id)).collect::<Vec<_>>());
    let sp = OverrideStorePool::new(base, |node_id, _, _| match node_id {
        1 => NodeLivenessStatus::Dead,
        2 => NodeLivenessStatus::Decommissioning,
        _ => NodeLivenessStatus::Live,
    });
    let conf = simple_config(3);

    let desc = RangeDescriptor::new(1, voters(&[(1, 1), (2, 2), (3, 3)]));
    let check = check_range_action(&allocator, &sp, &desc, &conf);
    assert_eq!(check.action, AllocatorAction::ReplaceDeadVoter);
    assert_eq!(check.replacing.map(|r| r.store_id), Some(1));
    assert_eq!(check.target.store_id, 4);

    let desc = RangeDescriptor::new(1, voters(&[(4, 4), (2, 2), (3, 3)]));
    let check = check_range_action(&allocator, &sp, &desc, &conf);
    assert_eq!(check.action, AllocatorAction::ReplaceDecommissioningVoter);
    assert_eq!(check.replacing.map(|r| r.store_id), Some(2));
    assert_eq!(check.target.store_id, 5);
}

#[test]
fn excess_decommissioning_voter_is_removed_not_replaced() {
    let (base, allocator, _clock, gossiper) = create_test_allocator(3, true);
    gossiper.gossip_stores(&three_stores());
    let sp = OverrideStorePool::new(base, |node_id, _, _| match node_id {
        3 => NodeLivenessStatus::Decommissioning,
        _ => NodeLivenessStatus::Live,
    });
    // Two available nodes still call for three voters, so the range keeps
    // what it has until a store joins.
    let desc = RangeDescriptor::new(1, voters(&[(1, 1), (2, 2), (3, 3)]));
    let check = check_range_action(&allocator, &sp, &desc, &simple_config(3));
    assert_eq!(check.action, AllocatorAction::ReplaceDecommissioningVoter);
    let err = check.error.expect("no store to replace onto");
    assert!(is_purgatory_error(&err), "{err:#}");

    let desc = RangeDescriptor::new(1, voters(&[(1, 1), (2, 2), (3, 3)]));
    let check = check_range_action(&allocator, &sp, &desc, &simple_config(1));
    assert_eq!(check.action, AllocatorAction::RemoveDecommissioningVoter);
    assert!(check.error.is_none());
}

#[test]
fn missing_capacity_parks_in_purgatory() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(1, true);
    gossiper.gossip_stores(&[store(1, 1)]);
    let desc = RangeDescriptor::new(1, voters(&[(1, 1)]));
    let check = check_range_action(&allocator, sp.as_ref(), &desc, &simple_config(3));
    assert_eq!(check.action, AllocatorAction::AddVoter);
    let err = check.error.expect("allocation error");
    assert!(is_purgatory_error(&err), "{err:#}");
}

#[test]
fn in_flight_change_is_finalized_first() {
    let (sp, allocator, _clock, gossiper) = create_test_allocator(3, true);
    gossiper.gossip_stores(&three_stores());
    let desc = RangeDescriptor::new(
        1,
        vec![
            ReplicaDescriptor::new(1, 1, 1),
            ReplicaDescriptor::new(2, 2, 2).with_type(ReplicaType::VoterOutgoing),
            ReplicaDescriptor::new(3, 3, 3).with_type(ReplicaType::VoterIncoming),
        ],
    );
    let check = check_range_action(&allocator, sp.as_ref(), &desc, &simple_config(3));
    assert_eq!(check.action, AllocatorAction::FinalizeAtomicReplicationChange);
}

#[test]
fn upreplicates_into_constrained_locality_then_sheds_the_outsider() {
    const IN_B: [u64; 3] = [4, 5, 6];
    let conf = all_on(3, "b");
    // Ties between the "b" stores are broken at random; run it a few times.
    for _ in 0..10 {
        let (sp, allocator, _clock, gossiper) = create_test_allocator(10, false);
        gossiper.gossip_stores(&two_dc_stores());
        let mut desc = RangeDescriptor::new(1, voters(&[(2, 2)]));

        for _ in 0..2 {
            let check = check_range_action(&allocator, sp.as_ref(), &desc, &conf);
            assert!(check.error.is_none(), "{:?}", check.error);
            assert_eq!(check.action, AllocatorAction::AddVoter);
            assert!(IN_B.contains(&check.target.store_id), "got {}", check.target);
            desc.add_replica(check.target, ReplicaType::Voter)
                .expect("new store");
        }

        let check = check_range_action(&allocator, sp.as_ref(), &desc, &conf);
        assert!(check.error.is_none(), "{:?}", check.error);
        assert_eq!(check.action, AllocatorAction::ConsiderRebalance);
        assert!(check.target.is_empty());

        let remaining = IN_B
            .into_iter()
            .find(|id| !desc.has_replica_on_node(*id))
            .expect("one b store left");
        desc.add_replica(ReplicationTarget::new(remaining, remaining), ReplicaType::Voter)
            .expect("new store");
        let check = check_range_action(&allocator, sp.as_ref(), &desc, &conf);
        assert!(check.error.is_none(), "{:?}", check.error);
        assert_eq!(check.action, AllocatorAction::RemoveVoter);
        assert!(check.target.is_empty());

        desc.remove_replica(2).expect("s2 holds a replica");
        let check = check_range_action(&allocator, sp.as_ref(), &desc, &conf);
        assert!(check.error.is_none(), "{:?}", check.error);
        assert_eq!(check.action, AllocatorAction::ConsiderRebalance);
    }
}

#[test]
fn decommissioning_n2_with_n1_down() {
    let (base, allocator, _clock, gossiper) = create_test_allocator(10, false);
    gossiper.gossip_stores(&two_dc_stores());
    let sp = OverrideStorePool::new(base, |node_id, _, _| match node_id {
        1 => NodeLivenessStatus::Dead,
        2 => NodeLivenessStatus::Decommissioning,
        _ => NodeLivenessStatus::Live,
    });
    let remaining = [5, 6];
    let mut desc = RangeDescriptor::new(1, voters(&[(2, 2), (3, 3), (4, 4)]));

    let check = check_range_action(&allocator, &sp, &desc, &simple_config(3));
    assert!(check.error.is_none(), "{:?}", check.error);
    assert_eq!(check.action, AllocatorAction::ReplaceDecommissioningVoter);
    assert!(remaining.contains(&check.target.store_id), "got {}", check.target);

    let check = check_range_action(&allocator, &sp, &desc, &simple_config(1));
    assert!(check.error.is_none(), "{:?}", check.error);
    assert_eq!(check.action, AllocatorAction::RemoveDecommissioningVoter);
    assert!(check.target.is_empty());

    // The only other "a" store is down.
    let check = check_range_action(&allocator, &sp, &desc, &all_on(3, "a"));
    assert_eq!(check.action, AllocatorAction::ReplaceDecommissioningVoter);
    assert!(check.error.is_some());
    assert!(check.target.is_empty());

    for replica_type in [
        ReplicaType::VoterIncoming,
        ReplicaType::VoterOutgoing,
        ReplicaType::VoterDemotingLearner,
        ReplicaType::VoterDemotingNonVoter,
    ] {
        desc.replicas[0].replica_type = replica_type;
        let check = check_range_action(&allocator, &sp, &desc, &simple_config(3));
        assert!(check.error.is_none(), "{replica_type:?}: {:?}", check.error);
        assert_eq!(
            check.action,
            AllocatorAction::FinalizeAtomicReplicationChange,
            "{replica_type:?}"
        );
        assert!(check.target.is_empty());
    }

    desc.replicas[0].replica_type = ReplicaType::NonVoter;
    desc.replicas[1].replica_type = ReplicaType::NonVoter;
    let conf = SpanConfig {
        num_replicas: 3,
        num_voters: 1,
        ..SpanConfig::default()
    };
    let check = check_range_action(&allocator, &sp, &desc, &conf);
    assert!(check.error.is_none(), "{:?}", check.error);
    assert_eq!(check.action, AllocatorAction::ReplaceDecommissioningNonVoter);
    assert_eq!(check.replacing.map(|r| r.store_id), Some(2));
    assert!(remaining.contains(&check.target.store_id), "got {}", check.target);
}
