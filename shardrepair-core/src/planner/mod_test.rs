use serde_json::{json, Value};

use crate::checker::check_collection;
use crate::error::RepairError;
use crate::fixtures::{self, DATABASE, FOLLOWER, LEADER, SERVER_A, SERVER_B, SERVER_C};
use crate::models::{ServerId, Snapshot};
use crate::operations::{GuardPhase, MoveShardOperation, RepairOperation};
use crate::planner::{derive_shard_steps, plan_repair, requires_parking, ShardStep};
use crate::snapshot::parse_snapshot;
use crate::transactions::{begin_repair_guard, finish_repair_guard};

fn servers(ids: &[&str]) -> Vec<ServerId> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn snapshot(plan: Value, health: Value) -> Snapshot {
    parse_snapshot(DATABASE, Some(&plan), Some(&health))
}

fn move_op(shard: &str, from: &str, to: &str, is_leader: bool) -> RepairOperation {
    RepairOperation::MoveShard(MoveShardOperation {
        database: DATABASE.into(),
        collection: FOLLOWER.into(),
        shard: shard.into(),
        from: from.into(),
        to: to.into(),
        is_leader,
    })
}

#[test]
fn derive_steps_for_swapped_pair() {
    let steps = derive_shard_steps(&servers(&["A", "B"]), &servers(&["B", "A"]), |_| Some("C".to_string()));

    let steps = steps.expect("expected a swap to be derivable");
    assert_eq!(
        steps,
        vec![
            ShardStep {
                position: 1,
                from: "B".into(),
                to: "C".into(),
                parking: true
            },
            ShardStep {
                position: 0,
                from: "A".into(),
                to: "B".into(),
                parking: false
            },
            ShardStep {
                position: 1,
                from: "C".into(),
                to: "A".into(),
                parking: false
            },
        ],
        "unexpected steps"
    );
    assert!(steps[1].is_leader(), "expected second step to move the leader");
}

#[test]
fn derive_steps_prefers_plain_installs() {
    // A is still needed at position 1, C is not needed anywhere.
    let steps = derive_shard_steps(&servers(&["A", "B", "C"]), &servers(&["D", "A", "E"]), |_| None).expect("expected derivable steps");

    assert!(!steps.iter().any(|step| step.parking), "expected no parking got {:?}", steps);
    assert_eq!(steps[0].from, "C");
    assert_eq!(steps[0].to, "E");
    assert_eq!(steps[1].from, "A");
    assert_eq!(steps[1].to, "D");
    assert_eq!(steps.len(), 3, "expected three steps got {:?}", steps);
}

#[test]
fn derive_steps_resume_partial_rotation() {
    let after_first = derive_shard_steps(&servers(&["A", "C"]), &servers(&["B", "A"]), |_| None).expect("expected derivable steps");
    assert_eq!(
        after_first
            .iter()
            .map(|step| (step.from.as_str(), step.to.as_str()))
            .collect::<Vec<_>>(),
        vec![("A", "B"), ("C", "A")],
        "unexpected resumed steps"
    );

    let after_second = derive_shard_steps(&servers(&["B", "C"]), &servers(&["B", "A"]), |_| None).expect("expected derivable steps");
    assert_eq!(after_second.len(), 1);
    assert_eq!((after_second[0].from.as_str(), after_second[0].to.as_str()), ("C", "A"));

    let done = derive_shard_steps(&servers(&["B", "A"]), &servers(&["B", "A"]), |_| None).expect("expected derivable steps");
    assert!(done.is_empty(), "expected no steps for a consistent shard");
}

#[test]
fn derive_steps_without_free_server() {
    let steps = derive_shard_steps(&servers(&["A", "B"]), &servers(&["B", "A"]), |_| None);

    assert!(steps.is_none(), "expected no steps without a free server got {:?}", steps);
    assert!(requires_parking(&servers(&["A", "B"]), &servers(&["B", "A"])));
    assert!(!requires_parking(&servers(&["A", "C"]), &servers(&["B", "A"])));
}

#[test]
fn derive_steps_rejects_length_mismatch() {
    assert!(derive_shard_steps(&servers(&["A"]), &servers(&["B", "A"]), |_| None).is_none());
}

#[test]
fn plan_fixture_with_three_healthy_servers() {
    let snapshot = snapshot(fixtures::plan_collections()[DATABASE].clone(), fixtures::health_3_healthy_0_bad());
    let deviation = check_collection(&snapshot, &snapshot.collections[FOLLOWER]).expect("expected fixture to check");

    let plan = plan_repair(&snapshot, &deviation).expect("expected fixture to plan").expect("expected a plan");

    let expected = vec![
        RepairOperation::GuardTransaction(begin_repair_guard(DATABASE, FOLLOWER, LEADER)),
        move_op("s11", SERVER_B, SERVER_C, false),
        move_op("s11", SERVER_A, SERVER_B, true),
        move_op("s11", SERVER_C, SERVER_A, false),
        RepairOperation::GuardTransaction(finish_repair_guard(DATABASE, FOLLOWER, LEADER)),
    ];
    assert_eq!(plan.operations, expected, "unexpected plan operations");
    assert_eq!(plan.move_count(), 3);
    assert_eq!(plan.leader, LEADER);
    assert_eq!(plan.collection_name, "_frontend");
}

#[test]
fn plan_consistent_collection_is_empty() {
    let plan = json!({
        "1": {"name": "leader", "replicationFactor": 2, "shards": {"s1": [SERVER_A, SERVER_B]}},
        "2": {"name": "follower", "replicationFactor": 2, "distributeShardsLike": "1", "shards": {"s2": [SERVER_A, SERVER_B]}},
    });
    let snapshot = snapshot(plan, fixtures::health_3_healthy_0_bad());
    let deviation = check_collection(&snapshot, &snapshot.collections["2"]).expect("expected collection to check");

    let plan = plan_repair(&snapshot, &deviation).expect("expected planning to succeed");

    assert!(plan.is_none(), "expected no plan got {:?}", plan);
}

#[test]
fn plan_resume_skips_begin_guard() {
    let plan = json!({
        "1": {"name": "leader", "replicationFactor": 2, "shards": {"s1": [SERVER_B, SERVER_A]}},
        "2": {"name": "follower", "replicationFactor": 2, "repairDistributeShardsLike": "1", "shards": {"s2": [SERVER_A, SERVER_C]}},
    });
    let snapshot = snapshot(plan, fixtures::health_3_healthy_0_bad());
    let deviation = check_collection(&snapshot, &snapshot.collections["2"]).expect("expected collection to check");

    let plan = plan_repair(&snapshot, &deviation).expect("expected planning to succeed").expect("expected a plan");

    let phases: Vec<GuardPhase> = plan.operations.iter().filter_map(|op| match op {
            RepairOperation::GuardTransaction(guard) => Some(guard.phase),
            RepairOperation::MoveShard(_) => None,
        }).collect();
    assert_eq!(phases, vec![GuardPhase::FinishRepair], "expected only the finish guard");
    let moves: Vec<(&str, &str, bool)> = plan
        .operations
        .iter()
        .filter_map(|op| op.as_move_shard())
        .map(|op| (op.from.as_str(), op.to.as_str(), op.is_leader))
        .collect();
    assert_eq!(moves, vec![(SERVER_A, SERVER_B, true), (SERVER_C, SERVER_A, false)], "unexpected resumed moves");
}

#[test]
fn plan_marker_without_deviation_only_finishes() {
    let plan = json!({
        "1": {"name": "leader", "replicationFactor": 2, "shards": {"s1": [SERVER_B, SERVER_A]}},
        "2": {"name": "follower", "replicationFactor": 2, "repairDistributeShardsLike": "1", "shards": {"s2": [SERVER_B, SERVER_A]}},
    });
    let snapshot = snapshot(plan, fixtures::health_3_healthy_0_bad());
    let deviation = check_collection(&snapshot, &snapshot.collections["2"]).expect("expected collection to check");

    let plan = plan_repair(&snapshot, &deviation).expect("expected planning to succeed").expect("expected a plan");

    assert_eq!(
        plan.operations,
        vec![RepairOperation::GuardTransaction(finish_repair_guard(DATABASE, "2", "1"))],
        "expected a lone finish guard"
    );
}

#[test]
fn plan_multiple_shards_in_shard_order() {
    let plan = json!({
        "1": {"name": "leader", "replicationFactor": 1, "shards": {"s1": [SERVER_A], "s2": [SERVER_B], "s10": [SERVER_A]}},
        "2": {"name": "follower", "replicationFactor": 1, "distributeShardsLike": "1", "shards": {"s3": [SERVER_B], "s4": [SERVER_A], "s30": [SERVER_B]}},
    });
    let snapshot = snapshot(plan, fixtures::health_2_healthy_0_bad());
    let deviation = check_collection(&snapshot, &snapshot.collections["2"]).expect("expected collection to check");

    let plan = plan_repair(&snapshot, &deviation).expect("expected planning to succeed").expect("expected a plan");

    let shards: Vec<&str> = plan.operations.iter().filter_map(|op| op.as_move_shard()).map(|op| op.shard.as_str()).collect();
    assert_eq!(shards, vec!["s3", "s4", "s30"], "expected moves in numeric shard order");
    assert!(
        plan.operations.iter().filter_map(|op| op.as_move_shard()).all(|op| op.is_leader),
        "expected every single-replica move to move the leader"
    );
}

#[test]
fn plan_shard_without_free_server_fails() {
    let snapshot = snapshot(fixtures::plan_collections()[DATABASE].clone(), fixtures::health_3_healthy_0_bad());
    let deviation = check_collection(&snapshot, &snapshot.collections[FOLLOWER]).expect("expected fixture to check");
    // Health changed between check and plan.
    let degraded = snapshot_with_health(&snapshot, fixtures::health_2_healthy_1_bad());

    let res = plan_repair(&degraded, &deviation);

    assert!(
        matches!(res, Err(RepairError::InsufficientHealthyServers { required: 3, available: 2, .. })),
        "expected InsufficientHealthyServers error got {:?}",
        res
    );
}

fn snapshot_with_health(snapshot: &Snapshot, health: Value) -> Snapshot {
    let mut updated = snapshot.clone();
    updated.health = parse_snapshot(DATABASE, None, Some(&health)).health;
    updated
}
