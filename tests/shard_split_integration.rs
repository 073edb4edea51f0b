//! Integration tests for the shard split lifecycle
//!
//! Drives complete splits against the simulated fleet: child provisioning
//! and cloning, range pruning, replica attachment, both cutover phases, and
//! the cleanup that recycles the parent. Also exercises resuming a split
//! after a child failed mid-import.

use shardherd::adapters::json_sink::NoopSink;
use shardherd::adapters::memory_spares::MemorySpares;
use shardherd::adapters::sim::SimFleet;
use shardherd::{
    Config, Error, InstanceId, Shard, ShardRange, ShardState, SpareRole, TableSpec, Topology,
};
use std::sync::Arc;

fn id(n: u8) -> InstanceId {
    InstanceId::new(format!("10.1.0.{}", n), 3306)
}

fn posts_table() -> TableSpec {
    TableSpec::new("posts", vec!["post_id".to_string()])
}

/// Parent shard posts-[1,100] at .1 with standbys .2/.3, master spares at
/// .4-.6 and standby spares at .7-.12. The parent master is seeded with
/// `rows` and fully probed.
async fn build_fleet(
    config: Config,
    rows: impl IntoIterator<Item = u64>,
) -> (Arc<SimFleet>, Topology, Arc<Shard>) {
    let config = Arc::new(config);
    let fleet = SimFleet::new(config.clone());
    let spares = Arc::new(MemorySpares::new());
    let topology = Topology::new(
        fleet.clone(),
        fleet.clone(),
        config,
        spares.clone(),
        Arc::new(NoopSink),
    );

    for n in 1..=12 {
        fleet.add_server(&id(n));
    }
    fleet.set_binlog(&id(1), "mysql-bin.000010", 4096);
    fleet.seed_table(&id(1), "posts", rows);
    fleet.make_replica(&id(2), &id(1));
    fleet.make_replica(&id(3), &id(1));
    for n in 4..=6 {
        spares.add_spare(SpareRole::Master, id(n));
    }
    for n in 7..=12 {
        spares.add_spare(SpareRole::Standby, id(n));
    }

    let master = topology.db(id(1));
    master.probe(true).await.unwrap();

    let parent = Shard::new(
        "posts",
        ShardRange::new(1, 100),
        master,
        ShardState::Ready,
        Arc::new(NoopSink),
        vec![posts_table()],
    );
    topology.add_shard(parent.clone()).unwrap();
    (fleet, topology, parent)
}

#[tokio::test(start_paused = true)]
async fn test_three_way_split_partitions_the_data() {
    let (fleet, topology, parent) = build_fleet(Config::default(), 1..=100).await;

    let children = parent.split(&topology, 3, None).await.unwrap();
    let names: Vec<_> = children.iter().map(|c| c.name().to_string()).collect();
    assert_eq!(names, ["posts-1-34", "posts-35-67", "posts-68-100"]);

    let expected: [Vec<u64>; 3] = [
        (1..=34).collect(),
        (35..=67).collect(),
        (68..=100).collect(),
    ];
    for (child, rows) in children.iter().zip(&expected) {
        assert_eq!(child.state(), ShardState::Replicating);
        assert_eq!(child.parent().unwrap().name(), "posts-1-100");
        assert_eq!(&fleet.table_ids(child.master().id(), "posts"), rows);

        // Each child master replicates from the parent master and carries
        // its own two standbys.
        let link = fleet.server(child.master().id()).unwrap().link.unwrap();
        assert_eq!(link.master, id(1));
        assert!(link.io_running && link.sql_running);

        let replicas = child.master().slaves();
        assert_eq!(replicas.len(), 2);
        for replica in &replicas {
            let link = fleet.server(replica.id()).unwrap().link.unwrap();
            assert_eq!(&link.master, child.master().id());
            assert!(link.io_running && link.sql_running);
            // Standbys were cloned after the prune, so they hold the slice.
            assert_eq!(&fleet.table_ids(replica.id(), "posts"), rows);
        }
    }
    // The parent kept everything; pruning happened on copies only.
    assert_eq!(fleet.table_ids(&id(1), "posts").len(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_cutover_and_cleanup_recycle_the_parent() {
    let (fleet, topology, parent) = build_fleet(Config::default(), 1..=90).await;
    let children = parent.split(&topology, 3, None).await.unwrap();

    // Live writes keep landing on the parent master after the split; they
    // reach every child through replication.
    fleet.append_writes(&id(1), "posts", 91..=100);

    parent.move_reads_to_children().await.unwrap();
    for child in &children {
        assert_eq!(child.state(), ShardState::Child);
        // Reads moved, writes did not: the write handle still resolves to
        // the parent master.
        assert_eq!(child.write_master().id(), &id(1));
    }
    // Routing prefers the children now.
    let hit = topology.shard_for_id("posts", 50).unwrap();
    assert_eq!(hit.name(), "posts-35-67");

    parent.move_writes_to_children().await.unwrap();
    assert_eq!(parent.state(), ShardState::Deprecated);
    for child in &children {
        assert_eq!(child.state(), ShardState::NeedsCleanup);
        assert_eq!(child.write_master().id(), child.master().id());
    }

    parent.cleanup().await.unwrap();
    assert_eq!(parent.state(), ShardState::Recycle);
    // The retired master is frozen.
    assert!(fleet.server(&id(1)).unwrap().read_only);

    let expected: [Vec<u64>; 3] = [
        (1..=34).collect(),
        (35..=67).collect(),
        (68..=100).collect(),
    ];
    for (child, rows) in children.iter().zip(&expected) {
        assert_eq!(child.state(), ShardState::Ready);
        // Detached from the parent, replicated writes purged down to the
        // child's own slice.
        assert!(fleet.server(child.master().id()).unwrap().link.is_none());
        assert_eq!(&fleet.table_ids(child.master().id(), "posts"), rows);
    }
}

#[tokio::test(start_paused = true)]
async fn test_split_without_spares_fails_before_touching_the_fleet() {
    let config = Arc::new(Config::default());
    let fleet = SimFleet::new(config.clone());
    let topology = Topology::new(
        fleet.clone(),
        fleet.clone(),
        config,
        Arc::new(MemorySpares::new()),
        Arc::new(NoopSink),
    );
    for n in 1..=3 {
        fleet.add_server(&id(n));
    }
    fleet.seed_table(&id(1), "posts", 1..=100);
    fleet.make_replica(&id(2), &id(1));
    fleet.make_replica(&id(3), &id(1));
    let master = topology.db(id(1));
    master.probe(true).await.unwrap();
    let parent = Shard::new(
        "posts",
        ShardRange::new(1, 100),
        master,
        ShardState::Ready,
        Arc::new(NoopSink),
        vec![posts_table()],
    );
    topology.add_shard(parent.clone()).unwrap();

    let err = parent.split(&topology, 3, None).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientSpares { .. }));
    assert!(parent.children().is_empty());
    assert_eq!(parent.state(), ShardState::Ready);
    // Nothing was stopped or cloned.
    assert!(!fleet
        .shell_history()
        .iter()
        .any(|(_, cmd)| cmd.contains("service mysql stop")));
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_split_resumes_from_recorded_states() {
    // No retries anywhere, so a failed import chunk aborts its child
    // outright instead of being absorbed.
    let config = Config {
        chunk_retries: 0,
        command_retries: 0,
        ..Config::default()
    };
    let (fleet, topology, parent) = build_fleet(config, 1..=100).await;

    // One child master will fail its bulk load once.
    fleet.fail_next_sql(&id(4), "LOAD DATA");
    let err = parent.split(&topology, 3, None).await.unwrap_err();
    assert!(matches!(err, Error::Aggregate { .. }));

    let children = parent.children();
    let stuck: Vec<_> = children
        .iter()
        .filter(|c| c.state() == ShardState::Importing)
        .collect();
    assert_eq!(stuck.len(), 1);
    assert!(children
        .iter()
        .filter(|c| c.state() == ShardState::Replicating)
        .count() == 2);

    // Re-running the split picks the stuck child up from its recorded
    // state and finishes; the healthy siblings are not redone.
    let queries_before = fleet.mutating_sql().len();
    let children = parent.split(&topology, 3, None).await.unwrap();
    for child in &children {
        assert_eq!(child.state(), ShardState::Replicating);
        assert_eq!(child.master().slaves().len(), 2);
    }
    // Only the stuck child issued new bulk loads on the resume.
    let new_loads = fleet.mutating_sql()[queries_before..]
        .iter()
        .filter(|(target, sql)| sql.starts_with("LOAD DATA") && *target != id(4))
        .count();
    assert_eq!(new_loads, 0);

    let expected: Vec<u64> = (1..=34).collect();
    assert_eq!(fleet.table_ids(&id(4), "posts"), expected);
}

#[tokio::test(start_paused = true)]
async fn test_split_with_explicit_ranges_must_cover_the_parent() {
    let (_fleet, topology, parent) = build_fleet(Config::default(), 1..=100).await;

    // A gap between 40 and 61.
    let err = parent
        .split(
            &topology,
            2,
            Some(vec![ShardRange::new(1, 40), ShardRange::new(61, 100)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
    assert!(parent.children().is_empty());
}
