//! Integration tests for chained directory transfers
//!
//! Runs the tar/nc relay against the simulated fleet: multi-destination
//! chains, destination safety checks, and file filtering.

use shardherd::adapters::sim::SimFleet;
use shardherd::topology::registry::HostRegistry;
use shardherd::topology::transfer::{transfer_directory, TransferOptions};
use shardherd::{Config, Error, Host};
use std::sync::Arc;

fn harness() -> (Arc<SimFleet>, HostRegistry) {
    let config = Arc::new(Config::default());
    let fleet = SimFleet::new(config.clone());
    let hosts = HostRegistry::new(fleet.clone(), config);
    (fleet, hosts)
}

fn seed_backup(fleet: &Arc<SimFleet>, ip: &str) {
    fleet.add_file(ip, "/var/tmp/backup/schema.sql", 4096);
    fleet.add_file(ip, "/var/tmp/backup/data/posts.csv", 1 << 20);
    fleet.add_file(ip, "/var/tmp/backup/data/blogs.csv", 512);
}

#[tokio::test(start_paused = true)]
async fn test_chained_copy_reaches_every_destination() {
    let (fleet, hosts) = harness();
    seed_backup(&fleet, "10.3.0.1");
    let source = hosts.get_or_create("10.3.0.1");
    let destinations: Vec<(Arc<Host>, String)> = vec![
        (hosts.get_or_create("10.3.0.2"), "/var/tmp/restore".to_string()),
        (hosts.get_or_create("10.3.0.3"), "/var/tmp/restore".to_string()),
    ];

    transfer_directory(
        &source,
        "/var/tmp/backup",
        &destinations,
        &TransferOptions::default(),
    )
    .await
    .unwrap();

    let want = fleet.files_under("10.3.0.1", "/var/tmp/backup");
    assert_eq!(want.len(), 3);
    assert_eq!(fleet.files_under("10.3.0.2", "/var/tmp/restore"), want);
    assert_eq!(fleet.files_under("10.3.0.3", "/var/tmp/restore"), want);

    // The intermediate hop relays through a fifo/tee pipeline; the tail
    // hop just unpacks.
    let relayed = fleet
        .shell_history()
        .iter()
        .any(|(ip, cmd)| ip == "10.3.0.2" && cmd.contains("tee"));
    let tail_relays = fleet
        .shell_history()
        .iter()
        .any(|(ip, cmd)| ip == "10.3.0.3" && cmd.contains("tee"));
    assert!(relayed);
    assert!(!tail_relays);
}

#[tokio::test(start_paused = true)]
async fn test_refuses_non_empty_destination_without_overwrite() {
    let (fleet, hosts) = harness();
    seed_backup(&fleet, "10.3.0.1");
    fleet.add_file("10.3.0.2", "/var/tmp/restore/stale.sql", 10);

    let source = hosts.get_or_create("10.3.0.1");
    let destinations: Vec<(Arc<Host>, String)> =
        vec![(hosts.get_or_create("10.3.0.2"), "/var/tmp/restore".to_string())];

    let err = transfer_directory(
        &source,
        "/var/tmp/backup",
        &destinations,
        &TransferOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NonEmptyDestination { .. }));

    // Overwriting is an explicit choice.
    transfer_directory(
        &source,
        "/var/tmp/backup",
        &destinations,
        &TransferOptions {
            overwrite: true,
            ..TransferOptions::default()
        },
    )
    .await
    .unwrap();
    let copied = fleet.files_under("10.3.0.2", "/var/tmp/restore");
    assert_eq!(copied.get("schema.sql"), Some(&4096));
}

#[tokio::test(start_paused = true)]
async fn test_copies_only_the_requested_files() {
    let (fleet, hosts) = harness();
    seed_backup(&fleet, "10.3.0.1");
    let source = hosts.get_or_create("10.3.0.1");
    let destinations: Vec<(Arc<Host>, String)> =
        vec![(hosts.get_or_create("10.3.0.2"), "/var/tmp/restore".to_string())];

    transfer_directory(
        &source,
        "/var/tmp/backup",
        &destinations,
        &TransferOptions {
            files: vec!["schema.sql".to_string()],
            ..TransferOptions::default()
        },
    )
    .await
    .unwrap();

    let copied = fleet.files_under("10.3.0.2", "/var/tmp/restore");
    assert_eq!(copied.len(), 1);
    assert_eq!(copied.get("schema.sql"), Some(&4096));
}
