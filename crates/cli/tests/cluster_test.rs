//! End-to-end cluster scenarios over in-process nodes.
//!
//! # Test Strategy
//!
//! Whole nodes run inside the test process, sharing one in-process bus and
//! talking real TCP on loopback ephemeral ports. Assertions go through the
//! wire client where a client could observe them, and through the node
//! data directories where only an operator could (object placement, stale
//! copies, epoch files).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cli::{ClusterClient, Daemon, DaemonConfig};
use cluster::LocalBus;
use corelib::{ClusterConfig, EpochLog, Error, Node, NodeId, Status};

const CTIME: u64 = 1_700_000_000;

fn config(dir: &Path, zone: u32, vnodes: u16) -> DaemonConfig {
    DaemonConfig {
        addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        zone,
        vnodes,
        dir: dir.to_path_buf(),
        cluster: ClusterConfig::default(),
        driver: "local".into(),
    }
}

async fn start_node(bus: &Arc<LocalBus>, dir: &Path, zone: u32) -> Daemon {
    Daemon::start_on_bus(config(dir, zone, 64), Arc::clone(bus))
        .await
        .expect("node failed to start")
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn object_file(dir: &Path, oid: u64) -> std::path::PathBuf {
    dir.join("objects").join(format!("{oid:016x}"))
}

fn stale_count(dir: &Path) -> usize {
    std::fs::read_dir(dir.join("objects").join(".stale"))
        .map(|it| it.count())
        .unwrap_or(0)
}

// ============================================================================
// Format & basic I/O
// ============================================================================

#[tokio::test]
async fn test_format_and_single_write() {
    let bus = LocalBus::new();
    let dir = tempfile::tempdir().unwrap();
    let a = start_node(&bus, dir.path(), 1).await;
    wait_until("node waiting for format", || {
        a.status() == Status::WaitForFormat
    })
    .await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    client.format(CTIME, 1).await.unwrap();
    wait_until("epoch 1", || a.view().epoch == 1).await;
    assert_eq!(a.status(), Status::Serving);

    client.create_and_write(0x1000, 0, b"hello").await.unwrap();
    let data = client.read(0x1000, 0, 5).await.unwrap();
    assert_eq!(&data[..], b"hello");

    let stat = client.stat().await.unwrap();
    assert_eq!(stat.epoch, 1);
    assert_eq!(stat.ctime, CTIME);
    assert_eq!(stat.status, Some(Status::Serving));
    assert_eq!(stat.nodes.len(), 1);

    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_io_rejected_before_format() {
    let bus = LocalBus::new();
    let dir = tempfile::tempdir().unwrap();
    let a = start_node(&bus, dir.path(), 1).await;
    wait_until("node waiting for format", || {
        a.status() == Status::WaitForFormat
    })
    .await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    assert!(matches!(
        client.create_and_write(0x1, 0, b"x").await,
        Err(Error::WaitForFormat)
    ));
    a.stop().await.unwrap();
}

// ============================================================================
// Replication
// ============================================================================

#[tokio::test]
async fn test_write_lands_on_every_replica() {
    let bus = LocalBus::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_node(&bus, dir_a.path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let b = start_node(&bus, dir_b.path(), 2).await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    wait_until("both members", || a.view().ring.nodes().len() == 2).await;
    client.format(CTIME, 2).await.unwrap();
    wait_until("serving", || {
        a.status() == Status::Serving && b.status() == Status::Serving
    })
    .await;

    client.create_and_write(0x42, 0, b"replicated").await.unwrap();
    assert!(object_file(dir_a.path(), 0x42).exists());
    assert!(object_file(dir_b.path(), 0x42).exists());

    // Reads are served through either entry node.
    let mut client_b = ClusterClient::connect(b.local_addr()).await.unwrap();
    assert_eq!(&client_b.read(0x42, 0, 10).await.unwrap()[..], b"replicated");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_read_falls_over_to_surviving_replica() {
    let bus = LocalBus::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_node(&bus, dir_a.path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let b = start_node(&bus, dir_b.path(), 2).await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    wait_until("both members", || a.view().ring.nodes().len() == 2).await;
    client.format(CTIME, 2).await.unwrap();
    wait_until("serving", || {
        a.status() == Status::Serving && b.status() == Status::Serving
    })
    .await;

    client.create_and_write(0x77, 0, b"fallback").await.unwrap();

    // Wipe one copy behind the cluster's back; the read must still answer.
    std::fs::remove_file(object_file(dir_b.path(), 0x77)).unwrap();
    let mut client_b = ClusterClient::connect(b.local_addr()).await.unwrap();
    assert_eq!(&client_b.read(0x77, 0, 8).await.unwrap()[..], b"fallback");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_write_halts_when_replica_is_dead() {
    let bus = LocalBus::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start_node(&bus, dir_a.path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let b = start_node(&bus, dir_b.path(), 2).await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    wait_until("both members", || a.view().ring.nodes().len() == 2).await;
    client.format(CTIME, 2).await.unwrap();
    wait_until("serving", || {
        a.status() == Status::Serving && b.status() == Status::Serving
    })
    .await;

    // Crash B without a leave: the membership still lists it, so the write
    // must fan out to it, fail, and halt rather than report weak success.
    b.kill();
    let result = client.create_and_write(0x99, 0, b"lost").await;
    assert!(result.is_err(), "write against a dead replica must not succeed");
    // At most one copy may exist afterwards.
    assert!(!object_file(dir_b.path(), 0x99).exists());

    a.stop().await.unwrap();
}

// ============================================================================
// Join & epoch replay
// ============================================================================

#[tokio::test]
async fn test_join_with_epoch_replay() {
    let bus = LocalBus::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();

    let a = start_node(&bus, dir_a.path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    client.format(CTIME, 1).await.unwrap();
    wait_until("epoch 1", || a.view().epoch == 1).await;

    // Bump the epoch twice: a join and a leave.
    let b = start_node(&bus, dir_b.path(), 2).await;
    wait_until("epoch 2", || a.view().epoch == 2).await;
    b.stop().await.unwrap();
    wait_until("epoch 3", || a.view().epoch == 3).await;

    // A fresh node joins a cluster whose history it never saw.
    let c = start_node(&bus, dir_c.path(), 3).await;
    wait_until("epoch 4 everywhere", || {
        a.view().epoch == 4 && c.view().epoch == 4
    })
    .await;

    // The joiner's log holds the replayed history plus the new epoch.
    let log_c = EpochLog::open(dir_c.path()).unwrap();
    assert_eq!(log_c.latest().unwrap(), 4);
    assert_eq!(log_c.ctime().unwrap(), CTIME);
    for epoch in 1..=4 {
        assert!(log_c.read(epoch).is_ok(), "joiner is missing epoch {epoch}");
    }
    assert_eq!(log_c.read(4).unwrap().len(), 2);

    let mut client_c = ClusterClient::connect(c.local_addr()).await.unwrap();
    let stat = client_c.stat().await.unwrap();
    assert_eq!(stat.ctime, CTIME);
    assert_eq!(stat.nodes.len(), 2);

    // Replayed history answers epoch queries on the joiner too.
    assert_eq!(client_c.get_epoch(1).await.unwrap().len(), 1);
    assert_eq!(client_c.get_epoch(2).await.unwrap().len(), 2);
    assert!(client_c.get_epoch(9).await.is_err());

    a.stop().await.unwrap();
    c.stop().await.unwrap();
}

#[tokio::test]
async fn test_cluster_wide_shutdown_op() {
    let bus = LocalBus::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = start_node(&bus, dir_a.path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let b = start_node(&bus, dir_b.path(), 2).await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    wait_until("both members", || a.view().ring.nodes().len() == 2).await;
    client.format(CTIME, 2).await.unwrap();
    wait_until("serving", || {
        a.status() == Status::Serving && b.status() == Status::Serving
    })
    .await;

    client.shutdown().await.unwrap();
    wait_until("both shutting down", || {
        a.status() == Status::ShuttingDown && b.status() == Status::ShuttingDown
    })
    .await;

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_join_rejected_on_ctime_mismatch() {
    let bus = LocalBus::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = start_node(&bus, dir_a.path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    client.format(1000, 1).await.unwrap();
    wait_until("epoch 1", || a.view().epoch == 1).await;

    // B carries state from some other cluster.
    {
        let log_b = EpochLog::open(dir_b.path()).unwrap();
        log_b.set_ctime(2000).unwrap();
        log_b.set_copies(1).unwrap();
        let stranger = Node::new(NodeId::new("10.9.9.9".parse().unwrap(), 7000), 1, 64);
        log_b.append(1, &[stranger]).unwrap();
    }

    let b = start_node(&bus, dir_b.path(), 2).await;
    wait_until("b killed", || b.status() == Status::Killed).await;

    // The survivor never admitted it.
    assert_eq!(a.view().ring.nodes().len(), 1);
    b.kill();
    a.stop().await.unwrap();
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_recovery_on_leave_converges_layout() {
    let bus = LocalBus::new();
    let dirs: Vec<tempfile::TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();

    let a = start_node(&bus, dirs[0].path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let b = start_node(&bus, dirs[1].path(), 2).await;
    let c = start_node(&bus, dirs[2].path(), 3).await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    wait_until("three members", || a.view().ring.nodes().len() == 3).await;
    client.format(CTIME, 2).await.unwrap();
    wait_until("all serving", || {
        [&a, &b, &c].iter().all(|n| n.status() == Status::Serving)
    })
    .await;

    let oids: Vec<u64> = (1..=100u64).map(|i| 0x5000 + i).collect();
    for oid in &oids {
        client
            .create_and_write(*oid, 0, format!("payload-{oid:x}").as_bytes())
            .await
            .unwrap();
    }

    let epoch_before = a.view().epoch;
    c.stop().await.unwrap();
    wait_until("epoch bumped on survivors", || {
        a.view().epoch == epoch_before + 1 && b.view().epoch == epoch_before + 1
    })
    .await;
    wait_until("recovery finished", || {
        !a.view().recovering() && !b.view().recovering()
    })
    .await;

    // Every object sits on every member of its new owner set, and the
    // placement matches a freshly built two-node ring.
    let view = a.view();
    for oid in &oids {
        let owners = view.ring.owners(*oid, 2).unwrap();
        assert_eq!(owners.len(), 2);
        for owner in owners {
            let dir = if owner == a.node().nid {
                dirs[0].path()
            } else if owner == b.node().nid {
                dirs[1].path()
            } else {
                panic!("object {oid:#x} owned by a departed node");
            };
            assert!(
                object_file(dir, *oid).exists(),
                "object {oid:#x} missing on {owner}"
            );
        }
    }

    // No displaced copies linger after the sweep.
    assert_eq!(stale_count(dirs[0].path()), 0);
    assert_eq!(stale_count(dirs[1].path()), 0);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_joiner_pulls_objects_it_now_owns() {
    let bus = LocalBus::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = start_node(&bus, dir_a.path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    client.format(CTIME, 1).await.unwrap();
    wait_until("epoch 1", || a.view().epoch == 1).await;

    let oids: Vec<u64> = (1..=50u64).map(|i| 0x9000 + i).collect();
    for oid in &oids {
        client.create_and_write(*oid, 0, b"moving day").await.unwrap();
    }

    let b = start_node(&bus, dir_b.path(), 2).await;
    wait_until("epoch 2", || a.view().epoch == 2 && b.view().epoch == 2).await;
    wait_until("recovery finished", || {
        !a.view().recovering() && !b.view().recovering()
    })
    .await;

    let view = a.view();
    let mut moved = 0;
    for oid in &oids {
        let owner = view.ring.owners(*oid, 1).unwrap()[0];
        let dir = if owner == a.node().nid {
            dir_a.path()
        } else {
            moved += 1;
            dir_b.path()
        };
        assert!(object_file(dir, *oid).exists(), "object {oid:#x} not at its owner");
    }
    assert!(moved > 0, "the ring diff moved nothing, test is vacuous");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ============================================================================
// Quorum / degraded operation
// ============================================================================

#[tokio::test]
async fn test_degraded_read_and_halted_write() {
    let bus = LocalBus::new();
    let dirs: Vec<tempfile::TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();

    let a = start_node(&bus, dirs[0].path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let b = start_node(&bus, dirs[1].path(), 2).await;
    let c = start_node(&bus, dirs[2].path(), 3).await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    wait_until("three members", || a.view().ring.nodes().len() == 3).await;
    client.format(CTIME, 3).await.unwrap();
    wait_until("all serving", || {
        [&a, &b, &c].iter().all(|n| n.status() == Status::Serving)
    })
    .await;

    client.create_and_write(0x77, 0, b"survivor").await.unwrap();

    // Two of three replicas leave; redundancy drops below the configured
    // three copies and the cluster halts new writes.
    b.stop().await.unwrap();
    c.stop().await.unwrap();
    wait_until("halted", || a.status() == Status::Halted).await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    assert_eq!(&client.read(0x77, 0, 8).await.unwrap()[..], b"survivor");
    assert!(matches!(
        client.create_and_write(0x78, 0, b"denied").await,
        Err(Error::Halt)
    ));

    a.stop().await.unwrap();
}

// ============================================================================
// VDI operations
// ============================================================================

#[tokio::test]
async fn test_vdi_lifecycle() {
    let bus = LocalBus::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = start_node(&bus, dir_a.path(), 1).await;
    wait_until("a up", || a.status() == Status::WaitForFormat).await;
    let b = start_node(&bus, dir_b.path(), 2).await;

    let mut client = ClusterClient::connect(a.local_addr()).await.unwrap();
    wait_until("both members", || a.view().ring.nodes().len() == 2).await;
    client.format(CTIME, 2).await.unwrap();
    wait_until("serving", || {
        a.status() == Status::Serving && b.status() == Status::Serving
    })
    .await;

    // Create through the non-master entry node: the request is forwarded
    // to the master, ordered, and visible everywhere.
    let mut client_b = ClusterClient::connect(b.local_addr()).await.unwrap();
    let vdi_id = client_b.new_vdi("alice", 12 << 20).await.unwrap();
    assert_ne!(vdi_id, 0);
    assert!(matches!(
        client_b.new_vdi("alice", 12 << 20).await,
        Err(Error::VdiExists)
    ));

    assert_eq!(client.vdi_info("alice").await.unwrap(), vdi_id);
    let listed = client.vdis().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "alice");
    assert_eq!(listed[0].vdi_id, vdi_id);

    // The inode object was replicated like any other object.
    let inode_oid = store::vdi::inode_oid(vdi_id);
    assert!(object_file(dir_a.path(), inode_oid).exists());
    assert!(object_file(dir_b.path(), inode_oid).exists());

    // Locking is exclusive across entry nodes.
    client.lock_vdi("alice").await.unwrap();
    assert!(matches!(client_b.lock_vdi("alice").await, Err(Error::VdiLocked)));
    client.release_vdi("alice").await.unwrap();
    client_b.lock_vdi("alice").await.unwrap();
    client_b.release_vdi("alice").await.unwrap();

    // Deletion sweeps the chain everywhere.
    client.del_vdi("alice").await.unwrap();
    assert!(matches!(client.vdi_info("alice").await, Err(Error::NoVdi)));
    wait_until("inode swept", || {
        !object_file(dir_a.path(), inode_oid).exists()
            && !object_file(dir_b.path(), inode_oid).exists()
    })
    .await;

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
