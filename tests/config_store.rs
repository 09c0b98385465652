//! Versioned config tests

mod common;

use common::{start_member, test_config, wait_leader};
use minipd::common::{NamespaceConfig, ReplicationConfig, ScheduleConfig, SchedulerConfig, Version};
use minipd::metastore::MemStore;
use minipd::Error;

#[tokio::test]
async fn test_schedule_round_trip_and_reload() {
    let store = MemStore::new();
    let leader = start_member(&store, test_config("pd-1")).await;
    wait_leader(std::slice::from_ref(&leader)).await;

    let mut cfg = ScheduleConfig::default();
    cfg.leader_schedule_limit = 16;
    cfg.high_space_ratio = 0.5;
    cfg.schedulers.push(SchedulerConfig {
        kind: "shuffle-leader".into(),
        args: vec!["1".into()],
        disable: true,
    });
    leader.set_schedule_config(cfg.clone()).await.unwrap();
    assert_eq!(*leader.get_schedule_config(), cfg);

    let replication = ReplicationConfig {
        max_replicas: 5,
        location_labels: vec!["zone".into(), "host".into()],
    };
    leader.set_replication_config(replication.clone()).await.unwrap();

    // A fresh member loads what the leader persisted
    let other = start_member(&store, test_config("pd-2")).await;
    assert_eq!(*other.get_schedule_config(), cfg);
    assert_eq!(*other.get_replication_config(), replication);

    // Reload on the leader itself returns the same values
    assert!(leader.config_store().reload().await.unwrap());
    assert_eq!(*leader.get_schedule_config(), cfg);

    leader.close().await;
    other.close().await;
}

#[tokio::test]
async fn test_namespace_add_delete_readd() {
    let store = MemStore::new();
    let server = start_member(&store, test_config("pd-1")).await;
    wait_leader(std::slice::from_ref(&server)).await;

    let ns = NamespaceConfig {
        leader_schedule_limit: 8,
        max_replicas: 5,
        ..Default::default()
    };
    server.set_namespace_config("ns1", ns.clone()).await.unwrap();
    assert_eq!(server.get_namespace_config("ns1"), ns);

    let adjusted = server.get_namespace_config_with_adjust("ns1");
    assert_eq!(adjusted.leader_schedule_limit, 8);
    assert_eq!(adjusted.region_schedule_limit, 4);
    assert_eq!(adjusted.max_replicas, 5);

    let replaced = NamespaceConfig {
        region_schedule_limit: 2,
        ..Default::default()
    };
    server.set_namespace_config("ns1", replaced.clone()).await.unwrap();
    assert_eq!(server.get_namespace_config("ns1"), replaced);

    server.delete_namespace_config("ns1").await.unwrap();
    assert_eq!(server.get_namespace_config("ns1"), NamespaceConfig::default());
    server.delete_namespace_config("ns1").await.unwrap();

    server.set_namespace_config("ns1", ns.clone()).await.unwrap();
    assert_eq!(server.get_namespace_config("ns1"), ns);

    assert!(server.config_store().reload().await.unwrap());
    assert_eq!(server.get_namespace_config("ns1"), ns);
    assert!(server.is_namespace_exist("global"));

    server.close().await;
}

#[tokio::test]
async fn test_label_property_and_cluster_version_reload() {
    let store = MemStore::new();
    let server = start_member(&store, test_config("pd-1")).await;
    wait_leader(std::slice::from_ref(&server)).await;

    server
        .set_label_property("reject-leader", "zone", "z1")
        .await
        .unwrap();
    server
        .set_label_property("reject-leader", "zone", "z2")
        .await
        .unwrap();
    server
        .delete_label_property("reject-leader", "zone", "z1")
        .await
        .unwrap();
    server.set_cluster_version("v2.1.0-rc.1").await.unwrap();
    assert!(matches!(
        server.set_cluster_version("2.x").await,
        Err(Error::Validation(_))
    ));

    let other = start_member(&store, test_config("pd-2")).await;
    let labels = other.get_label_property();
    let reject = labels.get("reject-leader");
    assert_eq!(reject.len(), 1);
    assert_eq!(reject[0].value, "z2");
    let version = other.get_cluster_version();
    assert_eq!(*version, Version::parse("2.1.0-rc.1").unwrap());
    assert_eq!(version.to_string(), "2.1.0-rc.1");

    server.close().await;
    other.close().await;
}

#[tokio::test]
async fn test_persist_failure_keeps_new_value() {
    let store = MemStore::new();
    let mut cfg = test_config("pd-1");
    cfg.lease = 10;
    let server = start_member(&store, cfg).await;
    wait_leader(std::slice::from_ref(&server)).await;

    let mut schedule = ScheduleConfig::default();
    schedule.max_snapshot_count = 99;
    store.set_available(false);
    let res = server.set_schedule_config(schedule.clone()).await;
    assert!(matches!(res, Err(Error::Persist(_))), "got {:?}", res);
    assert_eq!(*server.get_schedule_config(), schedule);
    store.set_available(true);

    server.close().await;
}

#[tokio::test]
async fn test_follower_write_is_rejected() {
    let store = MemStore::new();
    let a = start_member(&store, test_config("pd-1")).await;
    let b = start_member(&store, test_config("pd-2")).await;
    let servers = vec![a.clone(), b.clone()];
    let leader = wait_leader(&servers).await;
    let follower = &servers[1 - leader];

    let before = follower.get_schedule_config();
    let mut schedule = ScheduleConfig::default();
    schedule.merge_schedule_limit = 1;
    assert!(matches!(
        follower.set_schedule_config(schedule).await,
        Err(Error::NotLeader(_))
    ));
    assert_eq!(follower.get_schedule_config(), before);
    assert!(store
        .dump(&format!("{}/config", follower.root_path()))
        .is_none());

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_after_losing_leader_key_is_rolled_back() {
    let store = MemStore::new();
    let mut cfg = test_config("pd-1");
    cfg.lease = 10;
    let old = start_member(&store, cfg).await;
    wait_leader(std::slice::from_ref(&old)).await;
    let usurper = start_member(&store, test_config("pd-2")).await;

    let leader_key = format!("{}/leader", old.root_path());
    store.put_raw(&leader_key, &usurper.member().encode().unwrap());

    let before = old.get_schedule_config();
    let mut schedule = ScheduleConfig::default();
    schedule.merge_schedule_limit = 1;
    let res = old.set_schedule_config(schedule).await;
    assert!(matches!(res, Err(Error::NotLeader(_))), "got {:?}", res);
    assert_eq!(old.get_schedule_config(), before);

    let res = old.set_cluster_version("9.9.9").await;
    assert!(matches!(res, Err(Error::NotLeader(_))), "got {:?}", res);
    assert_ne!(old.get_cluster_version().to_string(), "9.9.9");
    assert!(store.dump(&format!("{}/config", old.root_path())).is_none());

    old.close().await;
    usurper.close().await;
}
