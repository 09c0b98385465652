//! Leader election and guarded write tests

mod common;

use common::{start_member, test_config, wait_leader, wait_until};
use minipd::coordinator::LifecycleState;
use minipd::metastore::MemStore;
use minipd::{Error, Server};
use std::sync::Arc;
use std::time::Duration;

async fn three_members(store: &MemStore) -> Vec<Arc<Server>> {
    let mut servers = Vec::new();
    for name in ["pd-1", "pd-2", "pd-3"] {
        servers.push(start_member(store, test_config(name)).await);
    }
    servers
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_leader_observed_by_all() {
    let store = MemStore::new();
    let servers = three_members(&store).await;
    let leader = wait_leader(&servers).await;
    let leader_id = servers[leader].member().member_id;

    let all = &servers;
    let ok = wait_until(Duration::from_secs(5), || async move {
        all.iter()
            .all(|s| s.leader().map(|l| l.member_id) == Some(leader_id))
    })
    .await;
    assert!(ok, "followers did not observe the leader");

    for s in &servers {
        s.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_guarded_write_after_leader_change() {
    let store = MemStore::new();
    let servers = three_members(&store).await;
    let leader = wait_leader(&servers).await;
    let old = &servers[leader];
    let usurper = &servers[(leader + 1) % servers.len()];

    // Another member's descriptor lands in the leader key
    let leader_key = format!("{}/leader", old.root_path());
    store.put_raw(&leader_key, &usurper.member().encode().unwrap());

    let priority_key = format!(
        "{}/member/{}/leader_priority",
        old.root_path(),
        old.member().member_id
    );
    let res = old.set_member_leader_priority(old.member().member_id, 5).await;
    assert!(matches!(res, Err(Error::NotLeader(_))), "got {:?}", res);
    assert!(store.dump(&priority_key).is_none());

    let ok = wait_until(Duration::from_secs(5), || async move { !old.is_leader() }).await;
    assert!(ok, "stale leader did not step down");

    for s in &servers {
        s.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lease_expiry_hands_over_leadership() {
    let store = MemStore::new();
    let servers = vec![
        start_member(&store, test_config("pd-1")).await,
        start_member(&store, test_config("pd-2")).await,
    ];
    let leader = wait_leader(&servers).await;
    let lease = servers[leader].leadership().token().unwrap().lease();

    store.expire_lease(lease);

    let all = &servers;
    let ok = wait_until(Duration::from_secs(10), || async move {
        let leaders: Vec<_> = all.iter().filter(|s| s.is_leader()).collect();
        leaders.len() == 1
            && leaders[0]
                .leadership()
                .token()
                .is_some_and(|t| t.lease() != lease)
    })
    .await;
    assert!(ok, "no new leader after lease expiry");

    for s in &servers {
        s.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_leader_fails_over() {
    let store = MemStore::new();
    let servers = three_members(&store).await;
    let leader = wait_leader(&servers).await;
    servers[leader].close().await;
    assert!(!servers[leader].is_leader());

    let rest: Vec<_> = servers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader)
        .map(|(_, s)| s.clone())
        .collect();
    wait_leader(&rest).await;

    for s in &rest {
        s.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_undecodable_leader_key_is_replaced() {
    let store = MemStore::new();
    let server = start_member(&store, test_config("pd-1")).await;
    wait_leader(std::slice::from_ref(&server)).await;
    let lease = server.leadership().token().unwrap().lease();

    let leader_key = format!("{}/leader", server.root_path());
    store.put_raw(&leader_key, b"\xffgarbage");

    let expected = server.member().encode().unwrap();
    let (store_ref, key, server_ref, expected) = (&store, &leader_key, &server, &expected);
    let ok = wait_until(Duration::from_secs(10), || async move {
        server_ref.leadership().token().is_some_and(|t| t.lease() != lease)
            && store_ref.dump(key).is_some_and(|kv| kv.value == *expected)
    })
    .await;
    assert!(ok, "member did not reclaim a corrupt leader key");

    server.close().await;
}

#[tokio::test]
async fn test_lifecycle_refuses_to_start() {
    let store = MemStore::new();
    let servers = vec![
        start_member(&store, test_config("pd-1")).await,
        start_member(&store, test_config("pd-2")).await,
    ];
    let leader = wait_leader(&servers).await;
    let follower = &servers[1 - leader];

    assert!(matches!(
        follower.lifecycle().start().await,
        Err(Error::NotLeader(_))
    ));
    assert!(matches!(
        servers[leader].lifecycle().start().await,
        Err(Error::NotBootstrapped(_))
    ));
    assert_eq!(
        servers[leader].lifecycle().state(),
        LifecycleState::NotBootstrapped
    );
    assert!(servers[leader].get_raft_cluster().is_none());

    for s in &servers {
        s.close().await;
    }
    assert_eq!(servers[0].lifecycle().state(), LifecycleState::Closed);
}

#[tokio::test]
async fn test_member_leader_priority() {
    let store = MemStore::new();
    let server = start_member(&store, test_config("pd-1")).await;
    wait_leader(std::slice::from_ref(&server)).await;
    let id = server.member().member_id;

    assert_eq!(server.get_member_leader_priority(id).await.unwrap(), 0);
    server.set_member_leader_priority(id, 7).await.unwrap();
    assert_eq!(server.get_member_leader_priority(id).await.unwrap(), 7);

    let members = server.get_members().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].leader_priority, 7);

    server.delete_member_leader_priority(id).await.unwrap();
    assert_eq!(server.get_member_leader_priority(id).await.unwrap(), 0);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_leadership_follows_priority() {
    let store = MemStore::new();
    let servers = vec![
        start_member(&store, test_config("pd-1")).await,
        start_member(&store, test_config("pd-2")).await,
    ];
    let leader = wait_leader(&servers).await;
    let me = servers[leader].member().member_id;
    servers[leader].set_member_leader_priority(me, 10).await.unwrap();

    let client = servers[leader].client().clone();
    let ok = wait_until(Duration::from_secs(5), || {
        let client = client.clone();
        async move { client.status().await.map(|s| s.leader == me).unwrap_or(false) }
    })
    .await;
    assert!(ok, "store leadership did not move to the prioritized member");

    for s in &servers {
        s.close().await;
    }
}
