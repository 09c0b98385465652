//! Member health check tests

mod common;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use common::{start_member, test_config};
use minipd::coordinator::health::{HealthChecker, HEALTH_PATH};
use minipd::coordinator::http::create_router;
use minipd::coordinator::Member;
use minipd::metastore::MemStore;
use std::time::Duration;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn serve_status(status: StatusCode) -> String {
    serve(Router::new().route(HEALTH_PATH, get(move || async move { status }))).await
}

fn member(id: u64, urls: Vec<String>) -> Member {
    Member {
        member_id: id,
        name: format!("pd-{}", id),
        client_urls: urls,
        peer_urls: vec![],
        leader_priority: 0,
    }
}

#[tokio::test]
async fn test_any_successful_url_means_healthy() {
    let ok = serve_status(StatusCode::OK).await;
    let broken = serve_status(StatusCode::INTERNAL_SERVER_ERROR).await;
    let unavailable = serve_status(StatusCode::SERVICE_UNAVAILABLE).await;
    let no_content = serve_status(StatusCode::NO_CONTENT).await;
    let unreachable = "http://127.0.0.1:1".to_string();

    let members = vec![
        member(1, vec![ok.clone()]),
        member(2, vec![broken.clone(), unavailable.clone()]),
        member(3, vec![broken.clone(), ok.clone()]),
        member(4, vec![unreachable.clone(), ok.clone()]),
        member(5, vec![unreachable]),
        member(6, vec![no_content.clone()]),
        member(7, vec![no_content, ok.clone()]),
    ];

    let checker = HealthChecker::new(Duration::from_millis(500)).unwrap();
    let unhealthy = checker.check_health(&members).await;
    assert_eq!(unhealthy.keys().copied().collect::<Vec<_>>(), vec![2, 5, 6]);
    assert_eq!(unhealthy[&2].name, "pd-2");
}

#[tokio::test]
async fn test_slow_member_does_not_block_others() {
    let slow = serve(Router::new().route(
        HEALTH_PATH,
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK
        }),
    ))
    .await;
    let ok = serve_status(StatusCode::OK).await;

    let checker = HealthChecker::new(Duration::from_millis(300)).unwrap();
    let start = std::time::Instant::now();
    let unhealthy = checker
        .check_health(&[member(1, vec![slow]), member(2, vec![ok])])
        .await;
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(unhealthy.len(), 1);
    assert!(unhealthy.contains_key(&1));
}

#[tokio::test]
async fn test_serving_member_answers_ping() {
    let store = MemStore::new();
    let server = start_member(&store, test_config("pd-1")).await;
    let url = serve(create_router(server.clone())).await;

    let checker = HealthChecker::new(Duration::from_secs(1)).unwrap();
    let target = member(server.member().member_id, vec![url.clone()]);
    assert!(checker.check_health(std::slice::from_ref(&target)).await.is_empty());

    let body: serde_json::Value = reqwest::get(format!("{}/pd/status", url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cluster_id"], server.cluster_id());

    let metrics = reqwest::get(format!("{}/metrics", url))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("minipd_"));

    server.close().await;
    assert_eq!(checker.check_health(&[target]).await.len(), 1);
}
