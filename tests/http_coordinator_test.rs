//! Integration tests for HttpCoordinator using wiremock
//!
//! These validate session probing, reads and polled watches against a mock
//! config store.

use backpack_replicator::config::CoordinationConfig;
use backpack_replicator::coordination::{
    ConfigWatch, CoordinationClient, CoordinationError, HttpCoordinator, SessionEvent,
    SessionOptions, WatchEvent,
};
use backpack_replicator::models::QueueDescriptor;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_polling() -> CoordinationConfig {
    CoordinationConfig {
        poll_interval_ms: 20,
        request_timeout_secs: 5,
        failure_threshold: 2,
    }
}

async fn started(server: &MockServer) -> HttpCoordinator {
    let options = SessionOptions::new(vec![server.uri()], "/backpack");
    let coordinator = HttpCoordinator::new(options, &fast_polling()).unwrap();
    coordinator.start().await.unwrap();
    coordinator
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Hosts are probed in order and the first reachable one is used
#[tokio::test]
async fn test_start_skips_unreachable_hosts() {
    let server = MockServer::start().await;
    let options = SessionOptions::new(vec!["127.0.0.1:1".to_string(), server.uri()], "/backpack");
    let coordinator = HttpCoordinator::new(options, &fast_polling()).unwrap();

    coordinator.start().await.unwrap();
    assert_eq!(coordinator.current_host(), Some(server.uri()));
}

/// start() fails when no host answers
#[tokio::test]
async fn test_start_fails_without_reachable_host() {
    let options = SessionOptions::new(vec!["127.0.0.1:1".to_string()], "/backpack");
    let coordinator = HttpCoordinator::new(options, &fast_polling()).unwrap();

    let result = coordinator.start().await;
    assert!(matches!(result, Err(CoordinationError::Unreachable(_))));
}

/// Paths are read under the config root
#[tokio::test]
async fn test_get_reads_under_root() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"servers": [], "key": "q"}"#))
        .mount(&server)
        .await;

    let coordinator = started(&server).await;
    let (bytes, _watcher) = coordinator.get("/queue").await.unwrap();

    let descriptor = QueueDescriptor::from_json(&bytes).unwrap();
    assert_eq!(descriptor.key, "q");
}

/// Missing documents surface as NotFound
#[tokio::test]
async fn test_get_missing_path() {
    let server = MockServer::start().await;
    let coordinator = started(&server).await;

    let err = coordinator.get("/servers-map").await.unwrap_err();
    assert_eq!(err, CoordinationError::NotFound("/servers-map".to_string()));
}

/// Unexpected statuses carry the path and status
#[tokio::test]
async fn test_get_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let coordinator = started(&server).await;
    let err = coordinator.get("/queue").await.unwrap_err();
    assert_eq!(
        err,
        CoordinationError::Status {
            path: "/queue".to_string(),
            status: 503
        }
    );
}

/// A watch fires once the body changes
#[tokio::test]
async fn test_watch_fires_on_content_change() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/servers-map"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/backpack/servers-map"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"1": {"host": "a", "port": 1}}"#),
        )
        .mount(&server)
        .await;

    let coordinator = started(&server).await;
    let (bytes, watcher) = coordinator.get("/servers-map").await.unwrap();
    assert_eq!(bytes, b"{}");

    assert_eq!(within(watcher.wait()).await, WatchEvent::Changed);
}

/// With an ETag the watch relies on conditional requests
#[tokio::test]
async fn test_watch_uses_etag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_string("same"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v2\"")
                .set_body_string("same"),
        )
        .mount(&server)
        .await;

    let coordinator = started(&server).await;
    let (_, watcher) = coordinator.get("/queue").await.unwrap();

    assert_eq!(within(watcher.wait()).await, WatchEvent::Changed);
}

/// A removed document fires Deleted
#[tokio::test]
async fn test_watch_fires_on_delete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let coordinator = started(&server).await;
    let (_, watcher) = coordinator.get("/queue").await.unwrap();

    assert_eq!(within(watcher.wait()).await, WatchEvent::Deleted);
}

/// Repeated poll failures expire the session
#[tokio::test]
async fn test_poll_failures_expire_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let coordinator = started(&server).await;
    let mut events = coordinator.session_events();
    let (_, watcher) = coordinator.get("/queue").await.unwrap();

    assert_eq!(within(events.recv()).await.unwrap(), SessionEvent::Expired);
    assert_eq!(within(watcher.wait()).await, WatchEvent::SessionLost);
    assert_eq!(coordinator.current_host(), None);
    assert_eq!(
        coordinator.get("/queue").await.unwrap_err(),
        CoordinationError::NotStarted
    );

    coordinator.start().await.unwrap();
    assert!(coordinator.current_host().is_some());
}

/// Repeated failed reads expire the session even with no watch armed
#[tokio::test]
async fn test_read_failures_expire_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let coordinator = started(&server).await;
    let mut events = coordinator.session_events();

    let first = coordinator.get("/queue").await.unwrap_err();
    assert!(matches!(first, CoordinationError::Status { status: 500, .. }));
    assert!(coordinator.current_host().is_some());

    coordinator.get("/queue").await.unwrap_err();
    assert_eq!(within(events.recv()).await.unwrap(), SessionEvent::Expired);
    assert_eq!(coordinator.current_host(), None);
}

/// Missing documents do not count as failed reads
#[tokio::test]
async fn test_missing_documents_keep_session() {
    let server = MockServer::start().await;
    let coordinator = started(&server).await;

    for _ in 0..3 {
        let err = coordinator.get("/queue").await.unwrap_err();
        assert_eq!(err, CoordinationError::NotFound("/queue".to_string()));
    }
    assert_eq!(coordinator.current_host(), Some(server.uri()));
}

/// After read failures expire the session, the restart moves to the next host
#[tokio::test]
async fn test_restart_fails_over_after_read_failures() {
    let failing = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&failing)
        .await;
    Mock::given(method("GET"))
        .and(path("/backpack"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&failing)
        .await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"servers": [], "key": "q"}"#))
        .mount(&healthy)
        .await;

    let options = SessionOptions::new(vec![failing.uri(), healthy.uri()], "/backpack");
    let coordinator = HttpCoordinator::new(options, &fast_polling()).unwrap();
    coordinator.start().await.unwrap();
    assert_eq!(coordinator.current_host(), Some(failing.uri()));

    coordinator.get("/queue").await.unwrap_err();
    coordinator.get("/queue").await.unwrap_err();
    assert_eq!(
        coordinator.get("/queue").await.unwrap_err(),
        CoordinationError::NotStarted
    );

    coordinator.start().await.unwrap();
    assert_eq!(coordinator.current_host(), Some(healthy.uri()));

    let (bytes, _watcher) = coordinator.get("/queue").await.unwrap();
    assert_eq!(QueueDescriptor::from_json(&bytes).unwrap().key, "q");
}

/// Closing the session ends armed watches
#[tokio::test]
async fn test_close_loses_watches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let coordinator = started(&server).await;
    let (_, watcher) = coordinator.get("/queue").await.unwrap();

    coordinator.close().await;
    assert_eq!(within(watcher.wait()).await, WatchEvent::SessionLost);
    assert_eq!(
        coordinator.get("/queue").await.unwrap_err(),
        CoordinationError::SessionClosed
    );
}

/// ConfigWatch yields successive parsed values from the store
#[tokio::test]
async fn test_config_watch_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"servers": [{"host": "r1", "port": 6379}], "key": "a"}"#),
        )
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/backpack/queue"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"servers": [{"host": "r2", "port": 6379}], "key": "b"}"#),
        )
        .mount(&server)
        .await;

    let coordinator = Arc::new(started(&server).await);
    let mut watch: ConfigWatch<QueueDescriptor> =
        ConfigWatch::new(coordinator.clone(), "/queue", Duration::from_millis(20));

    let first = within(watch.next()).await.unwrap().unwrap();
    assert_eq!(first.key, "a");

    let second = within(watch.next()).await.unwrap().unwrap();
    assert_eq!(second.key, "b");
    assert_eq!(second.servers[0].host, "r2");

    coordinator.close().await;
    assert!(within(watch.next()).await.is_none());
}
