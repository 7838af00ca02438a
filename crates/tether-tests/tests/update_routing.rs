use serde_json::json;
use std::time::Duration;
use tether_client::encryption::CacheStats;
use tether_client::{SyncEngine, SyncError};
use tether_protocol::api::{ApiArtifact, FriendsResponse};
use tether_protocol::update::UpdateBody;
use tether_tests::harness::account::TestAccount;
use tether_tests::harness::server::{MockServer, now_ms};
use tether_tests::harness::{client_config, poll_until, start_engine, wait_connected};
use tether_tests::init_tracing;

#[tokio::test]
async fn initialize_retries_after_failed_session_fetch() {
    init_tracing();
    let server = MockServer::spawn().await.unwrap();
    let account = TestAccount::new();
    server.add_session(account.session("s1", "/src/api"));
    server.fail_session_lists(1);

    let engine = SyncEngine::new(client_config(&server), account.secret()).unwrap();
    let err = engine.initialize().await.unwrap_err();
    assert!(matches!(err, SyncError::Http { status: Some(503), .. }), "{err:?}");
    assert!(engine.sessions().get("s1").is_none());

    engine.initialize().await.unwrap();
    assert_eq!(server.session_lists(), 2);
    assert!(engine.sessions().get("s1").is_some());
    wait_connected(&engine, Duration::from_secs(5)).await.unwrap();

    // Succeeded once; later calls do nothing.
    engine.initialize().await.unwrap();
    assert_eq!(server.session_lists(), 2);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn sparse_new_session_push_refetches() {
    init_tracing();
    let server = MockServer::spawn().await.unwrap();
    let account = TestAccount::new();
    server.add_session(account.session("s1", "/src/api"));

    let engine = start_engine(&server, &account).await.unwrap();
    server.add_session(account.session("s2", "/src/web"));
    server.push_raw_update(json!({
        "id": "upd-sparse",
        "seq": server.next_seq(),
        "createdAt": now_ms(),
        "body": {"t": "new-session", "id": "s2"},
    }));

    assert!(poll_until(Duration::from_secs(5), || engine.sessions().get("s2").is_some()).await);
    assert_eq!(server.session_lists(), 2);
    assert_eq!(engine.sessions().get("s2").unwrap().title(), "web");
}

#[tokio::test]
async fn message_for_unknown_session_refetches() {
    init_tracing();
    let server = MockServer::spawn().await.unwrap();
    let account = TestAccount::new();
    server.add_session(account.session("s1", "/src/api"));

    let engine = start_engine(&server, &account).await.unwrap();
    server.add_session(account.session("s2", "/src/web"));
    server.push_update(UpdateBody::NewMessage {
        sid: "s2".to_string(),
        message: account.agent_text("s2", "m1", 1, "hello from elsewhere"),
    });

    assert!(poll_until(Duration::from_secs(5), || engine.sessions().get("s2").is_some()).await);
    assert_eq!(server.session_lists(), 2);
}

#[tokio::test]
async fn malformed_pushes_are_dropped_and_the_stream_continues() {
    init_tracing();
    let server = MockServer::spawn().await.unwrap();
    let account = TestAccount::new();
    server.add_session(account.session("s1", "/src/api"));
    server.add_message("s1", account.agent_text("s1", "m1", 1, "first"));

    let engine = start_engine(&server, &account).await.unwrap();
    let timeline = engine.session("s1").unwrap();
    timeline.load().await.unwrap();

    server.push_raw_update(json!({"id": "upd-nobody"}));
    server.push_raw_update(json!({
        "id": "upd-unknown",
        "seq": server.next_seq(),
        "createdAt": now_ms(),
        "body": {"t": "mystery", "id": "s1"},
    }));
    server.push_raw_update(json!("not an envelope"));
    server.push_update(UpdateBody::NewMessage {
        sid: "s1".to_string(),
        message: account.agent_text("s1", "m2", 2, "second"),
    });

    assert!(poll_until(Duration::from_secs(5), || timeline.view().messages.len() == 2).await);
    assert_eq!(server.session_lists(), 1);
}

#[tokio::test]
async fn pushes_for_unreadable_sessions_do_not_refetch() {
    init_tracing();
    let server = MockServer::spawn().await.unwrap();
    let account = TestAccount::new();
    let stranger = TestAccount::new();
    server.add_session(account.session("s1", "/src/api"));
    server.add_session(stranger.session("s9", "/src/theirs"));

    let engine = start_engine(&server, &account).await.unwrap();
    assert!(engine.sessions().get("s9").is_none());
    let timeline = engine.session("s1").unwrap();
    timeline.load().await.unwrap();

    for (seq, id) in [(1, "x1"), (2, "x2")] {
        server.push_update(UpdateBody::NewMessage {
            sid: "s9".to_string(),
            message: stranger.agent_text("s9", id, seq, "not for you"),
        });
    }
    // Updates are applied in order, so once this lands the others have too.
    server.push_update(UpdateBody::NewMessage {
        sid: "s1".to_string(),
        message: account.agent_text("s1", "m1", 1, "yours"),
    });
    assert!(poll_until(Duration::from_secs(5), || timeline.view().messages.len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.session_lists(), 1);
}

#[tokio::test]
async fn dispose_drops_decrypted_plaintext() {
    init_tracing();
    let server = MockServer::spawn().await.unwrap();
    let account = TestAccount::new();
    server.add_session(account.session("s1", "/src/api"));
    server.add_message("s1", account.agent_text("s1", "m1", 1, "secret"));

    let engine = start_engine(&server, &account).await.unwrap();
    engine.session("s1").unwrap().load().await.unwrap();
    assert_ne!(engine.encryption().cache().stats(), CacheStats::default());

    engine.dispose();
    assert_eq!(engine.encryption().cache().stats(), CacheStats::default());
}

#[tokio::test]
async fn socket_request_carries_method_and_body() {
    init_tracing();
    let server = MockServer::spawn().await.unwrap();
    let account = TestAccount::new();
    let engine = start_engine(&server, &account).await.unwrap();

    let friends: FriendsResponse = engine
        .socket()
        .request(reqwest::Method::GET, "/v1/friends", None)
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(friends.friends.is_empty());

    let body = json!({
        "id": "a1",
        "header": "aGVhZGVy",
        "body": "Ym9keQ==",
        "dataEncryptionKey": "a2V5",
    });
    let created: ApiArtifact = engine
        .socket()
        .request(reqwest::Method::POST, "/v1/artifacts", Some(&body))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created.id, "a1");
    assert_eq!(created.body.as_deref(), Some("Ym9keQ=="));

    let err = engine
        .socket()
        .request(reqwest::Method::POST, "/v1/artifacts", Some(&json!({"id": 7})))
        .await
        .unwrap_err();
    assert!(
        matches!(err, SyncError::Http { status: Some(s), .. } if s >= 400),
        "{err:?}"
    );
}
