// Session server over HTTP: token checks, per-request policy and revocation.

mod helpers;

use std::sync::Arc;

use gatehouse::server::{ServerConfig, SessionServer, ENV_AUTHORIZATION_TOKEN, ENV_CREDENTIALS_URI};
use gatehouse::session::{SessionStatus, SessionTracker};
use helpers::{IssuerBuilder, PolicyFile, TestDb};
use reqwest::StatusCode;
use serde_json::Value;

async fn start(
    policy: &tempfile::NamedTempFile,
    test_db: &TestDb,
) -> (SessionServer, Arc<SessionTracker>) {
    let (issuer, _, _) = IssuerBuilder::new(policy).track_sessions().build();
    let tracker = Arc::new(SessionTracker::new(test_db.store()));
    let server = SessionServer::start(
        ServerConfig::new("alice", "production"),
        Arc::new(issuer),
        Some(tracker.clone()),
    )
    .await
    .expect("server should start");
    (server, tracker)
}

async fn fetch(server: &SessionServer, token: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(server.url())
        .header("Authorization", token)
        .send()
        .await
        .expect("request should complete")
}

#[tokio::test]
async fn test_serves_credentials_with_valid_token() {
    let test_db = TestDb::new().await;
    let policy = PolicyFile::new()
        .rule("prod-needs-server", "require_server_session", &["production"], &[])
        .write();
    let (server, tracker) = start(&policy, &test_db).await;

    let resp = fetch(&server, server.token()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["AccessKeyId"], "ASIATESTKEY");
    assert_eq!(body["SecretAccessKey"], "test-secret");
    assert_eq!(body["Token"], "test-token");
    assert!(body["Expiration"].as_str().unwrap().ends_with('Z'));

    // Startup issuance plus one refresh.
    let session_id = server.session_id().unwrap().to_string();
    let session = tracker.get(&session_id).await.unwrap();
    assert_eq!(session.request_count, 2);
    assert!(session.source_identity.starts_with("gatehouse:alice:"));

    let env = server.env_vars();
    assert_eq!(env[0].0, ENV_CREDENTIALS_URI);
    assert_eq!(env[1], (ENV_AUTHORIZATION_TOKEN, server.token().to_string()));

    server.shutdown().await;
    let ended = tracker.get(&session_id).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Expired);
}

#[tokio::test]
async fn test_rejects_bad_token() {
    let test_db = TestDb::new().await;
    let policy = PolicyFile::new().rule("allow-all", "allow", &["*"], &[]).write();
    let (server, _) = start(&policy, &test_db).await;

    let resp = fetch(&server, "not-the-token").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let bearer = format!("Bearer {}", server.token());
    assert_eq!(fetch(&server, &bearer).await.status(), StatusCode::OK);

    server.shutdown().await;
}

#[tokio::test]
async fn test_revoked_session_is_refused() {
    let test_db = TestDb::new().await;
    let policy = PolicyFile::new().rule("allow-all", "allow", &["*"], &[]).write();
    let (server, tracker) = start(&policy, &test_db).await;

    let session_id = server.session_id().unwrap().to_string();
    tracker
        .revoke(&session_id, "security-team", "suspicious activity")
        .await
        .unwrap();

    let resp = fetch(&server, server.token()).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    server.shutdown().await;
    // Shutdown leaves a revoked session revoked.
    let session = tracker.get(&session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Revoked);
}

#[tokio::test]
async fn test_policy_change_denies_next_refresh() {
    let test_db = TestDb::new().await;
    let policy = PolicyFile::new().rule("allow-all", "allow", &["*"], &[]).write();
    let (server, _) = start(&policy, &test_db).await;

    std::fs::write(policy.path(), "version \"2\"\n").unwrap();

    let resp = fetch(&server, server.token()).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["denied"]["user"], "alice");
    assert_eq!(body["denied"]["profile"], "production");

    server.shutdown().await;
}

#[tokio::test]
async fn test_start_fails_fast_when_denied() {
    let test_db = TestDb::new().await;
    let policy = PolicyFile::new().write();
    let (issuer, _, _) = IssuerBuilder::new(&policy).track_sessions().build();
    let tracker = Arc::new(SessionTracker::new(test_db.store()));

    let result = SessionServer::start(
        ServerConfig::new("alice", "production"),
        Arc::new(issuer),
        Some(tracker.clone()),
    )
    .await;
    assert!(result.is_err());

    // The session registered for the attempt is no longer active.
    assert!(tracker.list_active(10).await.unwrap().is_empty());
}
