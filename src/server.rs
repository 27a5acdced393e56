//! Local credential endpoint for a supervised process.
//!
//! The server speaks the container-credentials protocol: the child process
//! gets a URL and an authorization token through its environment, and its
//! SDK calls back whenever credentials are about to expire. Each call checks
//! the session in the store, touches it and runs a fresh issuance, so a
//! policy change or an out-of-band revoke takes effect on the next refresh.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use miette::Diagnostic;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::credentials::Credentials;
use crate::identifiers;
use crate::issuer::{CredentialIssuer, IssueError, IssueRequest};
use crate::policy::Mode;
use crate::session::{NewSession, SessionError, SessionTracker};

/// Variable names understood by AWS SDKs for container credentials.
pub const ENV_CREDENTIALS_URI: &str = "AWS_CONTAINER_CREDENTIALS_FULL_URI";
pub const ENV_AUTHORIZATION_TOKEN: &str = "AWS_CONTAINER_AUTHORIZATION_TOKEN";

pub const DEFAULT_SERVER_DURATION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub user: String,
    pub profile: String,
    pub bind: SocketAddr,
    /// Lifetime of each set of credentials handed out.
    pub duration: Duration,
    /// Defer the first issuance until the child asks for credentials.
    pub lazy: bool,
    pub namespace: String,
    pub device_id: Option<String>,
}

impl ServerConfig {
    pub fn new(user: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            profile: profile.into(),
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            duration: DEFAULT_SERVER_DURATION,
            lazy: false,
            namespace: identifiers::DEFAULT_NAMESPACE.to_string(),
            device_id: None,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ServerError {
    #[error("missing or invalid authorization token")]
    #[diagnostic(code(gatehouse::server::unauthorized))]
    Unauthorized,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Issue(#[from] IssueError),

    #[error("failed to bind session server on {addr}")]
    #[diagnostic(
        code(gatehouse::server::bind),
        help("Pick a different port or leave it at 0 to let the OS choose")
    )]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::Session(SessionError::Store(e)) if !e.is_not_found() => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServerError::Session(SessionError::InvalidId(_) | SessionError::MissingField(_)) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Session(_) => StatusCode::FORBIDDEN,
            ServerError::Issue(IssueError::Denied(_)) => StatusCode::FORBIDDEN,
            ServerError::Issue(IssueError::InvalidRequest(_) | IssueError::InvalidId(_)) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Issue(IssueError::Provider(_)) => StatusCode::BAD_GATEWAY,
            ServerError::Issue(IssueError::Policy(_)) | ServerError::Bind { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = match &self {
            ServerError::Issue(IssueError::Denied(details)) => json!({
                "error": self.to_string(),
                "denied": details,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Container-credentials response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialsBody {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
    expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role_arn: Option<String>,
}

impl CredentialsBody {
    fn new(creds: Credentials, fallback_expiry: DateTime<Utc>) -> Self {
        let expiration = creds.expiration.or(creds.can_expire.then_some(fallback_expiry));
        Self {
            access_key_id: creds.access_key_id,
            secret_access_key: creds.secret_access_key,
            token: creds.session_token,
            expiration: expiration.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            role_arn: Some(creds.role_arn).filter(|arn| !arn.is_empty()),
        }
    }
}

struct ServerState {
    issuer: Arc<CredentialIssuer>,
    tracker: Option<Arc<SessionTracker>>,
    session_id: Option<String>,
    token: String,
    user: String,
    profile: String,
    duration: Duration,
}

impl ServerState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let presented = value.strip_prefix("Bearer ").unwrap_or(value);
        constant_time_eq(presented.as_bytes(), self.token.as_bytes())
    }

    async fn serve_credentials(&self) -> Result<CredentialsBody, ServerError> {
        if let (Some(tracker), Some(id)) = (&self.tracker, &self.session_id) {
            tracker.touch(id).await?;
        }
        let issued = self
            .issuer
            .issue(&IssueRequest {
                user: self.user.clone(),
                profile: self.profile.clone(),
                mode: Mode::Server,
                duration: self.duration,
                session_id: self.session_id.clone(),
                no_session: false,
            })
            .await?;
        let fallback = crate::clock::add(Utc::now(), issued.duration);
        Ok(CredentialsBody::new(issued.credentials, fallback))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn new_token() -> String {
    // 128 bits, reusing the id generator.
    format!("{}{}", identifiers::new_id(), identifiers::new_id())
}

async fn credentials_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        tracing::warn!("Rejected credential request with bad token");
        return ServerError::Unauthorized.into_response();
    }
    match state.serve_credentials().await {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, session_id = ?state.session_id, "Credential request failed");
            e.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(credentials_handler))
        .route("/healthz", get(health))
        .with_state(state)
}

/// A running session server. Call [`SessionServer::shutdown`] to stop it and
/// end the tracked session.
pub struct SessionServer {
    addr: SocketAddr,
    token: String,
    session_id: Option<String>,
    tracker: Option<Arc<SessionTracker>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl SessionServer {
    /// Register the session, optionally issue once to fail fast, then start
    /// listening.
    pub async fn start(
        config: ServerConfig,
        issuer: Arc<CredentialIssuer>,
        tracker: Option<Arc<SessionTracker>>,
    ) -> Result<Self, ServerError> {
        let server_instance_id = identifiers::new_id();
        let session = match &tracker {
            Some(tracker) => Some(
                tracker
                    .create(NewSession {
                        user: config.user.clone(),
                        profile: config.profile.clone(),
                        server_instance_id: server_instance_id.clone(),
                        source_identity: identifiers::source_identity(
                            &config.namespace,
                            &config.user,
                            &server_instance_id,
                        ),
                        device_id: config.device_id.clone(),
                    })
                    .await?,
            ),
            None => None,
        };
        let session_id = session.map(|s| s.id);

        let state = Arc::new(ServerState {
            issuer,
            tracker: tracker.clone(),
            session_id: session_id.clone(),
            token: new_token(),
            user: config.user.clone(),
            profile: config.profile.clone(),
            duration: config.duration,
        });

        let ended = |e: ServerError| {
            let tracker = tracker.clone();
            let session_id = session_id.clone();
            async move {
                if let (Some(tracker), Some(id)) = (tracker, session_id) {
                    tracker.end(&id).await;
                }
                e
            }
        };

        if !config.lazy {
            if let Err(e) = state.serve_credentials().await {
                return Err(ended(e).await);
            }
        }

        let listener = match tokio::net::TcpListener::bind(config.bind).await {
            Ok(listener) => listener,
            Err(source) => {
                return Err(ended(ServerError::Bind {
                    addr: config.bind,
                    source,
                })
                .await)
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                return Err(ended(ServerError::Bind {
                    addr: config.bind,
                    source,
                })
                .await)
            }
        };

        let (tx, rx) = oneshot::channel::<()>();
        let app = router(state.clone());
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
        });

        tracing::info!(
            %addr,
            user = %config.user,
            profile = %config.profile,
            session_id = ?session_id,
            lazy = config.lazy,
            "Session server listening"
        );

        Ok(Self {
            addr,
            token: state.token.clone(),
            session_id,
            tracker,
            shutdown: Some(tx),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Environment for the supervised process.
    pub fn env_vars(&self) -> [(&'static str, String); 2] {
        [
            (ENV_CREDENTIALS_URI, self.url()),
            (ENV_AUTHORIZATION_TOKEN, self.token.clone()),
        ]
    }

    /// Stop accepting requests, wait for in-flight ones, and end the session.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match (&mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Session server exited with error"),
            Err(e) => tracing::warn!(error = %e, "Session server task panicked"),
        }
        if let (Some(tracker), Some(id)) = (&self.tracker, &self.session_id) {
            tracker.end(id).await;
        }
        tracing::info!(addr = %self.addr, "Session server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_token_shape() {
        let token = new_token();
        assert_eq!(token.len(), 32);
        assert_ne!(token, new_token());
    }

    #[test]
    fn test_credentials_body_format() {
        let expiry = DateTime::parse_from_rfc3339("2030-01-01T00:15:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let body = CredentialsBody::new(
            Credentials {
                access_key_id: "ASIA".into(),
                secret_access_key: "secret".into(),
                session_token: Some("tok".into()),
                expiration: Some(expiry),
                can_expire: true,
                source_identity: String::new(),
                role_arn: String::new(),
            },
            Utc::now(),
        );
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["AccessKeyId"], "ASIA");
        assert_eq!(json["Token"], "tok");
        assert_eq!(json["Expiration"], "2030-01-01T00:15:00Z");
        assert!(json.get("RoleArn").is_none());
    }

    #[test]
    fn test_denied_maps_to_forbidden() {
        let details = crate::issuer::DenyDetails {
            user: "alice".into(),
            profile: "production".into(),
            matched_rule: String::new(),
            rule_index: None,
            reason: "no matching rule".into(),
            requires_server_mode: false,
            requires_session_tracking: false,
            approval_available: true,
            break_glass_available: false,
            override_lookup_failed: false,
        };
        let resp = ServerError::Issue(IssueError::Denied(Box::new(details))).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = ServerError::Session(SessionError::AlreadyRevoked("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = ServerError::Issue(IssueError::Provider("boom".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        assert_eq!(ServerError::Unauthorized.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
