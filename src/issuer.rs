//! Credential issuance: one request, end to end.
//!
//! Load policy, evaluate, fall back to an override on a plain denial, size
//! the session, mint credentials, then record the decision. The issuer keeps
//! no state between calls, so every call re-evaluates from scratch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::audit::{DecisionLogEntry, Logger, NopLogger};
use crate::credentials::{
    CredentialProvider, CredentialRequest, Credentials, DriftChecker, DriftStatus, ProviderError,
};
use crate::identifiers::{self, InvalidId};
use crate::notify::{self, BreakGlassNotification, NoopNotifier, NotificationType, Notifier};
use crate::overrides::{Override, OverrideResolver};
use crate::policy::{evaluate, Decision, Mode, PolicyError, PolicyLoader, Request};

#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Passed verbatim to the policy loader.
    pub policy_source: String,
    /// Non-empty when server sessions are tracked.
    pub session_table_name: String,
    pub cli_default_duration: Duration,
    pub server_default_duration: Duration,
    pub max_duration: Duration,
    pub policy_timeout: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            policy_source: "policy.kdl".to_string(),
            session_table_name: String::new(),
            cli_default_duration: Duration::from_secs(3600),
            server_default_duration: Duration::from_secs(15 * 60),
            max_duration: Duration::from_secs(12 * 3600),
            policy_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub user: String,
    pub profile: String,
    pub mode: Mode,
    /// Zero selects the default for `mode`.
    pub duration: Duration,
    pub session_id: Option<String>,
    pub no_session: bool,
}

#[derive(Debug)]
pub struct Issued {
    pub credentials: Credentials,
    pub decision: Decision,
    pub request_id: String,
    pub duration: Duration,
    pub applied_override: Option<Override>,
}

/// Everything a caller needs to explain a denial and suggest a way forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenyDetails {
    pub user: String,
    pub profile: String,
    pub matched_rule: String,
    pub rule_index: Option<usize>,
    pub reason: String,
    pub requires_server_mode: bool,
    pub requires_session_tracking: bool,
    pub approval_available: bool,
    pub break_glass_available: bool,
    pub override_lookup_failed: bool,
}

impl DenyDetails {
    /// Remediation suggestions, comma-separated; empty when there are none.
    pub fn hint(&self) -> String {
        let mut hints = Vec::new();
        if self.requires_server_mode {
            hints.push("run in server mode");
        }
        if self.requires_session_tracking {
            hints.push("enable session tracking");
        }
        if !self.is_mode_requirement() {
            if self.approval_available {
                hints.push("submit an access request");
            }
            if self.break_glass_available {
                hints.push("invoke break-glass in an emergency");
            }
        }
        hints.join(", ")
    }

    pub fn is_mode_requirement(&self) -> bool {
        self.requires_server_mode || self.requires_session_tracking
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum IssueError {
    #[error("access denied for {} on profile {}: {}", .0.user, .0.profile, deny_reason(.0))]
    #[diagnostic(
        code(gatehouse::issue::denied),
        help("Switch mode if the policy asks for a server session; otherwise request approval or use break-glass")
    )]
    Denied(Box<DenyDetails>),

    #[error("invalid issuance request: {0}")]
    #[diagnostic(code(gatehouse::issue::invalid_request))]
    InvalidRequest(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidId(#[from] InvalidId),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Policy(#[from] PolicyError),

    #[error("credential provider failed: {0}")]
    #[diagnostic(code(gatehouse::issue::provider))]
    Provider(#[source] ProviderError),
}

fn deny_reason(d: &DenyDetails) -> &str {
    if d.reason.is_empty() {
        "denied by policy"
    } else {
        &d.reason
    }
}

pub struct CredentialIssuer {
    config: IssuerConfig,
    loader: Arc<dyn PolicyLoader>,
    provider: Arc<dyn CredentialProvider>,
    resolver: OverrideResolver,
    logger: Arc<dyn Logger>,
    notifier: Arc<dyn Notifier>,
    drift: Option<Arc<dyn DriftChecker>>,
}

impl CredentialIssuer {
    pub fn new(
        config: IssuerConfig,
        loader: Arc<dyn PolicyLoader>,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            config,
            loader,
            provider,
            resolver: OverrideResolver::new(),
            logger: Arc::new(NopLogger),
            notifier: Arc::new(NoopNotifier),
            drift: None,
        }
    }

    pub fn with_resolver(mut self, resolver: OverrideResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_drift_checker(mut self, checker: Arc<dyn DriftChecker>) -> Self {
        self.drift = Some(checker);
        self
    }

    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    pub async fn issue(&self, req: &IssueRequest) -> Result<Issued, IssueError> {
        if req.user.trim().is_empty() {
            return Err(IssueError::InvalidRequest("user must not be empty".into()));
        }
        if req.profile.trim().is_empty() {
            return Err(IssueError::InvalidRequest("profile must not be empty".into()));
        }
        if let Some(session_id) = &req.session_id {
            identifiers::validate_id("session", session_id)?;
        }

        let policy = tokio::time::timeout(
            self.config.policy_timeout,
            self.loader.load(&self.config.policy_source),
        )
        .await
        .map_err(|_| PolicyError::Timeout(self.config.policy_source.clone()))??;

        let now = Utc::now();
        let request_id = identifiers::new_id();
        let decision = evaluate(
            &policy,
            &Request {
                user: req.user.clone(),
                profile: req.profile.clone(),
                time: now,
                mode: req.mode,
                session_table_name: self.config.session_table_name.clone(),
            },
        );

        let mut applied_override = None;
        if !decision.is_allowed() {
            // A mode requirement is remediated by switching mode, not by an override.
            let resolution = if decision.is_mode_requirement() {
                Default::default()
            } else {
                self.resolver.resolve(&req.user, &req.profile, now).await
            };
            match resolution.found {
                Some(found) => applied_override = Some(found),
                None => {
                    let details = DenyDetails {
                        user: req.user.clone(),
                        profile: req.profile.clone(),
                        matched_rule: decision.matched_rule.clone(),
                        rule_index: decision.rule_index,
                        reason: decision.reason.clone(),
                        requires_server_mode: decision.requires_server_mode,
                        requires_session_tracking: decision.requires_session_tracking,
                        approval_available: self.resolver.has_approval_path(),
                        break_glass_available: self.resolver.has_break_glass_path(),
                        override_lookup_failed: resolution.lookup_failed,
                    };
                    tracing::info!(
                        user = %req.user,
                        profile = %req.profile,
                        rule = %decision.matched_rule,
                        lookup_failed = resolution.lookup_failed,
                        "Credential request denied"
                    );
                    self.log(req, &decision, &request_id, None, None, None, DriftStatus::Unchecked);
                    return Err(IssueError::Denied(Box::new(details)));
                }
            }
        }

        let duration = self.effective_duration(req, applied_override.as_ref(), now);
        let credentials = self
            .provider
            .get_credentials_with_source_identity(&CredentialRequest {
                profile: req.profile.clone(),
                duration,
                user: req.user.clone(),
                request_id: request_id.clone(),
                no_session: req.no_session,
            })
            .await
            .map_err(IssueError::Provider)?;

        let drift = match (&self.drift, credentials.role_arn.is_empty()) {
            (Some(checker), false) => checker.check(&credentials.role_arn).await,
            _ => DriftStatus::Unchecked,
        };
        if matches!(drift, DriftStatus::Partial | DriftStatus::Missing) {
            tracing::warn!(role_arn = %credentials.role_arn, ?drift, "Role enforcement drift detected");
        }

        self.log(
            req,
            &decision,
            &request_id,
            Some(&credentials),
            Some(duration),
            applied_override.as_ref(),
            drift,
        );

        if let Some(Override::BreakGlass(event)) = &applied_override {
            notify::dispatch(
                self.notifier.as_ref(),
                BreakGlassNotification {
                    kind: NotificationType::Used,
                    event: event.clone(),
                    actor: req.user.clone(),
                    timestamp: Utc::now(),
                },
            )
            .await;
        }

        tracing::debug!(
            user = %req.user,
            profile = %req.profile,
            mode = %req.mode,
            request_id = %request_id,
            duration_secs = duration.as_secs(),
            "Issued credentials"
        );

        Ok(Issued {
            credentials,
            decision,
            request_id,
            duration,
            applied_override,
        })
    }

    fn effective_duration(
        &self,
        req: &IssueRequest,
        applied: Option<&Override>,
        now: chrono::DateTime<Utc>,
    ) -> Duration {
        let requested = if req.duration.is_zero() {
            match req.mode {
                Mode::Server => self.config.server_default_duration,
                Mode::Cli | Mode::CredentialProcess => self.config.cli_default_duration,
            }
        } else {
            req.duration
        };
        let clamped = requested.min(self.config.max_duration);
        match applied {
            Some(o) => o.cap(clamped, now),
            None => clamped,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log(
        &self,
        req: &IssueRequest,
        decision: &Decision,
        request_id: &str,
        credentials: Option<&Credentials>,
        duration: Option<Duration>,
        applied: Option<&Override>,
        drift_status: DriftStatus,
    ) {
        let (approved_request_id, break_glass_event_id) = match applied {
            Some(Override::ApprovedRequest(r)) => (Some(r.id.clone()), None),
            Some(Override::BreakGlass(e)) => (None, Some(e.id.clone())),
            None => (None, None),
        };
        self.logger.log_decision(&DecisionLogEntry {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            user: req.user.clone(),
            profile: req.profile.clone(),
            mode: req.mode,
            effect: decision.effect,
            matched_rule: decision.matched_rule.clone(),
            rule_index: decision.rule_index,
            reason: decision.reason.clone(),
            source_identity: credentials.map(|c| c.source_identity.clone()),
            role_arn: credentials
                .map(|c| c.role_arn.clone())
                .filter(|arn| !arn.is_empty()),
            session_duration_secs: duration.map(|d| d.as_secs()),
            approved_request_id,
            break_glass_event_id,
            session_id: req.session_id.clone(),
            drift_status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryLogger;
    use crate::policy::{Effect, Policy, Rule};
    use crate::policy::types::Conditions;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticLoader(Arc<Policy>);

    #[async_trait]
    impl PolicyLoader for StaticLoader {
        async fn load(&self, _source: &str) -> Result<Arc<Policy>, PolicyError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        seen: Mutex<Vec<CredentialRequest>>,
    }

    #[async_trait]
    impl CredentialProvider for FakeProvider {
        async fn get_credentials_with_source_identity(
            &self,
            request: &CredentialRequest,
        ) -> Result<Credentials, ProviderError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(Credentials {
                access_key_id: "ASIAEXAMPLE".into(),
                secret_access_key: "secret".into(),
                session_token: Some("token".into()),
                expiration: Some(crate::clock::add(Utc::now(), request.duration)),
                can_expire: true,
                source_identity: identifiers::source_identity(
                    "gatehouse",
                    &request.user,
                    &request.request_id,
                ),
                role_arn: "arn:aws:iam::123456789012:role/prod".into(),
            })
        }
    }

    fn rule(name: &str, effect: Effect) -> Rule {
        Rule {
            name: name.into(),
            effect,
            conditions: Conditions {
                profiles: vec!["production".into()],
                users: vec![],
                time: None,
            },
            reason: String::new(),
        }
    }

    fn issuer(rules: Vec<Rule>) -> (CredentialIssuer, Arc<FakeProvider>, Arc<MemoryLogger>) {
        let policy = Arc::new(Policy {
            version: "1".into(),
            rules,
        });
        let provider = Arc::new(FakeProvider::default());
        let logger = Arc::new(MemoryLogger::new());
        let issuer = CredentialIssuer::new(
            IssuerConfig::default(),
            Arc::new(StaticLoader(policy)),
            provider.clone(),
        )
        .with_logger(logger.clone());
        (issuer, provider, logger)
    }

    fn request(mode: Mode) -> IssueRequest {
        IssueRequest {
            user: "alice".into(),
            profile: "production".into(),
            mode,
            duration: Duration::ZERO,
            session_id: None,
            no_session: false,
        }
    }

    #[tokio::test]
    async fn test_allow_uses_mode_default_duration() {
        let (issuer, provider, logger) = issuer(vec![rule("allow-all", Effect::Allow)]);

        let issued = issuer.issue(&request(Mode::Cli)).await.unwrap();
        assert_eq!(issued.duration, Duration::from_secs(3600));
        assert_eq!(issued.decision.rule_index, Some(0));

        let issued = issuer.issue(&request(Mode::Server)).await.unwrap();
        assert_eq!(issued.duration, Duration::from_secs(900));

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].request_id, seen[1].request_id);

        let entries = logger.decisions();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].matched_rule, "allow-all");
        assert_eq!(
            entries[0].source_identity.as_deref(),
            Some(format!("gatehouse:alice:{}", seen[0].request_id).as_str())
        );
    }

    #[tokio::test]
    async fn test_duration_clamped_to_max() {
        let (issuer, _, _) = issuer(vec![rule("allow-all", Effect::Allow)]);
        let mut req = request(Mode::Cli);
        req.duration = Duration::from_secs(48 * 3600);
        let issued = issuer.issue(&req).await.unwrap();
        assert_eq!(issued.duration, Duration::from_secs(12 * 3600));
    }

    #[tokio::test]
    async fn test_deny_carries_details() {
        let (issuer, provider, logger) = issuer(vec![]);
        let err = issuer.issue(&request(Mode::Cli)).await.unwrap_err();
        let IssueError::Denied(details) = err else {
            panic!("expected denial");
        };
        assert_eq!(details.rule_index, None);
        assert_eq!(details.reason, "no matching rule");
        assert!(!details.approval_available);
        assert!(!details.break_glass_available);
        assert!(provider.seen.lock().unwrap().is_empty());
        assert_eq!(logger.decisions()[0].effect, Effect::Deny);
    }

    #[tokio::test]
    async fn test_require_server_session_flags() {
        let (issuer, _, _) = issuer(vec![rule("server-only", Effect::RequireServerSession)]);
        let err = issuer.issue(&request(Mode::Cli)).await.unwrap_err();
        let IssueError::Denied(details) = err else {
            panic!("expected denial");
        };
        assert!(details.requires_server_mode);
        assert!(details.requires_session_tracking);
        assert!(details.hint().contains("server mode"));
    }

    #[tokio::test]
    async fn test_empty_user_is_invalid() {
        let (issuer, _, _) = issuer(vec![rule("allow-all", Effect::Allow)]);
        let mut req = request(Mode::Cli);
        req.user = String::new();
        assert!(matches!(
            issuer.issue(&req).await.unwrap_err(),
            IssueError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        struct Failing;

        #[async_trait]
        impl CredentialProvider for Failing {
            async fn get_credentials_with_source_identity(
                &self,
                _: &CredentialRequest,
            ) -> Result<Credentials, ProviderError> {
                Err("sts throttled".into())
            }
        }

        let policy = Arc::new(Policy {
            version: "1".into(),
            rules: vec![rule("allow-all", Effect::Allow)],
        });
        let issuer = CredentialIssuer::new(
            IssuerConfig::default(),
            Arc::new(StaticLoader(policy)),
            Arc::new(Failing),
        );
        let err = issuer.issue(&request(Mode::Cli)).await.unwrap_err();
        assert!(matches!(err, IssueError::Provider(_)));
        assert!(err.to_string().contains("sts throttled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_load_timeout() {
        struct Hanging;

        #[async_trait]
        impl PolicyLoader for Hanging {
            async fn load(&self, _: &str) -> Result<Arc<Policy>, PolicyError> {
                std::future::pending().await
            }
        }

        let issuer = CredentialIssuer::new(
            IssuerConfig::default(),
            Arc::new(Hanging),
            Arc::new(FakeProvider::default()),
        );
        let err = issuer.issue(&request(Mode::Cli)).await.unwrap_err();
        assert!(matches!(err, IssueError::Policy(PolicyError::Timeout(_))));
    }
}
