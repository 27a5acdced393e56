//! Seam to the cloud provider that actually mints credentials.
//!
//! gatehouse never talks to the provider's STS directly; a
//! [`CredentialProvider`] is injected. [`CommandCredentialProvider`] adapts
//! any program that speaks the `credential_process` JSON format.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifiers;

/// Upstream failures are boxed and passed through untouched.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequest {
    pub profile: String,
    pub duration: Duration,
    pub user: String,
    pub request_id: String,
    /// Return the profile's long-lived credentials without a session.
    pub no_session: bool,
}

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub can_expire: bool,
    pub source_identity: String,
    pub role_arn: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expiration", &self.expiration)
            .field("can_expire", &self.can_expire)
            .field("source_identity", &self.source_identity)
            .field("role_arn", &self.role_arn)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credentials_with_source_identity(
        &self,
        request: &CredentialRequest,
    ) -> Result<Credentials, ProviderError>;
}

/// Advisory comparison of a role's enforcement configuration against what
/// gatehouse expects. Never blocks issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Unchecked,
    Ok,
    Partial,
    Missing,
    Error,
}

#[async_trait]
pub trait DriftChecker: Send + Sync {
    async fn check(&self, role_arn: &str) -> DriftStatus;
}

/// `credential_process` output, as emitted by the external command.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessOutput {
    version: u32,
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    role_arn: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandProviderError {
    #[error("failed to run credential command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("credential command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("credential command produced invalid output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("unsupported credential_process version {0}")]
    Version(u32),
}

/// Runs an external program and parses its `credential_process` JSON.
///
/// The request is handed to the program through environment variables
/// (`GATEHOUSE_PROFILE`, `GATEHOUSE_USER`, `GATEHOUSE_REQUEST_ID`,
/// `GATEHOUSE_SOURCE_IDENTITY`, `GATEHOUSE_DURATION_SECS`,
/// `GATEHOUSE_NO_SESSION`).
#[derive(Debug, Clone)]
pub struct CommandCredentialProvider {
    program: String,
    args: Vec<String>,
    namespace: String,
    role_arn: Option<String>,
}

impl CommandCredentialProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>, namespace: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            namespace: namespace.into(),
            role_arn: None,
        }
    }

    /// Role reported when the command output does not carry one.
    pub fn with_role_arn(mut self, role_arn: impl Into<String>) -> Self {
        self.role_arn = Some(role_arn.into());
        self
    }

    async fn run(&self, request: &CredentialRequest) -> Result<Credentials, CommandProviderError> {
        let source_identity =
            identifiers::source_identity(&self.namespace, &request.user, &request.request_id);

        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("GATEHOUSE_PROFILE", &request.profile)
            .env("GATEHOUSE_USER", &request.user)
            .env("GATEHOUSE_REQUEST_ID", &request.request_id)
            .env("GATEHOUSE_SOURCE_IDENTITY", &source_identity)
            .env("GATEHOUSE_DURATION_SECS", request.duration.as_secs().to_string())
            .env("GATEHOUSE_NO_SESSION", if request.no_session { "1" } else { "0" })
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandProviderError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CommandProviderError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let parsed: ProcessOutput = serde_json::from_slice(&output.stdout)?;
        if parsed.version != 1 {
            return Err(CommandProviderError::Version(parsed.version));
        }

        Ok(Credentials {
            access_key_id: parsed.access_key_id,
            secret_access_key: parsed.secret_access_key,
            can_expire: parsed.expiration.is_some(),
            session_token: parsed.session_token,
            expiration: parsed.expiration,
            source_identity,
            role_arn: parsed
                .role_arn
                .or_else(|| self.role_arn.clone())
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl CredentialProvider for CommandCredentialProvider {
    async fn get_credentials_with_source_identity(
        &self,
        request: &CredentialRequest,
    ) -> Result<Credentials, ProviderError> {
        Ok(self.run(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CredentialRequest {
        CredentialRequest {
            profile: "production".into(),
            duration: Duration::from_secs(900),
            user: "alice".into(),
            request_id: "0123456789abcdef".into(),
            no_session: false,
        }
    }

    fn sh(script: &str) -> CommandCredentialProvider {
        CommandCredentialProvider::new("sh", vec!["-c".into(), script.into()], "gatehouse")
    }

    #[tokio::test]
    async fn test_command_provider_parses_output() {
        let provider = sh(r#"printf '{"Version":1,"AccessKeyId":"AKIA%s","SecretAccessKey":"secret","SessionToken":"tok","Expiration":"2030-01-01T00:00:00Z"}' "$GATEHOUSE_DURATION_SECS""#)
            .with_role_arn("arn:aws:iam::123456789012:role/prod");

        let creds = provider
            .get_credentials_with_source_identity(&request())
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIA900");
        assert_eq!(creds.session_token.as_deref(), Some("tok"));
        assert!(creds.can_expire);
        assert_eq!(creds.source_identity, "gatehouse:alice:0123456789abcdef");
        assert_eq!(creds.role_arn, "arn:aws:iam::123456789012:role/prod");
    }

    #[tokio::test]
    async fn test_command_provider_failure_propagates() {
        let provider = sh("echo boom >&2; exit 3");
        let err = provider
            .get_credentials_with_source_identity(&request())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_command_provider_rejects_bad_json() {
        let provider = sh("echo not-json");
        assert!(provider
            .get_credentials_with_source_identity(&request())
            .await
            .is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials {
            access_key_id: "AKIA".into(),
            secret_access_key: "very-secret".into(),
            session_token: Some("token".into()),
            expiration: None,
            can_expire: false,
            source_identity: String::new(),
            role_arn: String::new(),
        };
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("very-secret"));
        assert!(!dbg.contains("token\""));
    }
}
