use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use gatehouse::audit::MemoryLogger;
use gatehouse::credentials::{CredentialProvider, CredentialRequest, Credentials, ProviderError};
use gatehouse::identifiers;
use gatehouse::issuer::{CredentialIssuer, IssuerConfig};
use gatehouse::overrides::OverrideResolver;
use gatehouse::policy::FilePolicyLoader;
use gatehouse::storage::SqlStore;
use tempfile::NamedTempFile;

/// Builder for KDL policy files on disk
pub struct PolicyFile {
    rules: Vec<String>,
}

impl PolicyFile {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn rule(mut self, name: &str, effect: &str, profiles: &[&str], users: &[&str]) -> Self {
        let mut body = String::new();
        body.push_str("    profiles {\n");
        for p in profiles {
            body.push_str(&format!("        - \"{p}\"\n"));
        }
        body.push_str("    }\n");
        if !users.is_empty() {
            body.push_str("    users {\n");
            for u in users {
                body.push_str(&format!("        - \"{u}\"\n"));
            }
            body.push_str("    }\n");
        }
        self.rules
            .push(format!("rule \"{name}\" effect=\"{effect}\" {{\n{body}}}\n"));
        self
    }

    pub fn write(self) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create policy file");
        writeln!(file, "version \"1\"").expect("Failed to write policy");
        for rule in &self.rules {
            writeln!(file, "{rule}").expect("Failed to write policy");
        }
        file.flush().expect("Failed to flush policy");
        file
    }
}

/// Provider that hands out fixed credentials and records every request
#[derive(Default)]
pub struct FakeProvider {
    seen: Mutex<Vec<CredentialRequest>>,
}

impl FakeProvider {
    pub fn requests(&self) -> Vec<CredentialRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialProvider for FakeProvider {
    async fn get_credentials_with_source_identity(
        &self,
        request: &CredentialRequest,
    ) -> Result<Credentials, ProviderError> {
        self.seen.lock().unwrap().push(request.clone());
        Ok(Credentials {
            access_key_id: "ASIATESTKEY".into(),
            secret_access_key: "test-secret".into(),
            session_token: Some("test-token".into()),
            expiration: Some(gatehouse::clock::add(Utc::now(), request.duration)),
            can_expire: true,
            source_identity: identifiers::source_identity(
                identifiers::DEFAULT_NAMESPACE,
                &request.user,
                &request.request_id,
            ),
            role_arn: "arn:aws:iam::123456789012:role/test".into(),
        })
    }
}

/// Builder for an issuer backed by a policy file and, optionally, a store
pub struct IssuerBuilder {
    policy_source: String,
    store: Option<Arc<SqlStore>>,
    track_sessions: bool,
}

impl IssuerBuilder {
    pub fn new(policy: &NamedTempFile) -> Self {
        Self {
            policy_source: policy.path().to_string_lossy().to_string(),
            store: None,
            track_sessions: false,
        }
    }

    /// Enable both override paths against `store`.
    pub fn with_overrides(mut self, store: Arc<SqlStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn track_sessions(mut self) -> Self {
        self.track_sessions = true;
        self
    }

    pub fn build(self) -> (CredentialIssuer, Arc<FakeProvider>, Arc<MemoryLogger>) {
        let provider = Arc::new(FakeProvider::default());
        let logger = Arc::new(MemoryLogger::new());
        let config = IssuerConfig {
            policy_source: self.policy_source,
            session_table_name: if self.track_sessions {
                "server_sessions".into()
            } else {
                String::new()
            },
            ..IssuerConfig::default()
        };

        let mut issuer =
            CredentialIssuer::new(config, Arc::new(FilePolicyLoader::new()), provider.clone())
                .with_logger(logger.clone());
        if let Some(store) = self.store {
            issuer = issuer.with_resolver(
                OverrideResolver::new()
                    .with_requests(store.clone())
                    .with_break_glass(store),
            );
        }
        (issuer, provider, logger)
    }
}
