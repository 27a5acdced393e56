use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Weekday;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::policy::errors::PolicyError;
use crate::policy::parser::parse_kdl_document;
use crate::policy::types::*;

/// Source of policies. `source` is loader-specific (a file path for
/// [`FilePolicyLoader`]).
#[async_trait]
pub trait PolicyLoader: Send + Sync {
    async fn load(&self, source: &str) -> Result<Arc<Policy>, PolicyError>;
}

/// Loads KDL policy files from disk. Relative sources resolve against `base_dir`.
#[derive(Debug, Clone, Default)]
pub struct FilePolicyLoader {
    base_dir: Option<PathBuf>,
}

impl FilePolicyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, source: &str) -> PathBuf {
        let path = PathBuf::from(source);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl PolicyLoader for FilePolicyLoader {
    async fn load(&self, source: &str) -> Result<Arc<Policy>, PolicyError> {
        let path = self.resolve(source);
        let contents =
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| PolicyError::Load {
                    path: path.display().to_string(),
                    source,
                })?;
        let policy = compile_policy(parse_kdl_document(&contents)?)?;

        tracing::info!(
            path = %path.display(),
            version = %policy.version,
            rules = policy.rules.len(),
            "Loaded access policy"
        );

        Ok(Arc::new(policy))
    }
}

struct CachedEntry {
    policy: Arc<Policy>,
    loaded_at: Instant,
}

/// Wraps another loader and reuses its result for `ttl`, so per-request
/// evaluation does not re-read the policy source every time.
pub struct CachedPolicyLoader {
    inner: Arc<dyn PolicyLoader>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedEntry>>,
}

impl CachedPolicyLoader {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(inner: Arc<dyn PolicyLoader>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drop every cached policy.
    pub async fn invalidate(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl PolicyLoader for CachedPolicyLoader {
    async fn load(&self, source: &str) -> Result<Arc<Policy>, PolicyError> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(source) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(entry.policy.clone());
                }
            }
        }

        // Errors are not cached; the next request retries the source.
        let policy = self.inner.load(source).await?;
        self.entries.write().await.insert(
            source.to_string(),
            CachedEntry {
                policy: policy.clone(),
                loaded_at: Instant::now(),
            },
        );
        tracing::debug!(source, "Refreshed cached policy");
        Ok(policy)
    }
}

/// Validate a parsed document and turn it into an immutable [`Policy`].
pub fn compile_policy(parsed: ParsedPolicy) -> Result<Policy, PolicyError> {
    let version = parsed
        .version
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PolicyError::Invalid("missing `version` node".into()))?;

    let mut rules = Vec::with_capacity(parsed.rules.len());
    for raw in parsed.rules {
        rules.push(compile_rule(raw)?);
    }

    Ok(Policy { version, rules })
}

fn compile_rule(raw: ParsedRule) -> Result<Rule, PolicyError> {
    let invalid = |message: String| PolicyError::InvalidRule {
        rule: raw.name.clone(),
        message,
    };

    if raw.name.trim().is_empty() {
        return Err(PolicyError::Invalid("rule name must not be empty".into()));
    }

    let effect = Effect::parse(&raw.effect)
        .ok_or_else(|| invalid(format!("unknown effect `{}`", raw.effect)))?;

    if raw.profiles.is_empty() {
        return Err(invalid("at least one profile is required".into()));
    }

    let time = if raw.days.is_empty() && raw.hours.is_none() {
        None
    } else {
        let mut days = Vec::with_capacity(raw.days.len());
        for day in &raw.days {
            let parsed: Weekday = day
                .parse()
                .map_err(|_| invalid(format!("unknown day `{day}`")))?;
            days.push(parsed);
        }
        let hours = match &raw.hours {
            Some((start, end)) => Some(
                HourRange::parse(start, end)
                    .ok_or_else(|| invalid(format!("invalid hours `{start}`-`{end}`")))?,
            ),
            None => None,
        };
        Some(TimeWindow { days, hours })
    };

    Ok(Rule {
        effect,
        conditions: Conditions {
            profiles: raw.profiles,
            users: raw.users,
            time,
        },
        reason: raw.reason.unwrap_or_default(),
        name: raw.name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE: &str = r#"
version "1"

rule "server-for-prod" effect="require_server_session" {
    profiles {
        - "production"
    }
    reason "production requires tracked sessions"
}

rule "weekday-staging" effect="allow" {
    profiles {
        - "staging"
    }
    users {
        - "alice"
    }
    time {
        days {
            - "monday"
            - "tuesday"
        }
        hours start="08:00" end="18:00"
    }
}
"#;

    #[test]
    fn test_compile_sample() {
        let policy = compile_policy(parse_kdl_document(SAMPLE).unwrap()).unwrap();
        assert_eq!(policy.version, "1");
        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.rules[0].effect, Effect::RequireServerSession);
        let window = policy.rules[1].conditions.time.as_ref().unwrap();
        assert_eq!(window.days, vec![Weekday::Mon, Weekday::Tue]);
        assert!(window.hours.is_some());
    }

    #[test]
    fn test_compile_requires_version() {
        let parsed = parse_kdl_document(r#"rule "r" effect="allow" { profiles { - "p" } }"#)
            .unwrap();
        let err = compile_policy(parsed).unwrap_err();
        assert!(matches!(err, PolicyError::Invalid(_)));
    }

    #[test]
    fn test_compile_rejects_unknown_effect() {
        let parsed = parse_kdl_document(
            r#"
version "1"
rule "r" effect="permit" { profiles { - "p" } }
"#,
        )
        .unwrap();
        let err = compile_policy(parsed).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidRule { ref rule, .. } if rule == "r"));
    }

    #[test]
    fn test_compile_rejects_missing_profiles() {
        let parsed = parse_kdl_document(
            r#"
version "1"
rule "r" effect="allow" { users { - "alice" } }
"#,
        )
        .unwrap();
        assert!(compile_policy(parsed).is_err());
    }

    #[test]
    fn test_compile_rejects_bad_day() {
        let parsed = parse_kdl_document(
            r#"
version "1"
rule "r" effect="allow" {
    profiles { - "p" }
    time { days { - "someday" } }
}
"#,
        )
        .unwrap();
        assert!(compile_policy(parsed).is_err());
    }

    #[tokio::test]
    async fn test_file_loader() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policy.kdl"), SAMPLE).unwrap();

        let loader = FilePolicyLoader::with_base_dir(dir.path());
        let policy = loader.load("policy.kdl").await.unwrap();
        assert_eq!(policy.rules.len(), 2);
    }

    #[tokio::test]
    async fn test_file_loader_missing_file() {
        let loader = FilePolicyLoader::new();
        let err = loader.load("/nonexistent/policy.kdl").await.unwrap_err();
        assert!(matches!(err, PolicyError::Load { .. }));
    }

    struct CountingLoader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PolicyLoader for CountingLoader {
        async fn load(&self, _source: &str) -> Result<Arc<Policy>, PolicyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Policy {
                version: "1".into(),
                rules: vec![],
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_loader_reuses_within_ttl() {
        let inner = Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedPolicyLoader::new(inner.clone(), Duration::from_secs(300));

        cached.load("p").await.unwrap();
        cached.load("p").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        cached.load("p").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        cached.invalidate().await;
        cached.load("p").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
