use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wildcard accepted in profile and user lists.
pub const WILDCARD: &str = "*";

/// Outcome a rule grants when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
    /// Conditional allow: only for server-mode requests with session tracking.
    RequireServerSession,
}

impl Effect {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "require_server_session" => Some(Self::RequireServerSession),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireServerSession => "require_server_session",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the credentials are being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One-shot issuance from the command line.
    Cli,
    /// Per-request issuance through the session server.
    Server,
    /// Invoked by an SDK as a `credential_process`.
    CredentialProcess,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Server => "server",
            Self::CredentialProcess => "credential_process",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hour range in UTC, start inclusive, end exclusive.
/// A range whose start is after its end wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl HourRange {
    /// Parse `"HH:MM"` bounds.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self {
            start: NaiveTime::parse_from_str(start, "%H:%M").ok()?,
            end: NaiveTime::parse_from_str(end, "%H:%M").ok()?,
        })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Optional restriction on when a rule applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeWindow {
    /// Empty means every day.
    pub days: Vec<Weekday>,
    pub hours: Option<HourRange>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if !self.days.is_empty() && !self.days.contains(&at.weekday()) {
            return false;
        }
        match &self.hours {
            Some(range) => {
                // Second precision is enough; drop leap-second nanos.
                let t = NaiveTime::from_hms_opt(at.hour(), at.minute(), at.second())
                    .unwrap_or(NaiveTime::MIN);
                range.contains(t)
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    /// Profiles the rule covers; `*` matches any.
    pub profiles: Vec<String>,
    /// Users the rule covers; empty or `*` matches any.
    pub users: Vec<String>,
    pub time: Option<TimeWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub effect: Effect,
    pub conditions: Conditions,
    pub reason: String,
}

/// An ordered rule set. Immutable once loaded; first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub version: String,
    pub rules: Vec<Rule>,
}

/// Evaluator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub user: String,
    pub profile: String,
    pub time: DateTime<Utc>,
    pub mode: Mode,
    /// Non-empty when server sessions are tracked in a store.
    pub session_table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub effect: Effect,
    pub matched_rule: String,
    /// Index of the matched rule; `None` when no rule matched.
    pub rule_index: Option<usize>,
    pub reason: String,
    pub requires_server_mode: bool,
    pub requires_session_tracking: bool,
}

impl Decision {
    pub fn default_deny(reason: &str) -> Self {
        Self {
            effect: Effect::Deny,
            matched_rule: String::new(),
            rule_index: None,
            reason: reason.to_string(),
            requires_server_mode: false,
            requires_session_tracking: false,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.effect == Effect::Allow
    }

    /// A denial that asks for a different mode rather than refusing access.
    pub fn is_mode_requirement(&self) -> bool {
        self.requires_server_mode || self.requires_session_tracking
    }
}

/// Intermediate result from parsing a KDL policy document, before validation.
#[derive(Debug, Clone, Default)]
pub struct ParsedPolicy {
    pub version: Option<String>,
    pub rules: Vec<ParsedRule>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedRule {
    pub name: String,
    pub effect: String,
    pub profiles: Vec<String>,
    pub users: Vec<String>,
    pub days: Vec<String>,
    /// Raw `(start, end)` strings from an `hours` node.
    pub hours: Option<(String, String)>,
    pub reason: Option<String>,
}
