//! Structured audit trail for decisions, approvals and break-glass events.
//!
//! A [`Logger`] never reports failure to its caller: sinks swallow their own
//! errors (with a warning) so an audit hiccup cannot fail an issuance.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::breakglass::ReasonCode;
use crate::credentials::DriftStatus;
use crate::policy::{Effect, Mode};
use crate::requests::RequestStatus;

pub const AUDIT_TARGET: &str = "gatehouse::audit";

#[derive(Debug, Clone, Serialize)]
pub struct DecisionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub user: String,
    pub profile: String,
    pub mode: Mode,
    pub effect: Effect,
    pub matched_rule: String,
    pub rule_index: Option<usize>,
    pub reason: String,
    pub source_identity: Option<String>,
    pub role_arn: Option<String>,
    pub session_duration_secs: Option<u64>,
    pub approved_request_id: Option<String>,
    pub break_glass_event_id: Option<String>,
    pub session_id: Option<String>,
    pub drift_status: DriftStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Submitted,
    Approved,
    Denied,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: ApprovalAction,
    pub request_id: String,
    pub requester: String,
    pub profile: String,
    pub actor: String,
    pub status: RequestStatus,
    pub duration_secs: u64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakGlassAction {
    Invoked,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakGlassLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: BreakGlassAction,
    pub event_id: String,
    pub invoker: String,
    pub profile: String,
    pub actor: String,
    pub reason_code: ReasonCode,
    pub justification: String,
    pub duration_secs: u64,
    pub expires_at: DateTime<Utc>,
    pub closed_reason: Option<String>,
}

pub trait Logger: Send + Sync {
    fn log_decision(&self, entry: &DecisionLogEntry);
    fn log_approval(&self, entry: &ApprovalLogEntry);
    fn log_break_glass(&self, entry: &BreakGlassLogEntry);
}

/// Discards everything; used when audit logging is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopLogger;

impl Logger for NopLogger {
    fn log_decision(&self, _entry: &DecisionLogEntry) {}
    fn log_approval(&self, _entry: &ApprovalLogEntry) {}
    fn log_break_glass(&self, _entry: &BreakGlassLogEntry) {}
}

/// Emits one `tracing` event per entry on the `gatehouse::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log_decision(&self, e: &DecisionLogEntry) {
        tracing::info!(
            target: AUDIT_TARGET,
            request_id = %e.request_id,
            user = %e.user,
            profile = %e.profile,
            mode = %e.mode,
            effect = %e.effect,
            rule = %e.matched_rule,
            rule_index = ?e.rule_index,
            reason = %e.reason,
            source_identity = ?e.source_identity,
            role_arn = ?e.role_arn,
            duration_secs = ?e.session_duration_secs,
            approved_request_id = ?e.approved_request_id,
            break_glass_event_id = ?e.break_glass_event_id,
            session_id = ?e.session_id,
            drift = ?e.drift_status,
            "access decision"
        );
    }

    fn log_approval(&self, e: &ApprovalLogEntry) {
        tracing::info!(
            target: AUDIT_TARGET,
            action = ?e.action,
            request_id = %e.request_id,
            requester = %e.requester,
            profile = %e.profile,
            actor = %e.actor,
            status = %e.status,
            "access request"
        );
    }

    fn log_break_glass(&self, e: &BreakGlassLogEntry) {
        tracing::warn!(
            target: AUDIT_TARGET,
            action = ?e.action,
            event_id = %e.event_id,
            invoker = %e.invoker,
            profile = %e.profile,
            actor = %e.actor,
            reason_code = %e.reason_code,
            expires_at = %e.expires_at,
            "break-glass"
        );
    }
}

/// Lines buffered between callers and the file writer.
pub const DEFAULT_AUDIT_QUEUE: usize = 1024;

/// Appends one JSON object per line to a file.
///
/// Callers only encode and enqueue; a background task owns the file. A full
/// queue drops the entry with a warning. Call [`JsonLinesLogger::flush`]
/// before exiting so queued lines reach the file.
#[derive(Clone)]
pub struct JsonLinesLogger {
    tx: mpsc::Sender<WriterMsg>,
}

enum WriterMsg {
    Line(Vec<u8>),
    Flush(oneshot::Sender<()>),
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Decision(&'a DecisionLogEntry),
    Approval(&'a ApprovalLogEntry),
    BreakGlass(&'a BreakGlassLogEntry),
}

impl JsonLinesLogger {
    /// Open `path` for appending and spawn the writer on the current runtime.
    pub async fn open(path: &Path, capacity: usize) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        let (tx, mut rx) = mpsc::channel::<WriterMsg>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    WriterMsg::Line(json) => {
                        if let Err(e) = file.write_all(&json).await {
                            tracing::warn!(error = %e, "failed to write audit entry");
                        }
                    }
                    WriterMsg::Flush(done) => {
                        if let Err(e) = file.flush().await {
                            tracing::warn!(error = %e, "failed to flush audit log");
                        }
                        let _ = done.send(());
                    }
                }
            }
        });
        Ok(Self { tx })
    }

    /// Wait until every line queued before this call is written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(done)).await.is_err() {
            tracing::warn!("audit writer stopped; nothing to flush");
            return;
        }
        let _ = wait.await;
    }

    fn write(&self, line: Line<'_>) {
        let mut json = match serde_json::to_vec(&line) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode audit entry");
                return;
            }
        };
        json.push(b'\n');
        match self.tx.try_send(WriterMsg::Line(json)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("audit queue full; entry dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("audit writer stopped; entry dropped");
            }
        }
    }
}

impl Logger for JsonLinesLogger {
    fn log_decision(&self, entry: &DecisionLogEntry) {
        self.write(Line::Decision(entry));
    }

    fn log_approval(&self, entry: &ApprovalLogEntry) {
        self.write(Line::Approval(entry));
    }

    fn log_break_glass(&self, entry: &BreakGlassLogEntry) {
        self.write(Line::BreakGlass(entry));
    }
}

/// Keeps entries in memory; handy for assertions in tests.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    pub decisions: Mutex<Vec<DecisionLogEntry>>,
    pub approvals: Mutex<Vec<ApprovalLogEntry>>,
    pub break_glass: Mutex<Vec<BreakGlassLogEntry>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> Vec<DecisionLogEntry> {
        self.decisions.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn approvals(&self) -> Vec<ApprovalLogEntry> {
        self.approvals.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn break_glass_entries(&self) -> Vec<BreakGlassLogEntry> {
        self.break_glass.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl Logger for MemoryLogger {
    fn log_decision(&self, entry: &DecisionLogEntry) {
        if let Ok(mut v) = self.decisions.lock() {
            v.push(entry.clone());
        }
    }

    fn log_approval(&self, entry: &ApprovalLogEntry) {
        if let Ok(mut v) = self.approvals.lock() {
            v.push(entry.clone());
        }
    }

    fn log_break_glass(&self, entry: &BreakGlassLogEntry) {
        if let Ok(mut v) = self.break_glass.lock() {
            v.push(entry.clone());
        }
    }
}
