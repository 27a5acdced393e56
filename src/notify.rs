//! Security notifications for break-glass activity.
//!
//! Delivery transports live outside gatehouse; this module defines the
//! [`Notifier`] seam, a tracing sink, and [`QueuedNotifier`], a bounded
//! fire-and-forget wrapper that keeps slow transports off the critical path.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::breakglass::BreakGlassEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Invoked,
    Closed,
    /// Credentials were issued on the strength of the event.
    Used,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakGlassNotification {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub event: BreakGlassEvent,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification queue is full")]
    QueueFull,
    #[error("notification dispatcher has shut down")]
    Closed,
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_break_glass(&self, notification: &BreakGlassNotification)
        -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_break_glass(&self, _n: &BreakGlassNotification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Writes notifications to the log at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify_break_glass(&self, n: &BreakGlassNotification) -> Result<(), NotifyError> {
        tracing::warn!(
            kind = ?n.kind,
            event_id = %n.event.id,
            invoker = %n.event.invoker,
            profile = %n.event.profile,
            actor = %n.actor,
            "break-glass notification"
        );
        Ok(())
    }
}

/// Hands notifications to a background task through a bounded queue.
/// A full queue drops the notification and reports [`NotifyError::QueueFull`].
#[derive(Clone)]
pub struct QueuedNotifier {
    tx: mpsc::Sender<BreakGlassNotification>,
}

impl QueuedNotifier {
    /// Spawn the delivery task on the current runtime.
    pub fn spawn(inner: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<BreakGlassNotification>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if let Err(e) = inner.notify_break_glass(&notification).await {
                    tracing::warn!(
                        error = %e,
                        event_id = %notification.event.id,
                        "break-glass notification delivery failed"
                    );
                }
            }
        });
        Self { tx }
    }
}

#[async_trait]
impl Notifier for QueuedNotifier {
    async fn notify_break_glass(&self, n: &BreakGlassNotification) -> Result<(), NotifyError> {
        self.tx.try_send(n.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        })
    }
}

/// Deliver `notification`, logging and swallowing any failure.
pub async fn dispatch(notifier: &dyn Notifier, notification: BreakGlassNotification) {
    if let Err(e) = notifier.notify_break_glass(&notification).await {
        tracing::warn!(
            error = %e,
            event_id = %notification.event.id,
            kind = ?notification.kind,
            "failed to send break-glass notification"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakglass::{BreakGlassStatus, ReasonCode};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn notification() -> BreakGlassNotification {
        let now = Utc::now();
        BreakGlassNotification {
            kind: NotificationType::Invoked,
            event: BreakGlassEvent {
                id: "0123456789abcdef".into(),
                invoker: "alice".into(),
                profile: "production".into(),
                reason_code: ReasonCode::Incident,
                justification: "database failover during incident 42".into(),
                duration: Duration::from_secs(1800),
                status: BreakGlassStatus::Active,
                created_at: now,
                updated_at: now,
                expires_at: now + chrono::TimeDelta::minutes(30),
                closed_by: None,
                closed_reason: None,
                request_id: None,
                version: 1,
            },
            actor: "alice".into(),
            timestamp: now,
        }
    }

    struct Recording {
        seen: Mutex<Vec<String>>,
        signal: Notify,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify_break_glass(&self, n: &BreakGlassNotification) -> Result<(), NotifyError> {
            self.seen.lock().unwrap().push(n.event.id.clone());
            self.signal.notify_one();
            Ok(())
        }
    }

    struct Blocking;

    #[async_trait]
    impl Notifier for Blocking {
        async fn notify_break_glass(&self, _n: &BreakGlassNotification) -> Result<(), NotifyError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify_break_glass(&self, _n: &BreakGlassNotification) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn test_queued_notifier_delivers() {
        let inner = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            signal: Notify::new(),
        });
        let queued = QueuedNotifier::spawn(inner.clone(), 4);

        queued.notify_break_glass(&notification()).await.unwrap();
        inner.signal.notified().await;

        assert_eq!(inner.seen.lock().unwrap().as_slice(), ["0123456789abcdef"]);
    }

    #[tokio::test]
    async fn test_queued_notifier_drops_when_full() {
        let queued = QueuedNotifier::spawn(Arc::new(Blocking), 1);

        // One in flight, one buffered; eventually the queue reports full.
        let mut saw_full = false;
        for _ in 0..8 {
            if let Err(NotifyError::QueueFull) = queued.notify_break_glass(&notification()).await {
                saw_full = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(saw_full);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_errors() {
        dispatch(&Failing, notification()).await;
    }
}
