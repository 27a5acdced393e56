use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::breakglass::BreakGlassStatus;
use crate::errors::GateError;
use crate::requests::RequestStatus;
use crate::session::SessionStatus;
use crate::storage::{BreakGlassStore, RequestStore, SessionStore, StoreError, MAX_LIST_LIMIT};

pub const EXPIRY_SWEEP_JOB: &str = "expiry_sweep";

/// Records fetched per sweep query.
pub const SWEEP_BATCH: usize = MAX_LIST_LIMIT;

/// Every five minutes, on the minute.
pub const DEFAULT_SWEEP_SCHEDULE: &str = "0 */5 * * * *";

#[derive(Clone)]
pub struct SweepStores {
    pub requests: Arc<dyn RequestStore>,
    pub break_glass: Arc<dyn BreakGlassStore>,
    pub sessions: Arc<dyn SessionStore>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub requests: u64,
    pub break_glass: u64,
    pub sessions: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.requests + self.break_glass + self.sessions
    }
}

/// Initialize and start the scheduler with the expiry sweep.
pub async fn init_scheduler(stores: SweepStores, schedule: &str) -> Result<JobScheduler, GateError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| GateError::Scheduler(format!("Failed to create job scheduler: {}", e)))?;

    let sweep_job = Job::new_async(schedule, move |_uuid, _l| {
        let stores = stores.clone();
        Box::pin(async move {
            debug!("Running {} job", EXPIRY_SWEEP_JOB);
            match sweep_expired(&stores, Utc::now()).await {
                Ok(report) if report.total() > 0 => info!(
                    requests = report.requests,
                    break_glass = report.break_glass,
                    sessions = report.sessions,
                    "Marked expired records"
                ),
                Ok(_) => {}
                Err(e) => error!("Expiry sweep failed: {}", e),
            }
        })
    })
    .map_err(|e| GateError::Scheduler(format!("Failed to create expiry sweep job: {}", e)))?;

    sched
        .add(sweep_job)
        .await
        .map_err(|e| GateError::Scheduler(format!("Failed to add expiry sweep job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| GateError::Scheduler(format!("Failed to start job scheduler: {}", e)))?;

    info!(schedule, "Job scheduler started");

    Ok(sched)
}

/// Run a job by name outside its schedule.
pub async fn trigger_job_manually(stores: &SweepStores, job_name: &str) -> Result<SweepReport, GateError> {
    info!("Manually triggering job: {}", job_name);
    match job_name {
        EXPIRY_SWEEP_JOB => Ok(sweep_expired(stores, Utc::now()).await?),
        _ => Err(GateError::Other(format!("Unknown job name: {}", job_name))),
    }
}

/// Persist the Expired status for every record whose expiry has passed.
///
/// Reads already report these records as expired; this only brings the
/// stored status in line so status-indexed lists stay accurate. Records are
/// taken oldest expiry first in batches of [`SWEEP_BATCH`]; a swept record
/// leaves the batch query, so the next batch picks up where this one ended.
/// A record changed concurrently is skipped and picked up on the next run.
pub async fn sweep_expired(stores: &SweepStores, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
    let mut report = SweepReport::default();

    for status in [RequestStatus::Pending, RequestStatus::Approved] {
        loop {
            let batch = stores
                .requests
                .list_past_expiry(status, now, SWEEP_BATCH)
                .await?;
            let mut swept = 0;
            for mut request in batch.iter().cloned() {
                if request.effective_status(now) != RequestStatus::Expired {
                    continue;
                }
                request.status = RequestStatus::Expired;
                request.updated_at = now;
                if skip_conflict(stores.requests.update(&request).await)? {
                    swept += 1;
                }
            }
            report.requests += swept;
            if batch.len() < SWEEP_BATCH || swept == 0 {
                break;
            }
        }
    }

    loop {
        let batch = stores
            .break_glass
            .list_past_expiry(BreakGlassStatus::Active, now, SWEEP_BATCH)
            .await?;
        let mut swept = 0;
        for mut event in batch.iter().cloned() {
            if event.effective_status(now) != BreakGlassStatus::Expired {
                continue;
            }
            event.status = BreakGlassStatus::Expired;
            event.updated_at = now;
            if skip_conflict(stores.break_glass.update(&event).await)? {
                swept += 1;
            }
        }
        report.break_glass += swept;
        if batch.len() < SWEEP_BATCH || swept == 0 {
            break;
        }
    }

    loop {
        let batch = stores
            .sessions
            .list_past_expiry(SessionStatus::Active, now, SWEEP_BATCH)
            .await?;
        let mut swept = 0;
        for mut session in batch.iter().cloned() {
            if session.effective_status(now) != SessionStatus::Expired {
                continue;
            }
            session.status = SessionStatus::Expired;
            session.updated_at = now;
            if skip_conflict(stores.sessions.update(&session).await)? {
                swept += 1;
            }
        }
        report.sessions += swept;
        if batch.len() < SWEEP_BATCH || swept == 0 {
            break;
        }
    }

    Ok(report)
}

fn skip_conflict<T>(result: Result<T, StoreError>) -> Result<bool, StoreError> {
    match result {
        Ok(_) => Ok(true),
        Err(StoreError::ConcurrentModification { kind, id }) => {
            debug!(kind, id = %id, "Skipping record modified during sweep");
            Ok(false)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
