use crate::engine::PollResult;
use crate::scheduler::{SchedulerStatus, SyncScheduler, SyncScope, TriggerOutcome};
use crate::tool::{InvocationError, JobTool};
use chrono::{DateTime, Utc};
use fsc_core::{CacheEntry, Experiment, Job, JobStatus, ModelError};
use fsc_storage::{CacheStats, StatusStore, StorageError, SyncRecord, UpdateOrigin};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("experiment not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(StorageError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error("{behind} sync failed: {message}")]
    CoveringRunFailed { behind: SyncScope, message: String },
}

impl From<StorageError> for FacadeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(name) => FacadeError::NotFound(name),
            other => FacadeError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Jobs switched to killed locally, before any confirmation.
    pub killed_jobs: usize,
    /// Entry after the optimistic update; `None` when it was never cached.
    pub entry: Option<CacheEntry>,
    pub confirm_after: Duration,
}

/// Entry point for the presentation layer. Reads come straight from the
/// store; commands go through the tool or the scheduler.
pub struct SyncFacade<T> {
    scheduler: Arc<SyncScheduler<T>>,
}

impl<T: JobTool> Clone for SyncFacade<T> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

impl<T: JobTool> SyncFacade<T> {
    pub fn new(scheduler: Arc<SyncScheduler<T>>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler<T>> {
        &self.scheduler
    }

    fn store(&self) -> &StatusStore {
        self.scheduler.engine().store()
    }

    pub fn get_experiment(&self, name: &str) -> Result<CacheEntry, FacadeError> {
        Ok(self.store().get(name)?)
    }

    pub fn list_by_status(&self, status: JobStatus) -> Result<Vec<CacheEntry>, FacadeError> {
        Ok(self.store().list_by_status(status)?)
    }

    pub fn list_all(&self) -> Result<Vec<CacheEntry>, FacadeError> {
        Ok(self.store().list_all()?)
    }

    pub fn stats(&self) -> Result<CacheStats, FacadeError> {
        Ok(self.store().stats()?)
    }

    pub fn recent_syncs(&self, limit: usize) -> Result<Vec<SyncRecord>, FacadeError> {
        Ok(self.store().recent_syncs(limit)?)
    }

    pub fn last_error(&self) -> Option<String> {
        self.scheduler.last_error()
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Operator refresh. Unlike scheduled runs, a tool failure is returned
    /// to the caller, including when the request was coalesced onto a run
    /// that was already pending.
    pub async fn refresh_now(&self, scope: SyncScope) -> Result<TriggerOutcome, FacadeError> {
        let outcome = self.scheduler.trigger_now(scope).await?;
        match &outcome {
            TriggerOutcome::Completed(result) => surface_invocation_error(result)?,
            TriggerOutcome::Coalesced { behind, result } => match result {
                Ok(result) => surface_invocation_error(result)?,
                Err(message) => {
                    return Err(FacadeError::CoveringRunFailed {
                        behind: behind.clone(),
                        message: message.clone(),
                    })
                }
            },
        }
        Ok(outcome)
    }

    /// Cancels through the tool. On success the cached entry is marked
    /// killed right away (created if it was never polled) and a confirming
    /// refresh is scheduled. With a zero `cancel_confirm_delay` the refresh
    /// runs before this returns, so a short-lived caller still sees it.
    pub async fn cancel(&self, name: &str, job: Option<u32>) -> Result<CancelOutcome, FacadeError> {
        self.scheduler.engine().tool().cancel(name, job).await?;
        info!(event = "cancel_sent", experiment = %name, job = ?job);

        let store = self.store();
        let now = Utc::now();
        let killed_jobs = match store.find(name)? {
            Some(entry) => {
                let mut experiment = entry.experiment;
                let killed = experiment.kill_jobs(job);
                if killed > 0 {
                    store.upsert(&experiment, UpdateOrigin::Operator, now)?;
                }
                killed
            }
            None => {
                let experiment =
                    cancelled_placeholder(name, job, now).map_err(StorageError::from)?;
                store.upsert(&experiment, UpdateOrigin::Operator, now)?;
                1
            }
        };

        let confirm_after = self.scheduler.engine().config().cancel_confirm_delay;
        if confirm_after.is_zero() {
            self.confirm_cancel(name.to_string()).await;
        } else {
            self.schedule_confirmation(name.to_string(), confirm_after);
        }
        Ok(CancelOutcome {
            killed_jobs,
            entry: store.find(name)?,
            confirm_after,
        })
    }

    fn schedule_confirmation(&self, name: String, delay: Duration) {
        let facade = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            facade.confirm_cancel(name).await;
        });
    }

    async fn confirm_cancel(&self, name: String) {
        if let Err(err) = self
            .scheduler
            .trigger_now(SyncScope::Experiment(name.clone()))
            .await
        {
            warn!(event = "cancel_confirm_failed", experiment = %name, error = %err);
        }
    }

    /// Tail of one job's log. Not cached.
    pub async fn logs(&self, name: &str, job: u32, tail_lines: usize) -> Result<String, FacadeError> {
        Ok(self
            .scheduler
            .engine()
            .tool()
            .logs(name, job, tail_lines)
            .await?)
    }

    /// Explicit cache eviction; the reconciliation path never evicts.
    pub fn evict_cache(&self, name: &str) -> Result<bool, FacadeError> {
        let removed = self.store().evict(name)?;
        info!(event = "cache_evict", experiment = %name, removed);
        Ok(removed)
    }

    pub fn clear_cache(&self) -> Result<usize, FacadeError> {
        let removed = self.store().clear()?;
        info!(event = "cache_clear", removed);
        Ok(removed)
    }
}

/// Entry for a cancel issued before any poll saw the experiment. A single
/// cancelled side job leaves job 0 unknown until the confirming refresh.
fn cancelled_placeholder(
    name: &str,
    job: Option<u32>,
    now: DateTime<Utc>,
) -> Result<Experiment, ModelError> {
    match job {
        None | Some(0) => Experiment::single(name, JobStatus::Killed, now),
        Some(index) => Experiment::new(
            name,
            vec![
                Job::new(0, name, JobStatus::Unknown),
                Job::new(index, format!(":{index}"), JobStatus::Killed),
            ],
            now,
        ),
    }
}

fn surface_invocation_error(result: &PollResult) -> Result<(), FacadeError> {
    match result.invocation_error() {
        Some(err) => Err(FacadeError::Invocation(err.clone())),
        None => Ok(()),
    }
}
