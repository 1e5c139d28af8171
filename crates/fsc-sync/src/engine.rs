use crate::config::SyncConfig;
use crate::tool::{InvocationError, JobTool};
use chrono::{DateTime, Utc};
use fsc_core::parser::{parse_detail, parse_listing, DetailReport, ParseError};
use fsc_core::{Experiment, JobStatus, ModelError};
use fsc_storage::{may_overwrite, StatusStore, StorageError, UpdateOrigin, UpsertOutcome};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Non-fatal problems collected during a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("{context}: {error}")]
    Parse { context: String, error: ParseError },
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error("detail view of {experiment} has no job :0")]
    MissingCanonicalJob { experiment: String },
    #[error("detail view of {experiment} rejected: {error}")]
    InvalidDetail {
        experiment: String,
        error: ModelError,
    },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub seen: usize,
    pub updated: usize,
    pub corrected: usize,
    pub errors: Vec<PollError>,
}

impl PollResult {
    pub fn absorb(&mut self, other: PollResult) {
        self.seen += other.seen;
        self.updated += other.updated;
        self.corrected += other.corrected;
        self.errors.extend(other.errors);
    }

    pub fn first_error(&self) -> Option<&PollError> {
        self.errors.first()
    }

    pub fn invocation_error(&self) -> Option<&InvocationError> {
        self.errors.iter().find_map(|error| match error {
            PollError::Invocation(err) => Some(err),
            _ => None,
        })
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        if outcome.wrote_change() {
            self.updated += 1;
        }
    }
}

/// Re-derives stored status from fresh tool output. Holds no state beyond
/// its collaborators; mutual exclusion is the scheduler's job.
pub struct ReconciliationEngine<T> {
    tool: T,
    store: Arc<StatusStore>,
    config: SyncConfig,
}

impl<T: JobTool> ReconciliationEngine<T> {
    pub fn new(tool: T, store: Arc<StatusStore>, config: SyncConfig) -> Self {
        Self {
            tool,
            store,
            config,
        }
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Lists recent experiments and upserts each one. Entries missing from
    /// the listing have aged out of the tool's window and are left alone.
    pub async fn poll_all(&self) -> Result<PollResult, StorageError> {
        let mut result = PollResult::default();
        let output = match self.tool.list_experiments(self.config.list_limit).await {
            Ok(output) => output,
            Err(err) => {
                warn!(event = "list_failed", error = %err);
                result.errors.push(err.into());
                return Ok(result);
            }
        };

        let now = Utc::now();
        let parsed = parse_listing(&output, now);
        for error in parsed.errors {
            warn!(event = "parse_error", source = "listing", line = error.line_number, reason = %error.reason);
            result.errors.push(PollError::Parse {
                context: "listing".to_string(),
                error,
            });
        }

        for listed in parsed.records {
            result.seen += 1;
            let name = listed.name().to_string();
            let merged = match self.store.find(&name)? {
                Some(entry) if !may_overwrite(&entry, UpdateOrigin::Poll) => continue,
                Some(entry) => match merge_listing(entry.experiment, listed) {
                    Ok(merged) => merged,
                    Err(error) => {
                        result.errors.push(PollError::InvalidDetail {
                            experiment: name,
                            error,
                        });
                        continue;
                    }
                },
                None => listed,
            };
            let outcome = self.store.upsert(&merged, UpdateOrigin::Poll, now)?;
            if outcome.became_terminal() {
                info!(event = "experiment_finished", experiment = %merged.name(), status = %merged.status());
            }
            result.record(outcome);
        }

        info!(
            event = "poll_all_complete",
            seen = result.seen,
            updated = result.updated,
            errors = result.errors.len()
        );
        Ok(result)
    }

    /// Auto-correction. Every name in `names` still stored as non-terminal is
    /// re-queried through the detail view and its status re-derived from
    /// job 0. Terminal entries are skipped.
    pub async fn check_and_correct(
        &self,
        names: &BTreeSet<String>,
    ) -> Result<PollResult, StorageError> {
        let mut result = PollResult::default();
        let candidates = self
            .store
            .active_names()?
            .into_iter()
            .filter(|name| names.contains(name))
            .take(self.config.max_corrections_per_cycle)
            .collect::<Vec<_>>();

        for name in candidates {
            let Some(entry) = self.store.find(&name)? else {
                continue;
            };
            if entry.terminal {
                continue;
            }

            let output = match self.tool.describe_experiment(&name).await {
                Ok(output) => output,
                Err(err) => {
                    warn!(event = "describe_failed", experiment = %name, error = %err);
                    let missing = matches!(err, InvocationError::Missing { .. });
                    result.errors.push(err.into());
                    if missing {
                        break;
                    }
                    continue;
                }
            };
            result.seen += 1;

            let now = Utc::now();
            let detail = parse_detail(&output, now);
            let previous = entry.experiment.status();
            let mut corrected = match apply_detail(Some(entry.experiment), &name, detail, now, &mut result) {
                Some(experiment) => experiment,
                None => continue,
            };
            if corrected.status() == JobStatus::Unknown && previous != JobStatus::Unknown {
                debug!(event = "correction_skipped", experiment = %name, reason = "unknown job 0 status");
                corrected.set_job_status(0, previous);
            }

            let outcome = self.store.upsert(&corrected, UpdateOrigin::Poll, now)?;
            if outcome.status_changed() {
                result.corrected += 1;
                info!(
                    event = "status_corrected",
                    experiment = %name,
                    from = %previous,
                    to = %corrected.status()
                );
            }
            result.record(outcome);
        }

        Ok(result)
    }

    /// Operator refresh of one experiment. Unlike the automatic path this
    /// also rewrites terminal entries and creates unknown ones.
    pub async fn refresh_experiment(&self, name: &str) -> Result<PollResult, StorageError> {
        let mut result = PollResult::default();
        let output = match self.tool.describe_experiment(name).await {
            Ok(output) => output,
            Err(err) => {
                warn!(event = "describe_failed", experiment = %name, error = %err);
                result.errors.push(err.into());
                return Ok(result);
            }
        };
        result.seen += 1;

        let now = Utc::now();
        let detail = parse_detail(&output, now);
        let stored = self.store.find(name)?.map(|entry| entry.experiment);
        let previous = stored.as_ref().map(Experiment::status);
        let Some(refreshed) = apply_detail(stored, name, detail, now, &mut result) else {
            return Ok(result);
        };

        let outcome = self.store.upsert(&refreshed, UpdateOrigin::Operator, now)?;
        if outcome.status_changed() {
            result.corrected += 1;
            info!(
                event = "status_refreshed",
                experiment = %name,
                from = ?previous,
                to = %refreshed.status()
            );
        }
        result.record(outcome);
        Ok(result)
    }
}

/// Folds a listing row into what is already stored. Detailed job lists are
/// kept whole: the listing's headline status summarises every job and only
/// stands in for job 0 when job 0 is all we know.
fn merge_listing(stored: Experiment, listed: Experiment) -> Result<Experiment, ModelError> {
    let headline = listed.status();
    let mut merged = listed;
    let mut jobs = stored.jobs().to_vec();
    if jobs.len() == 1 && headline != JobStatus::Unknown {
        jobs[0].status = headline;
    }
    merged.replace_jobs(jobs)?;
    merged.service = stored.service;
    merged.workspace = stored.workspace;
    merged.submitted_at = stored.submitted_at;
    merged.cluster = merged.cluster.or(stored.cluster);
    Ok(merged)
}

/// Builds the experiment described by a detail view. Job 0 is located by its
/// explicit index.
fn apply_detail(
    stored: Option<Experiment>,
    name: &str,
    detail: DetailReport,
    now: DateTime<Utc>,
    result: &mut PollResult,
) -> Option<Experiment> {
    for error in &detail.errors {
        warn!(event = "parse_error", source = "detail", experiment = %name, line = error.line_number, reason = %error.reason);
    }
    result
        .errors
        .extend(detail.errors.iter().cloned().map(|error| PollError::Parse {
            context: format!("status {name}"),
            error,
        }));

    let Some(job0) = detail.canonical_job() else {
        warn!(event = "missing_canonical_job", experiment = %name);
        result.errors.push(PollError::MissingCanonicalJob {
            experiment: name.to_string(),
        });
        return None;
    };

    let base = match stored {
        Some(experiment) => Ok(experiment),
        None => Experiment::single(name, job0.status, now),
    };
    let built = base.and_then(|mut experiment| {
        experiment.replace_jobs(detail.jobs.clone())?;
        Ok(experiment)
    });
    let mut experiment = match built {
        Ok(experiment) => experiment,
        Err(error) => {
            result.errors.push(PollError::InvalidDetail {
                experiment: name.to_string(),
                error,
            });
            return None;
        }
    };

    if let Some(summary) = detail.summary {
        experiment.service = summary.service.or(experiment.service);
        experiment.workspace = summary.workspace.or(experiment.workspace);
        experiment.cluster = summary.cluster.or(experiment.cluster);
        experiment.description = summary.description.or(experiment.description);
        if let Some(n_jobs) = summary.n_jobs {
            experiment.job_count = n_jobs.max(experiment.jobs().len() as u32);
        }
    }
    if experiment.submitted_at.is_none() {
        experiment.submitted_at = experiment.jobs().iter().filter_map(|job| job.started_at).min();
    }
    Some(experiment)
}
