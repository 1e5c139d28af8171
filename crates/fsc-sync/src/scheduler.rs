use crate::engine::{PollResult, ReconciliationEngine};
use crate::tool::JobTool;
use chrono::{DateTime, Utc};
use fsc_storage::{StorageError, SyncRecord};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncScope {
    /// Listing poll followed by correction of every active entry.
    All,
    /// Correction of every active entry.
    Active,
    Experiment(String),
}

impl SyncScope {
    /// True when a run of `self` makes a run of `other` redundant.
    pub fn covers(&self, other: &SyncScope) -> bool {
        match (self, other) {
            (SyncScope::All, SyncScope::All | SyncScope::Active) => true,
            (left, right) => left == right,
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncScope::All => f.write_str("all"),
            SyncScope::Active => f.write_str("active"),
            SyncScope::Experiment(name) => write!(f, "experiment:{name}"),
        }
    }
}

impl FromStr for SyncScope {
    type Err = String;

    /// `all`, `active`, or an experiment name.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" => Err("empty sync scope".to_string()),
            "all" => Ok(SyncScope::All),
            "active" => Ok(SyncScope::Active),
            _ => Ok(SyncScope::Experiment(
                trimmed
                    .strip_prefix("experiment:")
                    .unwrap_or(trimmed)
                    .to_string(),
            )),
        }
    }
}

/// What a finished run reports to the triggers that coalesced onto it. A
/// store failure travels as its message.
pub type RunReport = Result<PollResult, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed(PollResult),
    /// An in-flight or already queued run covered the request; `result` is
    /// what that run reported once it finished.
    Coalesced { behind: SyncScope, result: RunReport },
}

type CoveringRun = (SyncScope, watch::Receiver<Option<RunReport>>);

struct PendingRun {
    scope: SyncScope,
    done: watch::Receiver<Option<RunReport>>,
}

#[derive(Default)]
struct GateState {
    in_flight: Option<PendingRun>,
    queued: Vec<PendingRun>,
}

impl GateState {
    fn remove_queued(&mut self, scope: &SyncScope) -> Option<PendingRun> {
        let position = self.queued.iter().position(|queued| queued.scope == *scope)?;
        Some(self.queued.remove(position))
    }
}

/// A trigger's place in the gate. Dropping it (normally or because the
/// caller went away) releases the slot; coalesced waiters then see the
/// channel close.
struct GateTicket<'a> {
    gate: &'a StdMutex<GateState>,
    scope: SyncScope,
    done: watch::Sender<Option<RunReport>>,
    running: bool,
    released: bool,
}

impl GateTicket<'_> {
    fn start(&mut self) {
        let mut gate = lock(self.gate);
        let pending = gate.remove_queued(&self.scope);
        gate.in_flight = pending.or_else(|| {
            Some(PendingRun {
                scope: self.scope.clone(),
                done: self.done.subscribe(),
            })
        });
        self.running = true;
    }

    /// Frees the slot first, so a trigger arriving now starts a fresh run
    /// instead of picking up this result.
    fn complete(mut self, report: RunReport) {
        lock(self.gate).in_flight = None;
        self.released = true;
        self.done.send_replace(Some(report));
    }
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut gate = lock(self.gate);
        if self.running {
            gate.in_flight = None;
        } else {
            gate.remove_queued(&self.scope);
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn wait_for_run(mut done: watch::Receiver<Option<RunReport>>) -> RunReport {
    loop {
        let current = done.borrow_and_update().clone();
        if let Some(report) = current {
            return report;
        }
        if done.changed().await.is_err() {
            let last = done.borrow().clone();
            return last.unwrap_or_else(|| Err("covering sync was abandoned".to_string()));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_scope: Option<SyncScope>,
    pub last_result: Option<PollResult>,
    pub last_error: Option<String>,
    pub completed_runs: usize,
}

/// Owns the single reconciliation gate. Scheduled ticks and operator
/// triggers both go through [`SyncScheduler::trigger_now`], so at most one
/// reconciliation runs at a time.
pub struct SyncScheduler<T> {
    engine: Arc<ReconciliationEngine<T>>,
    gate: StdMutex<GateState>,
    // tokio's mutex is fair, so queued triggers run in arrival order
    run_lock: Mutex<()>,
    status: StdMutex<SchedulerStatus>,
}

impl<T: JobTool> SyncScheduler<T> {
    pub fn new(engine: Arc<ReconciliationEngine<T>>) -> Self {
        Self {
            engine,
            gate: StdMutex::new(GateState::default()),
            run_lock: Mutex::new(()),
            status: StdMutex::new(SchedulerStatus::default()),
        }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine<T>> {
        &self.engine
    }

    pub fn status(&self) -> SchedulerStatus {
        lock(&self.status).clone()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.status).last_error.clone()
    }

    pub fn in_flight(&self) -> Option<SyncScope> {
        lock(&self.gate)
            .in_flight
            .as_ref()
            .map(|pending| pending.scope.clone())
    }

    /// Runs `scope` now, or after the current run when one is in flight.
    /// When an in-flight or queued run already covers `scope`, nothing new
    /// is started; the caller waits for that run and gets its report as
    /// [`TriggerOutcome::Coalesced`].
    pub async fn trigger_now(&self, scope: SyncScope) -> Result<TriggerOutcome, StorageError> {
        let mut ticket = match self.admit(&scope) {
            Ok(ticket) => ticket,
            Err((behind, done)) => {
                debug!(event = "sync_coalesced", scope = %scope, behind = %behind);
                let result = wait_for_run(done).await;
                return Ok(TriggerOutcome::Coalesced { behind, result });
            }
        };

        let _running = self.run_lock.lock().await;
        ticket.start();

        let started_at = Utc::now();
        let outcome = match self.run_scope(&scope).await {
            Ok(result) => self
                .finish(&scope, started_at, Utc::now(), &result)
                .map(|()| result),
            Err(err) => Err(err),
        };
        if let Err(err) = &outcome {
            warn!(event = "sync_failed", scope = %scope, error = %err);
            lock(&self.status).last_error = Some(err.to_string());
        }

        ticket.complete(match &outcome {
            Ok(result) => Ok(result.clone()),
            Err(err) => Err(err.to_string()),
        });
        outcome.map(TriggerOutcome::Completed)
    }

    /// Queues `scope`, or hands back the covering run to wait on.
    fn admit(&self, scope: &SyncScope) -> Result<GateTicket<'_>, CoveringRun> {
        let mut gate = lock(&self.gate);
        let covering = gate
            .in_flight
            .iter()
            .chain(gate.queued.iter())
            .find(|pending| pending.scope.covers(scope));
        if let Some(pending) = covering {
            return Err((pending.scope.clone(), pending.done.clone()));
        }

        let (done, receiver) = watch::channel(None);
        gate.queued.push(PendingRun {
            scope: scope.clone(),
            done: receiver,
        });
        Ok(GateTicket {
            gate: &self.gate,
            scope: scope.clone(),
            done,
            running: false,
            released: false,
        })
    }

    async fn run_scope(&self, scope: &SyncScope) -> Result<PollResult, StorageError> {
        match scope {
            SyncScope::All => {
                let mut result = self.engine.poll_all().await?;
                if result.invocation_error().is_some() {
                    return Ok(result);
                }
                let active = self.active_names()?;
                result.absorb(self.engine.check_and_correct(&active).await?);
                Ok(result)
            }
            SyncScope::Active => {
                let active = self.active_names()?;
                self.engine.check_and_correct(&active).await
            }
            SyncScope::Experiment(name) => self.engine.refresh_experiment(name).await,
        }
    }

    fn active_names(&self) -> Result<BTreeSet<String>, StorageError> {
        Ok(self.engine.store().active_names()?.into_iter().collect())
    }

    fn finish(
        &self,
        scope: &SyncScope,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        result: &PollResult,
    ) -> Result<(), StorageError> {
        let first_error = result.first_error().map(ToString::to_string);
        {
            let mut status = lock(&self.status);
            status.last_run_at = Some(finished_at);
            status.last_scope = Some(scope.clone());
            status.last_result = Some(result.clone());
            status.last_error = first_error.clone();
            status.completed_runs += 1;
        }

        info!(
            event = "sync_complete",
            scope = %scope,
            seen = result.seen,
            updated = result.updated,
            corrected = result.corrected,
            errors = result.errors.len()
        );

        self.engine.store().record_sync(&SyncRecord {
            scope: scope.to_string(),
            started_at,
            finished_at,
            seen: result.seen,
            updated: result.updated,
            corrected: result.corrected,
            error_count: result.errors.len(),
            first_error,
        })?;
        Ok(())
    }

    /// Spawns the interval loop. The first tick fires immediately.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let interval = self.engine.config().poll_interval;

        let task = tokio::spawn(async move {
            info!(event = "scheduler_start", interval_secs = interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                // Not raced against shutdown: an in-flight poll finishes.
                match scheduler.trigger_now(SyncScope::All).await {
                    Ok(TriggerOutcome::Completed(result)) => {
                        if let Some(err) = result.first_error() {
                            warn!(event = "scheduled_sync_errors", errors = result.errors.len(), first = %err);
                        }
                    }
                    Ok(TriggerOutcome::Coalesced { behind, result }) => {
                        debug!(event = "scheduled_sync_coalesced", behind = %behind, ok = result.is_ok());
                    }
                    Err(err) => {
                        warn!(event = "scheduled_sync_failed", error = %err);
                    }
                }

                if *shutdown_rx.borrow() {
                    break;
                }
            }
            info!(event = "scheduler_stop");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the timer and waits for any in-flight run to complete.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(event = "scheduler_join_failed", error = %err);
        }
    }
}
