//! Keeps the local status store in step with the external job tool.
//!
//! [`ReconciliationEngine`] turns tool output into store writes,
//! [`SyncScheduler`] serialises every run behind one gate and drives the
//! periodic poll, and [`SyncFacade`] is what a CLI or UI talks to.

pub mod config;
pub mod engine;
pub mod facade;
pub mod scheduler;
pub mod tool;

pub use config::SyncConfig;
pub use engine::{PollError, PollResult, ReconciliationEngine};
pub use facade::{CancelOutcome, FacadeError, SyncFacade};
pub use scheduler::{
    RunReport, SchedulerHandle, SchedulerStatus, SyncScheduler, SyncScope, TriggerOutcome,
};
pub use tool::{AmltTool, InvocationError, JobTool};
