use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

pub mod parser;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("experiment name must not be empty")]
    EmptyName,
    #[error("experiment {experiment} has no job :0")]
    MissingCanonicalJob { experiment: String },
    #[error("experiment {experiment} lists job :{index} more than once")]
    DuplicateJobIndex { experiment: String, index: u32 },
}

/// Status shared by experiments and their jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Killed,
    Unknown,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Passed,
        JobStatus::Failed,
        JobStatus::Killed,
        JobStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Passed => "passed",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::Unknown => "unknown",
        }
    }

    /// Passed, Failed and Killed never change without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Passed | JobStatus::Failed | JobStatus::Killed
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Lossy classification of a status cell. Only the first word counts, so
    /// `"pass (exit 0)"` and `"Pass"` both map to `Passed`.
    pub fn from_token(raw: &str) -> Self {
        let word = raw
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_ascii_lowercase();
        Self::from_word(&word).unwrap_or(JobStatus::Unknown)
    }

    fn from_word(word: &str) -> Option<Self> {
        match word {
            "queued" | "prep" | "preparing" | "pending" | "scheduled" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "pass" | "passed" | "completed" | "succeeded" => Some(JobStatus::Passed),
            "fail" | "failed" | "error" => Some(JobStatus::Failed),
            "killed" | "cancelled" | "canceled" => Some(JobStatus::Killed),
            "unknown" => Some(JobStatus::Unknown),
            _ => None,
        }
    }

    /// Rank used to pick the headline status of a compound listing cell.
    pub(crate) fn listing_priority(&self) -> u8 {
        match self {
            JobStatus::Running => 0,
            JobStatus::Queued => 1,
            JobStatus::Failed => 2,
            JobStatus::Killed => 3,
            JobStatus::Passed => 4,
            JobStatus::Unknown => 5,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_ascii_lowercase();
        Self::from_word(&normalized).ok_or_else(|| format!("Unknown status: {normalized}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ExperimentFlag {
    Premium,
    Standard,
    HighDemand,
    Other(String),
}

impl ExperimentFlag {
    pub fn token(&self) -> &str {
        match self {
            ExperimentFlag::Premium => "PRM",
            ExperimentFlag::Standard => "STD",
            ExperimentFlag::HighDemand => "HD",
            ExperimentFlag::Other(raw) => raw,
        }
    }

    /// Splits a `STD|HD` style cell. Empty segments are dropped.
    pub fn parse_set(raw: &str) -> BTreeSet<ExperimentFlag> {
        raw.split('|')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ExperimentFlag::from)
            .collect()
    }
}

impl From<&str> for ExperimentFlag {
    fn from(token: &str) -> Self {
        match token.trim().to_ascii_uppercase().as_str() {
            "PRM" | "PREMIUM" => ExperimentFlag::Premium,
            "STD" | "STANDARD" => ExperimentFlag::Standard,
            "HD" | "HIGH-DEMAND" => ExperimentFlag::HighDemand,
            _ => ExperimentFlag::Other(token.trim().to_string()),
        }
    }
}

impl From<String> for ExperimentFlag {
    fn from(token: String) -> Self {
        ExperimentFlag::from(token.as_str())
    }
}

impl From<ExperimentFlag> for String {
    fn from(flag: ExperimentFlag) -> Self {
        flag.token().to_string()
    }
}

impl fmt::Display for ExperimentFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub index: u32,
    pub name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub log_url: Option<String>,
}

impl Job {
    pub fn new(index: u32, name: impl Into<String>, status: JobStatus) -> Self {
        Self {
            index,
            name: name.into(),
            status,
            started_at: None,
            duration: None,
            log_url: None,
        }
    }

    /// Equality over everything the tool reports, ignoring the start time,
    /// which is re-derived from a relative age on every observation.
    fn same_observation(&self, other: &Job) -> bool {
        self.index == other.index
            && self.name == other.name
            && self.status == other.status
            && self.duration == other.duration
            && self.log_url == other.log_url
    }
}

/// A named unit of submitted work.
///
/// The name and job list are private: an experiment always holds a job with
/// index 0, jobs are kept sorted by index, and the aggregate status is read
/// from job 0 rather than stored alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Experiment {
    name: String,
    jobs: Vec<Job>,
    pub cluster: Option<String>,
    pub flags: BTreeSet<ExperimentFlag>,
    pub job_count: u32,
    pub service: Option<String>,
    pub workspace: Option<String>,
    pub job_url: Option<String>,
    pub size: Option<String>,
    pub description: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        jobs: Vec<Job>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ModelError::EmptyName);
        }
        let jobs = normalize_jobs(&name, jobs)?;
        let job_count = jobs.len() as u32;
        Ok(Self {
            name,
            jobs,
            cluster: None,
            flags: BTreeSet::new(),
            job_count,
            service: None,
            workspace: None,
            job_url: None,
            size: None,
            description: None,
            submitted_at: None,
            updated_at,
        })
    }

    /// Single-job experiment whose only job mirrors the experiment itself.
    pub fn single(
        name: impl Into<String>,
        status: JobStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        let job = Job::new(0, name.clone(), status);
        Self::new(name, vec![job], updated_at)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, index: u32) -> Option<&Job> {
        self.jobs.iter().find(|job| job.index == index)
    }

    pub fn canonical_job(&self) -> &Job {
        // normalize_jobs sorts by index and rejects lists without :0.
        &self.jobs[0]
    }

    /// Aggregate status: always the status of job 0, for single- and
    /// multi-job experiments alike.
    pub fn status(&self) -> JobStatus {
        self.canonical_job().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_multi_job(&self) -> bool {
        self.jobs.len() > 1
    }

    pub fn replace_jobs(&mut self, jobs: Vec<Job>) -> Result<(), ModelError> {
        self.jobs = normalize_jobs(&self.name, jobs)?;
        self.job_count = self.job_count.max(self.jobs.len() as u32);
        Ok(())
    }

    /// Overwrites the status of one job. Returns false when no job has `index`.
    pub fn set_job_status(&mut self, index: u32, status: JobStatus) -> bool {
        match self.jobs.iter_mut().find(|job| job.index == index) {
            Some(job) => {
                job.status = status;
                true
            }
            None => false,
        }
    }

    /// Marks active jobs as killed: every active job when `index` is `None`,
    /// otherwise only that job. Jobs that already finished keep their status.
    /// Returns the number of jobs changed.
    pub fn kill_jobs(&mut self, index: Option<u32>) -> usize {
        let mut changed = 0;
        for job in self
            .jobs
            .iter_mut()
            .filter(|job| index.map_or(true, |wanted| job.index == wanted))
        {
            if job.status.is_active() {
                job.status = JobStatus::Killed;
                changed += 1;
            }
        }
        changed
    }

    /// True when both values describe the same tool-reported state. Timestamps
    /// derived from relative ages are ignored.
    pub fn same_observation(&self, other: &Experiment) -> bool {
        self.name == other.name
            && self.cluster == other.cluster
            && self.flags == other.flags
            && self.job_count == other.job_count
            && self.service == other.service
            && self.workspace == other.workspace
            && self.job_url == other.job_url
            && self.size == other.size
            && self.description == other.description
            && self.jobs.len() == other.jobs.len()
            && self
                .jobs
                .iter()
                .zip(other.jobs.iter())
                .all(|(left, right)| left.same_observation(right))
    }
}

fn normalize_jobs(experiment: &str, mut jobs: Vec<Job>) -> Result<Vec<Job>, ModelError> {
    jobs.sort_by_key(|job| job.index);
    for pair in jobs.windows(2) {
        if pair[0].index == pair[1].index {
            return Err(ModelError::DuplicateJobIndex {
                experiment: experiment.to_string(),
                index: pair[0].index,
            });
        }
    }
    if jobs.first().map(|job| job.index) != Some(0) {
        return Err(ModelError::MissingCanonicalJob {
            experiment: experiment.to_string(),
        });
    }
    Ok(jobs)
}

/// Persisted snapshot of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub experiment: Experiment,
    pub cached_at: DateTime<Utc>,
    pub terminal: bool,
    pub terminal_at: Option<DateTime<Utc>>,
}

/// Parses the tool's relative ages: `5m ago`, `17h`, `3d ago`, `1w ago`.
pub fn parse_relative_age(raw: &str) -> Option<Duration> {
    static AGE: OnceLock<Regex> = OnceLock::new();
    let pattern = AGE.get_or_init(|| {
        Regex::new(r"^(\d+)\s*(s|sec|secs|m|min|mins|h|hr|hrs|d|day|days|w|wk|wks)\s*(?:ago)?$")
            .expect("valid regex")
    });
    let normalized = raw.trim().to_ascii_lowercase();
    let captures = pattern.captures(&normalized)?;
    let value = captures.get(1)?.as_str().parse::<i64>().ok()?;
    // None when the value is out of range for a duration
    match captures.get(2)?.as_str() {
        "s" | "sec" | "secs" => Duration::try_seconds(value),
        "m" | "min" | "mins" => Duration::try_minutes(value),
        "h" | "hr" | "hrs" => Duration::try_hours(value),
        "d" | "day" | "days" => Duration::try_days(value),
        _ => Duration::try_weeks(value),
    }
}

/// Absolute time for a relative age observed at `observed_at`. `None` when
/// the age is unparseable or reaches past the representable range.
pub fn resolve_relative_age(raw: &str, observed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    observed_at.checked_sub_signed(parse_relative_age(raw)?)
}
