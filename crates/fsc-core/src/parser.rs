//! Parsers for the job tool's tabular text output.
//!
//! Both the listing (`list --most-recent N`) and the detail view
//! (`status <experiment>`) are fixed-width tables whose column offsets come
//! from the header row. Parsing is lossy by design of the input: decorative
//! markup is stripped first, bad rows are reported and skipped, unknown
//! status words become [`JobStatus::Unknown`].

use crate::{resolve_relative_age, Experiment, ExperimentFlag, Job, JobStatus, ModelError};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

const LISTING_COLUMNS: &[&str] = &[
    "EXPERIMENT_NAME",
    "MODIFIED",
    "JOB_STATUS",
    "CLUSTER",
    "FLAGS",
    "SIZE",
    "JOB_URL",
    "DESCRIPTION",
];

const JOB_COLUMNS: &[&str] = &[
    "#",
    "JOB_NAME",
    "DURATION",
    "STATUS",
    "SIZE",
    "SUBMITTED",
    "FLAGS",
    "PORTAL URL",
];

const SUMMARY_COLUMNS: &[&str] = &[
    "EXPERIMENT_NAME",
    "SERVICE",
    "CLUSTER",
    "WORKSPACE",
    "N_JOBS",
    "PASS",
    "FAIL",
    "RUNNING",
    "QUEUED",
    "PREP",
    "KILLED",
    "DESCRIPTION",
];

const SUMMARY_STATUS_COLUMNS: &[(&str, JobStatus)] = &[
    ("PASS", JobStatus::Passed),
    ("FAIL", JobStatus::Failed),
    ("RUNNING", JobStatus::Running),
    ("QUEUED", JobStatus::Queued),
    ("PREP", JobStatus::Queued),
    ("KILLED", JobStatus::Killed),
];

const BOX_VERTICALS: &[char] = &['│', '┃', '║', '╎', '┆'];
const SEPARATOR_CHARS: &str = " -─━═│┃║╭╮╰╯├┤┬┴┼╞╡╪+=:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("no table header found")]
    MissingHeader,
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("job row has no :<index> token")]
    MissingJobIndex,
    #[error("invalid job index {0:?}")]
    InvalidJobIndex(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// A rejected line. `line_number` is 1-based within the parsed output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line_number}: {reason}: {line:?}")]
pub struct ParseError {
    pub line_number: usize,
    pub line: String,
    pub reason: ParseFailure,
}

impl ParseError {
    fn new(line_number: usize, line: &str, reason: ParseFailure) -> Self {
        Self {
            line_number,
            line: line.to_string(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseReport<T> {
    pub records: Vec<T>,
    pub errors: Vec<ParseError>,
}

impl<T> Default for ParseReport<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Summary table of the detail view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailSummary {
    pub name: String,
    pub service: Option<String>,
    pub cluster: Option<String>,
    pub workspace: Option<String>,
    pub n_jobs: Option<u32>,
    pub status_counts: Vec<(JobStatus, u32)>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailReport {
    pub summary: Option<DetailSummary>,
    pub jobs: Vec<Job>,
    pub errors: Vec<ParseError>,
}

impl DetailReport {
    /// Job 0 by its explicit index; row order is never consulted.
    pub fn canonical_job(&self) -> Option<&Job> {
        self.jobs.iter().find(|job| job.index == 0)
    }
}

/// Removes ANSI escapes and rich-style `[bold red]…[/]` tags, and blanks
/// box-drawing verticals so column offsets survive.
pub fn strip_markup(line: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    static RICH: OnceLock<Regex> = OnceLock::new();
    let ansi = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid regex")
    });
    let rich = RICH.get_or_init(|| {
        Regex::new(
            r"\[/[^\[\]]*\]|\[(?:(?:not\s+)?(?:bold|dim|italic|underline|blink|reverse|strike|on|link=[^\]\s]*|#[0-9a-fA-F]{6}|(?:bright_)?(?:black|red|green|yellow|blue|magenta|cyan|white)|gr[ae]y\d*)\s*)+\]",
        )
        .expect("valid regex")
    });
    let without_ansi = ansi.replace_all(line, "");
    let without_tags = rich.replace_all(&without_ansi, "");
    without_tags
        .chars()
        .map(|c| if BOX_VERTICALS.contains(&c) { ' ' } else { c })
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Parses a `Running (12), Queued (2)` cell into `(status, count)` pairs.
/// A bare word such as `Running` counts as one job.
pub fn parse_compound_status(cell: &str) -> Vec<(JobStatus, u32)> {
    static COMPOUND: OnceLock<Regex> = OnceLock::new();
    let pattern =
        COMPOUND.get_or_init(|| Regex::new(r"([A-Za-z]+)\s*\((\d+)\)").expect("valid regex"));
    let pairs = pattern
        .captures_iter(cell)
        .filter_map(|captures| {
            let status = JobStatus::from_token(captures.get(1)?.as_str());
            let count = captures.get(2)?.as_str().parse::<u32>().ok()?;
            Some((status, count))
        })
        .collect::<Vec<_>>();
    if pairs.is_empty() && !cell.trim().is_empty() {
        return vec![(JobStatus::from_token(cell), 1)];
    }
    pairs
}

/// Headline status and total job count of a listing status cell.
pub fn headline_status(cell: &str) -> Option<(JobStatus, u32)> {
    let pairs = parse_compound_status(cell);
    let status = pairs
        .iter()
        .map(|(status, _)| *status)
        .min_by_key(JobStatus::listing_priority)?;
    let total = pairs
        .iter()
        .fold(0u32, |total, (_, count)| total.saturating_add(*count))
        .max(1);
    Some((status, total))
}

/// Parses the experiment listing. Every row becomes a single-job
/// [`Experiment`] whose job 0 carries the listing's headline status.
pub fn parse_listing(output: &str, observed_at: DateTime<Utc>) -> ParseReport<Experiment> {
    let mut report = ParseReport::default();
    let lines = output.lines().map(strip_markup).collect::<Vec<_>>();

    let Some(header_idx) = lines
        .iter()
        .position(|line| has_word(line, "EXPERIMENT_NAME") && has_word(line, "JOB_STATUS"))
    else {
        if let Some((idx, line)) = first_content_line(&lines) {
            report
                .errors
                .push(ParseError::new(idx + 1, line, ParseFailure::MissingHeader));
        }
        return report;
    };

    let layout = ColumnLayout::locate(&lines[header_idx], LISTING_COLUMNS);
    for (idx, line) in lines.iter().enumerate().skip(header_idx + 1) {
        if is_noise(line) || has_word(line, "EXPERIMENT_NAME") {
            continue;
        }
        let cells = layout.cells(line);
        if cell(&cells, "EXPERIMENT_NAME").is_none() && line.starts_with(char::is_whitespace) {
            // wrapped DESCRIPTION continuation
            continue;
        }
        match listing_row(&cells, observed_at) {
            Ok(experiment) => report.records.push(experiment),
            Err(reason) => report.errors.push(ParseError::new(idx + 1, line, reason)),
        }
    }
    report
}

fn listing_row(
    cells: &BTreeMap<&str, String>,
    observed_at: DateTime<Utc>,
) -> Result<Experiment, ParseFailure> {
    let name = cell(cells, "EXPERIMENT_NAME").ok_or(ParseFailure::MissingField("EXPERIMENT_NAME"))?;
    let status_cell = cell(cells, "JOB_STATUS").ok_or(ParseFailure::MissingField("JOB_STATUS"))?;
    let (status, job_count) =
        headline_status(status_cell).ok_or(ParseFailure::MissingField("JOB_STATUS"))?;

    let updated_at = cell(cells, "MODIFIED")
        .and_then(|modified| resolve_relative_age(modified, observed_at))
        .unwrap_or(observed_at);

    let mut experiment = Experiment::single(name, status, updated_at)?;
    experiment.job_count = job_count;
    experiment.cluster = owned(cell(cells, "CLUSTER"));
    experiment.flags = cell(cells, "FLAGS")
        .map(ExperimentFlag::parse_set)
        .unwrap_or_default();
    experiment.size = owned(cell(cells, "SIZE"));
    experiment.job_url = owned(cell(cells, "JOB_URL"));
    experiment.description = owned(cell(cells, "DESCRIPTION"));
    Ok(experiment)
}

/// Parses the detail view: the job table, then the summary table.
pub fn parse_detail(output: &str, observed_at: DateTime<Utc>) -> DetailReport {
    let mut report = DetailReport::default();
    let lines = output.lines().map(strip_markup).collect::<Vec<_>>();

    let summary_idx = lines.iter().position(|line| {
        has_word(line, "EXPERIMENT_NAME") && has_word(line, "SERVICE") && has_word(line, "CLUSTER")
    });
    let job_header_idx = lines
        .iter()
        .position(|line| has_word(line, "#") && has_word(line, "JOB_NAME") && has_word(line, "STATUS"));

    match job_header_idx {
        Some(header_idx) => {
            let layout = ColumnLayout::locate(&lines[header_idx], JOB_COLUMNS);
            let end = summary_idx
                .filter(|summary| *summary > header_idx)
                .unwrap_or(lines.len());
            for (idx, line) in lines.iter().enumerate().take(end).skip(header_idx + 1) {
                if is_noise(line) {
                    continue;
                }
                match job_row(&layout.cells(line), observed_at) {
                    Ok(job) => report.jobs.push(job),
                    Err(reason) => report.errors.push(ParseError::new(idx + 1, line, reason)),
                }
            }
        }
        None => {
            for (idx, line) in lines.iter().enumerate() {
                if summary_idx.is_some_and(|summary| idx >= summary) {
                    break;
                }
                if !starts_with_index_token(line) {
                    continue;
                }
                match parse_job_line(line, observed_at) {
                    Ok(job) => report.jobs.push(job),
                    Err(reason) => report.errors.push(ParseError::new(idx + 1, line, reason)),
                }
            }
        }
    }

    if let Some(summary_idx) = summary_idx {
        let layout = ColumnLayout::locate(&lines[summary_idx], SUMMARY_COLUMNS);
        let row = lines
            .iter()
            .enumerate()
            .skip(summary_idx + 1)
            .find(|(_, line)| !is_noise(line));
        if let Some((idx, line)) = row {
            match summary_row(&layout.cells(line)) {
                Ok(summary) => report.summary = Some(summary),
                Err(reason) => report.errors.push(ParseError::new(idx + 1, line, reason)),
            }
        }
    }

    if job_header_idx.is_none() && summary_idx.is_none() && report.jobs.is_empty() {
        if let Some((idx, line)) = first_content_line(&lines) {
            report
                .errors
                .push(ParseError::new(idx + 1, line, ParseFailure::MissingHeader));
        }
    }
    report
}

fn job_row(cells: &BTreeMap<&str, String>, observed_at: DateTime<Utc>) -> Result<Job, ParseFailure> {
    let name_cell = cell(cells, "JOB_NAME").unwrap_or_default();
    let (index, name) = match cell(cells, "#") {
        Some(raw) => {
            let index = raw
                .trim_start_matches(':')
                .parse::<u32>()
                .map_err(|_| ParseFailure::InvalidJobIndex(raw.to_string()))?;
            let name = split_index_token(name_cell)
                .map(|(_, rest)| rest)
                .unwrap_or(name_cell);
            (index, name)
        }
        None => split_index_token(name_cell).ok_or(ParseFailure::MissingJobIndex)?,
    };
    let status = cell(cells, "STATUS").ok_or(ParseFailure::MissingField("STATUS"))?;

    let name = name.trim_start_matches(':');
    let mut job = Job::new(
        index,
        if name.is_empty() {
            format!(":{index}")
        } else {
            name.to_string()
        },
        JobStatus::from_token(status),
    );
    job.duration = owned(cell(cells, "DURATION"));
    job.started_at =
        cell(cells, "SUBMITTED").and_then(|submitted| resolve_relative_age(submitted, observed_at));
    job.log_url = owned(cell(cells, "PORTAL URL"));
    Ok(job)
}

fn summary_row(cells: &BTreeMap<&str, String>) -> Result<DetailSummary, ParseFailure> {
    let name = cell(cells, "EXPERIMENT_NAME").ok_or(ParseFailure::MissingField("EXPERIMENT_NAME"))?;
    let status_counts = SUMMARY_STATUS_COLUMNS
        .iter()
        .filter_map(|(column, status)| Some((*status, leading_number(cell(cells, column)?)?)))
        .filter(|(_, count)| *count > 0)
        .collect();
    Ok(DetailSummary {
        name: name.to_string(),
        service: owned(cell(cells, "SERVICE")),
        cluster: owned(cell(cells, "CLUSTER")),
        workspace: owned(cell(cells, "WORKSPACE")),
        n_jobs: cell(cells, "N_JOBS").and_then(leading_number),
        status_counts,
        description: owned(cell(cells, "DESCRIPTION")),
    })
}

/// Parses one headerless job line, e.g. `:0  n2-sft  running  5d`.
///
/// The status is the first recognised status word after the name, the
/// duration the first `5d`/`17h`/`1h30m` shaped token, and an `http(s)`
/// token becomes the log reference.
pub fn parse_job_line(line: &str, observed_at: DateTime<Utc>) -> Result<Job, ParseFailure> {
    let stripped = strip_markup(line);
    let (index, rest) = split_index_token(&stripped).ok_or_else(|| {
        match stripped.split_whitespace().next() {
            Some(token) if token.starts_with(':') => ParseFailure::InvalidJobIndex(token.to_string()),
            _ => ParseFailure::MissingJobIndex,
        }
    })?;

    let mut tokens = rest.split_whitespace();
    let name = tokens
        .next()
        .map(|name| name.trim_start_matches(':'))
        .filter(|name| !name.is_empty())
        .ok_or(ParseFailure::MissingField("JOB_NAME"))?;
    let remaining = tokens.collect::<Vec<_>>();
    if remaining.is_empty() {
        return Err(ParseFailure::MissingField("STATUS"));
    }

    let status = remaining
        .iter()
        .map(|token| JobStatus::from_token(token))
        .find(|status| *status != JobStatus::Unknown)
        .unwrap_or(JobStatus::Unknown);

    let mut job = Job::new(index, name, status);
    job.duration = remaining
        .iter()
        .find(|token| is_duration_token(token))
        .map(|token| token.to_string());
    job.log_url = remaining
        .iter()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(|token| token.to_string());
    job.started_at = remaining
        .windows(2)
        .find(|pair| pair[1].eq_ignore_ascii_case("ago"))
        .and_then(|pair| resolve_relative_age(pair[0], observed_at));
    Ok(job)
}

/// Splits a leading `:<digits>` token off a field.
fn split_index_token(field: &str) -> Option<(u32, &str)> {
    let trimmed = field.trim_start();
    let rest = trimmed.strip_prefix(':')?;
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let (digits, tail) = rest.split_at(digits_end);
    if !tail.is_empty() && !tail.starts_with(char::is_whitespace) {
        return None;
    }
    let index = digits.parse::<u32>().ok()?;
    Some((index, tail.trim()))
}

fn starts_with_index_token(line: &str) -> bool {
    let mut chars = line.trim_start().chars();
    chars.next() == Some(':') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn is_duration_token(token: &str) -> bool {
    static DURATION: OnceLock<Regex> = OnceLock::new();
    DURATION
        .get_or_init(|| Regex::new(r"^(?:\d+(?:\.\d+)?[smhdw])+$").expect("valid regex"))
        .is_match(token)
}

fn leading_number(value: &str) -> Option<u32> {
    value.split_whitespace().next()?.parse::<u32>().ok()
}

fn is_noise(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with("II ")
        || trimmed.chars().all(|c| SEPARATOR_CHARS.contains(c))
}

fn first_content_line(lines: &[String]) -> Option<(usize, &str)> {
    lines
        .iter()
        .enumerate()
        .find(|(_, line)| !is_noise(line))
        .map(|(idx, line)| (idx, line.as_str()))
}

fn cell<'a>(cells: &'a BTreeMap<&str, String>, column: &str) -> Option<&'a str> {
    cells
        .get(column)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

/// True when `word` occurs in `line` delimited by whitespace or line edges.
fn has_word(line: &str, word: &str) -> bool {
    find_word(line, word).is_some()
}

/// Char offset of the first whitespace-delimited occurrence of `word`.
fn find_word(line: &str, word: &str) -> Option<usize> {
    line.match_indices(word).find_map(|(byte_idx, _)| {
        let before = line[..byte_idx].chars().next_back();
        let after = line[byte_idx + word.len()..].chars().next();
        let bounded = before.map_or(true, char::is_whitespace) && after.map_or(true, char::is_whitespace);
        bounded.then(|| line[..byte_idx].chars().count())
    })
}

/// Column start offsets (in chars) taken from a header row.
struct ColumnLayout<'a> {
    columns: Vec<(&'a str, usize)>,
}

impl<'a> ColumnLayout<'a> {
    fn locate(header: &str, names: &[&'a str]) -> Self {
        let mut columns = names
            .iter()
            .filter_map(|name| find_word(header, name).map(|offset| (*name, offset)))
            .collect::<Vec<_>>();
        columns.sort_by_key(|(_, offset)| *offset);
        Self { columns }
    }

    /// Slices a row at the header offsets. The last column runs to the end
    /// of the line.
    fn cells(&self, line: &str) -> BTreeMap<&'a str, String> {
        let chars = line.chars().collect::<Vec<_>>();
        self.columns
            .iter()
            .enumerate()
            .map(|(position, (name, start))| {
                let end = self
                    .columns
                    .get(position + 1)
                    .map(|(_, next)| *next)
                    .unwrap_or(chars.len())
                    .min(chars.len());
                let start = (*start).min(end);
                let value = chars[start..end].iter().collect::<String>();
                (*name, value.trim().to_string())
            })
            .collect()
    }
}
