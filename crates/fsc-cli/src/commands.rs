use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use fsc_core::{CacheEntry, Experiment, JobStatus};
use fsc_storage::{CacheStats, StatusStore, SyncRecord};
use fsc_sync::{
    AmltTool, FacadeError, PollResult, ReconciliationEngine, SyncConfig, SyncFacade,
    SyncScheduler, SyncScope, TriggerOutcome,
};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum Command {
    /// List cached experiments, newest activity first
    List(ListArgs),
    /// Show one experiment and its jobs
    Status(StatusArgs),
    /// Reconcile with the job tool now
    Sync(SyncArgs),
    /// Print the tail of a job's log
    Logs(LogsArgs),
    /// Cancel an experiment or a single job
    Cancel(CancelArgs),
    /// Inspect or clear the local cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
    /// Cache counts and recent sync runs
    Stats,
    /// Poll on an interval until Ctrl-C
    Daemon(DaemonArgs),
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum CacheCommand {
    Stats,
    List(CacheListArgs),
    Clear(CacheClearArgs),
    Evict(CacheEvictArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub status: Option<JobStatus>,
    /// Listing window for --refresh; also caps the rows printed
    #[arg(long)]
    pub limit: Option<usize>,
    #[arg(long)]
    pub refresh: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub name: String,
    #[arg(long)]
    pub refresh: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// `all`, `active`, or an experiment name
    #[arg(long, default_value = "all")]
    pub scope: SyncScope,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    pub name: String,
    #[arg(long, short = 'j', default_value = "0", value_parser = parse_job_index)]
    pub job: u32,
    #[arg(long, short = 'n', default_value_t = 50)]
    pub lines: usize,
}

#[derive(Args, Debug)]
pub struct CancelArgs {
    pub name: String,
    #[arg(long, short = 'j', value_parser = parse_job_index)]
    pub job: Option<u32>,
    /// Skip the typed confirmation
    #[arg(long, short = 'y')]
    pub yes: bool,
    /// Re-read the experiment from the tool before exiting
    #[arg(long)]
    pub confirm: bool,
}

#[derive(Args, Debug)]
pub struct CacheListArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CacheClearArgs {
    #[arg(long, short = 'y')]
    pub yes: bool,
}

#[derive(Args, Debug)]
pub struct CacheEvictArgs {
    pub name: String,
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Poll interval in seconds (default from FSC_POLL_INTERVAL_SECS or 300)
    #[arg(long)]
    pub interval: Option<u64>,
}

/// Accepts `:1` as well as `1`.
fn parse_job_index(raw: &str) -> Result<u32, String> {
    raw.trim()
        .trim_start_matches(':')
        .parse::<u32>()
        .map_err(|_| format!("invalid job index {raw:?}, expected e.g. :0"))
}

pub async fn run(command: Command, db_path: &Path) -> Result<()> {
    let mut config = SyncConfig::from_env();
    match &command {
        Command::List(args) => {
            if let Some(limit) = args.limit {
                config.list_limit = limit;
            }
        }
        Command::Cancel(args) if args.confirm => {
            config.cancel_confirm_delay = Duration::ZERO;
        }
        Command::Daemon(args) => {
            if let Some(secs) = args.interval {
                config.poll_interval = Duration::from_secs(secs.max(1));
            }
        }
        _ => {}
    }
    let facade = open_facade(db_path, config)?;

    match command {
        Command::List(args) => list(&facade, &args).await,
        Command::Status(args) => status(&facade, &args).await,
        Command::Sync(args) => sync(&facade, args.scope).await,
        Command::Logs(args) => {
            let text = facade.logs(&args.name, args.job, args.lines).await?;
            print!("{text}");
            Ok(())
        }
        Command::Cancel(args) => cancel(&facade, &args).await,
        Command::Cache { action } => match action {
            CacheCommand::Stats => {
                print_stats(&facade.stats()?);
                Ok(())
            }
            CacheCommand::List(args) => {
                let entries = facade.list_all()?;
                print_entries(&entries, args.json)
            }
            CacheCommand::Clear(args) => {
                if !args.yes && !confirm("Remove every cached experiment, including finished ones?")? {
                    println!("Nothing removed.");
                    return Ok(());
                }
                println!("Removed {} cached experiments.", facade.clear_cache()?);
                Ok(())
            }
            CacheCommand::Evict(args) => {
                if facade.evict_cache(&args.name)? {
                    println!("Evicted {}.", args.name);
                } else {
                    println!("{} was not cached.", args.name);
                }
                Ok(())
            }
        },
        Command::Stats => {
            print_stats(&facade.stats()?);
            println!();
            let syncs = facade.recent_syncs(10)?;
            print_syncs(&syncs);
            Ok(())
        }
        Command::Daemon(_) => daemon(&facade).await,
    }
}

fn open_facade(db_path: &Path, config: SyncConfig) -> Result<SyncFacade<AmltTool>> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = StatusStore::open(db_path)
        .with_context(|| format!("failed to open status store {}", db_path.display()))?;
    let tool = AmltTool::from_config(&config);
    let engine = Arc::new(ReconciliationEngine::new(tool, Arc::new(store), config));
    Ok(SyncFacade::new(Arc::new(SyncScheduler::new(engine))))
}

async fn list(facade: &SyncFacade<AmltTool>, args: &ListArgs) -> Result<()> {
    if args.refresh {
        report_outcome(&facade.refresh_now(SyncScope::All).await?);
    }
    let mut entries = match args.status {
        Some(status) => facade.list_by_status(status)?,
        None => facade.list_all()?,
    };
    if let Some(limit) = args.limit {
        entries.truncate(limit);
    }
    print_entries(&entries, args.json)
}

async fn status(facade: &SyncFacade<AmltTool>, args: &StatusArgs) -> Result<()> {
    if args.refresh {
        report_outcome(
            &facade
                .refresh_now(SyncScope::Experiment(args.name.clone()))
                .await?,
        );
    }
    let entry = match facade.get_experiment(&args.name) {
        Ok(entry) => entry,
        Err(FacadeError::NotFound(name)) => {
            bail!("{name} is not cached; run `fsc status {name} --refresh`")
        }
        Err(err) => return Err(err.into()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(());
    }
    print_experiment(&entry);
    Ok(())
}

async fn sync(facade: &SyncFacade<AmltTool>, scope: SyncScope) -> Result<()> {
    let outcome = facade
        .refresh_now(scope.clone())
        .await
        .with_context(|| format!("sync {scope} failed"))?;
    report_outcome(&outcome);
    Ok(())
}

async fn cancel(facade: &SyncFacade<AmltTool>, args: &CancelArgs) -> Result<()> {
    if !args.yes {
        let (target, expected) = match args.job {
            Some(job) => (format!("job :{job} of {}", args.name), job.to_string()),
            None => (format!("ALL jobs of {}", args.name), args.name.clone()),
        };
        println!("About to cancel {target}.");
        print!("Type '{expected}' to confirm: ");
        io::stdout().flush()?;
        if read_line()?.trim() != expected {
            println!("Confirmation mismatch. Nothing cancelled.");
            return Ok(());
        }
    }

    let outcome = facade.cancel(&args.name, args.job).await?;
    if outcome.confirm_after.is_zero() {
        println!(
            "Cancel sent. {} job(s) marked killed locally, then re-read from the tool.",
            outcome.killed_jobs
        );
    } else {
        // the delayed refresh dies with this process; only a daemon keeps it
        println!(
            "Cancel sent. {} job(s) marked killed locally; pass --confirm or run `fsc sync` to re-read the tool's view.",
            outcome.killed_jobs
        );
    }
    if let Some(entry) = outcome.entry {
        println!("{}: {}", entry.experiment.name(), entry.experiment.status());
    }
    Ok(())
}

async fn daemon(facade: &SyncFacade<AmltTool>) -> Result<()> {
    let handle = facade.scheduler().start();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!(event = "daemon_shutdown");
    handle.stop().await;
    if let Some(err) = facade.last_error() {
        eprintln!("last sync error: {err}");
    }
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    Ok(matches!(
        read_line()?.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn read_line() -> Result<String> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read confirmation")?;
    Ok(line)
}

fn report_outcome(outcome: &TriggerOutcome) {
    match outcome {
        TriggerOutcome::Completed(result) => print_result(result),
        TriggerOutcome::Coalesced { behind, result } => {
            eprintln!("Joined the pending {behind} sync instead of starting another.");
            if let Ok(result) = result {
                print_result(result);
            }
        }
    }
}

fn print_result(result: &PollResult) {
    eprintln!(
        "Synced: {} seen, {} updated, {} corrected.",
        result.seen, result.updated, result.corrected
    );
    for error in &result.errors {
        eprintln!("  warning: {error}");
    }
}

fn print_entries(entries: &[CacheEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No cached experiments.");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<36} {:<8} {:<14} {:>4}  {:<9} FLAGS",
        "EXPERIMENT", "STATUS", "CLUSTER", "JOBS", "UPDATED"
    );
    for entry in entries {
        let experiment = &entry.experiment;
        println!(
            "{:<36} {:<8} {:<14} {:>4}  {:<9} {}",
            experiment.name(),
            experiment.status(),
            experiment.cluster.as_deref().unwrap_or("-"),
            experiment.job_count,
            format_age(now, experiment.updated_at),
            flags_label(experiment),
        );
    }
    Ok(())
}

fn print_experiment(entry: &CacheEntry) {
    let experiment = &entry.experiment;
    let now = Utc::now();
    println!("Experiment: {}", experiment.name());
    println!("Status: {}", experiment.status());
    if let Some(cluster) = &experiment.cluster {
        println!("Cluster: {cluster}");
    }
    if let Some(service) = &experiment.service {
        println!("Service: {service}");
    }
    if let Some(workspace) = &experiment.workspace {
        println!("Workspace: {workspace}");
    }
    if !experiment.flags.is_empty() {
        println!("Flags: {}", flags_label(experiment));
    }
    if let Some(description) = &experiment.description {
        println!("Description: {description}");
    }
    if let Some(url) = &experiment.job_url {
        println!("URL: {url}");
    }
    println!("Updated: {}", format_age(now, experiment.updated_at));
    println!(
        "Cached: {}{}",
        format_age(now, entry.cached_at),
        if entry.terminal { " (retained)" } else { "" }
    );
    println!("Jobs ({} reported):", experiment.job_count);
    for job in experiment.jobs() {
        println!(
            "  :{:<3} {:<28} {:<8} {:<8} {}",
            job.index,
            job.name,
            job.status,
            job.duration.as_deref().unwrap_or("-"),
            job.log_url.as_deref().unwrap_or("")
        );
    }
}

fn print_stats(stats: &CacheStats) {
    println!(
        "Cached experiments: {} ({} active, {} retained)",
        stats.total,
        stats.active(),
        stats.terminal
    );
    println!("Cached jobs: {}", stats.jobs);
    for (status, count) in &stats.by_status {
        println!("  {status:<8} {count}");
    }
    if let Some(last_sync) = stats.last_sync_at {
        println!("Last sync: {}", format_age(Utc::now(), last_sync));
    }
}

fn print_syncs(records: &[SyncRecord]) {
    if records.is_empty() {
        println!("No sync runs recorded.");
        return;
    }
    println!("Recent syncs:");
    for record in records {
        let took = (record.finished_at - record.started_at).num_milliseconds();
        println!(
            "  {} {:<24} seen={} updated={} corrected={} errors={} ({took} ms){}",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.scope,
            record.seen,
            record.updated,
            record.corrected,
            record.error_count,
            record
                .first_error
                .as_deref()
                .map(|err| format!(" first error: {err}"))
                .unwrap_or_default()
        );
    }
}

fn flags_label(experiment: &Experiment) -> String {
    experiment
        .flags
        .iter()
        .map(|flag| flag.token().to_string())
        .collect::<Vec<_>>()
        .join("|")
}

fn format_age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
