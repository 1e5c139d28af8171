use std::time::Duration;

pub const DEFAULT_TOOL_PROGRAM: &str = "amlt";
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_CORRECTIONS: usize = 20;
pub const DEFAULT_CANCEL_CONFIRM_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Executable of the external job tool.
    pub tool_program: String,
    /// `--most-recent` window passed to the listing command.
    pub list_limit: usize,
    pub poll_interval: Duration,
    /// Per invocation; an expired invocation fails the cycle and is not retried.
    pub invocation_timeout: Duration,
    /// Detail queries issued by one `check_and_correct` pass.
    pub max_corrections_per_cycle: usize,
    pub cancel_confirm_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tool_program: DEFAULT_TOOL_PROGRAM.to_string(),
            list_limit: DEFAULT_LIST_LIMIT,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            invocation_timeout: Duration::from_secs(DEFAULT_INVOCATION_TIMEOUT_SECS),
            max_corrections_per_cycle: DEFAULT_MAX_CORRECTIONS,
            cancel_confirm_delay: Duration::from_secs(DEFAULT_CANCEL_CONFIRM_SECS),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlays `FSC_*` values onto the defaults. Unparseable values are
    /// ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(program) = lookup("FSC_TOOL").filter(|value| !value.trim().is_empty()) {
            config.tool_program = program.trim().to_string();
        }
        if let Some(limit) = parse_positive(lookup("FSC_LIST_LIMIT")) {
            config.list_limit = limit as usize;
        }
        if let Some(secs) = parse_positive(lookup("FSC_POLL_INTERVAL_SECS")) {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(lookup("FSC_TIMEOUT_SECS")) {
            config.invocation_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = lookup("FSC_MAX_CORRECTIONS").and_then(|value| value.trim().parse().ok())
        {
            config.max_corrections_per_cycle = max;
        }
        if let Some(secs) =
            lookup("FSC_CANCEL_CONFIRM_SECS").and_then(|value| value.trim().parse().ok())
        {
            config.cancel_confirm_delay = Duration::from_secs(secs);
        }
        config
    }
}

fn parse_positive(value: Option<String>) -> Option<u64> {
    value?.trim().parse::<u64>().ok().filter(|value| *value > 0)
}
