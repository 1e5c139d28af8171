use crate::config::SyncConfig;
use std::future::Future;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("{program} not found")]
    Missing { program: String },
    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("{program} failed ({status}): {stderr}")]
    NonZeroExit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{program} timed out after {}s", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
}

/// The external job tool. Every method returns the tool's raw stdout.
pub trait JobTool: Send + Sync + 'static {
    fn list_experiments(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<String, InvocationError>> + Send;

    fn describe_experiment(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<String, InvocationError>> + Send;

    /// Cancels every job of `name`, or only `job` when given.
    fn cancel(
        &self,
        name: &str,
        job: Option<u32>,
    ) -> impl Future<Output = Result<String, InvocationError>> + Send;

    fn logs(
        &self,
        name: &str,
        job: u32,
        tail_lines: usize,
    ) -> impl Future<Output = Result<String, InvocationError>> + Send;
}

/// Runs the `amlt` command line as a subprocess.
#[derive(Debug, Clone)]
pub struct AmltTool {
    program: String,
    timeout: Duration,
}

impl AmltTool {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.tool_program.clone(), config.invocation_timeout)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: &[String]) -> Result<String, InvocationError> {
        debug!(event = "tool_invoke", program = %self.program, args = ?args);
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // On timeout the child is left to finish on its own; it is not killed.
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Err(InvocationError::Missing {
                    program: self.program.clone(),
                });
            }
            Ok(Err(err)) => {
                return Err(InvocationError::Spawn {
                    program: self.program.clone(),
                    message: err.to_string(),
                });
            }
            Err(_) => {
                return Err(InvocationError::Timeout {
                    program: self.program.clone(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(InvocationError::NonZeroExit {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl JobTool for AmltTool {
    async fn list_experiments(&self, limit: usize) -> Result<String, InvocationError> {
        self.run(&list_args(limit)).await
    }

    async fn describe_experiment(&self, name: &str) -> Result<String, InvocationError> {
        self.run(&describe_args(name)).await
    }

    async fn cancel(&self, name: &str, job: Option<u32>) -> Result<String, InvocationError> {
        self.run(&cancel_args(name, job)).await
    }

    async fn logs(
        &self,
        name: &str,
        job: u32,
        tail_lines: usize,
    ) -> Result<String, InvocationError> {
        self.run(&logs_args(name, job, tail_lines)).await
    }
}

fn list_args(limit: usize) -> Vec<String> {
    vec![
        "list".to_string(),
        "--most-recent".to_string(),
        limit.to_string(),
    ]
}

fn describe_args(name: &str) -> Vec<String> {
    vec!["status".to_string(), name.to_string()]
}

fn cancel_args(name: &str, job: Option<u32>) -> Vec<String> {
    let mut args = vec!["cancel".to_string(), "-y".to_string(), name.to_string()];
    if let Some(job) = job {
        args.push(format!(":{job}"));
    }
    args
}

fn logs_args(name: &str, job: u32, tail_lines: usize) -> Vec<String> {
    vec![
        "logs".to_string(),
        "-n".to_string(),
        tail_lines.to_string(),
        name.to_string(),
        format!(":{job}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_lines_follow_tool_syntax() {
        assert_eq!(list_args(25), ["list", "--most-recent", "25"]);
        assert_eq!(describe_args("winning-joey"), ["status", "winning-joey"]);
        assert_eq!(cancel_args("winning-joey", None), ["cancel", "-y", "winning-joey"]);
        assert_eq!(
            cancel_args("winning-joey", Some(2)),
            ["cancel", "-y", "winning-joey", ":2"]
        );
        assert_eq!(
            logs_args("winning-joey", 0, 50),
            ["logs", "-n", "50", "winning-joey", ":0"]
        );
    }

    #[tokio::test]
    async fn missing_program_is_reported_as_missing() {
        let tool = AmltTool::new("fsc-test-no-such-program", Duration::from_secs(5));
        let err = tool.list_experiments(5).await.expect_err("should fail");
        assert_eq!(
            err,
            InvocationError::Missing {
                program: "fsc-test-no-such-program".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let tool = AmltTool::new("sh", Duration::from_secs(5));
        let err = tool
            .run(&["-c".to_string(), "echo boom >&2; exit 3".to_string()])
            .await
            .expect_err("should fail");
        match err {
            InvocationError::NonZeroExit { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_invocation_times_out() {
        let tool = AmltTool::new("sh", Duration::from_millis(100));
        let err = tool
            .run(&["-c".to_string(), "sleep 2".to_string()])
            .await
            .expect_err("should time out");
        assert!(matches!(err, InvocationError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_is_returned_as_text() {
        let tool = AmltTool::new("sh", Duration::from_secs(5));
        let out = tool
            .run(&["-c".to_string(), "printf 'EXPERIMENT_NAME'".to_string()])
            .await
            .expect("runs");
        assert_eq!(out, "EXPERIMENT_NAME");
    }
}
