//! External process execution.
//!
//! Every invocation is bounded by a wait budget. A child that outlives it is
//! killed (`kill_on_drop`) and the call fails with [`RunnerError::TimedOut`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::RunnerError;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, for logging tools that mix both.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Runs external programs. A trait so workflows can be tested against a
/// scripted fake.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError>;
}

/// [`ProcessRunner`] over `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError> {
        debug!(%program, ?args, "spawning process");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // On timeout the wait future is dropped together with the child,
        // which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| RunnerError::Io {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                warn!(%program, ?args, ?timeout, "process timed out, killed");
                return Err(RunnerError::TimedOut {
                    program: program.to_string(),
                    after: timeout,
                });
            }
        };

        let result = ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        info!(%program, ?args, exit_code = result.exit_code, "process finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let out = TokioProcessRunner
            .run("sh", &sh("echo out; echo err >&2; exit 3"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn stdin_is_closed() {
        let out = TokioProcessRunner
            .run("sh", &sh("cat; echo done"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "done\n");
    }

    #[tokio::test]
    async fn times_out_and_kills() {
        let err = TokioProcessRunner
            .run("sh", &sh("sleep 30"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn spawn_failure() {
        let err = TokioProcessRunner
            .run("/nonexistent/tenantry-tool", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn signal_reports_minus_one() {
        let out = TokioProcessRunner
            .run("sh", &sh("kill -9 $$"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, -1);
    }

    #[test]
    fn combined_output() {
        let out = ProcessOutput {
            exit_code: 1,
            stdout: "a\n".into(),
            stderr: "b\n".into(),
        };
        assert_eq!(out.combined(), "a\nb\n");
        let only_err = ProcessOutput {
            stderr: "b".into(),
            ..Default::default()
        };
        assert_eq!(only_err.combined(), "b");
    }
}
