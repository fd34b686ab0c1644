//! Scripted [`ProcessRunner`] for tests.
//!
//! Replies are chosen by substring match against the full command line
//! (`program arg1 arg2 ...`); the most recently registered matching rule
//! wins. Unmatched commands succeed with empty output. Every call is
//! recorded in order.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RunnerError;
use crate::runner::{ProcessOutput, ProcessRunner};

#[derive(Debug, Clone)]
enum Reply {
    Output(ProcessOutput),
    Delayed(Duration, ProcessOutput),
    TimedOut,
    Panic(String),
}

#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, pattern: &str, reply: Reply) -> &Self {
        lock(&self.rules).push((pattern.to_string(), reply));
        self
    }

    /// Reply to matching commands with exit 0 and `stdout`.
    pub fn on_ok(&self, pattern: &str, stdout: &str) -> &Self {
        self.push(
            pattern,
            Reply::Output(ProcessOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }),
        )
    }

    /// Reply to matching commands with a non-zero exit and `stderr`.
    pub fn on_fail(&self, pattern: &str, exit_code: i32, stderr: &str) -> &Self {
        self.push(
            pattern,
            Reply::Output(ProcessOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
        )
    }

    /// Succeed after sleeping `delay`.
    pub fn on_delay(&self, pattern: &str, delay: Duration) -> &Self {
        self.push(pattern, Reply::Delayed(delay, ProcessOutput::default()))
    }

    pub fn on_timeout(&self, pattern: &str) -> &Self {
        self.push(pattern, Reply::TimedOut)
    }

    /// Panic inside `run`, simulating a bug in a workflow step.
    pub fn on_panic(&self, pattern: &str) -> &Self {
        self.push(pattern, Reply::Panic(pattern.to_string()))
    }

    /// Command lines run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Index of the first recorded call containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        lock(&self.calls).iter().position(|c| c.contains(pattern))
    }

    pub fn count(&self, pattern: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.contains(pattern)).count()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        lock(&self.calls).push(line.clone());

        let reply = lock(&self.rules)
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            None => Ok(ProcessOutput::default()),
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::Delayed(delay, out)) => {
                tokio::time::sleep(delay).await;
                Ok(out)
            }
            Some(Reply::TimedOut) => Err(RunnerError::TimedOut {
                program: program.to_string(),
                after: timeout,
            }),
            Some(Reply::Panic(pattern)) => panic!("scripted panic on {pattern}"),
        }
    }
}

/// One `docker ps --format {{json .}}` line.
pub fn ps_line(name: &str, state: &str) -> String {
    format!(
        r#"{{"Names":"{name}","State":"{state}","Image":"supabase/{name}:latest","CreatedAt":"2025-01-01 00:00:00 +0000 UTC","Ports":""}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_matching_rule_wins() {
        let runner = ScriptedRunner::new();
        runner.on_ok("docker", "first").on_fail("docker start", 1, "boom");

        let out = runner
            .run("docker", &["start".into(), "x".into()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.stderr, "boom");

        let out = runner
            .run("docker", &["stop".into()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.stdout, "first");

        assert_eq!(runner.calls(), vec!["docker start x", "docker stop"]);
        assert_eq!(runner.position("stop"), Some(1));
    }
}
