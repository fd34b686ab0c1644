//! Thin wrapper over the container runtime CLI.
//!
//! Each method runs one `docker` subcommand and returns the raw
//! [`ProcessOutput`]; callers decide what a non-zero exit means.

use std::sync::Arc;
use std::time::Duration;

use tenantry_core::config::RuntimeConfig;

use crate::error::RunnerError;
use crate::runner::{ProcessOutput, ProcessRunner};

#[derive(Clone)]
pub struct DockerCli {
    runner: Arc<dyn ProcessRunner>,
    bin: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(runner: Arc<dyn ProcessRunner>, bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            bin: bin.into(),
            timeout,
        }
    }

    pub fn from_config(runner: Arc<dyn ProcessRunner>, config: &RuntimeConfig) -> Self {
        Self::new(runner, config.docker_bin.clone(), config.command_timeout())
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    async fn run(&self, args: &[&str]) -> Result<ProcessOutput, RunnerError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run(&self.bin, &args, self.timeout).await
    }

    /// `docker ps -a --format {{json .}}`: one JSON object per line.
    pub async fn ps_all(&self) -> Result<ProcessOutput, RunnerError> {
        self.run(&["ps", "-a", "--format", "{{json .}}"]).await
    }

    pub async fn start(&self, name: &str) -> Result<ProcessOutput, RunnerError> {
        self.run(&["start", name]).await
    }

    pub async fn stop(&self, name: &str) -> Result<ProcessOutput, RunnerError> {
        self.run(&["stop", name]).await
    }

    /// Restart with `grace_secs` to stop gracefully before the kill.
    pub async fn restart(&self, name: &str, grace_secs: u32) -> Result<ProcessOutput, RunnerError> {
        let grace = grace_secs.to_string();
        self.run(&["restart", "-t", &grace, name]).await
    }

    pub async fn remove_force(&self, name: &str) -> Result<ProcessOutput, RunnerError> {
        self.run(&["rm", "-f", name]).await
    }

    pub async fn pause(&self, name: &str) -> Result<ProcessOutput, RunnerError> {
        self.run(&["pause", name]).await
    }

    pub async fn unpause(&self, name: &str) -> Result<ProcessOutput, RunnerError> {
        self.run(&["unpause", name]).await
    }

    pub async fn inspect(&self, name: &str) -> Result<ProcessOutput, RunnerError> {
        self.run(&["inspect", name]).await
    }

    pub async fn logs(&self, name: &str, tail: u32) -> Result<ProcessOutput, RunnerError> {
        let tail = tail.to_string();
        self.run(&["logs", "--tail", &tail, "--timestamps", name]).await
    }
}
