//! Start, stop, restart and log tailing for a tenant's containers.
//!
//! Per-container failures do not abort the loop; they are collected into
//! the report's `errors` and `success` is true only when there are none.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};
use tenantry_core::config::RuntimeConfig;
use tracing::{info, warn};

use crate::docker::DockerCli;
use crate::error::{FleetError, FleetResult};
use crate::fleet::{ContainerRecord, FleetInspector, order_for_lifecycle};
use crate::runner::ProcessOutput;

static SERVICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("static service regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
}

impl LifecycleAction {
    /// Key under which the touched containers are reported.
    pub fn containers_key(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "started_containers",
            LifecycleAction::Stop => "stopped_containers",
            LifecycleAction::Restart => "restarted_containers",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "starting",
            LifecycleAction::Stop => "stopping",
            LifecycleAction::Restart => "restarting",
        }
    }
}

/// Outcome of a start/stop/restart over a tenant's fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleReport {
    pub project: String,
    pub action: LifecycleAction,
    pub containers: Vec<String>,
    pub errors: Vec<String>,
}

impl LifecycleReport {
    fn new(project: &str, action: LifecycleAction) -> Self {
        Self {
            project: project.to_string(),
            action,
            containers: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    fn record_failure(&mut self, name: &str, detail: impl std::fmt::Display) {
        let entry = format!("Error {} {name}: {detail}", self.action.verb());
        warn!(project = %self.project, container = %name, "{entry}");
        self.errors.push(entry);
    }
}

impl Serialize for LifecycleReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("project", &self.project)?;
        map.serialize_entry(self.action.containers_key(), &self.containers)?;
        map.serialize_entry("errors", &self.errors)?;
        map.serialize_entry("success", &self.success())?;
        map.end()
    }
}

/// Tail of one service container's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogTail {
    pub container: String,
    pub logs: String,
    pub status: String,
}

#[derive(Clone)]
pub struct FleetController {
    docker: DockerCli,
    inspector: FleetInspector,
    container_prefix: String,
    stagger: Duration,
    restart_grace_secs: u32,
    default_log_lines: u32,
    max_log_lines: u32,
}

impl FleetController {
    pub fn new(docker: DockerCli, config: &RuntimeConfig) -> Self {
        Self {
            inspector: FleetInspector::new(docker.clone()),
            docker,
            container_prefix: config.container_prefix.clone(),
            stagger: config.start_stagger(),
            restart_grace_secs: config.restart_grace_secs,
            default_log_lines: config.default_log_lines,
            max_log_lines: config.max_log_lines,
        }
    }

    pub fn inspector(&self) -> &FleetInspector {
        &self.inspector
    }

    async fn fleet(&self, tenant: &str) -> FleetResult<Vec<ContainerRecord>> {
        let records = self.inspector.list_containers(tenant).await?;
        if records.is_empty() {
            return Err(FleetError::NotFound(format!(
                "no containers found for project {tenant}"
            )));
        }
        Ok(records)
    }

    async fn pause_between_starts(&self) {
        if !self.stagger.is_zero() {
            tokio::time::sleep(self.stagger).await;
        }
    }

    /// Start stopped containers in dependency order.
    pub async fn start(&self, tenant: &str) -> FleetResult<LifecycleReport> {
        let mut records = self.fleet(tenant).await?;
        order_for_lifecycle(&mut records, tenant);

        let mut report = LifecycleReport::new(tenant, LifecycleAction::Start);
        for record in records {
            if record.is_running() {
                report
                    .containers
                    .push(format!("{} (already running)", record.name));
                continue;
            }
            match self.docker.start(&record.name).await {
                Ok(out) if out.success() => {
                    report.containers.push(record.name);
                    self.pause_between_starts().await;
                }
                Ok(out) => report.record_failure(&record.name, stderr_of(&out)),
                Err(e) => report.record_failure(&record.name, e),
            }
        }
        info!(project = %tenant, success = report.success(), "fleet start finished");
        Ok(report)
    }

    /// Stop running containers. Order does not matter.
    pub async fn stop(&self, tenant: &str) -> FleetResult<LifecycleReport> {
        let records = self.fleet(tenant).await?;

        let mut report = LifecycleReport::new(tenant, LifecycleAction::Stop);
        for record in records {
            if !record.is_running() {
                report
                    .containers
                    .push(format!("{} (already stopped)", record.name));
                continue;
            }
            match self.docker.stop(&record.name).await {
                Ok(out) if out.success() => report.containers.push(record.name),
                Ok(out) => report.record_failure(&record.name, stderr_of(&out)),
                Err(e) => report.record_failure(&record.name, e),
            }
        }
        info!(project = %tenant, success = report.success(), "fleet stop finished");
        Ok(report)
    }

    /// Restart every container in dependency order.
    pub async fn restart(&self, tenant: &str) -> FleetResult<LifecycleReport> {
        let mut records = self.fleet(tenant).await?;
        order_for_lifecycle(&mut records, tenant);

        let mut report = LifecycleReport::new(tenant, LifecycleAction::Restart);
        for record in records {
            match self.docker.restart(&record.name, self.restart_grace_secs).await {
                Ok(out) if out.success() => {
                    report.containers.push(record.name);
                    self.pause_between_starts().await;
                }
                Ok(out) => report.record_failure(&record.name, stderr_of(&out)),
                Err(e) => report.record_failure(&record.name, e),
            }
        }
        info!(project = %tenant, success = report.success(), "fleet restart finished");
        Ok(report)
    }

    /// Tail the log of `<prefix>-<service>-<tenant>`.
    pub async fn logs(&self, tenant: &str, service: &str, lines: Option<u32>) -> FleetResult<LogTail> {
        if !SERVICE_RE.is_match(service) {
            return Err(FleetError::InvalidService(service.to_string()));
        }
        let lines = lines
            .unwrap_or(self.default_log_lines)
            .clamp(1, self.max_log_lines.max(1));
        let container = format!("{}-{service}-{tenant}", self.container_prefix);

        let inspect = self.docker.inspect(&container).await?;
        if !inspect.success() {
            return Err(FleetError::NotFound(format!("container {container} not found")));
        }

        let logs = self.docker.logs(&container, lines).await?;
        if !logs.success() {
            return Err(FleetError::ExternalTool {
                command: format!("{} logs {container}", self.docker.bin()),
                exit_code: logs.exit_code,
                stderr: stderr_of(&logs),
            });
        }

        Ok(LogTail {
            status: inspect_status(&inspect.stdout),
            container,
            logs: logs.stdout,
        })
    }
}

fn stderr_of(out: &ProcessOutput) -> String {
    out.stderr.trim().to_string()
}

/// `[0].State.Status` of `docker inspect` output, or `unknown`.
fn inspect_status(stdout: &str) -> String {
    serde_json::from_str::<serde_json::Value>(stdout)
        .ok()
        .and_then(|v| v.get(0)?.get("State")?.get("Status")?.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{ScriptedRunner, ps_line};

    fn controller(runner: Arc<ScriptedRunner>) -> FleetController {
        let config = RuntimeConfig {
            start_stagger_ms: 0,
            ..RuntimeConfig::default()
        };
        FleetController::new(DockerCli::from_config(runner, &config), &config)
    }

    fn fleet_output(lines: &[(&str, &str)]) -> String {
        lines
            .iter()
            .map(|(name, state)| ps_line(name, state))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn start_orders_and_skips_running() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_ok(
            "ps -a",
            &fleet_output(&[
                ("supabase-nginx-demo", "exited"),
                ("supabase-auth-demo", "running"),
                ("supabase-meta-demo", "exited"),
            ]),
        );
        let report = controller(runner.clone()).start("demo").await.unwrap();

        assert_eq!(
            report.containers,
            vec![
                "supabase-meta-demo",
                "supabase-auth-demo (already running)",
                "supabase-nginx-demo"
            ]
        );
        assert!(report.success());
        assert!(runner.position("start supabase-meta-demo") < runner.position("start supabase-nginx-demo"));
        assert_eq!(runner.count("start supabase-auth-demo"), 0);
    }

    #[tokio::test]
    async fn start_collects_failures() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .on_ok("ps -a", &fleet_output(&[("supabase-rest-demo", "exited")]))
            .on_fail("start supabase-rest-demo", 1, "port is already allocated\n");
        let report = controller(runner).start("demo").await.unwrap();

        assert!(!report.success());
        assert_eq!(
            report.errors,
            vec!["Error starting supabase-rest-demo: port is already allocated"]
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["started_containers"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn stop_only_running() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_ok(
            "ps -a",
            &fleet_output(&[
                ("supabase-auth-demo", "running"),
                ("supabase-meta-demo", "exited"),
            ]),
        );
        let report = controller(runner.clone()).stop("demo").await.unwrap();

        assert_eq!(
            report.containers,
            vec!["supabase-auth-demo", "supabase-meta-demo (already stopped)"]
        );
        assert_eq!(runner.count("docker stop"), 1);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("stopped_containers").is_some());
    }

    #[tokio::test]
    async fn restart_uses_grace_period() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_ok("ps -a", &fleet_output(&[("supabase-rest-demo", "running")]));
        let report = controller(runner.clone()).restart("demo").await.unwrap();

        assert_eq!(report.containers, vec!["supabase-rest-demo"]);
        assert_eq!(runner.count("docker restart -t 30 supabase-rest-demo"), 1);
    }

    #[tokio::test]
    async fn empty_fleet_is_not_found() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_ok("ps -a", &fleet_output(&[("supabase-rest-other", "running")]));
        let err = controller(runner).stop("demo").await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[tokio::test]
    async fn logs_happy_path() {
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .on_ok("inspect", r#"[{"State":{"Status":"running"}}]"#)
            .on_ok("logs", "2025-01-01T00:00:00Z ready\n");
        let tail = controller(runner.clone())
            .logs("demo", "rest", None)
            .await
            .unwrap();

        assert_eq!(tail.container, "supabase-rest-demo");
        assert_eq!(tail.status, "running");
        assert_eq!(tail.logs, "2025-01-01T00:00:00Z ready\n");
        assert_eq!(
            runner.count("docker logs --tail 100 --timestamps supabase-rest-demo"),
            1
        );
    }

    #[tokio::test]
    async fn logs_clamps_lines() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctl = controller(runner.clone());
        ctl.logs("demo", "rest", Some(0)).await.unwrap();
        ctl.logs("demo", "rest", Some(999_999)).await.unwrap();

        assert_eq!(runner.count("--tail 1 "), 1);
        assert_eq!(runner.count("--tail 5000 "), 1);
    }

    #[tokio::test]
    async fn logs_errors() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctl = controller(runner.clone());

        let err = ctl.logs("demo", "../etc", None).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidService(_)));
        assert!(runner.calls().is_empty());

        runner.on_fail("inspect", 1, "No such object");
        let err = ctl.logs("demo", "rest", None).await.unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));

        runner
            .on_ok("inspect", "[]")
            .on_fail("logs", 1, "daemon error");
        let err = ctl.logs("demo", "rest", None).await.unwrap_err();
        assert!(matches!(err, FleetError::ExternalTool { .. }));
    }

    #[test]
    fn inspect_status_falls_back_to_unknown() {
        assert_eq!(inspect_status("[]"), "unknown");
        assert_eq!(inspect_status("garbage"), "unknown");
        assert_eq!(inspect_status(r#"[{"State":{"Status":"exited"}}]"#), "exited");
    }
}
