//! Tenant deletion.
//!
//! Deletion never stops at the first failure. Each step's error is
//! collected and the next step runs; the report says `partial_success`
//! when anything went wrong. The shared realtime and pooler containers are
//! paused for the duration and always unpaused again.

use std::sync::Arc;

use serde::Serialize;
use tenantry_core::TenantSlug;
use tenantry_core::config::{ScriptsConfig, TeardownConfig};
use tenantry_runtime::{DockerCli, FleetInspector, ProcessOutput, ProcessRunner, RunnerError};
use tenantry_state::{Bookkeeping, PlatformDb, StateError};
use tracing::{error, info, warn};

use crate::provision::run_script;
use crate::replication;
use crate::wait::poll_until;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Success,
    PartialSuccess,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub project: String,
    pub status: DeleteStatus,
    pub message: String,
    pub errors: Vec<String>,
}

impl DeleteReport {
    fn new(project: &TenantSlug, errors: Vec<String>) -> Self {
        let (status, message) = if errors.is_empty() {
            (DeleteStatus::Success, "Project deleted successfully")
        } else {
            (DeleteStatus::PartialSuccess, "Project deleted with errors")
        };
        Self {
            project: project.to_string(),
            status,
            message: message.to_string(),
            errors,
        }
    }
}

/// Collected step failures.
#[derive(Default)]
struct Errors(Vec<String>);

impl Errors {
    fn push(&mut self, tenant: &TenantSlug, entry: String) {
        warn!(%tenant, "{entry}");
        self.0.push(entry);
    }

    /// Record a non-zero exit or a failure to run `docker <verb> <name>`.
    fn docker(
        &mut self,
        tenant: &TenantSlug,
        verb: &str,
        name: &str,
        result: Result<ProcessOutput, RunnerError>,
    ) {
        match result {
            Ok(out) if out.success() => {}
            Ok(out) => self.push(tenant, format!("{verb} {name}: {}", out.stderr.trim())),
            Err(e) => self.push(tenant, format!("{verb} {name}: {e}")),
        }
    }
}

/// Keeps the shared containers paused. Dropping it without calling
/// [`PauseGuard::release`] unpauses them from a spawned task.
struct PauseGuard {
    docker: DockerCli,
    paused: Vec<String>,
}

impl PauseGuard {
    async fn engage(docker: &DockerCli, names: &[String], tenant: &TenantSlug, errors: &mut Errors) -> Self {
        let mut paused = Vec::new();
        for name in names {
            let result = docker.pause(name).await;
            if matches!(&result, Ok(out) if out.success()) {
                paused.push(name.clone());
            }
            errors.docker(tenant, "pause", name, result);
        }
        Self {
            docker: docker.clone(),
            paused,
        }
    }

    async fn release(mut self, tenant: &TenantSlug, errors: &mut Errors) {
        for name in std::mem::take(&mut self.paused) {
            let result = self.docker.unpause(&name).await;
            errors.docker(tenant, "unpause", &name, result);
        }
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if self.paused.is_empty() {
            return;
        }
        let names = std::mem::take(&mut self.paused);
        let docker = self.docker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(containers = ?names, "delete interrupted, unpausing shared containers");
                handle.spawn(async move {
                    for name in names {
                        match docker.unpause(&name).await {
                            Ok(out) if out.success() => {}
                            Ok(out) => error!(container = %name, stderr = %out.stderr.trim(), "unpause failed"),
                            Err(e) => error!(container = %name, error = %e, "unpause failed"),
                        }
                    }
                });
            }
            Err(_) => error!(containers = ?names, "no runtime to unpause shared containers"),
        }
    }
}

#[derive(Clone)]
pub struct Deprovisioner {
    store: Arc<dyn Bookkeeping>,
    platform: Arc<dyn PlatformDb>,
    runner: Arc<dyn ProcessRunner>,
    docker: DockerCli,
    scripts: ScriptsConfig,
    teardown: TeardownConfig,
}

impl Deprovisioner {
    pub fn new(
        store: Arc<dyn Bookkeeping>,
        platform: Arc<dyn PlatformDb>,
        runner: Arc<dyn ProcessRunner>,
        docker: DockerCli,
        scripts: ScriptsConfig,
        teardown: TeardownConfig,
    ) -> Self {
        Self {
            store,
            platform,
            runner,
            docker,
            scripts,
            teardown,
        }
    }

    /// Remove every trace of `tenant`. Authorization and the tenant guard
    /// are the caller's business.
    pub async fn run(&self, tenant: &TenantSlug) -> DeleteReport {
        info!(%tenant, "deleting tenant");
        let mut errors = Errors::default();
        let database = tenant.database_name();

        let pause =
            PauseGuard::engage(&self.docker, &self.teardown.shared_containers, tenant, &mut errors).await;

        self.remove_containers(tenant, &mut errors).await;

        if let Err(e) = self.platform.delete_realtime_rows(tenant.as_str()).await {
            errors.push(tenant, format!("realtime cleanup: {e}"));
        }

        self.drain_connections(tenant, &database, &mut errors).await;

        for warning in replication::teardown(self.platform.as_ref(), tenant, &self.teardown).await {
            errors.push(tenant, warning);
        }

        if let Err(e) = self.platform.drop_database(&database).await {
            errors.push(tenant, format!("drop database {database}: {e}"));
        }

        if let Err(e) = self.store.purge_tenant(tenant.as_str()).await {
            errors.push(tenant, format!("bookkeeping cleanup: {e}"));
        }
        if let Err(e) = self.platform.delete_pooler_rows(tenant.as_str()).await {
            errors.push(tenant, format!("pooler cleanup: {e}"));
        }

        pause.release(tenant, &mut errors).await;

        match run_script(
            self.runner.as_ref(),
            &self.scripts,
            &self.scripts.delete,
            vec![tenant.to_string()],
        )
        .await
        {
            Ok(out) if out.success() => {}
            Ok(out) => errors.push(
                tenant,
                format!("directory cleanup failed: {}", out.stderr.trim()),
            ),
            Err(e) => errors.push(tenant, format!("directory cleanup failed: {e}")),
        }

        match self.platform.database_exists(&database).await {
            Ok(false) => {}
            Ok(true) => errors.push(tenant, format!("database {database} still exists")),
            Err(e) => errors.push(tenant, format!("verify database {database}: {e}")),
        }

        let report = DeleteReport::new(tenant, errors.0);
        info!(%tenant, status = ?report.status, errors = report.errors.len(), "tenant deleted");
        report
    }

    async fn remove_containers(&self, tenant: &TenantSlug, errors: &mut Errors) {
        let inspector = FleetInspector::new(self.docker.clone());
        match inspector.list_containers(tenant.as_str()).await {
            Ok(containers) => {
                for container in containers {
                    let result = self.docker.remove_force(&container.name).await;
                    errors.docker(tenant, "remove", &container.name, result);
                }
            }
            Err(e) => errors.push(tenant, format!("list containers: {e}")),
        }
    }

    async fn drain_connections(&self, tenant: &TenantSlug, database: &str, errors: &mut Errors) {
        tokio::time::sleep(self.teardown.settle_delay()).await;

        match self.platform.terminate_connections(database).await {
            Ok(count) => info!(%tenant, count, "terminated database connections"),
            Err(e) => {
                errors.push(tenant, format!("terminate connections to {database}: {e}"));
                return;
            }
        }

        let platform = self.platform.as_ref();
        let budget = self.teardown.connection_drain_timeout();
        let drained = poll_until(budget, self.teardown.poll_interval(), || async move {
            Ok::<_, StateError>(platform.connection_count(database).await? == 0)
        })
        .await;
        match drained {
            Ok(true) => {}
            Ok(false) => errors.push(
                tenant,
                format!("connections to {database} still open after {budget:?}"),
            ),
            Err(e) => errors.push(tenant, format!("count connections to {database}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tenantry_runtime::testing::{ScriptedRunner, ps_line};
    use tenantry_state::StateStore;

    use super::*;
    use crate::testing::{RecordingPlatform, test_config};

    struct Fixture {
        store: Arc<StateStore>,
        platform: Arc<RecordingPlatform>,
        runner: Arc<ScriptedRunner>,
        deprovisioner: Deprovisioner,
    }

    fn fixture() -> Fixture {
        let config = test_config();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let platform = Arc::new(RecordingPlatform::new());
        let runner = Arc::new(ScriptedRunner::new());
        let docker = DockerCli::from_config(runner.clone(), &config.runtime);
        let deprovisioner = Deprovisioner::new(
            store.clone(),
            platform.clone(),
            runner.clone(),
            docker,
            config.scripts.clone(),
            config.teardown.clone(),
        );
        Fixture {
            store,
            platform,
            runner,
            deprovisioner,
        }
    }

    fn demo() -> TenantSlug {
        TenantSlug::parse("demo").unwrap()
    }

    fn seed(fx: &Fixture) {
        let tenant = demo();
        fx.store.create_tenant(&tenant, "alice", "job-1").unwrap();
        fx.platform
            .with_database(&tenant.database_name(), 3)
            .with_slot(&tenant.messages_slot(), Some(41))
            .with_slot(&tenant.replication_slot(), None);
        fx.runner.on_ok(
            "ps -a",
            &[
                ps_line("supabase-db-demo", "running"),
                ps_line("supabase-auth-demo", "running"),
                ps_line("supabase-auth-other", "running"),
            ]
            .join("\n"),
        );
    }

    #[tokio::test]
    async fn clean_delete_succeeds() {
        let fx = fixture();
        seed(&fx);

        let report = fx.deprovisioner.run(&demo()).await;
        assert_eq!(report.status, DeleteStatus::Success, "{:?}", report.errors);
        assert_eq!(report.message, "Project deleted successfully");
        assert!(report.errors.is_empty());

        assert!(fx.store.get_tenant("demo").unwrap().is_none());
        assert!(fx.store.get_job("job-1").unwrap().is_none());
        assert_eq!(fx.runner.count("rm -f supabase-db-demo"), 1);
        assert_eq!(fx.runner.count("rm -f supabase-auth-demo"), 1);
        assert_eq!(fx.runner.count("supabase-auth-other"), 0);
        assert!(!fx.platform.has_slot(&demo().messages_slot()));
    }

    #[tokio::test]
    async fn steps_run_in_order() {
        let fx = fixture();
        seed(&fx);
        fx.deprovisioner.run(&demo()).await;

        let runner = &fx.runner;
        let pause = runner.position("pause realtime-dev.supabase-realtime").unwrap();
        let remove = runner.position("rm -f").unwrap();
        let unpause = runner.position("unpause supabase-pooler").unwrap();
        let script = runner.position("delete_project.sh demo").unwrap();
        assert!(pause < remove && remove < unpause && unpause < script);

        let platform = &fx.platform;
        let realtime = platform.position("delete_realtime_rows demo").unwrap();
        let terminate = platform.position("terminate_connections _supabase_demo").unwrap();
        let slots = platform.position("terminate_backend 41").unwrap();
        let drop_db = platform.position("drop_database _supabase_demo").unwrap();
        let pooler = platform.position("delete_pooler_rows demo").unwrap();
        let verify = platform.position("database_exists _supabase_demo").unwrap();
        assert!(realtime < terminate);
        assert!(terminate < slots);
        assert!(slots < drop_db);
        assert!(drop_db < pooler);
        assert!(pooler < verify);
    }

    #[tokio::test]
    async fn cleanup_script_failure_is_the_only_error() {
        let fx = fixture();
        seed(&fx);
        fx.runner.on_fail("delete_project.sh", 1, "rm: cannot remove 'projects/demo'\n");

        let report = fx.deprovisioner.run(&demo()).await;
        assert_eq!(report.status, DeleteStatus::PartialSuccess);
        assert_eq!(report.message, "Project deleted with errors");
        assert_eq!(
            report.errors,
            vec!["directory cleanup failed: rm: cannot remove 'projects/demo'".to_string()]
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "partial_success");
        assert_eq!(json["project"], "demo");
    }

    #[tokio::test]
    async fn failures_are_collected_and_later_steps_still_run() {
        let fx = fixture();
        seed(&fx);
        fx.runner.on_fail("rm -f supabase-db-demo", 1, "device busy");
        fx.platform.fail("delete_realtime_rows", "relation missing");

        let report = fx.deprovisioner.run(&demo()).await;
        assert_eq!(report.status, DeleteStatus::PartialSuccess);
        assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
        assert_eq!(report.errors[0], "remove supabase-db-demo: device busy");
        assert!(report.errors[1].starts_with("realtime cleanup:"));
        assert!(fx.platform.position("drop_database").is_some());
        assert_eq!(fx.runner.count("delete_project.sh"), 1);
    }

    #[tokio::test]
    async fn lingering_connections_are_reported() {
        let fx = fixture();
        seed(&fx);
        fx.platform.with_sticky_connections();

        let report = fx.deprovisioner.run(&demo()).await;
        assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
        assert!(report.errors[0].contains("still open"));
    }

    #[tokio::test]
    async fn surviving_database_is_reported() {
        let fx = fixture();
        seed(&fx);
        fx.platform.fail("drop_database", "database is being accessed");

        let report = fx.deprovisioner.run(&demo()).await;
        assert_eq!(report.errors.len(), 2, "{:?}", report.errors);
        assert!(report.errors[0].starts_with("drop database _supabase_demo"));
        assert_eq!(report.errors[1], "database _supabase_demo still exists");
    }

    #[tokio::test]
    async fn failed_pause_is_not_unpaused() {
        let fx = fixture();
        seed(&fx);
        fx.runner.on_fail("pause supabase-pooler", 1, "not running");

        let report = fx.deprovisioner.run(&demo()).await;
        assert_eq!(report.errors, vec!["pause supabase-pooler: not running".to_string()]);
        assert_eq!(fx.runner.count("unpause supabase-pooler"), 0);
        assert_eq!(fx.runner.count("unpause realtime-dev.supabase-realtime"), 1);
    }

    #[tokio::test]
    async fn dropped_delete_still_unpauses() {
        let fx = fixture();
        seed(&fx);
        fx.runner.on_delay("rm -f", Duration::from_secs(60));

        let deprovisioner = fx.deprovisioner.clone();
        let task = tokio::spawn(async move { deprovisioner.run(&demo()).await });
        for _ in 0..200 {
            if fx.runner.count("rm -f") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.abort();
        let _ = task.await;

        for _ in 0..200 {
            if fx.runner.count("unpause") == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fx.runner.count("unpause realtime-dev.supabase-realtime"), 1);
        assert_eq!(fx.runner.count("unpause supabase-pooler"), 1);
    }
}
