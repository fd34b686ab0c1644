//! Tenant provisioning: create a fresh stack or duplicate an existing one.
//!
//! Every job moves `queued -> running -> {done | failed}` in the ledger.
//! The first failing step fails the job; there are no retries.

use std::collections::HashMap;
use std::sync::Arc;

use tenantry_core::TenantSlug;
use tenantry_core::config::ScriptsConfig;
use tenantry_runtime::{ProcessOutput, ProcessRunner};
use tenantry_secrets::SecretCipher;
use tenantry_state::{Bookkeeping, CredentialUpdate, JobStatus, StateError};
use tracing::{error, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionKind {
    Create,
    Duplicate { source: TenantSlug, copy_data: bool },
}

impl ProvisionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProvisionKind::Create => "create",
            ProvisionKind::Duplicate { .. } => "duplicate",
        }
    }
}

/// One queued provisioning job.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub job_id: String,
    pub tenant: TenantSlug,
    pub owner: String,
    pub kind: ProvisionKind,
}

/// Parse `KEY=VALUE` lines, splitting on the first `=`. Lines without `=`
/// are ignored.
pub fn parse_key_values(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

pub struct Provisioner {
    store: Arc<dyn Bookkeeping>,
    runner: Arc<dyn ProcessRunner>,
    cipher: Arc<SecretCipher>,
    scripts: ScriptsConfig,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn Bookkeeping>,
        runner: Arc<dyn ProcessRunner>,
        cipher: Arc<SecretCipher>,
        scripts: ScriptsConfig,
    ) -> Self {
        Self {
            store,
            runner,
            cipher,
            scripts,
        }
    }

    /// Run the job to completion, recording every transition in the ledger.
    ///
    /// Any error, including a failed ledger write, leaves the job `failed`.
    pub async fn run(&self, request: &ProvisionRequest) -> OrchestratorResult<()> {
        let job_id = request.job_id.as_str();
        match self.advance(request).await {
            Ok(()) => {
                info!(job_id, tenant = %request.tenant, "provisioning done");
                Ok(())
            }
            Err(e) => {
                error!(job_id, tenant = %request.tenant, error = %e, "provisioning failed");
                mark_failed(self.store.as_ref(), job_id).await;
                Err(e)
            }
        }
    }

    async fn advance(&self, request: &ProvisionRequest) -> OrchestratorResult<()> {
        let job_id = request.job_id.as_str();
        self.store.set_job_status(job_id, JobStatus::Running).await?;
        info!(job_id, tenant = %request.tenant, kind = request.kind.label(), "provisioning started");
        self.execute(request).await?;
        self.store.set_job_status(job_id, JobStatus::Done).await?;
        Ok(())
    }

    async fn execute(&self, request: &ProvisionRequest) -> OrchestratorResult<()> {
        let tenant = request.tenant.as_str();
        let (script, args) = match &request.kind {
            ProvisionKind::Create => (&self.scripts.provision, vec![tenant.to_string()]),
            ProvisionKind::Duplicate { source, copy_data } => {
                let mode = if *copy_data { "with-data" } else { "schema-only" };
                (
                    &self.scripts.duplicate,
                    vec![source.to_string(), tenant.to_string(), mode.to_string()],
                )
            }
        };
        self.run_script(script, args).await?;

        let tokens = self
            .run_script(&self.scripts.extract_tokens, vec![tenant.to_string()])
            .await?;
        let vars = parse_key_values(&tokens.stdout);
        let anon = self.required(&vars, &self.scripts.anon_key_var)?;
        let service_role = self.required(&vars, &self.scripts.service_role_key_var)?;

        let anon = self.cipher.encrypt(anon)?;
        let service_role = self.cipher.encrypt(service_role)?;
        let update = self
            .store
            .store_credentials(tenant, &request.owner, &anon, &service_role)
            .await?;
        if update == CredentialUpdate::NoMatch {
            warn!(
                job_id = %request.job_id,
                tenant,
                owner = %request.owner,
                "credentials matched no tenant row for this owner; nothing stored"
            );
        }
        Ok(())
    }

    fn required<'v>(&self, vars: &'v HashMap<String, String>, key: &str) -> OrchestratorResult<&'v str> {
        match vars.get(key) {
            Some(value) if !value.is_empty() => Ok(value.as_str()),
            _ => Err(OrchestratorError::Workflow(format!(
                "{} did not print {key}",
                self.scripts.extract_tokens
            ))),
        }
    }

    /// Run `<shell> <dir>/<script> args`; a non-zero exit is an error.
    async fn run_script(&self, script: &str, args: Vec<String>) -> OrchestratorResult<ProcessOutput> {
        let out = run_script(self.runner.as_ref(), &self.scripts, script, args).await?;
        if !out.success() {
            warn!(script, exit_code = out.exit_code, output = %out.combined(), "script failed");
            return Err(OrchestratorError::Workflow(format!(
                "{script} exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        info!(script, output = %out.combined(), "script finished");
        Ok(out)
    }
}

/// Run a script from the scripts directory through the configured shell.
pub(crate) async fn run_script(
    runner: &dyn ProcessRunner,
    scripts: &ScriptsConfig,
    script: &str,
    mut args: Vec<String>,
) -> Result<ProcessOutput, tenantry_runtime::RunnerError> {
    args.insert(0, scripts.path(script).to_string_lossy().into_owned());
    runner.run(&scripts.shell, &args, scripts.timeout()).await
}

/// Move a job to `failed`, logging rather than returning any ledger error.
pub(crate) async fn mark_failed(store: &dyn Bookkeeping, job_id: &str) {
    match store.set_job_status(job_id, JobStatus::Failed).await {
        Ok(_) => {}
        Err(e @ StateError::InvalidTransition { .. }) => {
            warn!(job_id, error = %e, "job already finished, not marking failed");
        }
        Err(e) => error!(job_id, error = %e, "could not mark job failed"),
    }
}
