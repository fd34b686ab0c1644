//! The operations the HTTP layer exposes, with their authorization rules.
//!
//! Long-running provisioning is queued and returns a job id; everything
//! else completes within the request.

use std::sync::Arc;

use secrecy::SecretString;
use serde::Serialize;
use tenantry_core::{Caller, Role, TenantSlug, TenantryConfig};
use tenantry_runtime::{DockerCli, FleetController, LifecycleReport, LogTail, ProcessRunner, StatusReport};
use tenantry_secrets::{SecretCipher, secrets_match};
use tenantry_state::{
    Bookkeeping, JobStatus, PlatformDb, TenantId, TenantRecord, TransferOutcome,
};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::deprovision::{DeleteReport, Deprovisioner};
use crate::dispatch::{Dispatcher, JobReport};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::guard::TenantGuards;
use crate::provision::{ProvisionKind, ProvisionRequest, Provisioner};

/// Backends the service runs against.
pub struct ServiceDeps {
    pub store: Arc<dyn Bookkeeping>,
    pub platform: Arc<dyn PlatformDb>,
    pub runner: Arc<dyn ProcessRunner>,
    pub cipher: Arc<SecretCipher>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobTicket {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantSummary {
    pub name: String,
    pub anon_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberView {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    /// Ledger status, or `unknown` for an unknown id.
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncryptedServiceKey {
    pub enc_service_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub project: String,
    pub new_owner_id: String,
    pub status: TransferOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub name: String,
    pub status: String,
    pub running_containers: usize,
    pub total_containers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminProjectsInfo {
    pub projects: Vec<ProjectInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminMember {
    pub user_id: String,
    pub role: Role,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminProjectMembers {
    pub project_name: String,
    pub project_id: TenantId,
    pub current_members: Vec<AdminMember>,
}

pub struct TenantService {
    store: Arc<dyn Bookkeeping>,
    cipher: Arc<SecretCipher>,
    dispatcher: Dispatcher,
    deprovisioner: Deprovisioner,
    fleet: FleetController,
    guards: TenantGuards,
    shared_token: Option<SecretString>,
    delete_password: Option<SecretString>,
}

fn forbidden(message: &str) -> OrchestratorError {
    OrchestratorError::Forbidden(message.to_string())
}

/// An empty configured secret counts as unset.
fn configured_secret(value: Option<&str>) -> Option<SecretString> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| SecretString::from(v.to_string()))
}

fn tenant_not_found(name: &str) -> OrchestratorError {
    OrchestratorError::NotFound(format!("project {name} not found"))
}

impl TenantService {
    /// Build the service and hand back the job report stream for
    /// [`run_reporter`](crate::dispatch::run_reporter).
    pub fn new(deps: ServiceDeps, config: &TenantryConfig) -> (Self, mpsc::UnboundedReceiver<JobReport>) {
        let docker = DockerCli::from_config(deps.runner.clone(), &config.runtime);
        let guards = TenantGuards::new();
        let provisioner = Arc::new(Provisioner::new(
            deps.store.clone(),
            deps.runner.clone(),
            deps.cipher.clone(),
            config.scripts.clone(),
        ));
        let (dispatcher, reports) = Dispatcher::new(
            provisioner,
            deps.store.clone(),
            guards.clone(),
            config.orchestrator.max_concurrent_jobs,
        );
        let deprovisioner = Deprovisioner::new(
            deps.store.clone(),
            deps.platform,
            deps.runner,
            docker.clone(),
            config.scripts.clone(),
            config.teardown.clone(),
        );
        let service = Self {
            store: deps.store,
            cipher: deps.cipher,
            dispatcher,
            deprovisioner,
            fleet: FleetController::new(docker, &config.runtime),
            guards,
            shared_token: configured_secret(config.secrets.shared_token.as_deref()),
            delete_password: configured_secret(config.secrets.delete_password.as_deref()),
        };
        (service, reports)
    }

    pub fn guards(&self) -> &TenantGuards {
        &self.guards
    }

    // ── Lookups and role checks ────────────────────────────────────

    async fn tenant(&self, name: &str) -> OrchestratorResult<TenantRecord> {
        self.store
            .get_tenant(name)
            .await?
            .ok_or_else(|| tenant_not_found(name))
    }

    async fn tenant_ci(&self, name: &str) -> OrchestratorResult<TenantRecord> {
        self.store
            .find_tenant_ci(name)
            .await?
            .ok_or_else(|| tenant_not_found(name))
    }

    async fn role_of(&self, tenant: &TenantRecord, caller: &Caller) -> OrchestratorResult<Option<Role>> {
        Ok(self.store.member_role(tenant.id, &caller.principal).await?)
    }

    async fn require_member(&self, tenant: &TenantRecord, caller: &Caller) -> OrchestratorResult<Role> {
        self.role_of(tenant, caller)
            .await?
            .ok_or_else(|| forbidden("not a member of this project"))
    }

    async fn require_admin(&self, tenant: &TenantRecord, caller: &Caller, message: &str) -> OrchestratorResult<()> {
        match self.role_of(tenant, caller).await? {
            Some(Role::Admin) => Ok(()),
            _ => Err(forbidden(message)),
        }
    }

    fn require_global_admin(caller: &Caller) -> OrchestratorResult<()> {
        if caller.is_global_admin() {
            Ok(())
        } else {
            Err(forbidden("system administrators only"))
        }
    }

    // ── Provisioning ───────────────────────────────────────────────

    async fn enqueue(&self, caller: &Caller, tenant: TenantSlug, kind: ProvisionKind) -> OrchestratorResult<JobTicket> {
        let job_id = Uuid::new_v4().to_string();
        self.store
            .create_tenant(&tenant, &caller.principal, &job_id)
            .await
            .map_err(|e| match e {
                tenantry_state::StateError::Conflict(_) => {
                    OrchestratorError::Conflict(format!("project {tenant} already exists"))
                }
                other => other.into(),
            })?;
        info!(%job_id, %tenant, owner = %caller.principal, kind = kind.label(), "job queued");

        self.dispatcher.dispatch(ProvisionRequest {
            job_id: job_id.clone(),
            tenant,
            owner: caller.principal.clone(),
            kind,
        });
        Ok(JobTicket {
            job_id,
            status: JobStatus::Queued,
        })
    }

    pub async fn create_tenant(&self, caller: &Caller, name: &str) -> OrchestratorResult<JobTicket> {
        let tenant = TenantSlug::parse(name)?;
        self.enqueue(caller, tenant, ProvisionKind::Create).await
    }

    pub async fn duplicate_tenant(
        &self,
        caller: &Caller,
        source: &str,
        dest: &str,
        copy_data: bool,
    ) -> OrchestratorResult<JobTicket> {
        let source = TenantSlug::parse(source)?;
        let dest = TenantSlug::parse(dest)?;

        let original = self.tenant(source.as_str()).await?;
        if self.role_of(&original, caller).await?.is_none() {
            return Err(forbidden("access to the source project denied"));
        }
        self.enqueue(caller, dest, ProvisionKind::Duplicate { source, copy_data })
            .await
    }

    /// Delete a tenant. The password is checked before anything else.
    pub async fn delete_tenant(&self, caller: &Caller, name: &str, password: Option<&str>) -> OrchestratorResult<DeleteReport> {
        let Some(expected) = &self.delete_password else {
            return Err(OrchestratorError::Configuration(
                "delete password not configured".to_string(),
            ));
        };
        if !secrets_match(password.unwrap_or_default(), Some(expected)) {
            return Err(forbidden("invalid delete password"));
        }
        let tenant = TenantSlug::parse(name)?;
        let Some(_guard) = self.guards.try_acquire(tenant.as_str()) else {
            return Err(OrchestratorError::Conflict(format!(
                "operation in progress for project {tenant}"
            )));
        };
        info!(%tenant, by = %caller.principal, "delete requested");
        Ok(self.deprovisioner.run(&tenant).await)
    }

    // ── Tenants and members ────────────────────────────────────────

    pub async fn list_tenants(&self, caller: &Caller) -> OrchestratorResult<Vec<TenantSummary>> {
        let mut summaries = Vec::new();
        for tenant in self.store.list_member_tenants(&caller.principal).await? {
            let Some(anon) = tenant.anon_key else { continue };
            summaries.push(TenantSummary {
                name: tenant.name,
                anon_token: self.cipher.decrypt(&anon)?,
            });
        }
        Ok(summaries)
    }

    pub async fn add_member(&self, caller: &Caller, tenant: &str, user: &str, role: Role) -> OrchestratorResult<()> {
        let user = user.trim();
        if user.is_empty() {
            return Err(OrchestratorError::Validation("user_id is required".to_string()));
        }
        let tenant = self.tenant(tenant).await?;
        self.require_admin(&tenant, caller, "only admins can add members").await?;
        if self.store.add_member(tenant.id, user, role).await? {
            info!(tenant = %tenant.name, user, %role, "member added");
        }
        Ok(())
    }

    pub async fn list_members(&self, caller: &Caller, tenant: &str) -> OrchestratorResult<Vec<MemberView>> {
        let tenant = self.tenant_ci(tenant).await?;
        self.require_member(&tenant, caller).await?;
        Ok(self
            .store
            .list_members(tenant.id)
            .await?
            .into_iter()
            .map(|m| MemberView {
                user_id: m.user_id,
                role: m.role,
            })
            .collect())
    }

    pub async fn remove_member(&self, caller: &Caller, tenant: &str, user: &str) -> OrchestratorResult<()> {
        let tenant = self.tenant_ci(tenant).await?;
        self.require_admin(&tenant, caller, "only admins can remove members").await?;
        if self.store.remove_member(tenant.id, user).await? {
            info!(tenant = %tenant.name, user, "member removed");
        }
        Ok(())
    }

    pub async fn job_status(&self, job_id: &str) -> OrchestratorResult<JobStatusView> {
        let status = self.store.job_status(job_id).await?;
        Ok(JobStatusView {
            job_id: job_id.to_string(),
            status: status.map_or("unknown", |s| s.as_str()).to_string(),
        })
    }

    /// The privileged credential, still encrypted, for internal callers
    /// presenting the shared token.
    pub async fn encrypted_service_key(&self, tenant: &str, token: Option<&str>) -> OrchestratorResult<EncryptedServiceKey> {
        if !secrets_match(token.unwrap_or_default(), self.shared_token.as_ref()) {
            return Err(forbidden("forbidden"));
        }
        let tenant = self.tenant(tenant).await?;
        Ok(EncryptedServiceKey {
            enc_service_key: tenant.service_role,
        })
    }

    // ── Fleet ──────────────────────────────────────────────────────

    pub async fn fleet_status(&self, caller: &Caller, tenant: &str) -> OrchestratorResult<StatusReport> {
        let tenant = self.tenant(tenant).await?;
        if !caller.is_global_admin() {
            self.require_member(&tenant, caller).await?;
        }
        Ok(self.fleet.inspector().status(&tenant.name).await?)
    }

    async fn require_operator(&self, caller: &Caller, tenant: &str) -> OrchestratorResult<TenantRecord> {
        let tenant = self.tenant(tenant).await?;
        if !caller.is_global_admin() {
            self.require_admin(&tenant, caller, "project admin or system administrator required")
                .await?;
        }
        Ok(tenant)
    }

    pub async fn start(&self, caller: &Caller, tenant: &str) -> OrchestratorResult<LifecycleReport> {
        let tenant = self.require_operator(caller, tenant).await?;
        Ok(self.fleet.start(&tenant.name).await?)
    }

    pub async fn stop(&self, caller: &Caller, tenant: &str) -> OrchestratorResult<LifecycleReport> {
        let tenant = self.require_operator(caller, tenant).await?;
        Ok(self.fleet.stop(&tenant.name).await?)
    }

    pub async fn restart(&self, caller: &Caller, tenant: &str) -> OrchestratorResult<LifecycleReport> {
        let tenant = self.require_operator(caller, tenant).await?;
        Ok(self.fleet.restart(&tenant.name).await?)
    }

    pub async fn logs(
        &self,
        caller: &Caller,
        tenant: &str,
        service: &str,
        lines: Option<u32>,
    ) -> OrchestratorResult<LogTail> {
        let tenant = self.tenant(tenant).await?;
        self.require_member(&tenant, caller).await?;
        Ok(self.fleet.logs(&tenant.name, service, lines).await?)
    }

    // ── System administration ──────────────────────────────────────

    pub async fn transfer_ownership(&self, caller: &Caller, tenant: &str, new_owner: &str) -> OrchestratorResult<TransferReceipt> {
        Self::require_global_admin(caller)?;
        let new_owner = new_owner.trim().to_lowercase();
        if new_owner.is_empty() {
            return Err(OrchestratorError::Validation("new_owner_id is required".to_string()));
        }
        let outcome = self
            .store
            .transfer_ownership(tenant, &new_owner)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    tenant_not_found(tenant)
                } else {
                    e.into()
                }
            })?;
        info!(tenant, %new_owner, ?outcome, by = %caller.principal, "ownership transfer");
        Ok(TransferReceipt {
            project: tenant.to_string(),
            new_owner_id: new_owner,
            status: outcome,
            detail: (outcome == TransferOutcome::Noop).then(|| "already the owner".to_string()),
        })
    }

    pub async fn admin_projects_info(&self, caller: &Caller, user_id: &str) -> OrchestratorResult<AdminProjectsInfo> {
        Self::require_global_admin(caller)?;
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(OrchestratorError::Validation("user_id is required".to_string()));
        }
        let mut projects = Vec::new();
        for tenant in self.store.list_admin_tenants(user_id).await? {
            let report = self.fleet.inspector().status(&tenant.name).await?;
            projects.push(ProjectInfo {
                name: tenant.name,
                status: report.status.as_str().to_string(),
                running_containers: report.running,
                total_containers: report.total,
            });
        }
        Ok(AdminProjectsInfo { projects })
    }

    pub async fn admin_project_members(&self, caller: &Caller, tenant: &str) -> OrchestratorResult<AdminProjectMembers> {
        Self::require_global_admin(caller)?;
        let tenant = self.tenant_ci(tenant).await?;
        let current_members = self
            .store
            .list_members(tenant.id)
            .await?
            .into_iter()
            .map(|m| AdminMember {
                user_id: m.user_id,
                role: m.role,
                status: "member",
            })
            .collect();
        Ok(AdminProjectMembers {
            project_name: tenant.name,
            project_id: tenant.id,
            current_members,
        })
    }
}
