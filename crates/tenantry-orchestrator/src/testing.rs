//! Fakes for driving workflows without docker or Postgres.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tenantry_core::{Role, TenantSlug, TenantryConfig};
use tenantry_secrets::SecretCipher;
use tenantry_state::{
    Bookkeeping, CredentialUpdate, JobRecord, JobStatus, MemberRecord, PlatformDb, StateError,
    StateResult, StateStore, StatusChange, TenantId, TenantRecord, TransferOutcome,
};

pub use tenantry_runtime::testing::{ScriptedRunner, ps_line};

use crate::dispatch::JobReport;
use crate::error::OrchestratorResult;
use crate::service::{ServiceDeps, TenantService};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    active_pid: Option<i32>,
    /// Whether terminating the holder actually frees the slot.
    releases: bool,
}

#[derive(Debug, Default)]
struct PlatformState {
    slots: HashMap<String, Slot>,
    databases: HashSet<String>,
    connections: HashMap<String, i64>,
    sticky_connections: bool,
    failures: HashMap<String, String>,
}

/// In-memory [`PlatformDb`] that records every call in order.
///
/// Calls are recorded as `"<operation> <argument>"`, e.g.
/// `"drop_replication_slot supabase_realtime_messages_replication_slot_demo"`.
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    state: Mutex<PlatformState>,
    calls: Mutex<Vec<String>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// A replication slot, optionally held by backend `pid`.
    pub fn with_slot(&self, slot: &str, pid: Option<i32>) -> &Self {
        lock(&self.state).slots.insert(
            slot.to_string(),
            Slot {
                active_pid: pid,
                releases: true,
            },
        );
        self
    }

    /// A slot whose holder survives termination.
    pub fn with_stuck_slot(&self, slot: &str, pid: i32) -> &Self {
        lock(&self.state).slots.insert(
            slot.to_string(),
            Slot {
                active_pid: Some(pid),
                releases: false,
            },
        );
        self
    }

    pub fn with_database(&self, database: &str, connections: i64) -> &Self {
        let mut state = lock(&self.state);
        state.databases.insert(database.to_string());
        state.connections.insert(database.to_string(), connections);
        self
    }

    /// Connections survive `terminate_connections`.
    pub fn with_sticky_connections(&self) -> &Self {
        lock(&self.state).sticky_connections = true;
        self
    }

    /// Make `operation` fail with a database error.
    pub fn fail(&self, operation: &str, message: &str) -> &Self {
        lock(&self.state)
            .failures
            .insert(operation.to_string(), message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Index of the first recorded call containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        lock(&self.calls).iter().position(|c| c.contains(pattern))
    }

    pub fn has_slot(&self, slot: &str) -> bool {
        lock(&self.state).slots.contains_key(slot)
    }

    fn record(&self, operation: &str, argument: impl std::fmt::Display) -> StateResult<()> {
        lock(&self.calls).push(format!("{operation} {argument}"));
        match lock(&self.state).failures.get(operation) {
            Some(message) => Err(StateError::Database(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformDb for RecordingPlatform {
    async fn delete_realtime_rows(&self, tenant: &str) -> StateResult<()> {
        self.record("delete_realtime_rows", tenant)
    }

    async fn delete_pooler_rows(&self, tenant: &str) -> StateResult<()> {
        self.record("delete_pooler_rows", tenant)
    }

    async fn slot_active_pid(&self, slot: &str) -> StateResult<Option<i32>> {
        self.record("slot_active_pid", slot)?;
        Ok(lock(&self.state).slots.get(slot).and_then(|s| s.active_pid))
    }

    async fn terminate_backend(&self, pid: i32) -> StateResult<()> {
        self.record("terminate_backend", pid)?;
        for slot in lock(&self.state).slots.values_mut() {
            if slot.active_pid == Some(pid) && slot.releases {
                slot.active_pid = None;
            }
        }
        Ok(())
    }

    async fn drop_replication_slot(&self, slot: &str) -> StateResult<()> {
        self.record("drop_replication_slot", slot)?;
        match lock(&self.state).slots.remove(slot) {
            Some(_) => Ok(()),
            None => Err(StateError::NotFound(format!(
                "replication slot \"{slot}\" does not exist"
            ))),
        }
    }

    async fn terminate_connections(&self, database: &str) -> StateResult<u64> {
        self.record("terminate_connections", database)?;
        let mut state = lock(&self.state);
        let sticky = state.sticky_connections;
        let open = state.connections.entry(database.to_string()).or_default();
        let terminated = (*open).max(0) as u64;
        if !sticky {
            *open = 0;
        }
        Ok(terminated)
    }

    async fn connection_count(&self, database: &str) -> StateResult<i64> {
        self.record("connection_count", database)?;
        Ok(lock(&self.state)
            .connections
            .get(database)
            .copied()
            .unwrap_or_default())
    }

    async fn drop_database(&self, database: &str) -> StateResult<()> {
        self.record("drop_database", database)?;
        let mut state = lock(&self.state);
        state.databases.remove(database);
        state.connections.remove(database);
        Ok(())
    }

    async fn database_exists(&self, database: &str) -> StateResult<bool> {
        self.record("database_exists", database)?;
        Ok(lock(&self.state).databases.contains(database))
    }
}

/// [`Bookkeeping`] wrapper whose job status writes can be made to fail.
///
/// Each armed status fails exactly once with `StateError::Database`; every
/// other call goes to the wrapped store.
pub struct FlakyLedger {
    inner: Arc<dyn Bookkeeping>,
    failing: Mutex<Vec<JobStatus>>,
}

impl FlakyLedger {
    pub fn new(inner: Arc<dyn Bookkeeping>) -> Self {
        Self {
            inner,
            failing: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next write of `status`.
    pub fn fail_once(&self, status: JobStatus) -> &Self {
        lock(&self.failing).push(status);
        self
    }

    fn take_failure(&self, status: JobStatus) -> bool {
        let mut failing = lock(&self.failing);
        match failing.iter().position(|s| *s == status) {
            Some(index) => {
                failing.remove(index);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Bookkeeping for FlakyLedger {
    async fn get_tenant(&self, name: &str) -> StateResult<Option<TenantRecord>> {
        self.inner.get_tenant(name).await
    }

    async fn find_tenant_ci(&self, name: &str) -> StateResult<Option<TenantRecord>> {
        self.inner.find_tenant_ci(name).await
    }

    async fn create_tenant(
        &self,
        slug: &TenantSlug,
        owner: &str,
        job_id: &str,
    ) -> StateResult<TenantRecord> {
        self.inner.create_tenant(slug, owner, job_id).await
    }

    async fn store_credentials(
        &self,
        name: &str,
        owner: &str,
        anon_key: &str,
        service_role: &str,
    ) -> StateResult<CredentialUpdate> {
        self.inner
            .store_credentials(name, owner, anon_key, service_role)
            .await
    }

    async fn list_member_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>> {
        self.inner.list_member_tenants(principal).await
    }

    async fn list_admin_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>> {
        self.inner.list_admin_tenants(principal).await
    }

    async fn member_role(&self, tenant_id: TenantId, principal: &str) -> StateResult<Option<Role>> {
        self.inner.member_role(tenant_id, principal).await
    }

    async fn add_member(
        &self,
        tenant_id: TenantId,
        principal: &str,
        role: Role,
    ) -> StateResult<bool> {
        self.inner.add_member(tenant_id, principal, role).await
    }

    async fn list_members(&self, tenant_id: TenantId) -> StateResult<Vec<MemberRecord>> {
        self.inner.list_members(tenant_id).await
    }

    async fn remove_member(&self, tenant_id: TenantId, principal: &str) -> StateResult<bool> {
        self.inner.remove_member(tenant_id, principal).await
    }

    async fn transfer_ownership(
        &self,
        name: &str,
        new_owner: &str,
    ) -> StateResult<TransferOutcome> {
        self.inner.transfer_ownership(name, new_owner).await
    }

    async fn purge_tenant(&self, name: &str) -> StateResult<()> {
        self.inner.purge_tenant(name).await
    }

    async fn set_job_status(&self, job_id: &str, status: JobStatus) -> StateResult<StatusChange> {
        if self.take_failure(status) {
            return Err(StateError::Database("connection reset".to_string()));
        }
        self.inner.set_job_status(job_id, status).await
    }

    async fn get_job(&self, job_id: &str) -> StateResult<Option<JobRecord>> {
        self.inner.get_job(job_id).await
    }
}

pub const TEST_DELETE_PASSWORD: &str = "delete-me";
pub const TEST_SHARED_TOKEN: &str = "shared-token";

/// Configuration with every blind delay set to zero and short poll budgets.
pub fn test_config() -> TenantryConfig {
    let mut config = TenantryConfig::default();
    config.secrets.encryption_key = Some(SecretCipher::generate_key());
    config.secrets.shared_token = Some(TEST_SHARED_TOKEN.to_string());
    config.secrets.delete_password = Some(TEST_DELETE_PASSWORD.to_string());
    config.runtime.start_stagger_ms = 0;
    config.teardown.settle_delay_ms = 0;
    config.teardown.connection_drain_timeout_ms = 200;
    config.teardown.slot_release_timeout_ms = 200;
    config.teardown.poll_interval_ms = 10;
    config
}

/// A [`TenantService`] over an in-memory store and recording fakes.
pub struct Harness {
    pub service: Arc<TenantService>,
    pub store: Arc<StateStore>,
    pub runner: Arc<ScriptedRunner>,
    pub platform: Arc<RecordingPlatform>,
    pub cipher: Arc<SecretCipher>,
    pub reports: tokio::sync::mpsc::UnboundedReceiver<JobReport>,
}

impl Harness {
    pub fn new() -> OrchestratorResult<Self> {
        Self::with_config(test_config())
    }

    pub fn with_config(config: TenantryConfig) -> OrchestratorResult<Self> {
        let store = Arc::new(StateStore::open_in_memory()?);
        let runner = Arc::new(ScriptedRunner::new());
        let platform = Arc::new(RecordingPlatform::new());
        let cipher = Arc::new(SecretCipher::from_config(
            config.secrets.encryption_key.as_deref(),
        )?);
        let (service, reports) = TenantService::new(
            ServiceDeps {
                store: store.clone(),
                platform: platform.clone(),
                runner: runner.clone(),
                cipher: cipher.clone(),
            },
            &config,
        );
        Ok(Self {
            service: Arc::new(service),
            store,
            runner,
            platform,
            cipher,
            reports,
        })
    }

    /// Make the token extraction script print both credentials.
    pub fn script_tokens(&self, anon: &str, service_role: &str) {
        self.runner.on_ok(
            "extract_token.sh",
            &format!("ANON_KEY_PROJETO={anon}\nSERVICE_ROLE_KEY_PROJETO={service_role}\n"),
        );
    }
}

/// Poll the ledger until `job_id` reaches a terminal status.
pub async fn wait_for_job(store: &dyn Bookkeeping, job_id: &str) -> Option<JobStatus> {
    for _ in 0..500 {
        match store.job_status(job_id).await {
            Ok(Some(status)) if status.is_terminal() => return Some(status),
            Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(_) => return None,
        }
    }
    None
}
