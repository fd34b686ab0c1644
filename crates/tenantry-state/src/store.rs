//! StateStore — redb-backed bookkeeping for single-node deployments.
//!
//! Provides the same operations as the Postgres store over three tables
//! (tenants, members, jobs). All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tenantry_core::{Role, TenantSlug};
use tracing::{debug, info};

use crate::bookkeeping::Bookkeeping;
use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Decode every row whose key starts with `prefix` (all rows for `""`).
fn scan_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<(String, T)>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((key.value().to_string(), record));
        }
    }
    Ok(results)
}

/// Thread-safe bookkeeping store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        info!(?path, "bookkeeping store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory bookkeeping store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TENANTS).map_err(map_err!(Table))?;
        txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Tenants ────────────────────────────────────────────────────

    pub fn get_tenant(&self, name: &str) -> StateResult<Option<TenantRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TENANTS).map_err(map_err!(Table))?;
        get_json(&table, name)
    }

    /// Slugs are stored lowercase, so a case-insensitive lookup is a lookup
    /// of the lowercased name.
    pub fn find_tenant_ci(&self, name: &str) -> StateResult<Option<TenantRecord>> {
        self.get_tenant(&name.to_lowercase())
    }

    pub fn create_tenant(
        &self,
        slug: &TenantSlug,
        owner: &str,
        job_id: &str,
    ) -> StateResult<TenantRecord> {
        let now = Utc::now();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let tenant;
        {
            let mut tenants = txn.open_table(TENANTS).map_err(map_err!(Table))?;
            if tenants.get(slug.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("tenant {slug}")));
            }

            let mut seqs = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let next = seqs
                .get(TENANT_ID_SEQ)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            seqs.insert(TENANT_ID_SEQ, next).map_err(map_err!(Write))?;

            tenant = TenantRecord {
                id: next as TenantId,
                name: slug.to_string(),
                owner_id: owner.to_string(),
                anon_key: None,
                service_role: None,
                created_at: now,
            };
            tenants
                .insert(slug.as_str(), encode(&tenant)?.as_slice())
                .map_err(map_err!(Write))?;

            let member = MemberRecord {
                tenant_id: tenant.id,
                user_id: owner.to_string(),
                role: Role::Admin,
            };
            let mut members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            members
                .insert(
                    member_key(tenant.id, owner).as_str(),
                    encode(&member)?.as_slice(),
                )
                .map_err(map_err!(Write))?;

            let job = JobRecord {
                job_id: job_id.to_string(),
                project: slug.to_string(),
                owner_id: owner.to_string(),
                status: JobStatus::Queued,
                created_at: now,
                updated_at: now,
            };
            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            jobs.insert(job_id, encode(&job)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(tenant = %slug, %owner, %job_id, "tenant created");
        Ok(tenant)
    }

    pub fn store_credentials(
        &self,
        name: &str,
        owner: &str,
        anon_key: &str,
        service_role: &str,
    ) -> StateResult<CredentialUpdate> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TENANTS).map_err(map_err!(Table))?;
            let Some(mut tenant) = get_json::<TenantRecord>(&table, name)? else {
                return Ok(CredentialUpdate::NoMatch);
            };
            if tenant.owner_id != owner {
                return Ok(CredentialUpdate::NoMatch);
            }
            tenant.anon_key = Some(anon_key.to_string());
            tenant.service_role = Some(service_role.to_string());
            table
                .insert(name, encode(&tenant)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(CredentialUpdate::Stored)
    }

    /// Tenants on which `principal` holds a membership matching `filter`.
    fn tenants_where(
        &self,
        principal: &str,
        filter: impl Fn(&MemberRecord) -> bool,
    ) -> StateResult<Vec<TenantRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        let ids: HashSet<TenantId> = scan_json::<MemberRecord>(&members, "")?
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| m.user_id == principal && filter(m))
            .map(|m| m.tenant_id)
            .collect();

        let tenants = txn.open_table(TENANTS).map_err(map_err!(Table))?;
        Ok(scan_json::<TenantRecord>(&tenants, "")?
            .into_iter()
            .map(|(_, t)| t)
            .filter(|t| ids.contains(&t.id))
            .collect())
    }

    pub fn list_member_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>> {
        let mut tenants = self.tenants_where(principal, |_| true)?;
        tenants.retain(|t| t.anon_key.is_some());
        Ok(tenants)
    }

    pub fn list_admin_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>> {
        self.tenants_where(principal, |m| m.role == Role::Admin)
    }

    // ── Members ────────────────────────────────────────────────────

    pub fn member_role(&self, tenant_id: TenantId, principal: &str) -> StateResult<Option<Role>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        let member: Option<MemberRecord> = get_json(&table, &member_key(tenant_id, principal))?;
        Ok(member.map(|m| m.role))
    }

    pub fn add_member(&self, tenant_id: TenantId, principal: &str, role: Role) -> StateResult<bool> {
        let key = member_key(tenant_id, principal);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Ok(false);
            }
            let member = MemberRecord {
                tenant_id,
                user_id: principal.to_string(),
                role,
            };
            table
                .insert(key.as_str(), encode(&member)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    pub fn list_members(&self, tenant_id: TenantId) -> StateResult<Vec<MemberRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        Ok(scan_json(&table, &member_prefix(tenant_id))?
            .into_iter()
            .map(|(_, m)| m)
            .collect())
    }

    pub fn remove_member(&self, tenant_id: TenantId, principal: &str) -> StateResult<bool> {
        let key = member_key(tenant_id, principal);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            existed = table
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    pub fn transfer_ownership(&self, name: &str, new_owner: &str) -> StateResult<TransferOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut tenants = txn.open_table(TENANTS).map_err(map_err!(Table))?;
            let Some(mut tenant) = get_json::<TenantRecord>(&tenants, name)? else {
                return Err(StateError::NotFound(format!("tenant {name}")));
            };
            if tenant.owner_id == new_owner {
                return Ok(TransferOutcome::Noop);
            }
            let previous = std::mem::replace(&mut tenant.owner_id, new_owner.to_string());
            tenants
                .insert(name, encode(&tenant)?.as_slice())
                .map_err(map_err!(Write))?;

            let mut members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            let admin = MemberRecord {
                tenant_id: tenant.id,
                user_id: new_owner.to_string(),
                role: Role::Admin,
            };
            members
                .insert(
                    member_key(tenant.id, new_owner).as_str(),
                    encode(&admin)?.as_slice(),
                )
                .map_err(map_err!(Write))?;

            let previous_key = member_key(tenant.id, &previous);
            let prior: Option<MemberRecord> = get_json(&members, &previous_key)?;
            if let Some(mut prior) = prior.filter(|m| m.role == Role::Admin) {
                prior.role = Role::Member;
                members
                    .insert(previous_key.as_str(), encode(&prior)?.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(tenant = %name, %new_owner, "ownership transferred");
        Ok(TransferOutcome::Transferred)
    }

    pub fn purge_tenant(&self, name: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut tenants = txn.open_table(TENANTS).map_err(map_err!(Table))?;
            let tenant: Option<TenantRecord> = get_json(&tenants, name)?;

            if let Some(tenant) = &tenant {
                let mut members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
                let keys: Vec<String> = scan_json::<MemberRecord>(&members, &member_prefix(tenant.id))?
                    .into_iter()
                    .map(|(k, _)| k)
                    .collect();
                for key in &keys {
                    members.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }

            let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let job_keys: Vec<String> = scan_json::<JobRecord>(&jobs, "")?
                .into_iter()
                .filter(|(_, job)| job.project == name)
                .map(|(k, _)| k)
                .collect();
            for key in &job_keys {
                jobs.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            tenants.remove(name).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(tenant = %name, "bookkeeping rows purged");
        Ok(())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn set_job_status(&self, job_id: &str, status: JobStatus) -> StateResult<StatusChange> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let change;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let Some(mut job) = get_json::<JobRecord>(&table, job_id)? else {
                return Err(StateError::NotFound(format!("job {job_id}")));
            };
            change = check_transition(job.status, status)?;
            if change == StatusChange::Unchanged {
                return Ok(change);
            }
            job.status = status;
            job.updated_at = Utc::now();
            table
                .insert(job_id, encode(&job)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(change)
    }

    pub fn get_job(&self, job_id: &str) -> StateResult<Option<JobRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        get_json(&table, job_id)
    }
}

#[async_trait]
impl Bookkeeping for StateStore {
    async fn get_tenant(&self, name: &str) -> StateResult<Option<TenantRecord>> {
        StateStore::get_tenant(self, name)
    }

    async fn find_tenant_ci(&self, name: &str) -> StateResult<Option<TenantRecord>> {
        StateStore::find_tenant_ci(self, name)
    }

    async fn create_tenant(
        &self,
        slug: &TenantSlug,
        owner: &str,
        job_id: &str,
    ) -> StateResult<TenantRecord> {
        StateStore::create_tenant(self, slug, owner, job_id)
    }

    async fn store_credentials(
        &self,
        name: &str,
        owner: &str,
        anon_key: &str,
        service_role: &str,
    ) -> StateResult<CredentialUpdate> {
        StateStore::store_credentials(self, name, owner, anon_key, service_role)
    }

    async fn list_member_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>> {
        StateStore::list_member_tenants(self, principal)
    }

    async fn list_admin_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>> {
        StateStore::list_admin_tenants(self, principal)
    }

    async fn member_role(&self, tenant_id: TenantId, principal: &str) -> StateResult<Option<Role>> {
        StateStore::member_role(self, tenant_id, principal)
    }

    async fn add_member(
        &self,
        tenant_id: TenantId,
        principal: &str,
        role: Role,
    ) -> StateResult<bool> {
        StateStore::add_member(self, tenant_id, principal, role)
    }

    async fn list_members(&self, tenant_id: TenantId) -> StateResult<Vec<MemberRecord>> {
        StateStore::list_members(self, tenant_id)
    }

    async fn remove_member(&self, tenant_id: TenantId, principal: &str) -> StateResult<bool> {
        StateStore::remove_member(self, tenant_id, principal)
    }

    async fn transfer_ownership(
        &self,
        name: &str,
        new_owner: &str,
    ) -> StateResult<TransferOutcome> {
        StateStore::transfer_ownership(self, name, new_owner)
    }

    async fn purge_tenant(&self, name: &str) -> StateResult<()> {
        StateStore::purge_tenant(self, name)
    }

    async fn set_job_status(&self, job_id: &str, status: JobStatus) -> StateResult<StatusChange> {
        StateStore::set_job_status(self, job_id, status)
    }

    async fn get_job(&self, job_id: &str) -> StateResult<Option<JobRecord>> {
        StateStore::get_job(self, job_id)
    }
}
