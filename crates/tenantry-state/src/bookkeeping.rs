//! The bookkeeping seam: tenants, memberships and the job ledger.
//!
//! Two implementations exist: [`StateStore`](crate::StateStore) (embedded
//! redb) and [`PgStore`](crate::PgStore) (Postgres). Every method that
//! touches more than one record is atomic in both.

use async_trait::async_trait;
use tenantry_core::{Role, TenantSlug};

use crate::error::StateResult;
use crate::types::*;

#[async_trait]
pub trait Bookkeeping: Send + Sync {
    /// Look up a tenant by exact slug.
    async fn get_tenant(&self, name: &str) -> StateResult<Option<TenantRecord>>;

    /// Look up a tenant ignoring case.
    async fn find_tenant_ci(&self, name: &str) -> StateResult<Option<TenantRecord>>;

    /// Insert the tenant row, the owner's admin membership and a `queued` job
    /// in one transaction. Fails with `Conflict` if the slug is taken.
    async fn create_tenant(
        &self,
        slug: &TenantSlug,
        owner: &str,
        job_id: &str,
    ) -> StateResult<TenantRecord>;

    /// Store encrypted credentials on the tenant row matching slug and owner.
    async fn store_credentials(
        &self,
        name: &str,
        owner: &str,
        anon_key: &str,
        service_role: &str,
    ) -> StateResult<CredentialUpdate>;

    /// Tenants where `principal` is a member and the anonymous credential
    /// has been stored.
    async fn list_member_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>>;

    /// Tenants where `principal` has the admin role.
    async fn list_admin_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>>;

    async fn member_role(&self, tenant_id: TenantId, principal: &str) -> StateResult<Option<Role>>;

    /// Add a membership. Returns `false` if it already existed (unchanged).
    async fn add_member(&self, tenant_id: TenantId, principal: &str, role: Role)
    -> StateResult<bool>;

    async fn list_members(&self, tenant_id: TenantId) -> StateResult<Vec<MemberRecord>>;

    /// Remove a membership. Returns `false` if there was none.
    async fn remove_member(&self, tenant_id: TenantId, principal: &str) -> StateResult<bool>;

    /// Make `new_owner` the owner and an admin, demoting the prior owner to
    /// member if they are still admin. One transaction; `NotFound` if the
    /// tenant does not exist.
    async fn transfer_ownership(&self, name: &str, new_owner: &str)
    -> StateResult<TransferOutcome>;

    /// Delete the tenant's memberships, jobs and tenant row.
    async fn purge_tenant(&self, name: &str) -> StateResult<()>;

    /// Move a job to `status`. See [`check_transition`].
    async fn set_job_status(&self, job_id: &str, status: JobStatus) -> StateResult<StatusChange>;

    async fn get_job(&self, job_id: &str) -> StateResult<Option<JobRecord>>;

    async fn job_status(&self, job_id: &str) -> StateResult<Option<JobStatus>> {
        Ok(self.get_job(job_id).await?.map(|job| job.status))
    }
}
