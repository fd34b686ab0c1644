//! PostgreSQL bookkeeping store.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tenantry_core::config::DatabaseConfig;
use tenantry_core::{Role, TenantSlug};
use tracing::{debug, info};

use crate::bookkeeping::Bookkeeping;
use crate::error::{StateError, StateResult};
use crate::types::*;

/// Bookkeeping schema (embedded).
const SCHEMA: &str = include_str!("schema.sql");

/// Split the schema into single statements; Postgres rejects multiple
/// statements in one prepared query.
fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Open a connection pool sized from the database config.
pub async fn connect_pool(dsn: &str, config: &DatabaseConfig) -> StateResult<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(dsn)
        .await
        .map_err(|e| StateError::Open(e.to_string()))?;
    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct MemberRow {
    project_id: i64,
    user_id: String,
    role: String,
}

impl TryFrom<MemberRow> for MemberRecord {
    type Error = StateError;

    fn try_from(row: MemberRow) -> StateResult<Self> {
        Ok(MemberRecord {
            tenant_id: row.project_id,
            user_id: row.user_id,
            role: parse_role(&row.role)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    project: String,
    owner_id: String,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StateError;

    fn try_from(row: JobRow) -> StateResult<Self> {
        Ok(JobRecord {
            job_id: row.job_id,
            project: row.project,
            owner_id: row.owner_id,
            status: parse_status(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_role(raw: &str) -> StateResult<Role> {
    raw.parse().map_err(StateError::Deserialize)
}

fn parse_status(raw: &str) -> StateResult<JobStatus> {
    raw.parse().map_err(StateError::Deserialize)
}

const TENANT_COLUMNS: &str = "id, name, owner_id, anon_key, service_role, created_at";

/// Postgres-backed bookkeeping store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and create the schema if absent.
    pub async fn connect(dsn: &str, config: &DatabaseConfig) -> StateResult<Self> {
        let store = Self::from_pool(connect_pool(dsn, config).await?);
        store.migrate().await?;
        info!(
            max_connections = config.max_connections,
            "postgres bookkeeping store ready"
        );
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StateResult<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("bookkeeping schema ensured");
        Ok(())
    }
}

#[async_trait]
impl Bookkeeping for PgStore {
    async fn get_tenant(&self, name: &str) -> StateResult<Option<TenantRecord>> {
        let row = sqlx::query_as::<_, TenantRecord>(&format!(
            "SELECT {TENANT_COLUMNS} FROM projects WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_tenant_ci(&self, name: &str) -> StateResult<Option<TenantRecord>> {
        let row = sqlx::query_as::<_, TenantRecord>(&format!(
            "SELECT {TENANT_COLUMNS} FROM projects WHERE lower(name) = lower($1)"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_tenant(
        &self,
        slug: &TenantSlug,
        owner: &str,
        job_id: &str,
    ) -> StateResult<TenantRecord> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM projects WHERE name = $1")
            .bind(slug.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Err(StateError::Conflict(format!("tenant {slug}")));
        }

        // A concurrent insert of the same slug still fails on the unique
        // constraint and surfaces as `Conflict`.
        let tenant = sqlx::query_as::<_, TenantRecord>(&format!(
            "INSERT INTO projects (name, owner_id) VALUES ($1, $2) RETURNING {TENANT_COLUMNS}"
        ))
        .bind(slug.as_str())
        .bind(owner)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO project_members (project_id, user_id, role) VALUES ($1, $2, $3)")
            .bind(tenant.id)
            .bind(owner)
            .bind(Role::Admin.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO jobs (job_id, project, owner_id, status) VALUES ($1, $2, $3, $4)")
            .bind(job_id)
            .bind(slug.as_str())
            .bind(owner)
            .bind(JobStatus::Queued.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(tenant = %slug, %owner, %job_id, "tenant created");
        Ok(tenant)
    }

    async fn store_credentials(
        &self,
        name: &str,
        owner: &str,
        anon_key: &str,
        service_role: &str,
    ) -> StateResult<CredentialUpdate> {
        let result = sqlx::query(
            "UPDATE projects SET anon_key = $1, service_role = $2 WHERE name = $3 AND owner_id = $4",
        )
        .bind(anon_key)
        .bind(service_role)
        .bind(name)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(CredentialUpdate::NoMatch)
        } else {
            Ok(CredentialUpdate::Stored)
        }
    }

    async fn list_member_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>> {
        let rows = sqlx::query_as::<_, TenantRecord>(
            r#"
            SELECT p.id, p.name, p.owner_id, p.anon_key, p.service_role, p.created_at
            FROM projects p
            JOIN project_members m ON p.id = m.project_id
            WHERE m.user_id = $1 AND p.anon_key IS NOT NULL
            ORDER BY p.name
            "#,
        )
        .bind(principal)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_admin_tenants(&self, principal: &str) -> StateResult<Vec<TenantRecord>> {
        let rows = sqlx::query_as::<_, TenantRecord>(
            r#"
            SELECT p.id, p.name, p.owner_id, p.anon_key, p.service_role, p.created_at
            FROM projects p
            JOIN project_members m ON p.id = m.project_id
            WHERE m.user_id = $1 AND m.role = 'admin'
            ORDER BY p.name
            "#,
        )
        .bind(principal)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn member_role(&self, tenant_id: TenantId, principal: &str) -> StateResult<Option<Role>> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM project_members WHERE project_id = $1 AND user_id = $2",
        )
        .bind(tenant_id)
        .bind(principal)
        .fetch_optional(&self.pool)
        .await?;
        role.as_deref().map(parse_role).transpose()
    }

    async fn add_member(
        &self,
        tenant_id: TenantId,
        principal: &str,
        role: Role,
    ) -> StateResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO project_members (project_id, user_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id, user_id) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(principal)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_members(&self, tenant_id: TenantId) -> StateResult<Vec<MemberRecord>> {
        let rows = sqlx::query_as::<_, MemberRow>(
            "SELECT project_id, user_id, role FROM project_members WHERE project_id = $1 ORDER BY user_id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MemberRecord::try_from).collect()
    }

    async fn remove_member(&self, tenant_id: TenantId, principal: &str) -> StateResult<bool> {
        let result =
            sqlx::query("DELETE FROM project_members WHERE project_id = $1 AND user_id = $2")
                .bind(tenant_id)
                .bind(principal)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transfer_ownership(
        &self,
        name: &str,
        new_owner: &str,
    ) -> StateResult<TransferOutcome> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, owner_id FROM projects WHERE name = $1 FOR UPDATE")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((tenant_id, current_owner)) = row else {
            return Err(StateError::NotFound(format!("tenant {name}")));
        };
        if current_owner == new_owner {
            return Ok(TransferOutcome::Noop);
        }

        sqlx::query("UPDATE projects SET owner_id = $1 WHERE id = $2")
            .bind(new_owner)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO project_members (project_id, user_id, role)
            VALUES ($1, $2, 'admin')
            ON CONFLICT (project_id, user_id) DO UPDATE SET role = 'admin'
            "#,
        )
        .bind(tenant_id)
        .bind(new_owner)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE project_members SET role = 'member'
            WHERE project_id = $1 AND user_id = $2 AND role = 'admin'
            "#,
        )
        .bind(tenant_id)
        .bind(&current_owner)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(tenant = %name, %new_owner, previous = %current_owner, "ownership transferred");
        Ok(TransferOutcome::Transferred)
    }

    async fn purge_tenant(&self, name: &str) -> StateResult<()> {
        let mut tx = self.pool.begin().await?;

        let tenant_id: Option<i64> = sqlx::query_scalar("SELECT id FROM projects WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(tenant_id) = tenant_id {
            sqlx::query("DELETE FROM project_members WHERE project_id = $1")
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM jobs WHERE project = $1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM projects WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_job_status(&self, job_id: &str, status: JobStatus) -> StateResult<StatusChange> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE job_id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Err(StateError::NotFound(format!("job {job_id}")));
        };

        let change = check_transition(parse_status(&current)?, status)?;
        if change == StatusChange::Applied {
            sqlx::query("UPDATE jobs SET status = $1, updated_at = now() WHERE job_id = $2")
                .bind(status.as_str())
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(change)
    }

    async fn get_job(&self, job_id: &str) -> StateResult<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT job_id, project, owner_id, status, created_at, updated_at FROM jobs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRecord::try_from).transpose()
    }
}
