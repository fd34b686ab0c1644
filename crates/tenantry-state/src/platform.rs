//! Privileged access to the platform database: realtime and pooler
//! registrations, replication slots, and tenant databases.
//!
//! Always Postgres; the trait exists so the teardown sequence can be driven
//! against a recording fake.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::debug;

use crate::error::StateResult;

#[async_trait]
pub trait PlatformDb: Send + Sync {
    /// Delete the tenant's `_realtime.extensions` and `_realtime.tenants` rows.
    async fn delete_realtime_rows(&self, tenant: &str) -> StateResult<()>;

    /// Delete the tenant's `_supavisor.users` and `_supavisor.tenants` rows.
    async fn delete_pooler_rows(&self, tenant: &str) -> StateResult<()>;

    /// Backend pid holding `slot`, or `None` if the slot is idle or absent.
    async fn slot_active_pid(&self, slot: &str) -> StateResult<Option<i32>>;

    async fn terminate_backend(&self, pid: i32) -> StateResult<()>;

    /// Drop a replication slot; `NotFound` if it does not exist.
    async fn drop_replication_slot(&self, slot: &str) -> StateResult<()>;

    /// Terminate every backend connected to `database` except our own.
    /// Returns the number of backends signalled.
    async fn terminate_connections(&self, database: &str) -> StateResult<u64>;

    /// Number of backends still connected to `database`, excluding our own.
    async fn connection_count(&self, database: &str) -> StateResult<i64>;

    async fn drop_database(&self, database: &str) -> StateResult<()>;

    async fn database_exists(&self, database: &str) -> StateResult<bool>;
}

/// Quote an identifier for interpolation into DDL.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// [`PlatformDb`] over a superuser connection pool.
#[derive(Clone)]
pub struct PgPlatform {
    pool: PgPool,
}

impl PgPlatform {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlatformDb for PgPlatform {
    async fn delete_realtime_rows(&self, tenant: &str) -> StateResult<()> {
        sqlx::query("DELETE FROM _realtime.extensions WHERE tenant_external_id = $1")
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM _realtime.tenants WHERE external_id = $1")
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        debug!(%tenant, "realtime registration removed");
        Ok(())
    }

    async fn delete_pooler_rows(&self, tenant: &str) -> StateResult<()> {
        sqlx::query("DELETE FROM _supavisor.users WHERE tenant_external_id = $1")
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM _supavisor.tenants WHERE external_id = $1")
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        debug!(%tenant, "pooler registration removed");
        Ok(())
    }

    async fn slot_active_pid(&self, slot: &str) -> StateResult<Option<i32>> {
        let pid: Option<Option<i32>> =
            sqlx::query_scalar("SELECT active_pid FROM pg_replication_slots WHERE slot_name = $1")
                .bind(slot)
                .fetch_optional(&self.pool)
                .await?;
        Ok(pid.flatten())
    }

    async fn terminate_backend(&self, pid: i32) -> StateResult<()> {
        sqlx::query("SELECT pg_terminate_backend($1)")
            .bind(pid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn drop_replication_slot(&self, slot: &str) -> StateResult<()> {
        sqlx::query("SELECT pg_drop_replication_slot($1)")
            .bind(slot)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn terminate_connections(&self, database: &str) -> StateResult<u64> {
        let signalled: Vec<bool> = sqlx::query_scalar(
            r#"
            SELECT pg_terminate_backend(pid)
            FROM pg_stat_activity
            WHERE datname = $1 AND pid <> pg_backend_pid()
            "#,
        )
        .bind(database)
        .fetch_all(&self.pool)
        .await?;
        Ok(signalled.len() as u64)
    }

    async fn connection_count(&self, database: &str) -> StateResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(database)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn drop_database(&self, database: &str) -> StateResult<()> {
        // DDL cannot take bind parameters.
        let statement = format!("DROP DATABASE IF EXISTS {}", quote_ident(database));
        sqlx::raw_sql(&statement).execute(&self.pool).await?;
        debug!(%database, "database dropped");
        Ok(())
    }

    async fn database_exists(&self, database: &str) -> StateResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(database)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}
