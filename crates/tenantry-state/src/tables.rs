//! redb table definitions for the embedded bookkeeping store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Membership keys follow `{tenant_id}/{user_id}` so a tenant's members can
//! be found by prefix scan.

use redb::TableDefinition;

/// Tenant records keyed by slug.
pub const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");

/// Memberships keyed by `{tenant_id}/{user_id}`.
pub const MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("members");

/// Job ledger keyed by job id.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Counters (tenant id sequence).
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Key of the tenant id sequence in [`SEQUENCES`].
pub const TENANT_ID_SEQ: &str = "tenant_id";

pub fn member_key(tenant_id: i64, user_id: &str) -> String {
    format!("{tenant_id}/{user_id}")
}

pub fn member_prefix(tenant_id: i64) -> String {
    format!("{tenant_id}/")
}
