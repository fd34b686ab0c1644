//! tenantry-state — bookkeeping and platform database access for Tenantry.
//!
//! # Architecture
//!
//! The [`Bookkeeping`] trait covers tenants, memberships and the job ledger.
//! It has two backends:
//!
//! - [`StateStore`]: embedded [redb](https://docs.rs/redb), on-disk or
//!   in-memory. Records are JSON-serialized into `&str`-keyed tables;
//!   membership keys (`{tenant_id}/{user_id}`) allow prefix scans.
//! - [`PgStore`]: Postgres via `sqlx`, schema created at startup.
//!
//! [`PlatformDb`] is the privileged side (replication slots, realtime and
//! pooler registrations, tenant databases) and is always Postgres.
//!
//! Both stores are `Clone + Send + Sync` and shared as `Arc<dyn ...>`.

pub mod bookkeeping;
pub mod error;
pub mod platform;
pub mod postgres;
pub mod store;
pub mod tables;
pub mod types;

pub use bookkeeping::Bookkeeping;
pub use error::{StateError, StateResult};
pub use platform::{PgPlatform, PlatformDb};
pub use postgres::{PgStore, connect_pool};
pub use store::StateStore;
pub use types::*;
