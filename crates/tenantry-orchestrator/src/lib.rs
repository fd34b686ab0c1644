//! tenantry-orchestrator — tenant workflows and the service facade.
//!
//! # Components
//!
//! - **`service`**: [`TenantService`], every operation the API exposes,
//!   with its authorization rules
//! - **`provision`**: create/duplicate a tenant stack and store its
//!   credentials
//! - **`deprovision`**: tear a tenant down, collecting every failure
//! - **`replication`**: terminate-then-drop of a tenant's replication slots
//! - **`dispatch`**: bounded pool of detached provisioning jobs and their
//!   report channel
//! - **`guard`**: per-tenant mutual exclusion between workflows

pub mod deprovision;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod provision;
pub mod replication;
pub mod service;
pub mod wait;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use deprovision::{DeleteReport, DeleteStatus, Deprovisioner};
pub use dispatch::{Dispatcher, JobOutcome, JobReport, run_reporter};
pub use error::{ErrorKind, OrchestratorError, OrchestratorResult};
pub use guard::{TenantGuard, TenantGuards};
pub use provision::{ProvisionKind, ProvisionRequest, Provisioner};
pub use service::{ServiceDeps, TenantService};
