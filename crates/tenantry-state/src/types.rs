//! Bookkeeping records: tenants, memberships, and the job ledger.
//!
//! All types serialize to JSON for storage in redb tables and mirror the
//! columns of the Postgres schema.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use tenantry_core::Role;

use crate::error::{StateError, StateResult};

/// Numeric tenant id (`projects.id`).
pub type TenantId = i64;

// ── Tenant ─────────────────────────────────────────────────────────

/// A provisioned (or provisioning) tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct TenantRecord {
    pub id: TenantId,
    pub name: String,
    pub owner_id: String,
    /// Encrypted anonymous credential; `None` until provisioning finishes.
    pub anon_key: Option<String>,
    /// Encrypted privileged credential.
    pub service_role: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Membership of a principal in a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberRecord {
    pub tenant_id: TenantId,
    pub user_id: String,
    pub role: Role,
}

/// Result of storing provisioned credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialUpdate {
    Stored,
    /// No tenant row matched both slug and owner.
    NoMatch,
}

/// Result of an ownership transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// The new owner already owns the tenant.
    Noop,
    Transferred,
}

// ── Jobs ───────────────────────────────────────────────────────────

/// Status of a provisioning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Whether a job in `self` may move to `next`.
    ///
    /// Staying in the same status is not a transition; callers treat it as
    /// a no-op before asking.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A row of the job ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    /// Slug of the tenant the job provisions.
    pub project: String,
    pub owner_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of [`set_job_status`](crate::Bookkeeping::set_job_status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Applied,
    /// The job was already in the requested status.
    Unchanged,
}

/// Decide whether moving `current` to `next` is applied, ignored or rejected.
pub fn check_transition(current: JobStatus, next: JobStatus) -> StateResult<StatusChange> {
    if current == next {
        Ok(StatusChange::Unchanged)
    } else if current.can_transition_to(next) {
        Ok(StatusChange::Applied)
    } else {
        Err(StateError::InvalidTransition {
            from: current.to_string(),
            to: next.to_string(),
        })
    }
}
