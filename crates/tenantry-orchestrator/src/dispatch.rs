//! Detached execution of provisioning jobs.
//!
//! Jobs run as tokio tasks behind a semaphore. Each finished job sends a
//! [`JobReport`] to the reporter, which only logs. A panicking job is
//! caught through its `JoinHandle` and marked `failed` in the ledger.

use std::any::Any;
use std::sync::Arc;

use tenantry_state::Bookkeeping;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::guard::TenantGuards;
use crate::provision::{ProvisionRequest, Provisioner, mark_failed};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Failed(String),
    Panicked(String),
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub tenant: String,
    pub kind: &'static str,
    pub outcome: JobOutcome,
}

#[derive(Clone)]
pub struct Dispatcher {
    provisioner: Arc<Provisioner>,
    store: Arc<dyn Bookkeeping>,
    guards: TenantGuards,
    permits: Arc<Semaphore>,
    reports: mpsc::UnboundedSender<JobReport>,
}

impl Dispatcher {
    /// A dispatcher running at most `max_concurrent` jobs at once, and the
    /// receiving end of its report channel.
    pub fn new(
        provisioner: Arc<Provisioner>,
        store: Arc<dyn Bookkeeping>,
        guards: TenantGuards,
        max_concurrent: usize,
    ) -> (Self, mpsc::UnboundedReceiver<JobReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            provisioner,
            store,
            guards,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            reports,
        };
        (dispatcher, rx)
    }

    /// Start `request` in the background. The job waits for a worker
    /// permit, then for the tenant guard.
    pub fn dispatch(&self, request: ProvisionRequest) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.execute(&request).await;
            let report = JobReport {
                job_id: request.job_id,
                tenant: request.tenant.to_string(),
                kind: request.kind.label(),
                outcome,
            };
            if this.reports.send(report).is_err() {
                warn!("job reporter is gone, dropping report");
            }
        })
    }

    async fn execute(&self, request: &ProvisionRequest) -> JobOutcome {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            mark_failed(self.store.as_ref(), &request.job_id).await;
            return JobOutcome::Failed("worker pool closed".to_string());
        };
        let _guard = self.guards.acquire(request.tenant.as_str()).await;

        let provisioner = self.provisioner.clone();
        let job = request.clone();
        let handle = tokio::spawn(async move { provisioner.run(&job).await });

        match handle.await {
            Ok(Ok(())) => JobOutcome::Done,
            Ok(Err(e)) => {
                mark_failed(self.store.as_ref(), &request.job_id).await;
                JobOutcome::Failed(e.to_string())
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "job task cancelled".to_string()
                };
                error!(job_id = %request.job_id, tenant = %request.tenant, %message, "job panicked");
                mark_failed(self.store.as_ref(), &request.job_id).await;
                JobOutcome::Panicked(message)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "panic with non-string payload".to_string(),
        },
    }
}

/// Log job reports until every dispatcher is dropped.
pub async fn run_reporter(mut reports: mpsc::UnboundedReceiver<JobReport>) {
    while let Some(report) = reports.recv().await {
        match &report.outcome {
            JobOutcome::Done => {
                info!(job_id = %report.job_id, tenant = %report.tenant, kind = report.kind, "job finished")
            }
            JobOutcome::Failed(reason) => {
                warn!(job_id = %report.job_id, tenant = %report.tenant, kind = report.kind, %reason, "job failed")
            }
            JobOutcome::Panicked(reason) => {
                error!(job_id = %report.job_id, tenant = %report.tenant, kind = report.kind, %reason, "job panicked")
            }
        }
    }
    info!("job reporter stopped");
}
