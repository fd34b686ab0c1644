//! Replication slot teardown for a tenant database.
//!
//! A slot cannot be dropped while a walsender holds it, so each slot's
//! holder is terminated and its release awaited before the drop. The
//! messages slot goes first. Nothing here aborts: failures come back as
//! warnings and the remaining steps still run.

use std::time::Duration;

use tenantry_core::TenantSlug;
use tenantry_core::config::TeardownConfig;
use tenantry_state::{PlatformDb, StateError};
use tracing::{debug, info, warn};

use crate::wait::poll_until;

/// Terminates slot holders and drops slots through a [`PlatformDb`].
pub struct SlotTeardown<'a> {
    platform: &'a dyn PlatformDb,
    release_budget: Duration,
    poll_interval: Duration,
}

impl<'a> SlotTeardown<'a> {
    pub fn new(platform: &'a dyn PlatformDb, config: &TeardownConfig) -> Self {
        Self {
            platform,
            release_budget: config.slot_release_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Tear down the tenant's messages slot, then its replication slot.
    pub async fn run(&self, tenant: &TenantSlug) -> Vec<String> {
        let mut warnings = Vec::new();
        for slot in [tenant.messages_slot(), tenant.replication_slot()] {
            self.terminate_holder(&slot, &mut warnings).await;
            self.drop_slot(&slot, &mut warnings).await;
        }
        if warnings.is_empty() {
            info!(%tenant, "replication slots removed");
        }
        warnings
    }

    async fn terminate_holder(&self, slot: &str, warnings: &mut Vec<String>) {
        let pid = match self.platform.slot_active_pid(slot).await {
            Ok(Some(pid)) => pid,
            Ok(None) => return,
            Err(e) => return note(warnings, format!("terminate {slot}"), e),
        };

        debug!(slot, pid, "terminating slot holder");
        if let Err(e) = self.platform.terminate_backend(pid).await {
            return note(warnings, format!("terminate {slot}"), e);
        }

        let platform = self.platform;
        let released = poll_until(self.release_budget, self.poll_interval, || async move {
            Ok::<_, StateError>(platform.slot_active_pid(slot).await?.is_none())
        })
        .await;
        match released {
            Ok(true) => debug!(slot, pid, "slot released"),
            Ok(false) => {
                let warning = format!(
                    "terminate {slot}: backend {pid} still holds the slot after {:?}",
                    self.release_budget
                );
                warn!(slot, pid, "{warning}");
                warnings.push(warning);
            }
            Err(e) => note(warnings, format!("terminate {slot}"), e),
        }
    }

    async fn drop_slot(&self, slot: &str, warnings: &mut Vec<String>) {
        match self.platform.drop_replication_slot(slot).await {
            Ok(()) => debug!(slot, "replication slot dropped"),
            Err(e) => note(warnings, format!("drop {slot}"), e),
        }
    }
}

/// Record `err` as a warning unless it only says the object is gone.
fn note(warnings: &mut Vec<String>, step: String, err: StateError) {
    if err.is_not_found() {
        debug!(%step, error = %err, "already gone");
        return;
    }
    let warning = format!("{step}: {err}");
    warn!("{warning}");
    warnings.push(warning);
}

/// Run the slot teardown for `tenant` with `config`'s budgets.
pub async fn teardown(
    platform: &dyn PlatformDb,
    tenant: &TenantSlug,
    config: &TeardownConfig,
) -> Vec<String> {
    SlotTeardown::new(platform, config).run(tenant).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingPlatform, test_config};

    fn demo() -> TenantSlug {
        TenantSlug::parse("demo").unwrap()
    }

    #[tokio::test]
    async fn absent_slots_produce_no_warnings() {
        let platform = RecordingPlatform::new();
        let warnings = teardown(&platform, &demo(), &test_config().teardown).await;
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(
            platform.calls(),
            vec![
                format!("slot_active_pid {}", demo().messages_slot()),
                format!("drop_replication_slot {}", demo().messages_slot()),
                format!("slot_active_pid {}", demo().replication_slot()),
                format!("drop_replication_slot {}", demo().replication_slot()),
            ]
        );
    }

    #[tokio::test]
    async fn terminate_precedes_drop_and_messages_go_first() {
        let tenant = demo();
        let platform = RecordingPlatform::new();
        platform
            .with_slot(&tenant.messages_slot(), Some(101))
            .with_slot(&tenant.replication_slot(), Some(202));

        let warnings = teardown(&platform, &tenant, &test_config().teardown).await;
        assert!(warnings.is_empty(), "{warnings:?}");

        let term_messages = platform.position("terminate_backend 101").unwrap();
        let drop_messages = platform
            .position(&format!("drop_replication_slot {}", tenant.messages_slot()))
            .unwrap();
        let term_replication = platform.position("terminate_backend 202").unwrap();
        let drop_replication = platform
            .position(&format!("drop_replication_slot {}", tenant.replication_slot()))
            .unwrap();
        assert!(term_messages < drop_messages);
        assert!(drop_messages < term_replication);
        assert!(term_replication < drop_replication);
        assert!(!platform.has_slot(&tenant.messages_slot()));
        assert!(!platform.has_slot(&tenant.replication_slot()));
    }

    #[tokio::test]
    async fn idle_slot_is_dropped_without_terminate() {
        let tenant = demo();
        let platform = RecordingPlatform::new();
        platform.with_slot(&tenant.replication_slot(), None);

        let warnings = teardown(&platform, &tenant, &test_config().teardown).await;
        assert!(warnings.is_empty());
        assert!(platform.position("terminate_backend").is_none());
        assert!(!platform.has_slot(&tenant.replication_slot()));
    }

    #[tokio::test]
    async fn stuck_holder_becomes_warning_and_teardown_continues() {
        let tenant = demo();
        let platform = RecordingPlatform::new();
        platform
            .with_stuck_slot(&tenant.messages_slot(), 7)
            .with_slot(&tenant.replication_slot(), None);

        let warnings = teardown(&platform, &tenant, &test_config().teardown).await;
        assert_eq!(warnings.len(), 1, "{warnings:?}");
        assert!(warnings[0].starts_with(&format!("terminate {}", tenant.messages_slot())));
        assert!(warnings[0].contains("still holds"));
        // The drop is still attempted and the replication slot still goes.
        assert!(
            platform
                .position(&format!("drop_replication_slot {}", tenant.messages_slot()))
                .is_some()
        );
        assert!(!platform.has_slot(&tenant.replication_slot()));
    }

    #[tokio::test]
    async fn database_errors_become_warnings() {
        let tenant = demo();
        let platform = RecordingPlatform::new();
        platform
            .with_slot(&tenant.messages_slot(), None)
            .fail("drop_replication_slot", "permission denied");

        let warnings = teardown(&platform, &tenant, &test_config().teardown).await;
        assert_eq!(warnings.len(), 2, "{warnings:?}");
        assert!(warnings[0].starts_with(&format!("drop {}", tenant.messages_slot())));
        assert!(warnings[0].contains("permission denied"));
        assert!(warnings[1].starts_with(&format!("drop {}", tenant.replication_slot())));
    }
}
