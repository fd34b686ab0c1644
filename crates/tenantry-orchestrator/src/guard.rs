//! Per-tenant mutual exclusion for workflows.
//!
//! Provisioning waits for the slug; deletion refuses to start if anyone holds
//! it. Map entries live only while a guard or a waiter references them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = HashMap<String, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct TenantGuards {
    slots: Arc<Mutex<Slots>>,
}

impl TenantGuards {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, tenant: &str) -> Arc<AsyncMutex<()>> {
        self.lock().entry(tenant.to_string()).or_default().clone()
    }

    /// Wait until `tenant` is free, then hold it until the guard drops.
    pub async fn acquire(&self, tenant: &str) -> TenantGuard {
        let held = self.slot(tenant).lock_owned().await;
        TenantGuard {
            held: Some(held),
            tenant: tenant.to_string(),
            guards: self.clone(),
        }
    }

    /// Hold `tenant` if nobody else does.
    pub fn try_acquire(&self, tenant: &str) -> Option<TenantGuard> {
        let slot = self.slot(tenant);
        match slot.try_lock_owned() {
            Ok(held) => Some(TenantGuard {
                held: Some(held),
                tenant: tenant.to_string(),
                guards: self.clone(),
            }),
            Err(_) => {
                self.release_if_unused(tenant);
                None
            }
        }
    }

    pub fn is_held(&self, tenant: &str) -> bool {
        self.lock()
            .get(tenant)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of tracked slugs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_if_unused(&self, tenant: &str) {
        let mut slots = self.lock();
        // All clones are taken under this lock, so a count of one means only
        // the map still refers to the slot.
        if slots.get(tenant).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(tenant);
        }
    }
}

/// Exclusive hold on one tenant slug.
pub struct TenantGuard {
    held: Option<OwnedMutexGuard<()>>,
    tenant: String,
    guards: TenantGuards,
}

impl TenantGuard {
    pub fn tenant(&self) -> &str {
        &self.tenant
    }
}

impl Drop for TenantGuard {
    fn drop(&mut self) {
        self.held.take();
        self.guards.release_if_unused(&self.tenant);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let guards = TenantGuards::new();
        let held = guards.acquire("demo").await;
        assert!(guards.is_held("demo"));
        assert!(guards.try_acquire("demo").is_none());
        assert!(guards.try_acquire("other").is_some());

        drop(held);
        assert!(!guards.is_held("demo"));
        assert!(guards.try_acquire("demo").is_some());
    }

    #[tokio::test]
    async fn entries_are_removed_when_unused() {
        let guards = TenantGuards::new();
        {
            let _a = guards.acquire("a").await;
            let _b = guards.try_acquire("b").unwrap();
            assert_eq!(guards.len(), 2);
        }
        assert!(guards.is_empty());

        let _held = guards.acquire("a").await;
        assert!(guards.try_acquire("a").is_none());
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let guards = TenantGuards::new();
        let first = guards.acquire("demo").await;

        let waiter = {
            let guards = guards.clone();
            tokio::spawn(async move {
                let _second = guards.acquire("demo").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(guards.is_empty());
    }
}
