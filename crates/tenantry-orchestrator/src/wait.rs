//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Call `probe` every `interval` until it returns `true` or `budget` runs
/// out. Returns `Ok(false)` on timeout. The probe runs at least once, and
/// once more at the deadline.
pub async fn poll_until<F, Fut, E>(budget: Duration, interval: Duration, mut probe: F) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let deadline = Instant::now() + budget;
    loop {
        if probe().await? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn returns_once_condition_holds() {
        let calls = AtomicU32::new(0);
        let done = poll_until(Duration::from_secs(5), Duration::from_millis(1), || async {
            Ok::<_, ()>(calls.fetch_add(1, Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();
        assert!(done);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let start = Instant::now();
        let done = poll_until(Duration::from_secs(2), Duration::from_millis(250), || async {
            Ok::<_, ()>(false)
        })
        .await
        .unwrap();
        assert!(!done);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn probe_error_stops_polling() {
        let result = poll_until(Duration::from_secs(5), Duration::from_millis(1), || async {
            Err::<bool, _>("gone")
        })
        .await;
        assert_eq!(result, Err("gone"));
    }
}
