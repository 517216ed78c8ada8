//! Eventual consistency helpers for mesh tests.
//!
//! Links, state broadcasts and teardown all complete asynchronously. These
//! helpers poll a condition with exponential backoff until it holds or the
//! category's timeout passes.
//!
//! Time is measured with `tokio::time`, so the helpers also work in tests
//! that run with a paused clock.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Longest pause between two polls.
const MAX_POLL_DELAY: Duration = Duration::from_millis(200);

/// Categories of eventual consistency with their timeouts.
#[derive(Debug, Clone, Copy)]
pub enum ConsistencyCategory {
    /// Discovery, dial and answer for every pair (several discovery ticks)
    MeshFormation,

    /// A broadcast reaching every peer with an open data link
    StateSync,

    /// Links closing and resources being released after `stop()`
    Teardown,
}

impl ConsistencyCategory {
    /// Get the maximum timeout for this consistency category.
    pub fn timeout(&self) -> Duration {
        match self {
            ConsistencyCategory::MeshFormation => Duration::from_secs(5),
            ConsistencyCategory::StateSync => Duration::from_secs(2),
            ConsistencyCategory::Teardown => Duration::from_secs(2),
        }
    }

    /// Get the initial retry delay for exponential backoff.
    fn initial_delay(&self) -> Duration {
        Duration::from_millis(10)
    }
}

/// Assert that a condition becomes true within the timeout for the given category.
///
/// Polls with a 2x backoff starting at 10ms, capped at 200ms and at the time
/// remaining.
///
/// # Example
///
/// ```rust,ignore
/// assert_eventually(ConsistencyCategory::StateSync, || async {
///     bob.snapshot().await.unwrap().state_of("alice").is_some()
/// })
/// .await
/// .expect("bob should learn alice's state");
/// ```
pub async fn assert_eventually<F, Fut>(
    category: ConsistencyCategory,
    mut condition: F,
) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let timeout = category.timeout();
    let mut delay = category.initial_delay();
    let start = Instant::now();

    loop {
        if condition().await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!(
                "Condition not met within {:?} (category: {:?})",
                timeout, category
            ));
        }

        sleep(delay).await;

        delay = (delay * 2).min(MAX_POLL_DELAY);
        let remaining = timeout.saturating_sub(start.elapsed());
        if delay > remaining {
            delay = remaining;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_consistency_category_timeouts() {
        assert_eq!(
            ConsistencyCategory::MeshFormation.timeout(),
            Duration::from_secs(5)
        );
        assert_eq!(
            ConsistencyCategory::StateSync.timeout(),
            Duration::from_secs(2)
        );
        assert_eq!(
            ConsistencyCategory::Teardown.timeout(),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn test_assert_eventually_succeeds_immediately() {
        let result = assert_eventually(ConsistencyCategory::StateSync, || async { true }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_assert_eventually_succeeds_after_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = assert_eventually(ConsistencyCategory::StateSync, move || {
            let attempts = attempts_clone.clone();
            async move { attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 3 }
        })
        .await;
        assert!(result.is_ok());
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assert_eventually_fails_on_timeout() {
        let result = assert_eventually(ConsistencyCategory::Teardown, || async { false }).await;
        let err = result.expect_err("Should return error on timeout");
        assert!(err.contains("not met within"));
    }
}
