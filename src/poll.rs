//! Poll-until-deadline primitive.
//!
//! Replaces the original scripts' `sleep N; check` pattern with an explicit
//! loop, making "soft timeout" a first-class boolean result instead of an
//! implicit race.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Polls `condition` every `interval` until it returns `true` or `timeout`
/// elapses. Returns `true` if the condition was observed, `false` on
/// deadline — never an error, so callers choose their own timeout policy.
///
/// The condition is always checked at least once, even with a zero timeout.
pub async fn until_deadline<F, Fut>(interval: Duration, timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn returns_true_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let ready = until_deadline(Duration::from_millis(1), Duration::from_secs(1), move || {
            let calls = Arc::clone(&calls_in);
            async move { calls.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await;

        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_false_on_deadline_without_error() {
        let ready = until_deadline(
            Duration::from_millis(5),
            Duration::from_millis(20),
            || async { false },
        )
        .await;
        assert!(!ready);
    }

    #[tokio::test]
    async fn zero_timeout_still_checks_once() {
        let ready = until_deadline(Duration::from_millis(1), Duration::ZERO, || async { true }).await;
        assert!(ready);
    }
}
