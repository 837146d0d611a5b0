//! Time helpers: jitter and cancellation-aware sleeping.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Apply symmetric jitter: `base ± spread`.
///
/// The result never goes below 1 ms so a poll loop cannot spin.
pub fn jittered(base: Duration, spread: Duration) -> Duration {
    if spread.is_zero() {
        return base.max(Duration::from_millis(1));
    }

    let spread_ms = spread.as_millis() as i64;
    let offset_ms = rand::random_range(-spread_ms..=spread_ms);
    let base_ms = base.as_millis() as i64;

    Duration::from_millis((base_ms + offset_ms).max(1) as u64)
}

/// Sleep for `duration`, returning `Err(Cancelled)` if the token fires first.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_band() {
        let base = Duration::from_millis(250);
        let spread = Duration::from_millis(100);
        for _ in 0..100 {
            let d = jittered(base, spread);
            assert!(d >= Duration::from_millis(150));
            assert!(d <= Duration::from_millis(350));
        }
    }

    #[test]
    fn zero_spread_returns_base() {
        assert_eq!(
            jittered(Duration::from_millis(250), Duration::ZERO),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn sleep_returns_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = sleep_cancellable(Duration::from_secs(10), &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        sleep_cancellable(Duration::from_millis(5), &token)
            .await
            .expect("sleep should complete");
    }
}
