//! Fixed-interval retry driver.
//!
//! The streaming log tier is eventually visible: a record written to the
//! stream takes a moment to reach the tailer's local cache. Read-side
//! operations against the cache therefore poll until the file materializes
//! or a timeout expires.

use crate::{CloudError, CloudResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Sleep between attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default polling window: the stream's write-to-read visibility delay.
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(30);

/// Poll `op` until it succeeds or `period` has elapsed, then time out.
/// The operation's own error is never surfaced; exhaustion is `TimedOut`.
pub async fn retry<T, F, Fut>(period: Duration, mut op: F) -> CloudResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CloudResult<T>>,
{
    let start = Instant::now();
    loop {
        if let Ok(value) = op().await {
            return Ok(value);
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
        if start.elapsed() > period {
            return Err(CloudError::TimedOut);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success() {
        let out = retry(DEFAULT_RETRY_PERIOD, || async { Ok::<_, CloudError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_a_few_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let out = retry(DEFAULT_RETRY_PERIOD, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(CloudError::NotFound("not yet".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let err = retry(Duration::from_millis(350), || async {
            Err::<(), _>(CloudError::NotFound("never".to_string()))
        })
        .await
        .unwrap_err();
        assert_eq!(err, CloudError::TimedOut);
    }
}
