// src/retry.rs
//! Bounded retry with a fixed backoff, passed into every network-calling
//! component so retry semantics stay testable in isolation.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// One retry after a short fixed backoff (fan-out and persistence default).
    pub fn once_after(backoff: Duration) -> Self {
        Self {
            max_attempts: 2,
            backoff,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds or attempts are exhausted; returns the
    /// last error. Sleeps `backoff` between attempts.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt < attempts {
                        tracing::debug!(attempt, error = ?e, "retrying after backoff");
                        tokio::time::sleep(self.backoff).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one attempt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::once_after(Duration::from_millis(1));
        let out: Result<u32> = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(anyhow!("transient"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::once_after(Duration::from_millis(1));
        let out: Result<u32> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("still down")) }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
