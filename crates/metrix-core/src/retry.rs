//! Bounded backoff ladder.
//!
//! A [`Retrier`] holds an ordered list of delays. An operation is attempted
//! once, and after each retryable failure the next delay is slept before the
//! following attempt. Once the ladder is exhausted the last error is returned.

use std::future::Future;
use std::time::Duration;

/// Default ladder: 1s, 3s, 5s.
pub const DEFAULT_LADDER: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// Re-executes a failing operation on a fixed delay ladder.
#[derive(Debug, Clone)]
pub struct Retrier {
    ladder: Vec<Duration>,
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(DEFAULT_LADDER.to_vec())
    }
}

impl Retrier {
    pub fn new(ladder: Vec<Duration>) -> Self {
        Self { ladder }
    }

    /// A retrier that never retries.
    pub fn none() -> Self {
        Self { ladder: Vec::new() }
    }

    pub fn ladder(&self) -> &[Duration] {
        &self.ladder
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// ladder runs out. At most `ladder.len() + 1` attempts are made.
    pub async fn exec<T, E, F, Fut, P>(&self, mut op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut delays = self.ladder.iter();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) => match delays.next() {
                    Some(delay) => {
                        log::debug!(target: "metrix::retrier", "retrying in {delay:?}");
                        tokio::time::sleep(*delay).await;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn short_ladder() -> Retrier {
        Retrier::new(vec![Duration::from_millis(1); 3])
    }

    async fn fail_times(retrier: &Retrier, failures: usize) -> (Result<u32, &'static str>, usize) {
        let calls = AtomicUsize::new(0);
        let result = retrier
            .exec(
                || {
                    let calls = &calls;
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < failures { Err("transient") } else { Ok(7) }
                    }
                },
                |_| true,
            )
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn succeeds_after_k_transient_failures() {
        let retrier = short_ladder();
        for k in 0..3 {
            let (result, calls) = fail_times(&retrier, k).await;
            assert_eq!(result, Ok(7));
            assert_eq!(calls, k + 1, "k = {k}");
        }
    }

    #[tokio::test]
    async fn gives_up_when_ladder_exhausted() {
        let (result, calls) = fail_times(&short_ladder(), 10).await;
        assert_eq!(result, Err("transient"));
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = short_ladder()
            .exec(
                || {
                    let calls = &calls;
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("constraint")
                    }
                },
                |e| *e != "constraint",
            )
            .await;
        assert_eq!(result, Err("constraint"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_ladder_runs_once() {
        let (result, calls) = fail_times(&Retrier::none(), 1).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
