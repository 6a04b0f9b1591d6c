//! Per-query execution state
//!
//! A `QueryContext` is created for exactly one query invocation and threaded
//! explicitly through the evaluator and every storage iterator it opens. It
//! carries the cancellation signal, the wall-clock deadline and the shared
//! sample counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Reason a query stopped before completing
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    #[error("query was cancelled")]
    Cancelled,

    #[error("query timed out")]
    DeadlineExceeded,

    #[error("query processing would load too many samples into memory (limit {limit})")]
    TooManySamples { limit: u64 },
}

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct QueryContext {
    id: u64,
    token: CancellationToken,
    deadline: Instant,
    timed_out: AtomicBool,
    samples: AtomicU64,
    max_samples: u64,
}

impl QueryContext {
    pub fn new(timeout: Duration, max_samples: u64) -> Self {
        Self::with_deadline(Instant::now() + timeout, max_samples)
    }

    pub fn with_deadline(deadline: Instant, max_samples: u64) -> Self {
        Self {
            id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
            deadline,
            timed_out: AtomicBool::new(false),
            samples: AtomicU64::new(0),
            max_samples,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Cancel on behalf of the caller (client went away, shutdown)
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel because the deadline elapsed
    pub fn expire(&self) {
        self.timed_out.store(true, Ordering::Release);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled or expired
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Guard that cancels the query when dropped, so an abandoned request
    /// stops its evaluation at the next iteration step.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Observe cancellation and the deadline.
    ///
    /// Called at every loop boundary that consumes samples.
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.token.is_cancelled() {
            return Err(self.cancel_reason());
        }
        if Instant::now() >= self.deadline {
            self.expire();
            return Err(Interrupt::DeadlineExceeded);
        }
        Ok(())
    }

    /// Count one pulled sample against the budget
    pub fn record_sample(&self) -> Result<(), Interrupt> {
        let scanned = self.samples.fetch_add(1, Ordering::Relaxed) + 1;
        if scanned > self.max_samples {
            return Err(Interrupt::TooManySamples {
                limit: self.max_samples,
            });
        }
        Ok(())
    }

    pub fn samples_scanned(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn max_samples(&self) -> u64 {
        self.max_samples
    }

    fn cancel_reason(&self) -> Interrupt {
        if self.timed_out.load(Ordering::Acquire) {
            Interrupt::DeadlineExceeded
        } else {
            Interrupt::Cancelled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_budget() {
        let ctx = QueryContext::new(Duration::from_secs(10), 3);

        assert!(ctx.record_sample().is_ok());
        assert!(ctx.record_sample().is_ok());
        assert!(ctx.record_sample().is_ok());
        assert_eq!(
            ctx.record_sample(),
            Err(Interrupt::TooManySamples { limit: 3 })
        );
        assert_eq!(ctx.samples_scanned(), 4);
    }

    #[test]
    fn test_cancel_and_expire_are_distinguished() {
        let cancelled = QueryContext::new(Duration::from_secs(10), 100);
        assert!(cancelled.check().is_ok());
        cancelled.cancel();
        assert_eq!(cancelled.check(), Err(Interrupt::Cancelled));

        let expired = QueryContext::new(Duration::from_secs(10), 100);
        expired.expire();
        assert_eq!(expired.check(), Err(Interrupt::DeadlineExceeded));
    }

    #[test]
    fn test_elapsed_deadline() {
        let ctx = QueryContext::with_deadline(Instant::now(), 100);
        assert_eq!(ctx.check(), Err(Interrupt::DeadlineExceeded));
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_drop_guard_cancels() {
        let ctx = QueryContext::new(Duration::from_secs(10), 100);
        {
            let _guard = ctx.cancel_on_drop();
        }
        assert_eq!(ctx.check(), Err(Interrupt::Cancelled));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = QueryContext::new(Duration::from_secs(1), 1);
        let b = QueryContext::new(Duration::from_secs(1), 1);
        assert_ne!(a.id(), b.id());
    }
}
