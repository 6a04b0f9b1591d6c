//! Query admission and execution
//!
//! A `QueryScheduler` bounds how many queries evaluate at once. Admission
//! waits for a slot until the query's own deadline; admitted work runs on
//! the blocking pool and is raced against the deadline. Expiry is
//! cooperative: the context is marked expired and the evaluator stops at
//! its next iteration step.

use crate::query::context::QueryContext;
use crate::query::error::{QueryError, QueryResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Proof of admission; dropping it frees the slot exactly once
#[derive(Debug)]
pub struct AdmittedToken {
    query_id: u64,
    _permit: OwnedSemaphorePermit,
}

impl AdmittedToken {
    pub fn query_id(&self) -> u64 {
        self.query_id
    }
}

#[derive(Debug)]
pub struct QueryScheduler {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    accepting: AtomicBool,
}

impl QueryScheduler {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queries currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && !self.semaphore.is_closed()
    }

    /// Wait for a free slot.
    ///
    /// Fails with `QueueTimeout` when the query's deadline passes first and
    /// with `Cancelled` when the query is cancelled or the scheduler drains.
    pub async fn admit(&self, ctx: &QueryContext) -> QueryResult<AdmittedToken> {
        if !self.is_accepting() {
            debug!(query_id = ctx.id(), "rejecting query, scheduler is draining");
            return Err(QueryError::Cancelled);
        }
        if ctx.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let deadline = Instant::from_std(ctx.deadline());
        tokio::select! {
            biased;
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => {
                    debug!(query_id = ctx.id(), in_flight = self.in_flight(), "query admitted");
                    Ok(AdmittedToken {
                        query_id: ctx.id(),
                        _permit: permit,
                    })
                }
                Err(_) => Err(QueryError::Cancelled),
            },
            _ = tokio::time::sleep_until(deadline) => {
                debug!(query_id = ctx.id(), "no slot before deadline");
                Err(QueryError::QueueTimeout)
            }
            _ = ctx.cancelled() => Err(QueryError::Cancelled),
        }
    }

    /// Give a slot back
    pub fn release(&self, token: AdmittedToken) {
        debug!(query_id = token.query_id(), "query released");
        drop(token);
    }

    /// Admit, then run `work` on the blocking pool until it returns or the
    /// deadline passes.
    ///
    /// On expiry the context is marked expired and this waits for `work` to
    /// observe it, so the slot is only freed once evaluation has stopped.
    pub async fn execute<T, F>(&self, ctx: Arc<QueryContext>, work: F) -> QueryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&QueryContext) -> QueryResult<T> + Send + 'static,
    {
        let token = self.admit(&ctx).await?;

        let task_ctx = Arc::clone(&ctx);
        let mut handle = tokio::task::spawn_blocking(move || {
            let _token = token;
            work(&task_ctx)
        });

        let deadline = Instant::from_std(ctx.deadline());
        tokio::select! {
            result = &mut handle => result?,
            _ = tokio::time::sleep_until(deadline) => {
                ctx.expire();
                let stopped = handle.await;
                debug!(query_id = ctx.id(), finished = stopped.is_ok(), "query deadline elapsed");
                Err(QueryError::DeadlineExceeded)
            }
        }
    }

    /// Stop admitting and wait up to `grace` for in-flight queries.
    ///
    /// Returns whether every slot came back in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.accepting.store(false, Ordering::Release);
        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight queries");
        }

        let permits = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        let drained = matches!(
            tokio::time::timeout(grace, self.semaphore.acquire_many(permits)).await,
            Ok(Ok(_))
        );
        self.semaphore.close();

        if !drained {
            warn!(
                in_flight = self.in_flight(),
                grace_ms = grace.as_millis() as u64,
                "queries still running after shutdown grace period"
            );
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ctx(timeout: Duration) -> Arc<QueryContext> {
        Arc::new(QueryContext::new(timeout, 1_000))
    }

    #[tokio::test]
    async fn test_admit_and_release() {
        let scheduler = QueryScheduler::new(1);
        let first = ctx(Duration::from_secs(5));

        let token = scheduler.admit(&first).await.unwrap();
        assert_eq!(scheduler.in_flight(), 1);

        scheduler.release(token);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_waiting_query_is_admitted_when_slot_frees() {
        let scheduler = Arc::new(QueryScheduler::new(1));
        let token = scheduler.admit(&ctx(Duration::from_secs(5))).await.unwrap();

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.admit(&ctx(Duration::from_secs(5))).await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        scheduler.release(token);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_timeout() {
        let scheduler = QueryScheduler::new(1);
        let _held = scheduler.admit(&ctx(Duration::from_secs(5))).await.unwrap();

        let err = scheduler.admit(&ctx(Duration::from_millis(30))).await.unwrap_err();
        assert!(matches!(err, QueryError::QueueTimeout));
        assert_eq!(scheduler.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let scheduler = Arc::new(QueryScheduler::new(1));
        let _held = scheduler.admit(&ctx(Duration::from_secs(5))).await.unwrap();

        let queued = ctx(Duration::from_secs(5));
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            let queued = Arc::clone(&queued);
            tokio::spawn(async move { scheduler.admit(&queued).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queued.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(QueryError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_capacity() {
        let scheduler = Arc::new(QueryScheduler::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                scheduler
                    .execute(ctx(Duration::from_secs(10)), move |_| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_deadline_expiry_during_work() {
        let scheduler = QueryScheduler::new(2);
        let query = ctx(Duration::from_millis(50));

        let result: QueryResult<()> = scheduler
            .execute(Arc::clone(&query), |ctx| loop {
                ctx.check()?;
                std::thread::sleep(Duration::from_millis(5));
            })
            .await;

        assert!(matches!(result, Err(QueryError::DeadlineExceeded)));
        assert!(query.is_cancelled());
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_execute_returns_work_result() {
        let scheduler = QueryScheduler::new(1);
        let value = scheduler
            .execute(ctx(Duration::from_secs(5)), |_| Ok(42))
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_drain_waits_then_rejects() {
        let scheduler = Arc::new(QueryScheduler::new(2));
        let token = scheduler.admit(&ctx(Duration::from_secs(5))).await.unwrap();

        let releaser = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                scheduler.release(token);
            })
        };

        assert!(scheduler.drain(Duration::from_secs(2)).await);
        releaser.await.unwrap();
        assert!(!scheduler.is_accepting());
        assert!(matches!(
            scheduler.admit(&ctx(Duration::from_secs(5))).await,
            Err(QueryError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_drain_times_out_with_stuck_query() {
        let scheduler = QueryScheduler::new(1);
        let _stuck = scheduler.admit(&ctx(Duration::from_secs(5))).await.unwrap();
        assert!(!scheduler.drain(Duration::from_millis(20)).await);
    }
}
