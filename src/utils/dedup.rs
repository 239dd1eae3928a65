use crate::error::SharedError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T, SharedError>>>;

/// Collapses concurrent requests for an expensive async operation into one execution.
///
/// The operation runs on its own tokio task, so callers that stop waiting do not cancel
/// it for everyone else who joined.
pub struct Deduplicator<T> {
    in_flight: Mutex<Option<InFlight<T>>>,
}

struct InFlight<T> {
    result: SharedResult<T>,
    /// Set by the task itself, so it holds even if nobody polled `result` to the end.
    finished: Arc<AtomicBool>,
}

impl<T> Default for Deduplicator<T> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(None),
        }
    }
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the in-flight operation, or starts `operation` if nothing is running.
    ///
    /// A racer may join an operation that completes a moment later; the result is just as
    /// fresh as a new one would have been.
    pub fn start_or_join<F, Fut>(&self, operation: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = slot.as_ref() {
            if !current.finished.load(Ordering::Acquire) {
                return current.result.clone();
            }
        }

        // `operation` is only invoked inside the task, so nothing user-supplied runs
        // while the slot is locked, and a panic surfaces as a join error.
        let finished = Arc::new(AtomicBool::new(false));
        let task = {
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                let _done = FinishOnDrop(finished);
                operation().await
            })
        };

        let shared = async move {
            match task.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Arc::new(e)),
                Err(e) => Err(Arc::new(anyhow::anyhow!("operation aborted: {}", e))),
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            result: shared.clone(),
            finished,
        });
        shared
    }

    /// Forgets the last operation, dropping its cached result.
    pub fn clear(&self) {
        let previous = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(previous);
    }
}

/// Marks the operation finished however the task ends, panics included.
struct FinishOnDrop(Arc<AtomicBool>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let dedup = Arc::new(Deduplicator::<usize>::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut joins = Vec::new();
        for _ in 0..10 {
            let runs = runs.clone();
            let gate = gate.clone();
            joins.push(dedup.start_or_join(move || async move {
                gate.notified().await;
                Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
            }));
        }

        gate.notify_one();
        for join in joins {
            assert_eq!(join.await.unwrap(), 1);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completed_operation_is_started_again() {
        let dedup = Deduplicator::<usize>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let runs = runs.clone();
            let value = dedup
                .start_or_join(move || async move { Ok(runs.fetch_add(1, Ordering::SeqCst) + 1) })
                .await
                .unwrap();
            assert_eq!(value, expected);
        }
    }

    #[tokio::test]
    async fn test_failure_reaches_every_joiner() {
        let dedup = Deduplicator::<()>::new();
        let gate = Arc::new(Notify::new());

        let first = {
            let gate = gate.clone();
            dedup.start_or_join(move || async move {
                gate.notified().await;
                anyhow::bail!("upstream unavailable")
            })
        };
        let second = dedup.start_or_join(|| async { Ok(()) });

        gate.notify_one();
        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap_err().to_string().contains("upstream unavailable"));
        assert!(second.unwrap_err().to_string().contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn test_panic_is_delivered_as_error() {
        let dedup = Deduplicator::<()>::new();

        let result = dedup
            .start_or_join(|| -> futures::future::Ready<anyhow::Result<()>> {
                panic!("strategy blew up")
            })
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_wait_does_not_cancel_operation() {
        let dedup = Deduplicator::<&'static str>::new();
        let gate = Arc::new(Notify::new());

        let abandoned = {
            let gate = gate.clone();
            dedup.start_or_join(move || async move {
                gate.notified().await;
                Ok("done")
            })
        };
        let timed_out = tokio::time::timeout(Duration::from_millis(20), abandoned).await;
        assert!(timed_out.is_err());

        let joined = dedup.start_or_join(|| async { Ok("second run") });
        gate.notify_one();
        assert_eq!(joined.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_finished_operation_reruns_after_every_waiter_gave_up() {
        let dedup = Deduplicator::<usize>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let start = |runs: Arc<AtomicUsize>| {
            move || async move {
                let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<usize, _>(anyhow::anyhow!("upstream failure {}", run))
            }
        };

        drop(dedup.start_or_join(start(runs.clone())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let err = dedup.start_or_join(start(runs.clone())).await.unwrap_err();
        assert!(err.to_string().contains("upstream failure 2"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
