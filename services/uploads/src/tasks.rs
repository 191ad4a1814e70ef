use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Submitter for work that runs off the request path.
///
/// Every task is named and its outcome is observed: failures are logged and
/// counted, and [`BackgroundTasks::drain`] waits for everything submitted so
/// far.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    set: Mutex<JoinSet<()>>,
    failures: AtomicU64,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a named task. Must be called from within a Tokio runtime.
    pub fn spawn<F, E>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let inner = self.inner.clone();
        let mut set = self.inner.set.lock();

        // Reap whatever has already finished so the set stays small
        while let Some(result) = set.try_join_next() {
            log_join(result);
        }

        set.spawn(async move {
            match task.await {
                Ok(()) => debug!(task = name, "Background task completed"),
                Err(e) => {
                    inner.failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("uploads.background.failures", "task" => name).increment(1);
                    warn!(task = name, error = %e, "Background task failed");
                }
            }
        });
    }

    /// Await every task submitted so far, including tasks those tasks submit
    pub async fn drain(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.inner.set.lock());
            if set.is_empty() {
                return;
            }
            while let Some(result) = set.join_next().await {
                log_join(result);
            }
        }
    }

    /// Abort everything still running
    pub fn abort_all(&self) {
        self.inner.set.lock().abort_all();
    }

    /// Number of tasks that returned an error
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.inner.set.lock().len()
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Background task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_drain_waits_for_tasks() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let done = done.clone();
            tasks.spawn("count", async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            });
        }

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("fails", async { Err::<(), _>("boom") });
        tasks.spawn("succeeds", async { Ok::<(), &str>(()) });

        tasks.drain().await;
        assert_eq!(tasks.failures(), 1);
    }

    #[tokio::test]
    async fn test_drain_follows_nested_submissions() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        let nested = tasks.clone();
        let counter = done.clone();
        tasks.spawn("outer", async move {
            nested.spawn("inner", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            });
            Ok::<(), String>(())
        });

        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_on_empty_set_returns() {
        tokio_test::assert_ok!(
            tokio::time::timeout(std::time::Duration::from_secs(1), BackgroundTasks::new().drain())
                .await
        );
    }
}
