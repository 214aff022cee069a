//! Delayed side effects.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// A future that runs once after a delay, cancelled when dropped.
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `task` after `delay`.
    pub fn after<F>(name: &'static str, delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trace!(name, "Scheduled task firing");
            task.await;
        });
        Self { handle }
    }

    /// Cancel the task if it has not run yet.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let task = ScheduledTask::after("test", Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
        drop(task);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let task = ScheduledTask::after("test", Duration::from_secs(1), async move {
            flag.store(true, Ordering::SeqCst);
        });

        drop(task);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!fired.load(Ordering::SeqCst));
    }
}
