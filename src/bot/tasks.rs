//! Background work spawned while handling a message.

use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Spawn `fut` and log its error or panic. This is the one place detached
/// task failures are reported.
pub fn spawn_logged<F>(label: impl Into<String>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), String>> + Send + 'static,
{
    let label = label.into();
    // The inner task catches the panic; the outer one reports it.
    let inner = tokio::spawn(fut);
    tokio::spawn(async move {
        match inner.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} failed: {}", label, e),
            Err(e) if e.is_panic() => error!("{} panicked: {}", label, e),
            Err(e) => warn!("{} was cancelled: {}", label, e),
        }
    })
}

/// Tasks started for one message. Dropping it detaches them.
#[derive(Default)]
pub struct TaskSet {
    handles: Vec<JoinHandle<()>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Wait for every task. Panics inside a task are logged, not propagated.
    /// Dropping the set instead leaves the tasks running.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background task panicked: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::testing::capture_logs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_join_waits_for_all() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tasks = TaskSet::new();
        for _ in 0..3 {
            let counter = counter.clone();
            tasks.push(spawn_logged("count", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        tasks.join().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_task_does_not_affect_siblings() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tasks = TaskSet::new();
        tasks.push(spawn_logged("fail", async { Err("boom".to_string()) }));
        let c = counter.clone();
        tasks.push(spawn_logged("ok", async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        tasks.join().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let mut tasks = TaskSet::new();
        tasks.push(tokio::spawn(async { panic!("task blew up") }));
        tasks.join().await;
    }

    #[tokio::test]
    async fn test_detached_panic_is_logged() {
        let (_guard, logs) = capture_logs();

        let mut tasks = TaskSet::new();
        tasks.push(spawn_logged("render", async { panic!("codec blew up") }));
        drop(tasks);

        for _ in 0..50 {
            if !logs.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let logs = logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].0, tracing::Level::ERROR);
        assert!(logs[0].1.starts_with("render panicked"));
    }

    #[tokio::test]
    async fn test_detached_error_is_logged() {
        let (_guard, logs) = capture_logs();

        drop(spawn_logged("render", async { Err("boom".to_string()) }));

        for _ in 0..50 {
            if !logs.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let logs = logs.lock().unwrap();
        assert_eq!(*logs, vec![(tracing::Level::WARN, "render failed: boom".to_string())]);
    }
}
