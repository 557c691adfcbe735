//! Cancellation and background task bookkeeping shared by every loop.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One-shot cancellation signal observed by many tasks.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves once `cancel` is set or its sender is gone.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `period`; returns false when cancelled first.
pub async fn sleep_or_cancel(period: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    let slept = tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = cancelled(cancel) => false,
    };
    slept && !*cancel.borrow()
}

/// Named join handles of a device's background tasks.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push((name, tokio::spawn(fut)));
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await every task; a task that panicked is logged.
    pub async fn join_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            match handle.await {
                Ok(()) => debug!(task = name, "task finished"),
                Err(e) => warn!(task = name, error = %e, "task ended abnormally"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn trigger_wakes_every_subscriber() {
        let shutdown = Shutdown::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let tasks = TaskSet::new();
        for _ in 0..3 {
            let mut rx = shutdown.subscribe();
            let ticks = Arc::clone(&ticks);
            tasks.spawn("ticker", async move {
                while sleep_or_cancel(Duration::from_millis(5), &mut rx).await {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        tasks.join_all().await;
        assert!(tasks.is_empty());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn cancelled_returns_when_already_set() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut rx = shutdown.subscribe();
        cancelled(&mut rx).await;
        assert!(!sleep_or_cancel(Duration::from_secs(60), &mut rx).await);
    }
}
