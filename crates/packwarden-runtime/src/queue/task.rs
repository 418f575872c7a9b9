//! Tasks and enqueue options

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A unit of work executed by a queue worker
#[async_trait]
pub trait Task: Send + Sync {
    /// Task kind, e.g. `Run`
    fn name(&self) -> &str;

    /// Identity used by unique enqueues and dumps
    fn id(&self) -> String {
        self.name().to_string()
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Callback run once a task leaves its queue
pub type OnDone = Box<dyn FnOnce() + Send>;

/// Counts outstanding tasks and lets callers wait for them
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    pub fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until the count drops to zero
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Modifiers of a single enqueue
#[derive(Default)]
pub struct EnqueueOptions {
    pub(crate) unique: bool,
    pub(crate) wait: Option<Arc<WaitGroup>>,
    pub(crate) on_done: Option<OnDone>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the task if an equal one is already pending
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Count the task in `wait` until it leaves the queue
    pub fn wait(mut self, wait: Arc<WaitGroup>) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Run `f` once the task leaves the queue, whatever the outcome
    pub fn on_done(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_done = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for EnqueueOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueOptions")
            .field("unique", &self.unique)
            .field("wait", &self.wait.is_some())
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_group() {
        let wg = Arc::new(WaitGroup::new());
        wg.wait().await;

        wg.add(2);
        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };

        wg.done();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        wg.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wg.count(), 0);
    }

    #[test]
    fn test_options_builder() {
        let options = EnqueueOptions::new()
            .unique()
            .wait(Arc::new(WaitGroup::new()))
            .on_done(|| {});
        assert!(options.unique);
        assert!(options.wait.is_some());
        assert!(options.on_done.is_some());
    }
}
