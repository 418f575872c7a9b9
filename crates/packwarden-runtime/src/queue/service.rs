//! Named task queues
//!
//! Every queue is a FIFO with one worker, so tasks of a queue never overlap
//! while different queues run in parallel. A failed task stays at the head
//! of its queue and is retried with exponential backoff until it succeeds,
//! its context is cancelled or the queue is removed. A queue created again
//! under a removed name waits for the removed worker to exit first.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::task::{EnqueueOptions, OnDone, Task, WaitGroup};
use crate::error::{Result, RuntimeError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before the `retries`-th retry
pub fn backoff(retries: u32) -> Duration {
    let factor = 2u32.saturating_pow(retries.saturating_sub(1));
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

struct Entry {
    task: Arc<dyn Task>,
    cancel: CancellationToken,
    wait: Option<Arc<WaitGroup>>,
    on_done: Option<OnDone>,
}

impl Entry {
    fn finish(mut self) {
        if let Some(on_done) = self.on_done.take() {
            on_done();
        }
        if let Some(wait) = self.wait.take() {
            wait.done();
        }
    }
}

#[derive(Default)]
struct State {
    pending: VecDeque<Entry>,
    current: Option<String>,
    retries: u32,
    last_error: Option<String>,
}

struct Queue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    cancel: CancellationToken,
    started: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    previous: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    fn new(name: &str, parent: &CancellationToken) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            cancel: parent.child_token(),
            started: AtomicBool::new(false),
            worker: Mutex::new(None),
            previous: Mutex::new(None),
        }
    }

    /// Spawn the worker; later calls do nothing
    fn start(self: &Arc<Self>, tracker: &TaskTracker) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let queue = Arc::clone(self);
        let span = tracing::info_span!("queue", queue = %self.name);
        let handle = tracker.spawn(async move { queue.run().await }.instrument(span));
        *self.worker.lock() = Some(handle);
    }

    /// Push a task, or hand it back if `unique` finds an equal pending one
    fn push(&self, entry: Entry, unique: bool) -> std::result::Result<(), Entry> {
        {
            let mut state = self.state.lock();
            if unique {
                let id = entry.task.id();
                if state.pending.iter().any(|e| e.task.id() == id) {
                    return Err(entry);
                }
            }
            state.pending.push_back(entry);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn next(&self) -> Option<Entry> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            {
                let mut state = self.state.lock();
                if let Some(entry) = state.pending.pop_front() {
                    state.current = Some(entry.task.id());
                    return Some(entry);
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let previous = self.previous.lock().take();
        if let Some(previous) = previous {
            tracing::debug!("wait for the removed worker");
            if let Err(e) = previous.await {
                tracing::warn!(error = %e, "removed worker failed");
            }
        }

        tracing::debug!("queue started");

        while let Some(entry) = self.next().await {
            let id = entry.task.id();

            if entry.cancel.is_cancelled() {
                tracing::debug!(task = %id, "task cancelled before start");
                self.complete(entry);
                continue;
            }

            tracing::debug!(task = %id, "execute task");
            let result = tokio::select! {
                result = entry.task.execute(&entry.cancel) => result,
                _ = self.cancel.cancelled() => Err(RuntimeError::Cancelled),
            };

            match result {
                Ok(()) => self.complete(entry),
                Err(e)
                    if e.is_cancelled()
                        || entry.cancel.is_cancelled()
                        || self.cancel.is_cancelled() =>
                {
                    tracing::debug!(task = %id, "task cancelled");
                    self.complete(entry);
                }
                Err(e) => {
                    let delay = {
                        let mut state = self.state.lock();
                        state.retries += 1;
                        state.last_error = Some(e.to_string());
                        state.current = None;
                        state.pending.push_front(entry);
                        backoff(state.retries)
                    };
                    tracing::warn!(task = %id, error = %e, retry_in = ?delay, "task failed");

                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.drain();
        tracing::debug!("queue stopped");
    }

    fn complete(&self, entry: Entry) {
        {
            let mut state = self.state.lock();
            state.current = None;
            state.retries = 0;
            state.last_error = None;
        }
        entry.finish();
    }

    /// Release everything still pending
    fn drain(&self) {
        let pending: Vec<Entry> = {
            let mut state = self.state.lock();
            state.current = None;
            state.pending.drain(..).collect()
        };
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "drop pending tasks");
        }
        for entry in pending {
            entry.finish();
        }
    }

    fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + usize::from(state.current.is_some())
    }

    fn dump(&self) -> QueueDump {
        let state = self.state.lock();
        QueueDump {
            name: self.name.clone(),
            current: state.current.clone(),
            pending: state.pending.iter().map(|e| e.task.id()).collect(),
            retries: state.retries,
            last_error: state.last_error.clone(),
        }
    }
}

/// Snapshot of one queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueDump {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    pub pending: Vec<String>,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Owner of all queues
pub struct QueueService {
    queues: Mutex<BTreeMap<String, Arc<Queue>>>,
    /// Workers of removed queues that may still be finishing a task
    retiring: Mutex<BTreeMap<String, JoinHandle<()>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl QueueService {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            retiring: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Add a task to a queue, creating the queue and its worker on first use.
    ///
    /// A task whose context is already cancelled, or that arrives after
    /// [`stop`](Self::stop), is released right away.
    pub fn enqueue(
        &self,
        cancel: &CancellationToken,
        queue: &str,
        task: Arc<dyn Task>,
        options: EnqueueOptions,
    ) {
        let EnqueueOptions {
            unique,
            wait,
            on_done,
        } = options;

        if let Some(wait) = &wait {
            wait.add(1);
        }

        let entry = Entry {
            task,
            cancel: cancel.clone(),
            wait,
            on_done,
        };

        if self.cancel.is_cancelled() || cancel.is_cancelled() {
            tracing::debug!(queue = %queue, task = %entry.task.id(), "drop task of a cancelled context");
            entry.finish();
            return;
        }

        let target = {
            let mut queues = self.queues.lock();
            let target = match queues.get(queue) {
                Some(existing) => existing.clone(),
                None => {
                    let created = Arc::new(Queue::new(queue, &self.cancel));
                    *created.previous.lock() = self.retiring.lock().remove(queue);
                    queues.insert(queue.to_string(), created.clone());
                    created
                }
            };
            target.start(&self.tracker);
            target
        };

        if let Err(mut entry) = target.push(entry, unique) {
            tracing::debug!(queue = %queue, task = %entry.task.id(), "task already queued");
            if let Some(wait) = entry.wait.take() {
                wait.done();
            }
        }
    }

    /// Drop a queue. Its worker stops after the current task and releases
    /// everything still pending. Safe to call from a task's `on_done`.
    ///
    /// A queue created later under the same name starts running only after
    /// this worker has exited, so tasks of one name never overlap.
    pub fn remove(&self, queue: &str) {
        let removed = self.queues.lock().remove(queue);
        let Some(removed) = removed else {
            return;
        };

        tracing::debug!(queue = %queue, "remove queue");
        removed.cancel.cancel();

        let mut retiring = self.retiring.lock();
        retiring.retain(|_, handle| !handle.is_finished());
        if let Some(handle) = removed.worker.lock().take() {
            retiring.insert(queue.to_string(), handle);
        }
    }

    /// Cancel every queue and wait for the workers
    pub async fn stop(&self) {
        tracing::info!("stop queue service");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.queues.lock().clear();
        self.retiring.lock().clear();
    }

    pub fn exists(&self, queue: &str) -> bool {
        self.queues.lock().contains_key(queue)
    }

    /// Pending and running tasks of a queue
    pub fn len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map(|q| q.len()).unwrap_or(0)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<QueueDump> {
        let queues: Vec<Arc<Queue>> = self.queues.lock().values().cloned().collect();
        queues.iter().map(|q| q.dump()).collect()
    }

    /// YAML snapshot of all queues
    pub fn dump(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.snapshot())?)
    }
}

impl Default for QueueService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Task recording its runs into a shared log
    struct TestTask {
        id: String,
        log: Arc<PlMutex<Vec<String>>>,
        failures: AtomicUsize,
        gate: Option<Arc<Notify>>,
        delay: Duration,
    }

    impl TestTask {
        fn new(id: &str, log: &Arc<PlMutex<Vec<String>>>) -> Self {
            Self {
                id: id.to_string(),
                log: log.clone(),
                failures: AtomicUsize::new(0),
                gate: None,
                delay: Duration::ZERO,
            }
        }

        fn failing(self, times: usize) -> Self {
            self.failures.store(times, Ordering::SeqCst);
            self
        }

        fn gated(mut self, gate: &Arc<Notify>) -> Self {
            self.gate = Some(gate.clone());
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Task for TestTask {
        fn name(&self) -> &str {
            &self.id
        }

        async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
            if let Some(gate) = &self.gate {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                }
            }
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                }
            }

            self.log.lock().push(self.id.clone());
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(RuntimeError::Server("temporary failure".to_string()));
            }
            Ok(())
        }
    }

    fn log() -> Arc<PlMutex<Vec<String>>> {
        Arc::new(PlMutex::new(Vec::new()))
    }

    async fn wait(wg: &WaitGroup) {
        tokio::time::timeout(Duration::from_secs(5), wg.wait())
            .await
            .expect("tasks should complete");
    }

    #[test]
    fn test_backoff_is_bounded() {
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(2), Duration::from_millis(200));
        assert_eq!(backoff(4), Duration::from_millis(800));
        assert_eq!(backoff(20), MAX_BACKOFF);
        assert_eq!(backoff(u32::MAX), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let service = QueueService::new();
        let log = log();
        let wg = Arc::new(WaitGroup::new());
        let cancel = CancellationToken::new();

        for id in ["a", "b", "c"] {
            service.enqueue(
                &cancel,
                "q",
                Arc::new(TestTask::new(id, &log).slow(Duration::from_millis(5))),
                EnqueueOptions::new().wait(wg.clone()),
            );
        }

        wait(&wg).await;
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_queues_run_in_parallel() {
        let service = QueueService::new();
        let log = log();
        let gate = Arc::new(Notify::new());
        let wg = Arc::new(WaitGroup::new());
        let cancel = CancellationToken::new();

        service.enqueue(
            &cancel,
            "blocked",
            Arc::new(TestTask::new("blocked", &log).gated(&gate)),
            EnqueueOptions::new(),
        );
        service.enqueue(
            &cancel,
            "free",
            Arc::new(TestTask::new("free", &log)),
            EnqueueOptions::new().wait(wg.clone()),
        );

        wait(&wg).await;
        assert_eq!(*log.lock(), vec!["free"]);
        assert_eq!(service.len("blocked"), 1);

        gate.notify_one();
        service.stop().await;
    }

    #[tokio::test]
    async fn test_failed_task_is_retried_before_next() {
        let service = QueueService::new();
        let log = log();
        let wg = Arc::new(WaitGroup::new());
        let cancel = CancellationToken::new();

        service.enqueue(
            &cancel,
            "q",
            Arc::new(TestTask::new("flaky", &log).failing(2)),
            EnqueueOptions::new().wait(wg.clone()),
        );
        service.enqueue(
            &cancel,
            "q",
            Arc::new(TestTask::new("next", &log)),
            EnqueueOptions::new().wait(wg.clone()),
        );

        wait(&wg).await;
        assert_eq!(*log.lock(), vec!["flaky", "flaky", "flaky", "next"]);

        let dump = &service.snapshot()[0];
        assert_eq!(dump.retries, 0);
        assert!(dump.last_error.is_none());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_dump_shows_last_error() {
        let service = QueueService::new();
        let log = log();
        let cancel = CancellationToken::new();

        service.enqueue(
            &cancel,
            "q",
            Arc::new(TestTask::new("broken", &log).failing(usize::MAX)),
            EnqueueOptions::new(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let dump = service.dump().unwrap();
        assert!(dump.contains("temporary failure"));
        assert!(dump.contains("broken"));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_unique_coalesces_pending() {
        let service = QueueService::new();
        let log = log();
        let gate = Arc::new(Notify::new());
        let wg = Arc::new(WaitGroup::new());
        let cancel = CancellationToken::new();

        service.enqueue(
            &cancel,
            "q",
            Arc::new(TestTask::new("run", &log).gated(&gate)),
            EnqueueOptions::new().wait(wg.clone()),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the running copy does not count
        service.enqueue(
            &cancel,
            "q",
            Arc::new(TestTask::new("run", &log)),
            EnqueueOptions::new().unique().wait(wg.clone()),
        );
        service.enqueue(
            &cancel,
            "q",
            Arc::new(TestTask::new("run", &log)),
            EnqueueOptions::new().unique().wait(wg.clone()),
        );

        let dump = &service.snapshot()[0];
        assert_eq!(dump.current.as_deref(), Some("run"));
        assert_eq!(dump.pending, vec!["run"]);

        gate.notify_one();
        wait(&wg).await;
        assert_eq!(log.lock().len(), 2);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_dump_format() {
        let service = QueueService::new();
        let log = log();
        let gate = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        service.enqueue(
            &cancel,
            "echo",
            Arc::new(TestTask::new("Startup:echo", &log).gated(&gate)),
            EnqueueOptions::new(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.enqueue(
            &cancel,
            "echo",
            Arc::new(TestTask::new("Run:echo", &log)),
            EnqueueOptions::new(),
        );

        insta::assert_snapshot!(service.dump().unwrap(), @r"
        - name: echo
          current: Startup:echo
          pending:
          - Run:echo
          retries: 0
        ");

        gate.notify_one();
        service.stop().await;
    }

    #[tokio::test]
    async fn test_cancelled_context_releases_waiters() {
        let service = QueueService::new();
        let log = log();
        let gate = Arc::new(Notify::new());
        let wg = Arc::new(WaitGroup::new());
        let done = Arc::new(AtomicUsize::new(0));
        let package = CancellationToken::new();

        for id in ["first", "second"] {
            let done = done.clone();
            service.enqueue(
                &package,
                "q",
                Arc::new(TestTask::new(id, &log).gated(&gate)),
                EnqueueOptions::new().wait(wg.clone()).on_done(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        package.cancel();
        wait(&wg).await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert!(log.lock().is_empty());

        // enqueue with a cancelled context never reaches the queue
        let done_late = done.clone();
        service.enqueue(
            &package,
            "q",
            Arc::new(TestTask::new("late", &log)),
            EnqueueOptions::new().wait(wg.clone()).on_done(move || {
                done_late.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(wg.count(), 0);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_remove_drains_pending() {
        let service = QueueService::new();
        let log = log();
        let gate = Arc::new(Notify::new());
        let wg = Arc::new(WaitGroup::new());
        let done = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        for id in ["running", "pending-1", "pending-2"] {
            let done = done.clone();
            service.enqueue(
                &cancel,
                "q",
                Arc::new(TestTask::new(id, &log).gated(&gate)),
                EnqueueOptions::new().wait(wg.clone()).on_done(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        service.remove("q");
        assert!(!service.exists("q"));

        wait(&wg).await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(log.lock().is_empty());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_remove_from_on_done() {
        let service = Arc::new(QueueService::new());
        let log = log();
        let wg = Arc::new(WaitGroup::new());
        let cancel = CancellationToken::new();

        let remover = service.clone();
        service.enqueue(
            &cancel,
            "echo",
            Arc::new(TestTask::new("Disable:echo", &log)),
            EnqueueOptions::new()
                .wait(wg.clone())
                .on_done(move || remover.remove("echo")),
        );

        wait(&wg).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!service.exists("echo"));

        // a new queue with the same name starts fresh
        service.enqueue(
            &cancel,
            "echo",
            Arc::new(TestTask::new("Load:echo", &log)),
            EnqueueOptions::new().wait(wg.clone()),
        );
        wait(&wg).await;
        assert_eq!(*log.lock(), vec!["Disable:echo", "Load:echo"]);
        service.stop().await;
    }

    /// Task tracking how many instances run at the same time
    struct OverlapTask {
        id: String,
        running: Arc<AtomicUsize>,
        max: Arc<AtomicUsize>,
        started: Arc<Notify>,
        log: Arc<PlMutex<Vec<String>>>,
        delay: Duration,
    }

    struct RunningGuard(Arc<AtomicUsize>);

    impl Drop for RunningGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Task for OverlapTask {
        fn name(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _cancel: &CancellationToken) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard(self.running.clone());
            self.started.notify_one();

            // ignores its own context; only the worker can interrupt it
            tokio::time::sleep(self.delay).await;
            self.log.lock().push(self.id.clone());
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recreated_queue_waits_for_removed_worker() {
        let service = QueueService::new();
        let log = log();
        let running = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Notify::new());
        let wg = Arc::new(WaitGroup::new());
        let cancel = CancellationToken::new();

        let task = |id: &str, delay: Duration| OverlapTask {
            id: id.to_string(),
            running: running.clone(),
            max: max.clone(),
            started: started.clone(),
            log: log.clone(),
            delay,
        };

        service.enqueue(
            &cancel,
            "q",
            Arc::new(task("old", Duration::from_secs(60))),
            EnqueueOptions::new(),
        );
        tokio::time::timeout(Duration::from_secs(5), started.notified())
            .await
            .expect("old task should start");

        service.remove("q");
        service.enqueue(
            &cancel,
            "q",
            Arc::new(task("new", Duration::from_millis(5))),
            EnqueueOptions::new().wait(wg.clone()),
        );

        wait(&wg).await;
        assert_eq!(max.load(Ordering::SeqCst), 1);
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock(), vec!["new"]);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_and_rejects() {
        let service = QueueService::new();
        let log = log();
        let wg = Arc::new(WaitGroup::new());
        let cancel = CancellationToken::new();

        service.enqueue(
            &cancel,
            "q",
            Arc::new(TestTask::new("slow", &log).slow(Duration::from_secs(60))),
            EnqueueOptions::new().wait(wg.clone()),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::timeout(Duration::from_secs(1), service.stop())
            .await
            .expect("stop should not wait for the slow task");
        assert_eq!(wg.count(), 0);

        service.enqueue(
            &cancel,
            "q",
            Arc::new(TestTask::new("after-stop", &log)),
            EnqueueOptions::new().wait(wg.clone()),
        );
        assert_eq!(wg.count(), 0);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let tracker = TaskTracker::new();
        let root = CancellationToken::new();
        let queue = Arc::new(Queue::new("q", &root));
        queue.start(&tracker);
        queue.start(&tracker);
        queue.start(&tracker);
        assert_eq!(tracker.len(), 1);

        root.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
