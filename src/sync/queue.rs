//! Sequential write queue with positional coalescing, plus the transient
//! sync status indicator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::persistence::{Persistence, Write};

pub const SUCCESS_CLEAR_AFTER: Duration = Duration::from_secs(2);
pub const ERROR_CLEAR_AFTER: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Error(String),
}

/// Publishes the status indicator. Success and error revert to idle on a
/// timer unless a newer status replaced them first.
#[derive(Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<SyncStatus>>,
    generation: Arc<AtomicU64>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::Idle);
        StatusReporter {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn syncing(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.tx.send_replace(SyncStatus::Syncing);
    }

    pub fn success(&self) {
        self.transient(SyncStatus::Success, SUCCESS_CLEAR_AFTER);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.transient(SyncStatus::Error(message.into()), ERROR_CLEAR_AFTER);
    }

    fn transient(&self, status: SyncStatus, clear_after: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx.send_replace(status);

        let tx = self.tx.clone();
        let current = self.generation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(clear_after).await;
            if current.load(Ordering::SeqCst) == generation {
                tx.send_replace(SyncStatus::Idle);
            }
        });
    }
}

struct Job {
    backend: Arc<dyn Persistence>,
    write: Write,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    in_flight: bool,
    /// A status-reporting write ran since the last drain.
    reported: bool,
    /// A write failed since the most recent push.
    failed: bool,
}

impl QueueState {
    fn outstanding(&self) -> usize {
        self.jobs.len() + usize::from(self.in_flight)
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    outstanding: watch::Sender<usize>,
    closed: AtomicBool,
    status: StatusReporter,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Called with the state lock held so counts are published in order.
    fn publish(&self, state: &QueueState) {
        self.outstanding.send_replace(state.outstanding());
    }
}

/// Runs persistence writes one at a time in enqueue order on a background task.
///
/// Must be created inside a tokio runtime.
pub struct WriteQueue {
    shared: Arc<Shared>,
    _worker: JoinHandle<()>,
}

impl WriteQueue {
    pub fn new(status: StatusReporter) -> Self {
        let (outstanding, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            outstanding,
            closed: AtomicBool::new(false),
            status,
        });
        let worker = tokio::spawn(run(shared.clone()));
        WriteQueue {
            shared,
            _worker: worker,
        }
    }

    /// Enqueue a write. A queued write with the same coalesce key is dropped
    /// in favor of this one.
    pub fn push(&self, backend: Arc<dyn Persistence>, write: Write) {
        let reports = backend.reports_status();
        {
            let mut state = self.shared.state();
            if let Some(key) = write.coalesce_key() {
                let before = state.jobs.len();
                state
                    .jobs
                    .retain(|job| job.write.coalesce_key().as_ref() != Some(&key));
                if state.jobs.len() < before {
                    debug!(?key, "Superseded pending write");
                }
            }
            state.jobs.push_back(Job { backend, write });
            state.failed = false;
            state.reported |= reports;
            self.shared.publish(&state);
        }
        if reports {
            self.shared.status.syncing();
        }
        self.shared.notify.notify_one();
    }

    /// Drop every write that has not started yet.
    pub fn clear(&self) {
        let mut state = self.shared.state();
        if !state.jobs.is_empty() {
            debug!(count = state.jobs.len(), "Discarding pending writes");
        }
        state.jobs.clear();
        state.reported = false;
        self.shared.publish(&state);
    }

    /// Writes queued or running.
    pub fn pending(&self) -> usize {
        *self.shared.outstanding.borrow()
    }

    /// Wait until every queued write has finished.
    pub async fn flush(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn status(&self) -> &StatusReporter {
        &self.shared.status
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.state();
            let job = state.jobs.pop_front();
            state.in_flight = job.is_some();
            job
        };
        let Some(job) = next else {
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            shared.notify.notified().await;
            continue;
        };

        let label = job.write.label();
        let reports = job.backend.reports_status();
        let result = job.backend.write(&job.write).await;

        {
            let mut state = shared.state();
            state.in_flight = false;
            match &result {
                Ok(()) => debug!(write = label, "Write persisted"),
                Err(e) => {
                    warn!(write = label, error = %e, "Write failed");
                    if reports {
                        state.failed = true;
                        shared.status.error(e.to_string());
                    }
                }
            }
            if state.jobs.is_empty() {
                if state.reported && !state.failed {
                    shared.status.success();
                }
                state.reported = false;
            }
            shared.publish(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::error::PersistError;
    use crate::models::AppData;
    use crate::persistence::{Change, Granularity};

    struct GatedBackend {
        gate: Semaphore,
        started: AtomicUsize,
        written: Mutex<Vec<Write>>,
        fail: bool,
    }

    impl GatedBackend {
        fn new(open: bool, fail: bool) -> Arc<Self> {
            Arc::new(GatedBackend {
                gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
                started: AtomicUsize::new(0),
                written: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn labels(&self) -> Vec<&'static str> {
            self.written.lock().unwrap().iter().map(Write::label).collect()
        }
    }

    #[async_trait]
    impl Persistence for GatedBackend {
        fn granularity(&self) -> Granularity {
            Granularity::Row
        }

        async fn load(&self) -> Result<AppData, PersistError> {
            Ok(AppData::default())
        }

        async fn write(&self, write: &Write) -> Result<(), PersistError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.written.lock().unwrap().push(write.clone());
            if self.fail {
                return Err(PersistError::Network("offline".into()));
            }
            Ok(())
        }
    }

    fn upsert(list_id: &str) -> Write {
        Write::Row(Change::UpsertTasks {
            list_id: list_id.into(),
            tasks: vec![],
        })
    }

    fn delete(id: &str) -> Write {
        Write::Row(Change::DeleteTask { id: id.into() })
    }

    #[tokio::test]
    async fn writes_run_in_order() {
        let backend = GatedBackend::new(true, false);
        let queue = WriteQueue::new(StatusReporter::new());
        queue.push(backend.clone(), delete("a"));
        queue.push(backend.clone(), upsert("l"));
        queue.push(backend.clone(), delete("b"));
        queue.flush().await;
        assert_eq!(backend.labels(), vec!["delete_task", "upsert_tasks", "delete_task"]);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn newer_positional_write_supersedes_queued_one() {
        let backend = GatedBackend::new(false, false);
        let queue = WriteQueue::new(StatusReporter::new());

        queue.push(backend.clone(), delete("first"));
        while backend.started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        queue.push(backend.clone(), upsert("l"));
        queue.push(backend.clone(), delete("second"));
        queue.push(backend.clone(), upsert("other"));
        queue.push(backend.clone(), upsert("l"));
        assert_eq!(queue.pending(), 5 - 1);

        backend.gate.add_permits(16);
        queue.flush().await;
        let written = backend.written.lock().unwrap().clone();
        assert_eq!(
            written,
            vec![delete("first"), delete("second"), upsert("other"), upsert("l")]
        );
    }

    #[tokio::test]
    async fn clear_drops_pending_writes() {
        let backend = GatedBackend::new(false, false);
        let queue = WriteQueue::new(StatusReporter::new());
        queue.push(backend.clone(), delete("running"));
        while backend.started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        queue.push(backend.clone(), delete("dropped"));
        queue.clear();
        assert_eq!(queue.pending(), 1);

        backend.gate.add_permits(16);
        queue.flush().await;
        assert_eq!(backend.written.lock().unwrap().clone(), vec![delete("running")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pending_count_settles_at_zero_under_contention() {
        let backend = GatedBackend::new(true, false);
        let queue = Arc::new(WriteQueue::new(StatusReporter::new()));
        let pushers: Vec<_> = (0..4)
            .map(|n| {
                let queue = queue.clone();
                let backend = backend.clone();
                tokio::spawn(async move {
                    for i in 0..50 {
                        queue.push(backend.clone(), delete(&format!("{n}-{i}")));
                        if i % 10 == 0 {
                            queue.clear();
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for pusher in pushers {
            pusher.await.unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(5), queue.flush())
            .await
            .expect("flush hung on a stale pending count");
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_status_clears_after_two_seconds() {
        let backend = GatedBackend::new(true, false);
        let status = StatusReporter::new();
        let queue = WriteQueue::new(status.clone());

        queue.push(backend, delete("a"));
        assert_eq!(status.current(), SyncStatus::Syncing);
        queue.flush().await;
        assert_eq!(status.current(), SyncStatus::Success);

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(status.current(), SyncStatus::Success);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(status.current(), SyncStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_shows_error_then_clears() {
        let backend = GatedBackend::new(true, true);
        let status = StatusReporter::new();
        let queue = WriteQueue::new(status.clone());

        queue.push(backend, delete("a"));
        queue.flush().await;
        assert!(matches!(status.current(), SyncStatus::Error(msg) if msg.contains("offline")));

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(status.current(), SyncStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_status_survives_older_timer() {
        let status = StatusReporter::new();
        status.error("boom");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        status.syncing();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(status.current(), SyncStatus::Syncing);
    }
}
