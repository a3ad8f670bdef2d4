//! # Reconciliation manager
//!
//! Serializes per-resource work through a fixed worker pool. Each reconciler
//! record enforces at-most-one concurrent reconcile per name; events enqueued
//! while a reconcile runs collapse to the most recent one (latest wins) and
//! are picked up when the current run completes. Reconciles across different
//! names run in parallel, bounded by the worker count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::ControllerError;
use crate::observability::metrics;

/// A named unit of coalescable work. The manager owns the record keyed by
/// [`NamedReconciler::name`]; the reconciler owns everything else (its
/// working directory included).
#[async_trait]
pub trait NamedReconciler<E>: Send + Sync {
    /// Unique name; one record and at most one in-flight reconcile exist per
    /// name.
    fn name(&self) -> String;

    /// Run one reconcile. `event` is `None` for periodic resyncs.
    async fn reconcile(&self, event: Option<E>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Idle,
    Running,
}

struct Record<E> {
    reconciler: Arc<dyn NamedReconciler<E>>,
    state: RecordState,
    /// Event for the dispatched run the worker has not picked up yet.
    current: Option<E>,
    /// Latest event enqueued while running; `Some(None)` is a pending empty
    /// event.
    pending: Option<Option<E>>,
}

struct Inner<E> {
    records: Mutex<HashMap<String, Record<E>>>,
    queue: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

/// Worker-pool manager with latest-wins coalescing.
pub struct Manager<E> {
    inner: Arc<Inner<E>>,
    workers: Mutex<JoinSet<()>>,
}

impl<E: Send + Clone + 'static> Manager<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(HashMap::new()),
                queue: Mutex::new(None),
            }),
            workers: Mutex::new(JoinSet::new()),
        }
    }

    /// Add a reconciler. Fails with [`ControllerError::DuplicateReconciler`]
    /// when the name is taken; callers racing to add the same resource treat
    /// that as benign.
    pub async fn add_reconciler(
        &self,
        reconciler: Arc<dyn NamedReconciler<E>>,
    ) -> Result<(), ControllerError> {
        let name = reconciler.name();
        let mut records = self.inner.records.lock().await;
        if records.contains_key(&name) {
            return Err(ControllerError::DuplicateReconciler(name));
        }
        debug!(name, "reconciler added");
        records.insert(
            name,
            Record {
                reconciler,
                state: RecordState::Idle,
                current: None,
                pending: None,
            },
        );
        Ok(())
    }

    /// Whether a reconciler with this name exists.
    pub async fn has_reconciler(&self, name: &str) -> bool {
        self.inner.records.lock().await.contains_key(name)
    }

    /// Enqueue an event for `name`. If the record is idle the event is
    /// dispatched to a worker; if a reconcile is already running the pending
    /// event is overwritten, latest wins.
    pub async fn enqueue(&self, name: &str, event: Option<E>) -> Result<(), ControllerError> {
        let mut records = self.inner.records.lock().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| ControllerError::UnknownReconciler(name.to_string()))?;
        match record.state {
            RecordState::Idle => {
                record.state = RecordState::Running;
                record.current = event;
                drop(records);
                self.dispatch(name).await?;
            }
            RecordState::Running => {
                debug!(name, "reconcile in flight; coalescing event");
                record.pending = Some(event);
            }
        }
        Ok(())
    }

    async fn dispatch(&self, name: &str) -> Result<(), ControllerError> {
        let queue = self.inner.queue.lock().await;
        let sender = queue.as_ref().ok_or(ControllerError::ShuttingDown)?;
        sender
            .send(name.to_string())
            .map_err(|_| ControllerError::ShuttingDown)
    }

    /// Launch `workers` worker tasks and, when `resync_period` is set, a
    /// periodic resync that enqueues every known reconciler with an empty
    /// event.
    pub async fn start(&self, workers: usize, resync_period: Option<Duration>) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        *self.inner.queue.lock().await = Some(tx);
        let rx = Arc::new(Mutex::new(rx));

        let mut pool = self.workers.lock().await;
        for worker in 0..workers.max(1) {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&rx);
            pool.spawn(async move {
                loop {
                    let name = { rx.lock().await.recv().await };
                    let Some(name) = name else {
                        debug!(worker, "queue closed; worker exiting");
                        return;
                    };
                    run_one(&inner, &name).await;
                }
            });
        }

        if let Some(period) = resync_period {
            let inner = Arc::clone(&self.inner);
            pool.spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    resync(&inner).await;
                }
            });
        }
        info!(workers, resync = ?resync_period, "manager started");
    }

    /// Stop accepting enqueues, drain in-flight reconciles, and return.
    /// Waits a bounded time for workers before abandoning them.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        // Dropping the sender closes the queue; workers exit once drained.
        self.inner.queue.lock().await.take();
        let mut pool = self.workers.lock().await;
        pool.abort_all_on_timeout(drain_timeout).await;
        info!("manager stopped");
    }
}

impl<E: Send + Clone + 'static> Default for Manager<E> {
    fn default() -> Self {
        Self::new()
    }
}

trait JoinSetExt {
    async fn abort_all_on_timeout(&mut self, timeout: Duration);
}

impl JoinSetExt for JoinSet<()> {
    async fn abort_all_on_timeout(&mut self, timeout: Duration) {
        let drain = async {
            while self.join_next().await.is_some() {}
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("workers did not drain in time; aborting");
            self.abort_all();
            while self.join_next().await.is_some() {}
        }
    }
}

async fn run_one<E: Send + Clone + 'static>(inner: &Arc<Inner<E>>, name: &str) {
    loop {
        let (reconciler, event) = {
            let mut records = inner.records.lock().await;
            let Some(record) = records.get_mut(name) else {
                warn!(name, "record vanished while queued");
                return;
            };
            (Arc::clone(&record.reconciler), record.current.take())
        };

        metrics::reconciles_inc();
        let timer = std::time::Instant::now();
        let outcome = std::panic::AssertUnwindSafe(reconciler.reconcile(event))
            .catch_unwind()
            .await;
        metrics::reconcile_duration_observe(timer.elapsed().as_secs_f64());
        match outcome {
            Ok(Ok(())) => debug!(name, "reconcile succeeded"),
            Ok(Err(e)) => {
                metrics::reconcile_errors_inc();
                error!(name, error = %format!("{e:#}"), "reconcile failed");
            }
            Err(panic) => {
                metrics::reconcile_errors_inc();
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    name,
                    error = %ControllerError::Internal(reason),
                    "reconcile panicked"
                );
            }
        }

        // Transition running -> idle atomically with the pending pickup: if
        // an event arrived while we ran, keep the record running and loop.
        let mut records = inner.records.lock().await;
        let Some(record) = records.get_mut(name) else {
            return;
        };
        match record.pending.take() {
            Some(event) => {
                record.current = event;
            }
            None => {
                record.state = RecordState::Idle;
                return;
            }
        }
    }
}

async fn resync<E: Send + Clone + 'static>(inner: &Arc<Inner<E>>) {
    let names: Vec<String> = {
        let records = inner.records.lock().await;
        records.keys().cloned().collect()
    };
    debug!(count = names.len(), "periodic resync");
    for name in names {
        let mut records = inner.records.lock().await;
        let Some(record) = records.get_mut(&name) else {
            continue;
        };
        match record.state {
            RecordState::Idle => {
                record.state = RecordState::Running;
                record.current = None;
                drop(records);
                let queue = inner.queue.lock().await;
                if let Some(sender) = queue.as_ref() {
                    let _ = sender.send(name);
                }
            }
            RecordState::Running => {
                record.pending = Some(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every event it sees and can be made to block until released.
    struct Recording {
        name: String,
        seen: Mutex<Vec<Option<u64>>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        gate: tokio::sync::Semaphore,
    }

    impl Recording {
        fn new(name: &str, permits: usize) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                gate: tokio::sync::Semaphore::new(permits),
            })
        }
    }

    #[async_trait]
    impl NamedReconciler<u64> for Recording {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn reconcile(&self, event: Option<u64>) -> anyhow::Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let _permit = self.gate.acquire().await?;
            self.seen.lock().await.push(event);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_duplicate_reconciler_rejected() {
        let manager: Manager<u64> = Manager::new();
        manager.add_reconciler(Recording::new("a", 1)).await.unwrap();
        let err = manager
            .add_reconciler(Recording::new("a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::DuplicateReconciler(_)));
    }

    #[tokio::test]
    async fn test_enqueue_unknown_name_fails() {
        let manager: Manager<u64> = Manager::new();
        manager.start(1, None).await;
        let err = manager.enqueue("ghost", None).await.unwrap_err();
        assert!(matches!(err, ControllerError::UnknownReconciler(_)));
        manager.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_coalescing_latest_wins() {
        let manager: Manager<u64> = Manager::new();
        let reconciler = Recording::new("n", 0);
        manager.add_reconciler(Arc::clone(&reconciler) as _).await.unwrap();
        manager.start(1, None).await;

        // e1 starts and blocks on the gate; e2 and e3 arrive while running.
        manager.enqueue("n", Some(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.enqueue("n", Some(2)).await.unwrap();
        manager.enqueue("n", Some(3)).await.unwrap();

        // Release e1 and the coalesced follow-up.
        reconciler.gate.add_permits(2);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = reconciler.seen.lock().await.clone();
        assert_eq!(seen, vec![Some(1), Some(3)]);
        manager.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_at_most_one_reconcile_per_name() {
        let manager: Manager<u64> = Manager::new();
        let reconciler = Recording::new("n", 0);
        manager.add_reconciler(Arc::clone(&reconciler) as _).await.unwrap();
        manager.start(4, None).await;

        for i in 0..10 {
            manager.enqueue("n", Some(i)).await.unwrap();
        }
        reconciler.gate.add_permits(20);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(reconciler.max_running.load(Ordering::SeqCst), 1);
        manager.shutdown(Duration::from_secs(1)).await;
    }

    /// A reconciler that panics once, to prove workers survive.
    struct Panicky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NamedReconciler<u64> for Panicky {
        fn name(&self) -> String {
            "panicky".to_string()
        }

        async fn reconcile(&self, _event: Option<u64>) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panic_is_recovered() {
        let manager: Manager<u64> = Manager::new();
        let reconciler = Arc::new(Panicky {
            calls: AtomicUsize::new(0),
        });
        manager.add_reconciler(Arc::clone(&reconciler) as _).await.unwrap();
        manager.start(1, None).await;

        manager.enqueue("panicky", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The worker survived the panic and still serves events.
        manager.enqueue("panicky", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
        manager.shutdown(Duration::from_secs(1)).await;
    }
}
