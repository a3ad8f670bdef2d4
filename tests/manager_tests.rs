//! Integration tests of the reconciliation manager: coalescing, per-name
//! serialization, and cross-name parallelism.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hydros::controller::{Manager, NamedReconciler};
use tokio::sync::{Mutex, Semaphore};

struct Recorder {
    name: String,
    seen: Mutex<Vec<Option<String>>>,
    gate: Semaphore,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Recorder {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            seen: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl NamedReconciler<String> for Recorder {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn reconcile(&self, event: Option<String>) -> anyhow::Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _permit = self.gate.acquire().await?;
        self.seen.lock().await.push(event);
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// With one worker, events e2 and e3 enqueued while e1 runs collapse to a
/// single follow-up reconcile carrying e3; e2 is never observed.
#[tokio::test]
async fn test_coalescing_is_latest_wins() {
    let manager: Manager<String> = Manager::new();
    let recorder = Recorder::new("repo");
    manager
        .add_reconciler(Arc::clone(&recorder) as _)
        .await
        .unwrap();
    manager.start(1, None).await;

    manager.enqueue("repo", Some("e1".to_string())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.enqueue("repo", Some("e2".to_string())).await.unwrap();
    manager.enqueue("repo", Some("e3".to_string())).await.unwrap();

    recorder.gate.add_permits(4);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = recorder.seen.lock().await.clone();
    assert_eq!(seen, vec![Some("e1".to_string()), Some("e3".to_string())]);
    manager.shutdown(Duration::from_secs(1)).await;
}

/// Reconciles for different names proceed in parallel, bounded by the
/// worker count; reconciles for one name never overlap.
#[tokio::test]
async fn test_parallel_across_names_serial_within() {
    let manager: Manager<String> = Manager::new();
    let first = Recorder::new("first");
    let second = Recorder::new("second");
    manager.add_reconciler(Arc::clone(&first) as _).await.unwrap();
    manager.add_reconciler(Arc::clone(&second) as _).await.unwrap();
    manager.start(2, None).await;

    for i in 0..4 {
        manager.enqueue("first", Some(format!("f{i}"))).await.unwrap();
        manager.enqueue("second", Some(format!("s{i}"))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Both names are in flight simultaneously on separate workers.
    assert_eq!(first.running.load(Ordering::SeqCst), 1);
    assert_eq!(second.running.load(Ordering::SeqCst), 1);

    first.gate.add_permits(8);
    second.gate.add_permits(8);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(first.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(second.max_running.load(Ordering::SeqCst), 1);
    // Coalescing: the first event ran, then exactly one follow-up.
    assert_eq!(first.seen.lock().await.len(), 2);
    assert_eq!(second.seen.lock().await.len(), 2);
    manager.shutdown(Duration::from_secs(1)).await;
}

/// The periodic resync enqueues every known reconciler with an empty event.
#[tokio::test]
async fn test_periodic_resync_sends_empty_events() {
    let manager: Manager<String> = Manager::new();
    let recorder = Recorder::new("repo");
    recorder.gate.add_permits(100);
    manager
        .add_reconciler(Arc::clone(&recorder) as _)
        .await
        .unwrap();
    manager.start(1, Some(Duration::from_millis(20))).await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    manager.shutdown(Duration::from_secs(1)).await;

    let seen = recorder.seen.lock().await.clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(Option::is_none));
}
