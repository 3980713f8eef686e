//! Reconciliation behaviour against an in-memory store and a scripted adapter.

use async_trait::async_trait;
use snare_common::{
    ActualState, DecoyKind, DesiredState, DesiredStateRecord, MemoryStateStore, SnareError,
    StateStore,
};
use snared::decoys::{spawn_serve, DecoyAdapter, DecoyError, DecoyTask, Lifecycle};
use snared::events::{EventLevel, RecordingSink, SharedSink};
use snared::supervisor::{Reconciled, SupervisedService, Supervisor, SupervisorSettings};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const GRACE: Duration = Duration::from_millis(500);

/// Adapter whose failures are scripted by the test
struct ScriptedAdapter {
    kind: DecoyKind,
    lifecycle: Lifecycle,
    failing_starts: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    crash: Mutex<Option<oneshot::Sender<()>>>,
}

impl ScriptedAdapter {
    fn new(kind: DecoyKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            lifecycle: Lifecycle::new(),
            failing_starts: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            crash: Mutex::new(None),
        })
    }

    fn fail_next_starts(&self, n: usize) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn is_live(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Make the live run exit with an engine error
    fn crash(&self) {
        if let Some(tx) = self.crash.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl DecoyAdapter for ScriptedAdapter {
    fn kind(&self) -> DecoyKind {
        self.kind
    }

    async fn start(&self, _sink: SharedSink) -> Result<DecoyTask, DecoyError> {
        if self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DecoyError::Bind {
                addr: "127.0.0.1:2222".parse().unwrap(),
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
            });
        }

        let guard = self.lifecycle.begin(self.kind)?;
        self.starts.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        *self.crash.lock().unwrap() = Some(tx);
        let token = guard.token();
        Ok(spawn_serve(guard, async move {
            tokio::select! {
                _ = token.cancelled() => Ok(()),
                Ok(()) = rx => Err(DecoyError::Engine("listener died".to_string())),
            }
        }))
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.lifecycle.stop().await;
    }
}

/// Adapter whose serving task never looks at its cancellation token
struct StubbornAdapter {
    lifecycle: Lifecycle,
    task_dropped: Arc<AtomicBool>,
}

/// Flips its flag when the owning future is dropped
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DecoyAdapter for StubbornAdapter {
    fn kind(&self) -> DecoyKind {
        DecoyKind::Web
    }

    async fn start(&self, _sink: SharedSink) -> Result<DecoyTask, DecoyError> {
        let guard = self.lifecycle.begin(DecoyKind::Web)?;
        let flag = DropFlag(Arc::clone(&self.task_dropped));
        Ok(spawn_serve(guard, async move {
            let _flag = flag;
            std::future::pending::<()>().await;
            Ok(())
        }))
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

struct Harness {
    adapter: Arc<ScriptedAdapter>,
    service: SupervisedService,
    store: Arc<MemoryStateStore>,
    shared: Arc<dyn StateStore>,
    recorder: Arc<RecordingSink>,
    sink: SharedSink,
}

impl Harness {
    fn new(kind: DecoyKind) -> Self {
        let adapter = ScriptedAdapter::new(kind);
        let recorder = Arc::new(RecordingSink::new());
        let store = Arc::new(MemoryStateStore::new());
        Self {
            service: SupervisedService::new(adapter.clone()),
            adapter,
            shared: store.clone(),
            store,
            sink: recorder.clone(),
            recorder,
        }
    }

    async fn reconcile(&mut self) -> Reconciled {
        self.service.reconcile(&self.shared, &self.sink, GRACE).await
    }

    fn actual(&self) -> ActualState {
        self.store.read().actual(self.adapter.kind)
    }

    fn desire(&self, desired: DesiredState) {
        self.store.set_desired(self.adapter.kind, desired).unwrap();
    }
}

#[tokio::test]
async fn test_default_intent_starts_decoy() {
    let mut h = Harness::new(DecoyKind::Shell);
    assert_eq!(h.reconcile().await, Reconciled::Started);
    assert_eq!(h.actual(), ActualState::Running);
    assert!(h.service.is_running());
    assert!(h.adapter.is_live());
}

#[tokio::test]
async fn test_stop_converges_to_stopped_without_task() {
    let mut h = Harness::new(DecoyKind::Ftp);
    h.reconcile().await;

    h.desire(DesiredState::Stopped);
    assert_eq!(h.reconcile().await, Reconciled::Stopped);
    assert_eq!(h.actual(), ActualState::Stopped);
    assert!(!h.service.has_task());
    assert!(!h.adapter.is_live());

    assert_eq!(h.reconcile().await, Reconciled::Unchanged);
    assert_eq!(h.store.read().desired(DecoyKind::Ftp), DesiredState::Stopped);
}

#[tokio::test]
async fn test_at_most_one_live_run() {
    let mut h = Harness::new(DecoyKind::Dns);
    for _ in 0..5 {
        h.reconcile().await;
    }
    assert_eq!(h.adapter.starts(), 1);

    h.desire(DesiredState::Stopped);
    h.reconcile().await;
    h.desire(DesiredState::Running);
    h.reconcile().await;
    h.reconcile().await;
    assert_eq!(h.adapter.starts(), 2);
    assert!(h.adapter.is_live());
}

#[tokio::test]
async fn test_stop_on_stopped_adapter_is_noop() {
    let mut h = Harness::new(DecoyKind::Smb);
    h.desire(DesiredState::Stopped);
    assert_eq!(h.reconcile().await, Reconciled::Resynced);
    assert_eq!(h.actual(), ActualState::Stopped);

    h.adapter.stop().await;
    h.adapter.stop().await;
    assert_eq!(h.actual(), ActualState::Stopped);
    assert_eq!(h.reconcile().await, Reconciled::Unchanged);
    assert_eq!(h.adapter.starts(), 0);
}

#[tokio::test]
async fn test_start_failure_records_error_and_retries() {
    let mut h = Harness::new(DecoyKind::Web);
    h.adapter.fail_next_starts(1);

    assert_eq!(h.reconcile().await, Reconciled::StartFailed);
    assert_eq!(h.actual(), ActualState::Error);
    assert!(!h.service.is_running());
    let errors = h.recorder.messages(EventLevel::Error, DecoyKind::Web);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("address in use"));

    assert_eq!(h.reconcile().await, Reconciled::Started);
    assert_eq!(h.actual(), ActualState::Running);
}

#[tokio::test]
async fn test_unexpected_termination_downgrades_to_error() {
    let mut h = Harness::new(DecoyKind::Shell);
    h.reconcile().await;
    h.adapter.crash();

    let mut outcome = Reconciled::Unchanged;
    for _ in 0..100 {
        outcome = h.reconcile().await;
        if outcome == Reconciled::Terminated {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(outcome, Reconciled::Terminated);
    assert_eq!(h.actual(), ActualState::Error);
    assert!(!h.service.is_running());
    assert!(h.recorder.contains("terminated unexpectedly: Engine failure: listener died"));

    // Desired is still running, so the next pass restarts it
    assert_eq!(h.reconcile().await, Reconciled::Started);
    assert_eq!(h.adapter.starts(), 2);
}

#[tokio::test]
async fn test_drifted_actual_is_resynced() {
    let mut h = Harness::new(DecoyKind::Dns);
    h.reconcile().await;

    // Another writer clobbered our value
    h.store.set_actual(DecoyKind::Dns, ActualState::Unknown).unwrap();
    assert_eq!(h.reconcile().await, Reconciled::Resynced);
    assert_eq!(h.actual(), ActualState::Running);
    assert_eq!(h.adapter.starts(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_adapters_and_flushes_state() {
    let shell = ScriptedAdapter::new(DecoyKind::Shell);
    let dns = ScriptedAdapter::new(DecoyKind::Dns);
    let store = Arc::new(MemoryStateStore::new());
    let recorder = Arc::new(RecordingSink::new());

    let supervisor = Supervisor::new(
        store.clone(),
        recorder.clone(),
        vec![shell.clone() as Arc<dyn DecoyAdapter>, dns.clone()],
        SupervisorSettings {
            poll_interval: Duration::from_millis(20),
            stop_grace: GRACE,
        },
    );

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(supervisor.run(shutdown.clone()));

    for _ in 0..100 {
        let record = store.read();
        if record.actual(DecoyKind::Shell) == ActualState::Running
            && record.actual(DecoyKind::Dns) == ActualState::Running
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.read().actual(DecoyKind::Ftp), ActualState::Stopped);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("supervisor did not exit")
        .unwrap();

    assert!(!shell.is_live());
    assert!(!dns.is_live());
    assert!(shell.stops() >= 1);
    let record = store.read();
    for kind in DecoyKind::ALL {
        assert_eq!(record.actual(kind), ActualState::Stopped);
    }
}

#[tokio::test]
async fn test_stop_aborts_task_that_ignores_cancellation() {
    let adapter = Arc::new(StubbornAdapter {
        lifecycle: Lifecycle::new(),
        task_dropped: Arc::new(AtomicBool::new(false)),
    });
    let mut service = SupervisedService::new(adapter.clone());
    let store = Arc::new(MemoryStateStore::new());
    let shared: Arc<dyn StateStore> = store.clone();
    let sink: SharedSink = Arc::new(RecordingSink::new());

    assert_eq!(
        service.reconcile(&shared, &sink, GRACE).await,
        Reconciled::Started
    );

    store
        .set_desired(DecoyKind::Web, DesiredState::Stopped)
        .unwrap();
    let began = Instant::now();
    assert_eq!(
        service.reconcile(&shared, &sink, GRACE).await,
        Reconciled::Stopped
    );
    let elapsed = began.elapsed();

    // One grace period for the adapter, one for the task, then abort
    assert!(elapsed >= GRACE * 2, "stop returned after {:?}", elapsed);
    assert!(elapsed < GRACE * 3, "stop took {:?}", elapsed);
    assert_eq!(store.read().actual(DecoyKind::Web), ActualState::Stopped);
    assert!(!service.has_task());
    assert!(!service.is_running());

    for _ in 0..100 {
        if adapter.task_dropped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(adapter.task_dropped.load(Ordering::SeqCst));
    assert!(!adapter.lifecycle.is_active());
}

/// Store whose every call parks the calling thread, like a slow disk
struct SlowStore {
    inner: MemoryStateStore,
    delay: Duration,
}

impl StateStore for SlowStore {
    fn read(&self) -> DesiredStateRecord {
        std::thread::sleep(self.delay);
        self.inner.read()
    }

    fn write(&self, record: &DesiredStateRecord) -> Result<(), SnareError> {
        std::thread::sleep(self.delay);
        self.inner.write(record)
    }
}

#[tokio::test]
async fn test_slow_store_does_not_stall_the_runtime() {
    let store: Arc<dyn StateStore> = Arc::new(SlowStore {
        inner: MemoryStateStore::new(),
        delay: Duration::from_millis(50),
    });
    let mut service = SupervisedService::new(ScriptedAdapter::new(DecoyKind::Dns));
    let sink: SharedSink = Arc::new(RecordingSink::new());

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let ticks = Arc::clone(&ticks);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // One read plus two read-modify-write updates, all on the blocking pool
    assert_eq!(
        service.reconcile(&store, &sink, GRACE).await,
        Reconciled::Started
    );
    ticker.abort();

    assert!(ticks.load(Ordering::SeqCst) >= 5);
    assert_eq!(store.read().actual(DecoyKind::Dns), ActualState::Running);
}
