//! Per-decoy reconciliation state.

use snare_common::{ActualState, DecoyKind, DesiredState, DesiredStateRecord, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::{task, time};
use tracing::{debug, warn};

use crate::decoys::{DecoyAdapter, DecoyError, DecoyTask};
use crate::events::SharedSink;

/// What one reconcile pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Local state already matched intent
    Unchanged,
    /// `actual` drifted and was rewritten
    Resynced,
    Started,
    StartFailed,
    Stopped,
    /// The live task ended without being asked to
    Terminated,
}

/// One decoy as seen by its reconciliation loop
pub struct SupervisedService {
    adapter: Arc<dyn DecoyAdapter>,
    running: bool,
    task: Option<DecoyTask>,
}

impl SupervisedService {
    pub fn new(adapter: Arc<dyn DecoyAdapter>) -> Self {
        Self {
            adapter,
            running: false,
            task: None,
        }
    }

    pub fn kind(&self) -> DecoyKind {
        self.adapter.kind()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn has_task(&self) -> bool {
        self.task.is_some()
    }

    /// Drive the adapter one step toward the stored intent
    pub async fn reconcile(
        &mut self,
        store: &Arc<dyn StateStore>,
        sink: &SharedSink,
        stop_grace: Duration,
    ) -> Reconciled {
        if self.reap_finished(store, sink).await {
            return Reconciled::Terminated;
        }

        let record = read_record(store).await;
        let kind = self.kind();

        match (record.desired(kind), self.running) {
            (DesiredState::Running, false) => self.start(store, sink).await,
            (DesiredState::Stopped, true) => {
                self.stop(stop_grace).await;
                record_actual(store, kind, ActualState::Stopped).await;
                sink.info(kind, &format!("{} decoy stopped", kind.label()));
                Reconciled::Stopped
            }
            _ => {
                let expected = if self.running {
                    ActualState::Running
                } else {
                    ActualState::Stopped
                };
                let current = record.actual(kind);
                if current == expected {
                    Reconciled::Unchanged
                } else {
                    debug!("{} actual drifted ({} -> {})", kind, current, expected);
                    record_actual(store, kind, expected).await;
                    Reconciled::Resynced
                }
            }
        }
    }

    /// Stop the adapter if it is live; used on loop exit
    pub async fn shutdown(&mut self, stop_grace: Duration) {
        if self.running || self.task.is_some() {
            self.stop(stop_grace).await;
        }
    }

    async fn start(&mut self, store: &Arc<dyn StateStore>, sink: &SharedSink) -> Reconciled {
        let kind = self.kind();
        record_actual(store, kind, ActualState::Starting).await;

        match self.adapter.start(Arc::clone(sink)).await {
            Ok(task) => {
                self.task = Some(task);
                self.running = true;
                record_actual(store, kind, ActualState::Running).await;
                sink.info(kind, &format!("{} decoy started", kind.label()));
                Reconciled::Started
            }
            Err(e) => {
                record_actual(store, kind, ActualState::Error).await;
                sink.error(kind, &format!("Failed to start {} decoy: {}", kind.label(), e));
                Reconciled::StartFailed
            }
        }
    }

    /// Signal the adapter, then make sure the task is gone
    async fn stop(&mut self, stop_grace: Duration) {
        let kind = self.kind();
        if time::timeout(stop_grace, self.adapter.stop()).await.is_err() {
            warn!("{} decoy did not stop within {:?}", kind, stop_grace);
        }

        if let Some(mut task) = self.task.take() {
            if !task.is_finished() {
                if time::timeout(stop_grace, &mut task).await.is_err() {
                    warn!("Aborting {} decoy task", kind);
                    task.abort();
                }
            }
        }
        self.running = false;
    }

    /// Detect a task that ended while we believed it was serving
    async fn reap_finished(&mut self, store: &Arc<dyn StateStore>, sink: &SharedSink) -> bool {
        if !self.running {
            return false;
        }
        let finished = self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true);
        if !finished {
            return false;
        }

        let kind = self.kind();
        let reason = match self.task.take() {
            Some(task) => describe_exit(task.await),
            None => "task handle missing".to_string(),
        };
        self.running = false;
        // Let the adapter drop whatever it still tracks for the dead run
        self.adapter.stop().await;

        record_actual(store, kind, ActualState::Error).await;
        sink.error(
            kind,
            &format!("{} decoy terminated unexpectedly: {}", kind.label(), reason),
        );
        true
    }
}

fn describe_exit(result: Result<Result<(), DecoyError>, tokio::task::JoinError>) -> String {
    match result {
        Ok(Ok(())) => "exited".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => "panicked".to_string(),
        Err(e) => e.to_string(),
    }
}

// Store calls do file IO under a lock, so they run on the blocking pool

async fn read_record(store: &Arc<dyn StateStore>) -> DesiredStateRecord {
    let store = Arc::clone(store);
    match task::spawn_blocking(move || store.read()).await {
        Ok(record) => record,
        Err(e) => {
            warn!("State read task failed: {}", e);
            DesiredStateRecord::new()
        }
    }
}

/// Store faults are logged and retried on the next pass
pub(crate) async fn record_actual(store: &Arc<dyn StateStore>, kind: DecoyKind, actual: ActualState) {
    let writer = Arc::clone(store);
    let written = task::spawn_blocking(move || writer.set_actual(kind, actual)).await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to record {} as {}: {}", kind, actual, e),
        Err(e) => warn!("State write task for {} failed: {}", kind, e),
    }
}
