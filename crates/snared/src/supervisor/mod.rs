//! Service supervisor - keeps every decoy converged on its desired state.
//!
//! One reconciliation loop runs per enabled decoy. Each loop owns its
//! `SupervisedService`, polls the state store on a fixed interval and drives
//! the adapter's start/stop. Loops never share anything but the store and the
//! event sink, so a fault in one decoy cannot stall another.

pub mod service;

pub use service::{Reconciled, SupervisedService};

use service::record_actual;

use snare_common::config::SupervisorConfig;
use snare_common::{ActualState, DecoyKind, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::decoys::DecoyAdapter;
use crate::events::SharedSink;

/// Loop timing
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            stop_grace: config.stop_grace(),
        }
    }
}

pub struct Supervisor {
    store: Arc<dyn StateStore>,
    sink: SharedSink,
    adapters: Vec<Arc<dyn DecoyAdapter>>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn StateStore>,
        sink: SharedSink,
        adapters: Vec<Arc<dyn DecoyAdapter>>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            sink,
            adapters,
            settings,
        }
    }

    /// Run every loop until `shutdown` fires, then flush `actual=stopped`
    pub async fn run(self, shutdown: CancellationToken) {
        let supervised: Vec<DecoyKind> = self.adapters.iter().map(|a| a.kind()).collect();
        for kind in DecoyKind::ALL {
            if !supervised.contains(&kind) {
                info!("{} decoy disabled in configuration", kind.label());
                record_actual(&self.store, kind, ActualState::Stopped).await;
            }
        }

        let mut loops = JoinSet::new();
        for adapter in &self.adapters {
            loops.spawn(run_loop(
                SupervisedService::new(Arc::clone(adapter)),
                Arc::clone(&self.store),
                Arc::clone(&self.sink),
                self.settings,
                shutdown.clone(),
            ));
        }
        info!("Supervising {} decoys", supervised.len());

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!("Reconciliation loop failed: {}", e);
            }
        }

        for kind in DecoyKind::ALL {
            record_actual(&self.store, kind, ActualState::Stopped).await;
        }
        info!("[SHUTDOWN] All decoys marked stopped");
    }
}

/// Reconcile one decoy until cancelled; the held adapter is stopped on exit
pub async fn run_loop(
    mut service: SupervisedService,
    store: Arc<dyn StateStore>,
    sink: SharedSink,
    settings: SupervisorSettings,
    shutdown: CancellationToken,
) {
    let kind = service.kind();
    info!("Reconciliation loop for {} started", kind);

    while !shutdown.is_cancelled() {
        service
            .reconcile(&store, &sink, settings.stop_grace)
            .await;

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = time::sleep(settings.poll_interval) => {}
        }
    }

    service.shutdown(settings.stop_grace).await;
    info!("Reconciliation loop for {} exited", kind);
}
