//! Boot sequence shared by the binary and integration tests.

use anyhow::{Context, Result};
use snare_common::{Config, FileStateStore, StateStore};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::decoys::build_adapters;
use crate::events::{FanoutSink, JsonlEventSink, SharedSink, TracingEventSink};
use crate::supervisor::{Supervisor, SupervisorSettings};

/// Sinks configured for this process
pub fn build_sink(config: &Config) -> SharedSink {
    let mut fanout = FanoutSink::new().with(Arc::new(TracingEventSink));
    if config.events.jsonl {
        fanout = fanout.with(Arc::new(JsonlEventSink::new(&config.events.log_dir)));
    }
    Arc::new(fanout)
}

/// Wire store, sinks and adapters into a supervisor
pub fn assemble(config: &Config) -> Result<Supervisor> {
    config.validate().context("Invalid configuration")?;

    let store: Arc<dyn StateStore> =
        Arc::new(FileStateStore::new(&config.supervisor.state_file));
    info!(
        "[BOOT] State file: {}",
        config.supervisor.state_file.display()
    );

    let sink = build_sink(config);
    if config.events.jsonl {
        info!("[BOOT] Event log directory: {}", config.events.log_dir.display());
    }

    let adapters = build_adapters(config).context("Failed to build decoy adapters")?;
    info!(
        "[BOOT] Decoys enabled: {}",
        adapters
            .iter()
            .map(|a| a.kind().as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(Supervisor::new(
        store,
        sink,
        adapters,
        SupervisorSettings::from(&config.supervisor),
    ))
}

/// Run until `shutdown` fires
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    let supervisor = assemble(&config)?;
    info!("[READY] snared operational");
    supervisor.run(shutdown).await;
    Ok(())
}

/// Cancel `shutdown` once `signal` fires.
///
/// A signal that cannot be registered leaves the token alone; the daemon then
/// keeps serving until it is killed.
pub async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("[SHUTDOWN] Interrupt received, stopping decoys");
            shutdown.cancel();
        }
        Err(e) => error!("Failed to listen for shutdown signal, Ctrl-C disabled: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_cancels_shutdown() {
        let shutdown = CancellationToken::new();
        cancel_on_signal(async { Ok(()) }, shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_signal_registration_keeps_running() {
        let shutdown = CancellationToken::new();
        let failed = async {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "no signal handler",
            ))
        };
        cancel_on_signal(failed, shutdown.clone()).await;
        assert!(!shutdown.is_cancelled());
    }
}
