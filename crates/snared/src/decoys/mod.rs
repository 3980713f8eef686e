//! Decoy adapters - boundary objects around each protocol engine.
//!
//! Every adapter owns its configuration and exposes the same two operations:
//! `start` binds and spawns the engine, returning a task that stays pending for
//! as long as the decoy serves; `stop` signals the engine and waits for it to
//! wind down. `stop` on a stopped adapter does nothing.
//!
//! Engines report activity through the `EventSink` handed to `start`.

pub mod dns;
pub mod ftp;
pub mod shell;
pub mod smb;
pub mod smb_reply;
pub mod web;

use async_trait::async_trait;
use snare_common::{Config, DecoyKind};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::SharedSink;

pub use dns::{DnsDecoy, FakeResolver};
pub use ftp::FtpDecoy;
pub use shell::ShellDecoy;
pub use smb::SmbDecoy;
pub use web::WebDecoy;

/// Decoy adapter errors
#[derive(Error, Debug)]
pub enum DecoyError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} decoy is already running")]
    AlreadyRunning(DecoyKind),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine failure: {0}")]
    Engine(String),
}

/// Handle to a live adapter invocation
pub type DecoyTask = JoinHandle<Result<(), DecoyError>>;

#[async_trait]
pub trait DecoyAdapter: Send + Sync {
    fn kind(&self) -> DecoyKind;

    /// Bind and serve; errors here mean the decoy never came up
    async fn start(&self, sink: SharedSink) -> Result<DecoyTask, DecoyError>;

    /// Graceful shutdown, idempotent
    async fn stop(&self);
}

// ============================================================================
// Lifecycle
// ============================================================================

struct ActiveRun {
    token: CancellationToken,
    finished: watch::Receiver<bool>,
}

/// Tracks the single live run of an adapter
#[derive(Default)]
pub struct Lifecycle {
    active: Mutex<Option<ActiveRun>>,
}

/// Held by the serving task; dropping it marks the run finished
pub struct RunGuard {
    token: CancellationToken,
    finished: watch::Sender<bool>,
}

impl RunGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = self.finished.send(true);
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot; fails while a previous run is still serving
    pub fn begin(&self, kind: DecoyKind) -> Result<RunGuard, DecoyError> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(run) = active.as_ref() {
            if !*run.finished.borrow() {
                return Err(DecoyError::AlreadyRunning(kind));
            }
        }

        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(false);
        *active = Some(ActiveRun {
            token: token.clone(),
            finished: rx,
        });
        Ok(RunGuard {
            token,
            finished: tx,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|run| !*run.finished.borrow())
            .unwrap_or(false)
    }

    /// Cancel the live run and wait until its task lets go of the guard
    pub async fn stop(&self) {
        let run = self
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(run) = run else {
            return;
        };

        run.token.cancel();
        let mut finished = run.finished;
        while !*finished.borrow() {
            if finished.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Spawn a serving future that owns its run guard
pub fn spawn_serve<F>(guard: RunGuard, serve: F) -> DecoyTask
where
    F: Future<Output = Result<(), DecoyError>> + Send + 'static,
{
    tokio::spawn(async move {
        let _guard = guard;
        serve.await
    })
}

/// Listen address for a decoy
pub fn listen_addr(bind_address: &str, port: u16) -> Result<SocketAddr, DecoyError> {
    let ip: IpAddr = bind_address
        .parse()
        .map_err(|_| DecoyError::Config(format!("invalid bind address '{}'", bind_address)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Adapters for every enabled decoy
pub fn build_adapters(config: &Config) -> Result<Vec<Arc<dyn DecoyAdapter>>, DecoyError> {
    let services = &config.services;
    let mut adapters: Vec<Arc<dyn DecoyAdapter>> = Vec::new();

    for kind in config.enabled_decoys() {
        let addr = listen_addr(&config.bind_address, services.port(kind))?;
        let adapter: Arc<dyn DecoyAdapter> = match kind {
            DecoyKind::Shell => Arc::new(ShellDecoy::new(services.shell.clone(), addr)),
            DecoyKind::Dns => Arc::new(DnsDecoy::new(&services.dns, addr)?),
            DecoyKind::Ftp => Arc::new(FtpDecoy::new(services.ftp.clone(), addr)),
            DecoyKind::Smb => Arc::new(SmbDecoy::new(services.smb.clone(), addr)),
            DecoyKind::Web => Arc::new(WebDecoy::new(services.web.clone(), addr)),
        };
        adapters.push(adapter);
    }

    Ok(adapters)
}
