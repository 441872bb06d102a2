//! Daemon - long-running owner of loops and the control-plane endpoint
//!
//! The daemon:
//! - Serves control-plane requests over a Unix socket
//! - Drives one runner task per loop it owns
//! - Sweeps for stale runners and reclaims their loops

mod agents;
mod context;
mod control;
mod handlers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::watch;

pub use agents::{
    AgentDetail, AgentFilter, AgentRegistry, AgentSummary, InputSink, QueueInputSink, SpecialKey, TRANSCRIPT_LIMIT,
    TranscriptEntry, workspace_id,
};
pub use context::{DaemonContext, DaemonRestarter};
pub use control::{ControlPlane, DaemonStatus, Health, PingInfo, RunnerStartAck, RunnerStopAck, SendInputAck, VERSION};
pub use handlers::DaemonHandler;

use crate::error::Result;
use crate::ipc::server::{IpcServer, IpcServerConfig};
use crate::recovery::{StaleConfig, StaleRunnerDetector};
use crate::runner::RunnerConfig;
use crate::store::Store;

/// Default control socket: `<runtime dir or tmp>/loopd.sock`
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("loopd.sock")
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub runner: RunnerConfig,
    pub stale: StaleConfig,
    /// How long runners get to finish their iteration on shutdown
    pub shutdown_grace: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            runner: RunnerConfig::default(),
            stale: StaleConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct Daemon {
    config: DaemonConfig,
    server: IpcServer,
    ctx: Arc<DaemonContext>,
}

impl Daemon {
    pub fn new(store: Arc<Store>, config: DaemonConfig) -> Self {
        let server = IpcServer::new(IpcServerConfig::default().with_socket_path(&config.socket_path));
        let ctx = DaemonContext::new(store, config.runner.clone(), config.stale.threshold)
            .with_event_sender(server.events());
        Self {
            config,
            server,
            ctx: Arc::new(ctx),
        }
    }

    pub fn context(&self) -> Arc<DaemonContext> {
        Arc::clone(&self.ctx)
    }

    /// Serve until `shutdown` flips to true, then stop owned runners.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Daemon {} starting on {}",
            self.ctx.instance_id,
            self.config.socket_path.display()
        );

        let forwarder = tokio::spawn(Arc::clone(&self.ctx).forward_runner_events());

        let detector = StaleRunnerDetector::new(Arc::clone(&self.ctx.store), self.config.stale.clone())
            .with_restarter(Arc::new(DaemonRestarter::new(Arc::clone(&self.ctx))));
        let sweeper = tokio::spawn(detector.run(shutdown.clone()));

        let handler = Arc::new(DaemonHandler::new(ControlPlane::new(Arc::clone(&self.ctx))));
        let served = self.server.run(handler, shutdown).await;

        self.ctx.shutdown_runners(self.config.shutdown_grace).await;
        forwarder.abort();
        sweeper.abort();
        info!("Daemon {} stopped", self.ctx.instance_id);
        served
    }
}
