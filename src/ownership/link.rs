//! Reaching a daemon from a process that wants to hand it a loop.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::daemon::PingInfo;
use crate::error::{LoopdError, Result};
use crate::ipc::{IpcClient, IpcClientConfig};

/// The operations the resolver needs from a daemon.
#[async_trait]
pub trait DaemonLink: Send + Sync {
    /// Liveness probe. Errors mean unreachable.
    async fn ping(&self) -> Result<PingInfo>;

    /// Ask the daemon to claim and drive `loop_id`; returns its instance id.
    async fn start_loop_runner(&self, loop_id: &str) -> Result<String>;

    /// Ask the daemon to stop `loop_id`; false when it did not own it.
    async fn stop_loop_runner(&self, loop_id: &str) -> Result<bool>;
}

/// [`DaemonLink`] over the IPC socket, connecting fresh for every call.
#[derive(Debug, Clone)]
pub struct IpcDaemonLink {
    socket_path: PathBuf,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl IpcDaemonLink {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            probe_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn client(&self, request_timeout: Duration) -> Result<IpcClient> {
        let client = IpcClient::new(IpcClientConfig {
            socket_path: self.socket_path.clone(),
            connect_timeout_ms: self.probe_timeout.as_millis() as u64,
            request_timeout_ms: request_timeout.as_millis() as u64,
        });
        client.connect().await?;
        Ok(client)
    }
}

#[async_trait]
impl DaemonLink for IpcDaemonLink {
    async fn ping(&self) -> Result<PingInfo> {
        let client = self.client(self.probe_timeout).await?;
        let info = client.ping().await.map_err(|e| match e {
            LoopdError::Ipc(msg) => LoopdError::Unreachable(msg),
            other => other,
        })?;
        debug!("Daemon at {} answered ping (v{})", self.socket_path.display(), info.version);
        Ok(info)
    }

    async fn start_loop_runner(&self, loop_id: &str) -> Result<String> {
        let client = self.client(self.request_timeout).await?;
        Ok(client.start_loop_runner(loop_id).await?.instance_id)
    }

    async fn stop_loop_runner(&self, loop_id: &str) -> Result<bool> {
        let client = self.client(self.request_timeout).await?;
        Ok(client.stop_loop_runner(loop_id).await?.stopping)
    }
}
