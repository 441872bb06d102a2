//! IPC client for talking to the daemon.
//!
//! Provides async connection to the daemon Unix socket with:
//! - Request/response communication
//! - Event subscription and streaming
//! - Typed wrappers for the control-plane methods

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::daemon::{
    AgentDetail, AgentFilter, AgentSummary, DaemonStatus, PingInfo, RunnerStartAck, RunnerStopAck, SendInputAck,
    SpecialKey, default_socket_path,
};
use crate::error::{LoopdError, Result};
use crate::ipc::messages::{DaemonEvent, DaemonRequest, DaemonResponse, Methods};

/// Configuration for IPC client.
#[derive(Debug, Clone)]
pub struct IpcClientConfig {
    pub socket_path: PathBuf,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for IpcClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connect_timeout_ms: 1000,
            request_timeout_ms: 30000,
        }
    }
}

impl IpcClientConfig {
    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
            ..Default::default()
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<DaemonResponse>>>>;

/// IPC client for communicating with the daemon.
pub struct IpcClient {
    config: IpcClientConfig,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    event_sender: mpsc::Sender<DaemonEvent>,
    event_receiver: Mutex<mpsc::Receiver<DaemonEvent>>,
}

impl IpcClient {
    pub fn new(config: IpcClientConfig) -> Self {
        let (event_sender, event_receiver) = mpsc::channel(100);
        Self {
            config,
            writer: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
            event_sender,
            event_receiver: Mutex::new(event_receiver),
        }
    }

    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self::new(IpcClientConfig::with_socket(path))
    }

    /// Connect to the daemon. Fails with `Unreachable` when nobody listens.
    pub async fn connect(&self) -> Result<()> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(timeout, UnixStream::connect(&self.config.socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(LoopdError::Unreachable(format!(
                    "{}: {}",
                    self.config.socket_path.display(),
                    e
                )));
            }
            Err(_) => {
                return Err(LoopdError::Unreachable(format!(
                    "{}: connect timed out",
                    self.config.socket_path.display()
                )));
            }
        };

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        let pending = Arc::clone(&self.pending);
        let event_sender = self.event_sender.clone();
        let connected = Arc::clone(&self.connected);

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }

                        // Responses carry an id, events an event name
                        if let Ok(response) = serde_json::from_str::<DaemonResponse>(line) {
                            if let Some(sender) = pending.lock().await.remove(&response.id) {
                                let _ = sender.send(response);
                            }
                        } else if let Ok(event) = serde_json::from_str::<DaemonEvent>(line) {
                            let _ = event_sender.send(event).await;
                        } else {
                            debug!("Ignoring unrecognised daemon message: {}", line);
                        }
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            // Fail outstanding requests fast
            pending.lock().await.clear();
        });

        Ok(())
    }

    pub async fn disconnect(&self) {
        *self.writer.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Value) -> Result<DaemonResponse> {
        if !self.is_connected() {
            return Err(LoopdError::Ipc("Not connected".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = DaemonRequest::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut json = serde_json::to_string(&request)?;
        json.push('\n');
        {
            let mut writer = self.writer.lock().await;
            let written = match writer.as_mut() {
                Some(w) => w.write_all(json.as_bytes()).await,
                None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "writer closed")),
            };
            if let Err(e) = written {
                self.pending.lock().await.remove(&id);
                return Err(LoopdError::Ipc(format!("Failed to write: {}", e)));
            }
        }

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(LoopdError::Ipc("Connection closed before response".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(LoopdError::Ipc(format!("Request {} timed out", method)))
            }
        }
    }

    /// Send a request and decode its result, mapping daemon errors back to
    /// library errors.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.request(method, params).await?.into_result()?;
        Ok(serde_json::from_value(value)?)
    }

    /// Receive next pushed event (after [`subscribe`](Self::subscribe)).
    pub async fn recv_event(&self) -> Option<DaemonEvent> {
        self.event_receiver.lock().await.recv().await
    }

    pub async fn subscribe(&self) -> Result<()> {
        self.request(Methods::SUBSCRIBE, json!({})).await?.into_result()?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<PingInfo> {
        self.call(Methods::PING, json!({})).await
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        self.call(Methods::STATUS_GET, json!({})).await
    }

    pub async fn send_input(&self, agent_id: &str, text: &str, special_keys: &[SpecialKey]) -> Result<SendInputAck> {
        self.call(
            Methods::AGENT_SEND_INPUT,
            json!({"agent_id": agent_id, "text": text, "special_keys": special_keys}),
        )
        .await
    }

    pub async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<AgentSummary>> {
        self.call(Methods::AGENT_LIST, serde_json::to_value(filter)?).await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentDetail> {
        self.call(Methods::AGENT_GET, json!({"agent_id": agent_id})).await
    }

    pub async fn start_loop_runner(&self, loop_id: &str) -> Result<RunnerStartAck> {
        self.call(Methods::RUNNER_START, json!({"loop_id": loop_id})).await
    }

    pub async fn stop_loop_runner(&self, loop_id: &str) -> Result<RunnerStopAck> {
        self.call(Methods::RUNNER_STOP, json!({"loop_id": loop_id})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_with_socket() {
        let config = IpcClientConfig::with_socket("/custom/path.sock");
        assert_eq!(config.socket_path, PathBuf::from("/custom/path.sock"));
        assert_eq!(config.request_timeout_ms, 30000);
    }

    #[tokio::test]
    async fn test_not_connected_error() {
        let client = IpcClient::with_socket("/tmp/never.sock");
        assert!(!client.is_connected());
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, LoopdError::Ipc(_)));
    }

    #[tokio::test]
    async fn test_connect_missing_socket_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let client = IpcClient::with_socket(dir.path().join("nobody.sock"));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, LoopdError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_disconnect() {
        let client = IpcClient::with_socket("/tmp/never.sock");
        client.disconnect().await;
        assert!(!client.is_connected());
    }
}
