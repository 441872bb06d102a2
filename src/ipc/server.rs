//! IPC Server - Unix socket server for the daemon's control plane
//!
//! Provides:
//! - Unix stream socket listener
//! - Client connection handling
//! - Request routing and response sending
//! - Event broadcasting to subscribers

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{RwLock, broadcast, watch};

use crate::error::{LoopdError, Result};
use crate::ipc::messages::{DaemonError, DaemonEvent, DaemonRequest, DaemonResponse, Methods};

/// Configuration for the IPC server
#[derive(Debug, Clone)]
pub struct IpcServerConfig {
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Maximum number of concurrent clients
    pub max_clients: usize,
    /// Channel capacity for events
    pub event_channel_capacity: usize,
}

impl Default for IpcServerConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::daemon::default_socket_path(),
            max_clients: 64,
            event_channel_capacity: 256,
        }
    }
}

impl IpcServerConfig {
    pub fn with_socket_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.socket_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }
}

/// Handler trait for processing requests
pub trait RequestHandler: Send + Sync {
    /// Handle a request and return a response
    fn handle(&self, request: DaemonRequest) -> impl std::future::Future<Output = DaemonResponse> + Send;
}

/// Connected client state
#[derive(Debug)]
struct ClientState {
    /// Whether client is subscribed to events
    subscribed: bool,
}

type Clients = Arc<RwLock<HashMap<u64, ClientState>>>;

/// IPC Server for daemon communication
pub struct IpcServer {
    config: IpcServerConfig,
    clients: Clients,
    event_tx: broadcast::Sender<DaemonEvent>,
}

impl IpcServer {
    pub fn new(config: IpcServerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            config,
            clients: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Sender for events pushed to subscribed clients.
    pub fn events(&self) -> broadcast::Sender<DaemonEvent> {
        self.event_tx.clone()
    }

    /// Broadcast an event to all subscribed clients
    pub fn broadcast(&self, event: DaemonEvent) -> usize {
        // No receivers is fine
        self.event_tx.send(event).unwrap_or(0)
    }

    /// Bind the socket and serve until `shutdown` flips to true.
    pub async fn run<H: RequestHandler + 'static>(
        &self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if self.config.socket_path.exists() {
            if UnixStream::connect(&self.config.socket_path).await.is_ok() {
                return Err(LoopdError::InvalidState(format!(
                    "a daemon is already listening on {}",
                    self.config.socket_path.display()
                )));
            }
            // Nobody answers: left behind by a dead daemon
            std::fs::remove_file(&self.config.socket_path)?;
        }
        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)
            .map_err(|e| LoopdError::Ipc(format!("Failed to bind socket: {}", e)))?;
        info!("IPC server listening on {}", self.config.socket_path.display());

        let mut next_client_id: u64 = 1;
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            if self.clients.read().await.len() >= self.config.max_clients {
                                warn!("Rejecting client: {} clients connected", self.config.max_clients);
                                continue;
                            }

                            let client_id = next_client_id;
                            next_client_id += 1;
                            self.clients.write().await.insert(client_id, ClientState { subscribed: false });

                            let handler = Arc::clone(&handler);
                            let clients = Arc::clone(&self.clients);
                            let event_rx = self.event_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, client_id, handler, clients, event_rx).await {
                                    debug!("Client {} ended with error: {}", client_id, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.config.socket_path);
        info!("IPC server stopped");
        Ok(())
    }
}

async fn write_line<T: serde::Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> Result<()> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    Ok(())
}

/// Handle a single client connection
async fn handle_client<H: RequestHandler>(
    stream: UnixStream,
    client_id: u64,
    handler: Arc<H>,
    clients: Clients,
    mut event_rx: broadcast::Receiver<DaemonEvent>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let result = loop {
        tokio::select! {
            read_result = reader.read_line(&mut line) => {
                match read_result {
                    Ok(0) => break Ok(()), // client disconnected
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            line.clear();
                            continue;
                        }

                        let response = match serde_json::from_str::<DaemonRequest>(trimmed) {
                            Ok(request) if request.method == Methods::SUBSCRIBE => {
                                if let Some(state) = clients.write().await.get_mut(&client_id) {
                                    state.subscribed = true;
                                }
                                DaemonResponse::success(request.id, serde_json::json!({"subscribed": true}))
                            }
                            Ok(request) => handler.handle(request).await,
                            Err(e) => DaemonResponse::error(0, DaemonError::parse_error(format!("Parse error: {}", e))),
                        };
                        line.clear();
                        if let Err(e) = write_line(&mut writer, &response).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e.into()),
                }
            }
            event_result = event_rx.recv() => {
                match event_result {
                    Ok(event) => {
                        let subscribed = clients.read().await.get(&client_id).is_some_and(|s| s.subscribed);
                        if subscribed && let Err(e) = write_line(&mut writer, &event).await {
                            break Err(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Client {} lagged, skipped {} events", client_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                }
            }
        }
    };

    clients.write().await.remove(&client_id);
    result
}
