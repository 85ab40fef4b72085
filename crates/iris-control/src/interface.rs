//! Control-protocol listeners.
//!
//! Two variants of the same interface: a Unix-domain socket bound to a
//! filesystem path (refusing to clobber an existing one, unlinked again
//! on stop), and a TCP listener. Both plug into the server through the
//! [`ControlPlane`] trait: started during `Server::bind`, where a
//! failure is fatal to startup, and stopped during shutdown, which
//! also disconnects every control client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use iris_core::ConnectionId;
use iris_server::{ControlPlane, ServerCore, ServerError, ServerResult};

use crate::auth::Authenticator;
use crate::connection::{ControlConnection, CustomHandler, InterfaceShared};
use crate::envelope::ServerEnvelope;

/// Default file mode for the Unix socket node.
const DEFAULT_SOCKET_MODE: u32 = 0o777;

struct Runtime {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Options shared by both interface variants.
struct InterfaceOptions {
    envelope: Option<Arc<ServerEnvelope>>,
    authenticator: Arc<dyn Authenticator>,
    custom: Option<CustomHandler>,
    log_payloads: bool,
    log_auth_payloads: bool,
    connections: Arc<DashMap<ConnectionId, ()>>,
}

impl InterfaceOptions {
    fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            envelope: None,
            authenticator,
            custom: None,
            log_payloads: true,
            log_auth_payloads: false,
            connections: Arc::new(DashMap::new()),
        }
    }

    fn to_shared(
        &self,
        core: Arc<ServerCore>,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<InterfaceShared> {
        Arc::new(InterfaceShared {
            core,
            envelope: self.envelope.clone(),
            authenticator: Arc::clone(&self.authenticator),
            custom: self.custom.clone(),
            log_payloads: self.log_payloads,
            log_auth_payloads: self.log_auth_payloads,
            connections: Arc::clone(&self.connections),
            shutdown,
        })
    }
}

/// Control interface bound to a Unix-domain socket.
pub struct UnixControlInterface {
    path: PathBuf,
    mode: u32,
    options: InterfaceOptions,
    runtime: Option<Runtime>,
}

impl UnixControlInterface {
    /// Create an interface that will bind `path`.
    pub fn new(path: impl Into<PathBuf>, authenticator: impl Authenticator) -> Self {
        Self {
            path: path.into(),
            mode: DEFAULT_SOCKET_MODE,
            options: InterfaceOptions::new(Arc::new(authenticator)),
            runtime: None,
        }
    }

    /// Set the file mode applied to the socket node.
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Enable RSA envelope encryption with the server's private key.
    pub fn envelope(mut self, envelope: ServerEnvelope) -> Self {
        self.options.envelope = Some(Arc::new(envelope));
        self
    }

    /// Install the custom-command hook.
    pub fn custom_handler(
        mut self,
        handler: impl Fn(&[u8]) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.options.custom = Some(Arc::new(handler));
        self
    }

    /// Whether command payloads appear in debug logs.
    pub fn log_payloads(mut self, log: bool) -> Self {
        self.options.log_payloads = log;
        self
    }

    /// Whether AUTH payloads appear in debug logs (off by default).
    pub fn log_auth_payloads(mut self, log: bool) -> Self {
        self.options.log_auth_payloads = log;
        self
    }

    /// Number of connected control clients.
    pub fn connection_count(&self) -> usize {
        self.options.connections.len()
    }
}

#[async_trait]
impl ControlPlane for UnixControlInterface {
    async fn start(&mut self, core: Arc<ServerCore>) -> ServerResult<()> {
        if self.runtime.is_some() {
            return Err(ServerError::ControlInterface {
                reason: "control interface already started".to_string(),
            });
        }

        if self.path.exists() {
            return Err(ServerError::ControlInterface {
                reason: format!("unix socket already exists: {}", self.path.display()),
            });
        }

        debug!(path = %self.path.display(), "creating streaming unix socket");
        let listener = UnixListener::bind(&self.path).map_err(|e| ServerError::ControlInterface {
            reason: format!("unable to bind {}: {e}", self.path.display()),
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(self.mode);
            if let Err(e) = std::fs::set_permissions(&self.path, perms) {
                warn!(path = %self.path.display(), error = %e, "unable to set socket mode");
            }
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let shared = self.options.to_shared(core, shutdown_tx.clone());

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => ControlConnection::spawn(Arc::clone(&shared), stream),
                        Err(e) => warn!(error = %e, "cannot accept control client"),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        self.runtime = Some(Runtime {
            shutdown: shutdown_tx,
            task,
        });
        info!(path = %self.path.display(), "control interface listening");
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.shutdown.send(());
            let _ = runtime.task.await;
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "unable to unlink socket");
            }
            info!(path = %self.path.display(), "control interface stopped");
        }
    }
}

/// Control interface bound to a TCP address.
pub struct TcpControlInterface {
    addr: String,
    bound_addr: Option<SocketAddr>,
    options: InterfaceOptions,
    runtime: Option<Runtime>,
}

impl TcpControlInterface {
    /// Create an interface that will bind `addr` (e.g. `127.0.0.1:9001`).
    pub fn new(addr: impl Into<String>, authenticator: impl Authenticator) -> Self {
        Self {
            addr: addr.into(),
            bound_addr: None,
            options: InterfaceOptions::new(Arc::new(authenticator)),
            runtime: None,
        }
    }

    /// Enable RSA envelope encryption with the server's private key.
    pub fn envelope(mut self, envelope: ServerEnvelope) -> Self {
        self.options.envelope = Some(Arc::new(envelope));
        self
    }

    /// Install the custom-command hook.
    pub fn custom_handler(
        mut self,
        handler: impl Fn(&[u8]) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.options.custom = Some(Arc::new(handler));
        self
    }

    /// Whether command payloads appear in debug logs.
    pub fn log_payloads(mut self, log: bool) -> Self {
        self.options.log_payloads = log;
        self
    }

    /// Whether AUTH payloads appear in debug logs (off by default).
    pub fn log_auth_payloads(mut self, log: bool) -> Self {
        self.options.log_auth_payloads = log;
        self
    }

    /// Number of connected control clients.
    pub fn connection_count(&self) -> usize {
        self.options.connections.len()
    }

    /// The address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }
}

#[async_trait]
impl ControlPlane for TcpControlInterface {
    async fn start(&mut self, core: Arc<ServerCore>) -> ServerResult<()> {
        if self.runtime.is_some() {
            return Err(ServerError::ControlInterface {
                reason: "control interface already started".to_string(),
            });
        }

        debug!(addr = %self.addr, "creating control TCP socket");
        let listener = TcpListener::bind(&self.addr).await.map_err(|e| {
            ServerError::ControlInterface {
                reason: format!("unable to bind {}: {e}", self.addr),
            }
        })?;
        self.bound_addr = listener.local_addr().ok();

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let shared = self.options.to_shared(core, shutdown_tx.clone());

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => ControlConnection::spawn(Arc::clone(&shared), stream),
                        Err(e) => warn!(error = %e, "cannot accept control client"),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        self.runtime = Some(Runtime {
            shutdown: shutdown_tx,
            task,
        });
        info!(addr = ?self.bound_addr, "control interface listening");
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.shutdown.send(());
            let _ = runtime.task.await;
            info!(addr = %self.addr, "control interface stopped");
        }
    }
}
