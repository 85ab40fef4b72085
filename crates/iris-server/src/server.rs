//! The server: listener, registries, run loop, shutdown.
//!
//! [`Server`] is assembled through its builder (config, router,
//! services, control planes), bound with [`Server::bind`], then driven
//! by [`BoundServer::run`]. The run loop accepts sockets, spawns their
//! connection tasks, and ticks every service on a bounded interval so
//! liveness processing happens even with no I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use iris_core::ConnectionId;
use iris_proto::handshake::HandshakeProcessor;
use iris_router::{RouteMatch, Router};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionHandle};
use crate::error::{ServerError, ServerResult};
use crate::service::{SendReport, Service};

/// A control-protocol listener that can be attached to the server.
///
/// Implementations live in `iris-control`; the engine only drives their
/// lifecycle: `start` during [`Server::bind`] (a failure there is fatal
/// to startup), `stop` during shutdown.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Bind the control listener and begin accepting control clients.
    async fn start(&mut self, core: Arc<ServerCore>) -> ServerResult<()>;

    /// Disconnect all control clients and close the listener.
    async fn stop(&mut self);
}

/// Shared engine state: everything connections and control planes need.
pub struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) handshake: HandshakeProcessor,
    pub(crate) router: Router,
    pub(crate) services: HashMap<String, Arc<Service>>,
    pub(crate) registry: DashMap<ConnectionId, ConnectionHandle>,
}

impl ServerCore {
    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Look up a registered service by name.
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).cloned()
    }

    /// All registered services.
    pub fn services(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.services.values()
    }

    /// Run the routing table over a path/query pair.
    pub fn route(&self, path: &str, query: Option<&str>) -> Vec<RouteMatch> {
        self.router.process(path, query, None)
    }

    /// Resolve a path to the service it routes to, if any.
    pub fn resolve_service(&self, path: &str) -> Option<String> {
        self.route(path, None)
            .into_iter()
            .find_map(|m| m.service().map(String::from))
    }

    /// Number of live WebSocket connections (handshaken or not).
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Look up a live connection handle by id.
    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.registry.get(id).map(|e| e.value().clone())
    }

    /// Info for every client across all services.
    pub fn clients_info(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut out = serde_json::Map::new();
        for service in self.services.values() {
            out.extend(service.clients_info());
        }
        out
    }

    /// Deliver a message to client ids anywhere on the server.
    ///
    /// Every requested recipient appears in exactly one of the report's
    /// `sent`/`errors` halves; ids no service knows land in `errors`.
    pub fn send_to(&self, recipients: &[String], message: &str) -> SendReport {
        let mut report = SendReport::default();
        for id in recipients {
            let owner = self.services.values().find(|s| s.has_client(id));
            match owner {
                Some(service) => report.merge(service.send_to(
                    std::slice::from_ref(id),
                    message,
                )),
                None => report.fail(id, iris_core::ErrorCode::UnknownClient),
            }
        }
        report
    }

    /// Deliver a message to every client on the server.
    pub fn send_to_all(&self, message: &str, exclude: &[String]) -> SendReport {
        let mut report = SendReport::default();
        for service in self.services.values() {
            report.merge(service.send_to_all(message, exclude));
        }
        report
    }
}

impl std::fmt::Debug for ServerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCore")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    router: Router,
    services: HashMap<String, Arc<Service>>,
    control: Vec<Box<dyn ControlPlane>>,
    error: Option<ServerError>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            router: Router::new(),
            services: HashMap::new(),
            control: Vec::new(),
            error: None,
        }
    }

    /// Set the server configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the routing table.
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Register a service. Duplicate names are a fatal startup error.
    pub fn service(mut self, service: Service) -> Self {
        let name = service.name().to_string();
        if self.services.contains_key(&name) {
            self.error.get_or_insert(ServerError::DuplicateService(name));
            return self;
        }
        self.services.insert(name, Arc::new(service));
        self
    }

    /// Attach a control interface.
    pub fn control(mut self, plane: impl ControlPlane) -> Self {
        self.control.push(Box::new(plane));
        self
    }

    /// Validate and produce the server.
    pub fn build(self) -> ServerResult<Server> {
        if let Some(error) = self.error {
            return Err(error);
        }

        // every routing rule must point at a registered service
        for rule in self.router.rules() {
            let Some(service) = rule.destination("service") else {
                return Err(ServerError::ServiceMissingDest {
                    rule_id: rule.id().to_string(),
                });
            };
            if !self.services.contains_key(service) {
                return Err(ServerError::ServiceMissingDest {
                    rule_id: rule.id().to_string(),
                });
            }
        }

        Ok(Server {
            config: self.config,
            router: self.router,
            services: self.services,
            control: self.control,
        })
    }
}

/// A configured, not yet bound server.
pub struct Server {
    config: ServerConfig,
    router: Router,
    services: HashMap<String, Arc<Service>>,
    control: Vec<Box<dyn ControlPlane>>,
}

impl Server {
    /// Start building a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind the main listener and start every control interface.
    ///
    /// Failures here are fatal: the address in use, or a control
    /// interface that cannot start (in which case the ones already
    /// started are stopped again).
    pub async fn bind(self) -> ServerResult<BoundServer> {
        info!(addr = %self.config.addr, "starting server");

        let listener = TcpListener::bind(&self.config.addr).await.map_err(|source| {
            ServerError::Bind {
                addr: self.config.addr.clone(),
                source,
            }
        })?;

        let handshake = HandshakeProcessor::new(
            self.config.allowed_hosts.clone(),
            self.config.allowed_origins.clone(),
        );

        let core = Arc::new(ServerCore {
            config: self.config,
            handshake,
            router: self.router,
            services: self.services,
            registry: DashMap::new(),
        });

        let mut control = self.control;
        for index in 0..control.len() {
            if let Err(e) = control[index].start(Arc::clone(&core)).await {
                warn!(error = %e, "control interface failed to start, rolling back");
                for plane in control.iter_mut().take(index) {
                    plane.stop().await;
                }
                return Err(match e {
                    ServerError::ControlInterface { .. } => e,
                    other => ServerError::ControlInterface {
                        reason: other.to_string(),
                    },
                });
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(BoundServer {
            listener,
            core,
            control,
            shutdown_tx,
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.config.addr)
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("control_interfaces", &self.control.len())
            .finish()
    }
}

/// Requests a running server to shut down.
#[derive(Clone)]
pub struct ShutdownHandle(broadcast::Sender<()>);

impl ShutdownHandle {
    /// Begin the shutdown sequence.
    pub fn shutdown(&self) {
        let _ = self.0.send(());
    }
}

/// A bound server, ready to run.
pub struct BoundServer {
    listener: TcpListener,
    core: Arc<ServerCore>,
    control: Vec<Box<dyn ControlPlane>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BoundServer {
    /// The address the main listener actually bound.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        self.listener.local_addr().map_err(ServerError::ConfigIo)
    }

    /// Shared engine state.
    pub fn core(&self) -> Arc<ServerCore> {
        Arc::clone(&self.core)
    }

    /// A handle that can stop the run loop from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Drive the server until shutdown is requested.
    ///
    /// Each loop turn either accepts a socket (accept failures are
    /// logged, the loop continues), runs the periodic service tick, or
    /// observes the shutdown signal. On shutdown: disconnect every
    /// WebSocket client, then stop the control interfaces.
    pub async fn run(mut self) -> ServerResult<()> {
        let mut tick = tokio::time::interval(self.core.config.tick_interval_duration());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!("listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let _ = Connection::spawn(Arc::clone(&self.core), stream);
                    }
                    Err(e) => {
                        warn!(error = %e, "cannot accept new web client connection");
                    }
                },
                _ = tick.tick() => {
                    for service in self.core.services.values() {
                        service.tick();
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("initiating shutdown sequence");

        debug!("disconnecting clients");
        for entry in self.core.registry.iter() {
            entry.value().disconnect(None, "server shutting down");
        }

        debug!("stopping control interfaces");
        for plane in self.control.iter_mut() {
            plane.stop().await;
        }

        info!("server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientContext};
    use crate::service::Service;
    use iris_proto::opcode::Opcode;
    use iris_router::Rule;

    struct NullClient;

    impl Client for NullClient {
        fn on_message(&mut self, _ctx: &ClientContext, _opcode: Opcode, _payload: &[u8]) {}
    }

    fn null_service(name: &str) -> Service {
        Service::new(name, |_ctx| Box::new(NullClient))
    }

    #[test]
    fn test_duplicate_service_is_fatal() {
        let result = Server::builder()
            .service(null_service("chat"))
            .service(null_service("chat"))
            .build();
        assert!(matches!(result, Err(ServerError::DuplicateService(_))));
    }

    #[test]
    fn test_rule_without_registered_service_is_fatal() {
        let mut router = Router::new();
        router.add_rule(
            Rule::builder()
                .source("^/")
                .destination("service", "ghost")
                .build()
                .unwrap(),
        );

        let result = Server::builder()
            .router(router)
            .service(null_service("chat"))
            .build();
        assert!(matches!(
            result,
            Err(ServerError::ServiceMissingDest { .. })
        ));
    }

    #[test]
    fn test_rule_without_service_destination_is_fatal() {
        let mut router = Router::new();
        router.add_rule(
            Rule::builder()
                .source("^/")
                .destination("page", "index")
                .build()
                .unwrap(),
        );

        let result = Server::builder().router(router).build();
        assert!(matches!(
            result,
            Err(ServerError::ServiceMissingDest { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_on_ephemeral_port() {
        let mut router = Router::new();
        router.add_rule(
            Rule::builder()
                .source("^/")
                .destination("service", "chat")
                .build()
                .unwrap(),
        );

        let server = Server::builder()
            .config(ServerConfig::new().addr("127.0.0.1:0"))
            .router(router)
            .service(null_service("chat"))
            .build()
            .unwrap();

        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(bound.core().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_reports_address() {
        // occupy a port, then try to bind the server to the same one
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let server = Server::builder()
            .config(ServerConfig::new().addr(addr.clone()))
            .build()
            .unwrap();

        let err = match server.bind().await {
            Err(e) => e,
            Ok(_) => panic!("expected bind failure"),
        };
        match err {
            ServerError::Bind { addr: failed, .. } => assert_eq!(failed, addr),
            other => panic!("unexpected error: {other}"),
        }
    }
}
