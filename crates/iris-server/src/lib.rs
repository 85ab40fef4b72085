//! WebSocket server engine for iris.
//!
//! The engine multiplexes many concurrent WebSocket connections,
//! performs the RFC 6455 handshake and framing via `iris-proto`, routes
//! freshly upgraded connections to registered [`Service`]s through an
//! `iris-router` rule table, and tracks client liveness with a periodic
//! ping tick.
//!
//! # Architecture
//!
//! ```text
//! accept ──► Connection task ──► HandshakeProcessor ──► Router
//!                 │                                        │
//!                 │                                   Service factory
//!                 ▼                                        │
//!           frame decode ──► FragmentBuffer ──► Client::on_message
//!                 ▲
//!   ConnectionHandle (send/ping/disconnect, from anywhere)
//! ```
//!
//! Each connection is owned by exactly one task; the socket registry and
//! the per-service client maps are the only shared state, touched for
//! add/remove and iteration. Client callbacks always run on the owning
//! task, so messages from one peer are delivered in strict receipt
//! order.
//!
//! # Example
//!
//! ```no_run
//! use iris_proto::opcode::Opcode;
//! use iris_router::{Router, Rule};
//! use iris_server::{Client, ClientContext, Server, ServerConfig, Service};
//!
//! struct Echo;
//!
//! impl Client for Echo {
//!     fn on_message(&mut self, ctx: &ClientContext, _opcode: Opcode, payload: &[u8]) {
//!         let _ = ctx.send_binary(payload);
//!     }
//! }
//!
//! # async fn run() -> Result<(), iris_server::ServerError> {
//! let mut router = Router::new();
//! router.add_rule(
//!     Rule::builder()
//!         .source("^/")
//!         .destination("service", "echo")
//!         .build()
//!         .expect("valid rule"),
//! );
//!
//! let server = Server::builder()
//!     .config(
//!         ServerConfig::new()
//!             .addr("127.0.0.1:9000")
//!             .allow_host("localhost:9000")
//!             .allow_origin("http://localhost"),
//!     )
//!     .router(router)
//!     .service(Service::new("echo", |_ctx| Box::new(Echo)))
//!     .build()?;
//!
//! server.bind().await?.run().await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;
pub mod service;
pub mod telemetry;

pub use client::{Client, ClientContext};
pub use config::{PingConfig, ServerConfig};
pub use connection::{ConnectionHandle, ConnectionState};
pub use error::{ServerError, ServerResult};
pub use server::{BoundServer, ControlPlane, Server, ServerBuilder, ServerCore, ShutdownHandle};
pub use service::{SendEntry, SendReport, Service, ServiceHooks};
pub use telemetry::{init_logging, LogConfig};
