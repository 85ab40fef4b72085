//! # iris
//!
//! **WebSocket server engine with an encrypted control channel**
//!
//! iris multiplexes many concurrent WebSocket connections over an async
//! engine, performs the RFC 6455 handshake and framing itself, routes
//! freshly upgraded sockets to pluggable services, and exposes a
//! parallel control protocol, over a Unix or TCP socket and optionally
//! RSA-enveloped, that lets external processes list clients, deliver
//! messages and select services on a running server.
//!
//! ## Crates
//!
//! - [`proto`]: RFC 6455 handshake, frame codec, fragmentation
//! - [`router`]: priority-bucketed regex routing rules
//! - [`server`]: the engine with connections, services and the liveness tick
//! - [`control`]: the control protocol, both interface and client
//! - [`core`]: shared ids, error codes, protocol version
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use iris::prelude::*;
//!
//! struct Echo;
//!
//! impl Client for Echo {
//!     fn on_message(&mut self, ctx: &ClientContext, _opcode: Opcode, payload: &[u8]) {
//!         let _ = ctx.send_binary(payload);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ServerError> {
//!     let mut router = Router::new();
//!     router.add_rule(
//!         Rule::builder()
//!             .source("^/")
//!             .destination("service", "echo")
//!             .build()
//!             .expect("valid rule"),
//!     );
//!
//!     Server::builder()
//!         .config(
//!             ServerConfig::new()
//!                 .addr("0.0.0.0:9000")
//!                 .allow_host("localhost:9000")
//!                 .allow_origin("http://localhost"),
//!         )
//!         .router(router)
//!         .service(Service::new("echo", |_ctx| Box::new(Echo)))
//!         .build()?
//!         .bind()
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/iris/1.2.0")]
#![forbid(unsafe_code)]

// Re-export shared types
pub use iris_core as core;

// Re-export the wire protocol
pub use iris_proto as proto;

// Re-export routing rules
pub use iris_router as router;

// Re-export the engine
pub use iris_server as server;

// Re-export the control channel
pub use iris_control as control;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust,ignore
/// use iris::prelude::*;
/// ```
pub mod prelude {
    pub use iris_core::{ConnectionId, ErrorCode, VERSION};

    pub use iris_proto::opcode::{CloseCode, Opcode};

    pub use iris_router::{Priority, RouteMatch, Router, Rule};

    pub use iris_server::{
        Client, ClientContext, LogConfig, PingConfig, Server, ServerConfig, ServerError, Service,
        ServiceHooks,
    };

    pub use iris_control::{
        Authenticator, ClientEnvelope, ControlClient, ServerEnvelope, SimpleAuthenticator,
        TcpControlInterface, UnixControlInterface,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_exports() {
        // Verify the prelude surface is accessible
        let _config = ServerConfig::default();
        let _id = ConnectionId::new();
        let _priority = Priority::Normal;
        assert_eq!(VERSION, "1.2.0");
    }
}
