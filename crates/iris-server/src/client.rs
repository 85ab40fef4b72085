//! The client capability trait and its context.
//!
//! A [`Client`] is the application-facing side of one WebSocket
//! connection: the service's factory builds one after the handshake and
//! routing succeed, and the engine drives its callbacks from the
//! connection's own task, so no two callbacks on the same client ever
//! run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use iris_core::{ConnectionId, ErrorCode};
use iris_proto::opcode::Opcode;
use iris_router::RouteMatch;

use crate::connection::ConnectionHandle;

/// Everything a client knows about the connection it is bound to.
///
/// Cloneable; the service keeps a copy so the control channel can act on
/// the client without going through its callbacks.
#[derive(Clone)]
pub struct ClientContext {
    pub(crate) id: ConnectionId,
    pub(crate) service: String,
    pub(crate) handle: ConnectionHandle,
    pub(crate) route: RouteMatch,
    pub(crate) headers: Arc<HashMap<String, String>>,
}

impl ClientContext {
    /// The connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Name of the service that adopted this connection.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The routing match that picked the service.
    pub fn route(&self) -> &RouteMatch {
        &self.route
    }

    /// A handshake request header, by lowercased name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The underlying connection handle.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Send a text message to the peer.
    pub fn send_text(&self, text: &str) -> Result<(), ErrorCode> {
        self.handle.send_text(text)
    }

    /// Send a binary message to the peer.
    pub fn send_binary(&self, data: &[u8]) -> Result<(), ErrorCode> {
        self.handle.send_binary(data)
    }

    /// Disconnect the peer.
    pub fn disconnect(&self, code: Option<ErrorCode>, reason: &str) {
        self.handle.disconnect(code, reason);
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("id", &self.id)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

/// Application behavior attached to one connection.
///
/// Implementations are built by the factory stored with the service
/// registration. All callbacks run on the connection's task.
pub trait Client: Send + 'static {
    /// Called once the client is attached; returning `false` disconnects
    /// the connection immediately.
    fn on_open(&mut self, ctx: &ClientContext) -> bool {
        let _ = ctx;
        true
    }

    /// A complete data message arrived from the peer.
    fn on_message(&mut self, ctx: &ClientContext, opcode: Opcode, payload: &[u8]);

    /// The connection is going away. `code` is set when the engine
    /// initiated the disconnect (e.g. [`ErrorCode::ClientInactive`]).
    fn on_close(&mut self, ctx: &ClientContext, code: Option<ErrorCode>, reason: &str) {
        let _ = (ctx, code, reason);
    }

    /// A recoverable or fatal error happened on this connection.
    fn on_error(&mut self, ctx: &ClientContext, code: ErrorCode, text: &str) {
        let _ = (ctx, code, text);
    }

    /// Application-defined description, surfaced by the control
    /// channel's LIST_CLIENTS command.
    fn info(&self) -> Option<serde_json::Value> {
        None
    }

    /// Deliver an administrative message to the peer. The default sends
    /// it as a text frame; override to re-encode.
    fn send(&mut self, ctx: &ClientContext, data: &str) -> Result<(), ErrorCode> {
        ctx.send_text(data)
    }
}
