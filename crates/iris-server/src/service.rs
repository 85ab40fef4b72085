//! Services: named groups of clients with a factory and a liveness tick.
//!
//! A service owns the clients the router assigns to it. Clients are
//! materialized by a factory closure stored with the registration; the
//! application supplies the closure and, optionally, service-level hooks
//! that can veto new clients or observe removals.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use iris_core::{ConnectionId, ErrorCode};

use crate::client::{Client, ClientContext};
use crate::config::PingConfig;

/// A client behind its per-connection lock.
///
/// The lock serializes callbacks with control-channel access; it is only
/// ever held for the duration of a single call.
pub type ClientSlot = Arc<Mutex<Box<dyn Client>>>;

/// Factory building a client for a freshly routed connection.
pub type ClientFactory = Box<dyn Fn(&ClientContext) -> Box<dyn Client> + Send + Sync>;

/// Service-level lifecycle hooks.
pub trait ServiceHooks: Send + Sync + 'static {
    /// A client is about to be attached; returning `false` aborts the
    /// attachment and the connection is dropped.
    fn on_new_client(&self, client: &mut dyn Client, ctx: &ClientContext) -> bool {
        let _ = (client, ctx);
        true
    }

    /// A client is being detached.
    fn on_remove_client(&self, client: &mut dyn Client, ctx: &ClientContext) {
        let _ = (client, ctx);
    }
}

struct DefaultHooks;

impl ServiceHooks for DefaultHooks {}

pub(crate) struct ClientEntry {
    pub(crate) client: ClientSlot,
    pub(crate) ctx: ClientContext,
}

/// A named handler group owning a subset of connected clients.
pub struct Service {
    name: String,
    factory: ClientFactory,
    hooks: Box<dyn ServiceHooks>,
    ping: Option<PingConfig>,
    clients: DashMap<ConnectionId, ClientEntry>,
}

impl Service {
    /// Create a service with the given name and client factory.
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn(&ClientContext) -> Box<dyn Client> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            hooks: Box::new(DefaultHooks),
            ping: None,
            clients: DashMap::new(),
        }
    }

    /// Install service-level hooks.
    pub fn hooks(mut self, hooks: impl ServiceHooks) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Enable the ping/liveness loop for this service's clients.
    pub fn ping(mut self, ping: PingConfig) -> Self {
        self.ping = Some(ping);
        self
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Ids of all attached clients.
    pub fn client_ids(&self) -> Vec<ConnectionId> {
        self.clients.iter().map(|e| *e.key()).collect()
    }

    /// Build and attach a client for a routed connection.
    ///
    /// Runs the factory, then [`ServiceHooks::on_new_client`]; a `false`
    /// veto aborts the attachment and nothing is registered.
    pub(crate) fn attach(&self, ctx: ClientContext) -> Option<ClientSlot> {
        info!(service = %self.name, connection_id = %ctx.id(), "attaching client");

        let mut client = (self.factory)(&ctx);
        if !self.hooks.on_new_client(client.as_mut(), &ctx) {
            debug!(service = %self.name, connection_id = %ctx.id(), "service vetoed the client");
            return None;
        }

        let slot: ClientSlot = Arc::new(Mutex::new(client));
        self.clients.insert(
            ctx.id(),
            ClientEntry {
                client: Arc::clone(&slot),
                ctx,
            },
        );
        Some(slot)
    }

    /// Detach a client, firing [`ServiceHooks::on_remove_client`].
    pub(crate) fn remove_client(&self, id: &ConnectionId) {
        if let Some((_, entry)) = self.clients.remove(id) {
            info!(service = %self.name, connection_id = %id, "detaching client");
            self.hooks
                .on_remove_client(entry.client.lock().as_mut(), &entry.ctx);
        }
    }

    /// Per-client info map, as surfaced by the control channel.
    pub fn clients_info(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut out = serde_json::Map::new();
        for entry in self.clients.iter() {
            let info = entry
                .value()
                .client
                .lock()
                .info()
                .unwrap_or(serde_json::Value::Null);
            out.insert(entry.key().to_string(), info);
        }
        out
    }

    /// Deliver a message to the given client ids.
    ///
    /// Every requested recipient lands in exactly one half of the
    /// report: `sent` when the message was accepted for delivery,
    /// `errors` otherwise.
    pub fn send_to(&self, recipients: &[String], message: &str) -> SendReport {
        let mut report = SendReport::default();
        for id_str in recipients {
            match self.try_send(id_str, message) {
                Ok(()) => report.ok(id_str),
                Err(code) => report.fail(id_str, code),
            }
        }
        report
    }

    /// Deliver a message to every client except the excluded ids.
    pub fn send_to_all(&self, message: &str, exclude: &[String]) -> SendReport {
        let recipients: Vec<String> = self
            .clients
            .iter()
            .map(|e| e.key().to_string())
            .filter(|id| !exclude.contains(id))
            .collect();
        self.send_to(&recipients, message)
    }

    pub(crate) fn try_send(&self, id_str: &str, message: &str) -> Result<(), ErrorCode> {
        let id = ConnectionId::parse(id_str).ok_or(ErrorCode::UnknownClient)?;
        let entry = self.clients.get(&id).ok_or(ErrorCode::UnknownClient)?;
        let ctx = entry.ctx.clone();
        let result = entry.client.lock().send(&ctx, message);
        result
    }

    /// Whether this service knows the given client id.
    pub(crate) fn has_client(&self, id_str: &str) -> bool {
        ConnectionId::parse(id_str)
            .map(|id| self.clients.contains_key(&id))
            .unwrap_or(false)
    }

    /// Run one liveness pass over this service's clients.
    ///
    /// Invoked once per reactor tick. For each client: skip while a ping
    /// is outstanding or the client was active within the interval; once
    /// the unanswered-ping budget is exhausted, disconnect with
    /// [`ErrorCode::ClientInactive`]; otherwise send the next ping.
    pub(crate) fn tick(&self) {
        let Some(ping) = &self.ping else {
            return;
        };
        let interval = ping.interval();

        for entry in self.clients.iter() {
            let handle = entry.value().ctx.connection();
            let state = handle.state();

            if state.ping_pending() {
                continue;
            }
            if state.last_message_or_connect().elapsed() < interval {
                continue;
            }
            if let Some(sent_at) = state.ping_sent_at() {
                if sent_at.elapsed() < interval {
                    continue;
                }
            }

            if let Some(max) = ping.max_before_disconnect {
                if state.ping_count() >= max {
                    warn!(
                        service = %self.name,
                        connection_id = %entry.key(),
                        pings = state.ping_count(),
                        "client inactive for too long, disconnecting"
                    );
                    handle.disconnect(Some(ErrorCode::ClientInactive), "client inactive");
                    continue;
                }
            }

            debug!(service = %self.name, connection_id = %entry.key(), "sending liveness ping");
            let _ = handle.send_ping(ping.payload.as_bytes());
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("clients", &self.clients.len())
            .field("ping", &self.ping)
            .finish_non_exhaustive()
    }
}

/// Per-recipient outcome entry in a [`SendReport`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SendEntry {
    /// Zero on success, otherwise the wire error code.
    pub code: u16,
    /// Optional human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descr: Option<String>,
}

/// Result of a multi-recipient send.
///
/// Every requested recipient appears in exactly one of `sent` or
/// `errors`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SendReport {
    /// Recipients the message was accepted for.
    pub sent: BTreeMap<String, SendEntry>,
    /// Recipients that could not be delivered to.
    pub errors: BTreeMap<String, SendEntry>,
}

impl SendReport {
    pub(crate) fn ok(&mut self, id: &str) {
        self.sent.insert(
            id.to_string(),
            SendEntry {
                code: 0,
                descr: None,
            },
        );
    }

    pub(crate) fn fail(&mut self, id: &str, code: ErrorCode) {
        self.errors.insert(
            id.to_string(),
            SendEntry {
                code: code.as_u16(),
                descr: Some(code.description().to_string()),
            },
        );
    }

    /// Whether every recipient was accepted.
    pub fn all_sent(&self) -> bool {
        self.errors.is_empty()
    }

    /// Merge another report into this one.
    pub(crate) fn merge(&mut self, other: SendReport) {
        self.sent.extend(other.sent);
        self.errors.extend(other.errors);
    }
}
