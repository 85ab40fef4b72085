//! Per-connection state machine and task.
//!
//! Each accepted socket is owned by exactly one tokio task running
//! [`Connection::run`]. The task drains the socket into a byte
//! accumulator, runs the handshake processor until upgraded, then the
//! frame decoder in a loop, and delivers complete messages to the bound
//! client. Everything else in the process talks to the connection
//! through its cloneable [`ConnectionHandle`], so per-connection state
//! has a single writer and client callbacks are naturally serialized.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use iris_core::{ConnectionId, ErrorCode};
use iris_proto::frame::{self, Decoded, Frame};
use iris_proto::fragment::FragmentBuffer;
use iris_proto::handshake::HandshakeOutcome;
use iris_proto::opcode::Opcode;

use crate::client::ClientContext;
use crate::server::ServerCore;
use crate::service::{ClientSlot, Service};

/// Commands a handle can enqueue on the owning task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Encode and send a data or control message.
    Send { opcode: Opcode, payload: Bytes },
    /// Send a ping frame (ping bookkeeping already done by the handle).
    Ping { payload: Bytes },
    /// Tear the connection down.
    Disconnect {
        /// Engine-level reason code, if any.
        code: Option<ErrorCode>,
        /// Human-readable reason.
        reason: String,
    },
}

#[derive(Debug)]
struct StateCells {
    last_recv: Option<Instant>,
    last_sent: Option<Instant>,
    last_message: Option<Instant>,
    ping_pending: bool,
    ping_data: Bytes,
    ping_sent_at: Option<Instant>,
    ping_count: u32,
    closed: bool,
}

/// Shared per-connection bookkeeping.
///
/// Written by the owning task (and by [`ConnectionHandle::send_ping`],
/// which transitions ping state synchronously); read by the service
/// tick.
#[derive(Debug)]
pub struct ConnectionState {
    connected_at: Instant,
    peer_addr: Option<SocketAddr>,
    cells: Mutex<StateCells>,
}

impl ConnectionState {
    fn new(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            connected_at: Instant::now(),
            peer_addr,
            cells: Mutex::new(StateCells {
                last_recv: None,
                last_sent: None,
                last_message: None,
                ping_pending: false,
                ping_data: Bytes::new(),
                ping_sent_at: None,
                ping_count: 0,
                closed: false,
            }),
        }
    }

    /// When the socket was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// The peer address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether a ping is outstanding.
    pub fn ping_pending(&self) -> bool {
        self.cells.lock().ping_pending
    }

    /// When the last liveness ping was sent.
    pub fn ping_sent_at(&self) -> Option<Instant> {
        self.cells.lock().ping_sent_at
    }

    /// Consecutive pings sent since the last complete message.
    pub fn ping_count(&self) -> u32 {
        self.cells.lock().ping_count
    }

    /// Instant of the last complete message in either direction, or the
    /// accept time if none yet.
    pub fn last_message_or_connect(&self) -> Instant {
        self.cells.lock().last_message.unwrap_or(self.connected_at)
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.cells.lock().closed
    }

    fn note_recv(&self) {
        self.cells.lock().last_recv = Some(Instant::now());
    }

    fn note_sent(&self) {
        self.cells.lock().last_sent = Some(Instant::now());
    }

    fn note_message(&self) {
        let mut cells = self.cells.lock();
        cells.last_message = Some(Instant::now());
        cells.ping_count = 0;
    }
}

/// A cloneable handle to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Command>,
    state: Arc<ConnectionState>,
}

impl ConnectionHandle {
    /// The connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Shared connection bookkeeping.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Send a text message.
    pub fn send_text(&self, text: &str) -> Result<(), ErrorCode> {
        self.send(Opcode::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Send a binary message.
    pub fn send_binary(&self, data: &[u8]) -> Result<(), ErrorCode> {
        self.send(Opcode::Binary, Bytes::copy_from_slice(data))
    }

    fn send(&self, opcode: Opcode, payload: Bytes) -> Result<(), ErrorCode> {
        self.tx
            .send(Command::Send { opcode, payload })
            .map_err(|_| ErrorCode::Send)
    }

    /// Send a liveness ping.
    ///
    /// Refuses to send while a previous ping is outstanding: that is a
    /// strict policy, the connection is disconnected rather than the
    /// ping silently dropped.
    pub fn send_ping(&self, payload: &[u8]) -> Result<(), ErrorCode> {
        {
            let mut cells = self.state.cells.lock();
            if cells.closed {
                return Err(ErrorCode::NotConnected);
            }
            if cells.ping_pending {
                drop(cells);
                warn!(connection_id = %self.id, "ping already sent, waiting for response");
                self.disconnect(None, "ping already pending");
                return Err(ErrorCode::Send);
            }
            cells.ping_pending = true;
            cells.ping_data = Bytes::copy_from_slice(payload);
            cells.ping_sent_at = Some(Instant::now());
            cells.ping_count += 1;
        }
        self.tx
            .send(Command::Ping {
                payload: Bytes::copy_from_slice(payload),
            })
            .map_err(|_| ErrorCode::Send)
    }

    /// Tear the connection down. Idempotent.
    pub fn disconnect(&self, code: Option<ErrorCode>, reason: &str) {
        let _ = self.tx.send(Command::Disconnect {
            code,
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// The service binding established after handshake + routing.
struct Binding {
    service: Arc<Service>,
    client: ClientSlot,
    ctx: ClientContext,
}

/// The reactor-facing side of one WebSocket connection.
pub(crate) struct Connection {
    id: ConnectionId,
    core: Arc<ServerCore>,
    handle: ConnectionHandle,
    read_buf: BytesMut,
    handshake_done: bool,
    fragments: FragmentBuffer,
    binding: Option<Binding>,
    closed: bool,
}

impl Connection {
    /// Register a freshly accepted socket and spawn its task.
    pub(crate) fn spawn(core: Arc<ServerCore>, stream: TcpStream) -> ConnectionHandle {
        let id = ConnectionId::new();
        let peer_addr = stream.peer_addr().ok();
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnectionState::new(peer_addr));
        let handle = ConnectionHandle { id, tx, state };

        core.registry.insert(id, handle.clone());
        info!(connection_id = %id, ip = ?peer_addr, "new web client connected");

        let conn = Self {
            id,
            core,
            handle: handle.clone(),
            read_buf: BytesMut::with_capacity(4096),
            handshake_done: false,
            fragments: FragmentBuffer::new(),
            binding: None,
            closed: false,
        };
        tokio::spawn(conn.run(stream, rx));

        handle
    }

    async fn run(mut self, mut stream: TcpStream, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                read = stream.read_buf(&mut self.read_buf) => match read {
                    Ok(0) => {
                        debug!(connection_id = %self.id, "EOF on read, disconnecting");
                        self.teardown(None, "peer closed the connection");
                    }
                    Ok(n) => {
                        debug!(connection_id = %self.id, bytes = n, "received data");
                        self.handle.state.note_recv();
                        self.process_buffer(&mut stream).await;
                    }
                    Err(e) => {
                        debug!(connection_id = %self.id, error = %e, "read failed, disconnecting");
                        self.teardown(None, "read error");
                    }
                },
                cmd = rx.recv() => match cmd {
                    Some(Command::Send { opcode, payload }) => {
                        self.write_message(&mut stream, opcode, &payload).await;
                    }
                    Some(Command::Ping { payload }) => {
                        let frame = frame::encode_frame(Opcode::Ping, &payload, true, false);
                        self.write_raw(&mut stream, &frame).await;
                    }
                    Some(Command::Disconnect { code, reason }) => {
                        self.teardown(code, &reason);
                    }
                    None => self.teardown(None, "all handles dropped"),
                },
            }

            if self.closed {
                break;
            }
        }
    }

    /// Drain the accumulator: handshake first, then frames, until the
    /// decoder asks for more bytes.
    async fn process_buffer(&mut self, stream: &mut TcpStream) {
        loop {
            if self.closed {
                return;
            }

            if !self.handshake_done {
                match self.core.handshake.process(&mut self.read_buf) {
                    Ok(HandshakeOutcome::Incomplete) => return,
                    Ok(HandshakeOutcome::Upgraded(upgrade)) => {
                        if !self.write_raw(stream, &upgrade.response).await {
                            return;
                        }
                        self.handshake_done = true;
                        debug!(connection_id = %self.id, path = %upgrade.path, "handshake done");

                        if !self.bind_to_service(&upgrade) {
                            self.teardown(None, "no service adopted the connection");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = %self.id, error = %e, "handshake failed");
                        // no client exists yet; abrupt close, no callbacks
                        self.teardown(Some(ErrorCode::ClientHandshake), &e.to_string());
                        return;
                    }
                }
            } else {
                match frame::decode(&mut self.read_buf) {
                    Ok(Decoded::Incomplete) => return,
                    Ok(Decoded::Frame(frame)) => self.handle_frame(stream, frame).await,
                    Err(e) => {
                        self.frame_error(&e.to_string());
                        return;
                    }
                }
            }

            if self.read_buf.is_empty() {
                return;
            }
            debug!(connection_id = %self.id, "some data left, processing next unit");
        }
    }

    /// Route the upgraded connection to a service and build its client.
    fn bind_to_service(&mut self, upgrade: &iris_proto::handshake::Upgrade) -> bool {
        let matches = self
            .core
            .router
            .process(&upgrade.path, upgrade.query.as_deref(), None);

        for matched in matches {
            let Some(name) = matched.service() else {
                continue;
            };
            let Some(service) = self.core.service(name) else {
                continue;
            };

            debug!(connection_id = %self.id, service = name, "attaching new client to service");

            let ctx = ClientContext {
                id: self.id,
                service: name.to_string(),
                handle: self.handle.clone(),
                route: matched.clone(),
                headers: Arc::new(upgrade.headers.clone()),
            };

            let Some(client) = service.attach(ctx.clone()) else {
                // the service refused the client
                return false;
            };

            let opened = client.lock().on_open(&ctx);
            self.binding = Some(Binding {
                service,
                client,
                ctx,
            });
            if !opened {
                self.teardown(None, "client refused to open");
                return false;
            }
            return true;
        }

        false
    }

    async fn handle_frame(&mut self, stream: &mut TcpStream, frame: Frame) {
        if frame.opcode.is_control() {
            self.handle_control_frame(stream, frame).await;
            return;
        }

        match self.fragments.push(frame) {
            Ok(Some(message)) => {
                self.handle.state.note_message();
                if self.core.config.log_payloads {
                    debug!(
                        connection_id = %self.id,
                        opcode = %message.opcode,
                        payload = %message.as_text(),
                        "received message"
                    );
                } else {
                    debug!(connection_id = %self.id, opcode = %message.opcode, "received message");
                }

                if let Some(binding) = &self.binding {
                    let ctx = binding.ctx.clone();
                    binding
                        .client
                        .lock()
                        .on_message(&ctx, message.opcode, &message.payload);
                } else {
                    self.teardown(None, "message before service binding");
                }
            }
            Ok(None) => {
                debug!(connection_id = %self.id, "fragmented message incomplete, postponing");
            }
            Err(e) => self.frame_error(&e.to_string()),
        }
    }

    async fn handle_control_frame(&mut self, stream: &mut TcpStream, frame: Frame) {
        match frame.opcode {
            Opcode::Close => {
                let (code, reason) = frame::parse_close_payload(&frame.payload);
                debug!(
                    connection_id = %self.id,
                    code = ?code,
                    reason = ?reason,
                    "CLOSE message, disconnecting"
                );
                self.teardown(None, "close received");
            }
            Opcode::Ping => {
                debug!(connection_id = %self.id, "PING, answering back with a pong");
                let pong = frame::encode_frame(Opcode::Pong, &frame.payload, true, false);
                self.write_raw(stream, &pong).await;
            }
            Opcode::Pong => self.handle_pong(&frame.payload),
            _ => unreachable!("data opcodes handled by the caller"),
        }
    }

    fn handle_pong(&mut self, payload: &[u8]) {
        let matched = {
            let mut cells = self.handle.state.cells.lock();
            if !cells.ping_pending {
                None
            } else {
                cells.ping_pending = false;
                Some(cells.ping_data.clone())
            }
        };

        match matched {
            None => {
                warn!(connection_id = %self.id, "PONG received without asking for it, ignoring");
            }
            Some(expected) if expected.as_ref() == payload => {
                debug!(connection_id = %self.id, "PONG received with matching payload");
            }
            Some(_) => {
                self.frame_error("pong payload does not match the outstanding ping");
            }
        }
    }

    /// A malformed frame: report to the client, then tear down.
    fn frame_error(&mut self, text: &str) {
        warn!(connection_id = %self.id, error = %text, "client frame error");
        if let Some(binding) = &self.binding {
            let ctx = binding.ctx.clone();
            binding
                .client
                .lock()
                .on_error(&ctx, ErrorCode::ClientFrame, text);
        }
        self.teardown(Some(ErrorCode::ClientFrame), text);
    }

    /// Encode and write one outgoing message, fragmenting as needed.
    async fn write_message(&mut self, stream: &mut TcpStream, opcode: Opcode, payload: &[u8]) {
        let frames =
            match frame::encode_message(opcode, payload, false, self.core.config.max_frame_size) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(connection_id = %self.id, error = %e, "refusing to send message");
                    return;
                }
            };

        for f in &frames {
            if !self.write_raw(stream, f).await {
                return;
            }
        }

        if opcode.is_data() {
            self.handle.state.note_message();
        }
    }

    /// Write bytes with immediate flush; failure tears the connection
    /// down. Returns whether the write succeeded.
    async fn write_raw(&mut self, stream: &mut TcpStream, bytes: &[u8]) -> bool {
        let result = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.handle.state.note_sent();
                true
            }
            Err(e) => {
                debug!(connection_id = %self.id, error = %e, "write failed, disconnecting");
                if let Some(binding) = &self.binding {
                    let ctx = binding.ctx.clone();
                    binding
                        .client
                        .lock()
                        .on_error(&ctx, ErrorCode::Send, "unable to send frame");
                }
                self.teardown(Some(ErrorCode::Send), "write failure");
                false
            }
        }
    }

    /// Idempotent teardown: close callbacks, service detach, registry
    /// removal. The socket itself closes when the task drops it.
    fn teardown(&mut self, code: Option<ErrorCode>, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.handle.state.cells.lock().closed = true;

        if let Some(binding) = self.binding.take() {
            {
                let ctx = binding.ctx.clone();
                binding.client.lock().on_close(&ctx, code, reason);
            }
            binding.service.remove_client(&self.id);
        }
        self.core.registry.remove(&self.id);

        info!(
            connection_id = %self.id,
            code = ?code.map(ErrorCode::as_u16),
            reason = %reason,
            "web client disconnected"
        );
    }
}
