//! Server-side control connections.
//!
//! Each accepted control socket runs one session task: HELO goes out
//! immediately, the first inbound message must be AUTH, and afterwards
//! commands are dispatched against the selected scope (one service, or
//! the whole server). Application-level failures answer with an
//! `{error: code}` envelope on the same connection; protocol violations
//! tear the connection down.

use std::sync::Arc;

use bytes::BytesMut;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use dashmap::DashMap;
use iris_core::{ConnectionId, ErrorCode, VERSION};
use iris_server::{ServerCore, Service};

use crate::auth::{Account, Authenticator};
use crate::codec::{self, DecodedControl};
use crate::command::{CommandId, FLAG_COMMAND, SYSTEM_ID_LIMIT};
use crate::envelope::ServerEnvelope;
use crate::error::{ControlError, ControlResult};

/// Handler for custom (COMMAND-bit-unset) frames.
///
/// Returns the JSON answer to echo back, or `None` to refuse, which is
/// a protocol violation and disconnects the control client.
pub type CustomHandler = Arc<dyn Fn(&[u8]) -> Option<Value> + Send + Sync>;

/// State shared between an interface and its sessions.
pub(crate) struct InterfaceShared {
    pub(crate) core: Arc<ServerCore>,
    pub(crate) envelope: Option<Arc<ServerEnvelope>>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) custom: Option<CustomHandler>,
    pub(crate) log_payloads: bool,
    pub(crate) log_auth_payloads: bool,
    pub(crate) connections: Arc<DashMap<ConnectionId, ()>>,
    pub(crate) shutdown: broadcast::Sender<()>,
}

/// One control client session.
pub(crate) struct ControlConnection {
    id: ConnectionId,
    shared: Arc<InterfaceShared>,
    buf: BytesMut,
    first_message_seen: bool,
    authenticated: bool,
    account: Option<Account>,
    service: Option<Arc<Service>>,
}

impl ControlConnection {
    /// Register and spawn a session for an accepted control socket.
    pub(crate) fn spawn<S>(shared: Arc<InterfaceShared>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::new();
        shared.connections.insert(id, ());
        info!(connection_id = %id, "control client connected");

        let conn = Self {
            id,
            shared,
            buf: BytesMut::with_capacity(4096),
            first_message_seen: false,
            authenticated: false,
            account: None,
            service: None,
        };
        tokio::spawn(conn.run(stream));
    }

    async fn run<S>(mut self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut shutdown = self.shared.shutdown.subscribe();

        // required by the v1.0.0 control protocol: greet before anything
        let helo = json!({ "version": VERSION });
        if let Err(e) = self
            .send_command(&mut stream, CommandId::Helo.as_u16(), helo)
            .await
        {
            warn!(connection_id = %self.id, error = %e, "unable to send HELO");
            self.close();
            return;
        }

        loop {
            tokio::select! {
                read = stream.read_buf(&mut self.buf) => match read {
                    Ok(0) => {
                        debug!(connection_id = %self.id, "EOF on control socket");
                        break;
                    }
                    Ok(n) => {
                        debug!(connection_id = %self.id, bytes = n, "control data received");
                        if let Err(e) = self.process(&mut stream).await {
                            warn!(connection_id = %self.id, error = %e, "control connection error");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(connection_id = %self.id, error = %e, "control read failed");
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        self.close();
    }

    fn close(&self) {
        self.shared.connections.remove(&self.id);
        info!(connection_id = %self.id, "control client disconnected");
    }

    /// Drain complete frames from the accumulator.
    async fn process<S>(&mut self, stream: &mut S) -> ControlResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let frame = match codec::decode(&mut self.buf) {
                DecodedControl::Incomplete => return Ok(()),
                DecodedControl::Frame(frame) => frame,
            };

            let cleartext = match (&self.shared.envelope, frame.is_encrypted()) {
                (Some(envelope), true) => envelope.decrypt(&frame.payload)?,
                (None, false) => frame.payload.to_vec(),
                (Some(_), false) => return Err(ControlError::EncryptedExpected),
                (None, true) => return Err(ControlError::EncryptedUnexpected),
            };

            if frame.is_command() {
                let (id, body) = codec::decode_command(&cleartext)?;
                self.dispatch(stream, id, body).await?;
            } else {
                self.dispatch_custom(stream, &cleartext).await?;
            }

            if self.buf.is_empty() {
                return Ok(());
            }
            debug!(connection_id = %self.id, "data left in control buffer, continuing");
        }
    }

    async fn dispatch<S>(&mut self, stream: &mut S, id: u16, body: Value) -> ControlResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !self.first_message_seen {
            self.first_message_seen = true;

            if id != CommandId::Auth.as_u16() {
                return Err(ControlError::Protocol(
                    "expected AUTH as the first message".to_string(),
                ));
            }

            if self.shared.log_auth_payloads {
                debug!(connection_id = %self.id, payload = %body, "received AUTH");
            } else {
                debug!(connection_id = %self.id, "received AUTH");
            }

            return match self.shared.authenticator.authenticate(&body) {
                Some(account) => {
                    self.account = Some(account);
                    self.authenticated = true;
                    self.send_command(stream, id, json!({ "auth": true })).await
                }
                None => {
                    self.send_command(stream, id, json!({ "auth": false }))
                        .await?;
                    Err(ControlError::Protocol("authentication refused".to_string()))
                }
            };
        }

        if !self.authenticated {
            return Err(ControlError::Protocol(
                "command on an unauthenticated connection".to_string(),
            ));
        }

        if id < SYSTEM_ID_LIMIT {
            debug!(connection_id = %self.id, command = id, "received system command, ignoring");
            return Ok(());
        }

        if self.shared.log_payloads {
            debug!(connection_id = %self.id, command = id, payload = %body, "received command");
        } else {
            debug!(connection_id = %self.id, command = id, "received command");
        }

        let result = match CommandId::from_u16(id) {
            Some(CommandId::SelectService) => self.cmd_select_service(&body),
            Some(CommandId::ListClients) => self.cmd_list_clients(),
            Some(CommandId::SendMessage) => self.cmd_send_message(&body),
            // AUTH twice, HELO from a client, or an id nobody assigned:
            // answered with an error envelope, the connection survives
            _ => Err(ErrorCode::ControlCommandUnknown),
        };

        match result {
            Ok(value) => {
                self.send_command(stream, id, json!({ "result": value }))
                    .await
            }
            Err(code) => {
                warn!(connection_id = %self.id, command = id, error = %code, "command failed");
                self.send_command(stream, id, json!({ "error": code.as_u16() }))
                    .await
            }
        }
    }

    async fn dispatch_custom<S>(&mut self, stream: &mut S, payload: &[u8]) -> ControlResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !self.first_message_seen {
            self.first_message_seen = true;
            return Err(ControlError::Protocol(
                "expected AUTH as the first message".to_string(),
            ));
        }
        if !self.authenticated {
            return Err(ControlError::Protocol(
                "command on an unauthenticated connection".to_string(),
            ));
        }

        debug!(connection_id = %self.id, bytes = payload.len(), "received custom command");

        let Some(handler) = &self.shared.custom else {
            return Err(ControlError::Protocol(
                "no custom command handler installed".to_string(),
            ));
        };

        match handler(payload) {
            Some(value) => {
                self.send_command(stream, CommandId::CustomCmd.as_u16(), value)
                    .await
            }
            None => Err(ControlError::Protocol(
                "custom command handler refused the payload".to_string(),
            )),
        }
    }

    fn cmd_select_service(&mut self, body: &Value) -> Result<Value, ErrorCode> {
        let name = if let Some(path) = body.get("path").and_then(Value::as_str) {
            self.shared.core.resolve_service(path)
        } else if let Some(name) = body.get("name").and_then(Value::as_str) {
            Some(name.to_string())
        } else {
            return Err(ErrorCode::MissingParam);
        };

        let name = name.ok_or(ErrorCode::ServiceNotFound)?;
        let service = self
            .shared
            .core
            .service(&name)
            .ok_or(ErrorCode::ServiceNotFound)?;

        let account = self.account.as_ref().ok_or(ErrorCode::Unauthorized)?;
        if !self
            .shared
            .authenticator
            .authorize_service(Some(&name), account)
        {
            return Err(ErrorCode::Unauthorized);
        }

        info!(connection_id = %self.id, service = %name, "control client selected service");
        self.service = Some(service);
        Ok(Value::String(name))
    }

    fn cmd_list_clients(&self) -> Result<Value, ErrorCode> {
        match &self.service {
            Some(service) => Ok(Value::Object(service.clients_info())),
            None => {
                self.authorize_server_scope()?;
                Ok(Value::Object(self.shared.core.clients_info()))
            }
        }
    }

    fn cmd_send_message(&self, body: &Value) -> Result<Value, ErrorCode> {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .ok_or(ErrorCode::MissingParam)?;

        let recipients: Vec<String> = match body.get("recipients") {
            Some(Value::String(single)) => vec![single.clone()],
            Some(Value::Array(many)) => many
                .iter()
                .map(|v| match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                })
                .collect(),
            _ => return Err(ErrorCode::CommandParameters),
        };

        let report = match &self.service {
            Some(service) => service.send_to(&recipients, message),
            None => {
                self.authorize_server_scope()?;
                self.shared.core.send_to(&recipients, message)
            }
        };

        serde_json::to_value(report).map_err(|_| ErrorCode::MessageFormat)
    }

    /// Whole-server scope needs an explicit grant.
    fn authorize_server_scope(&self) -> Result<(), ErrorCode> {
        let account = self.account.as_ref().ok_or(ErrorCode::Unauthorized)?;
        if self.shared.authenticator.authorize_service(None, account) {
            Ok(())
        } else {
            Err(ErrorCode::Unauthorized)
        }
    }

    async fn send_command<S>(&self, stream: &mut S, id: u16, body: Value) -> ControlResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut body = body;
        if let Value::Object(map) = &mut body {
            map.entry("error").or_insert_with(|| json!(0));
        }

        if self.shared.log_payloads {
            debug!(connection_id = %self.id, command = id, payload = %body, "sending command");
        }

        let cleartext = codec::encode_command(id, &body)?;
        self.send_frame(stream, cleartext, FLAG_COMMAND).await
    }

    async fn send_frame<S>(
        &self,
        stream: &mut S,
        payload: Vec<u8>,
        flags: u8,
    ) -> ControlResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (payload, flags) = match &self.shared.envelope {
            Some(envelope) => (envelope.encrypt(&payload)?, flags | crate::command::FLAG_ENCRYPTED),
            None => (payload, flags),
        };

        let frame = codec::encode(flags, &payload);
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }
}
