//! The control client: the far end of the control protocol.
//!
//! Used by external tooling (and the end-to-end tests) to administer a
//! running server: connect over Unix or TCP, verify the HELO greeting,
//! authenticate, then issue commands. Every command waits for its
//! response under a wall-clock deadline; a response carrying a different
//! command id than the request is an error, as is a non-zero `error`
//! field in the envelope.
//!
//! When the server interface encrypts, the client carries the matching
//! [`ClientEnvelope`] (public key both ways, the mirror image of the
//! server's private-key-both-ways side).

use std::path::Path;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use iris_core::VERSION;

use crate::codec::{self, DecodedControl};
use crate::command::{CommandId, FLAG_COMMAND, SYSTEM_ID_LIMIT};
use crate::envelope::ClientEnvelope;
use crate::error::{ControlError, ControlResult};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected control client.
#[derive(Debug)]
pub struct ControlClient<S> {
    stream: S,
    buf: BytesMut,
    envelope: Option<ClientEnvelope>,
    command_timeout: Duration,
    server_version: Option<String>,
    service: Option<String>,
}

impl ControlClient<UnixStream> {
    /// Connect to a Unix control socket and consume the HELO greeting.
    pub async fn connect_unix(path: impl AsRef<Path>) -> ControlResult<Self> {
        Self::connect_unix_with(path, None).await
    }

    /// Connect to a Unix control socket with an optional envelope.
    pub async fn connect_unix_with(
        path: impl AsRef<Path>,
        envelope: Option<ClientEnvelope>,
    ) -> ControlResult<Self> {
        let stream = UnixStream::connect(path.as_ref())
            .await
            .map_err(ControlError::Io)?;
        Self::finish_connect(stream, envelope).await
    }
}

impl ControlClient<TcpStream> {
    /// Connect to a TCP control address and consume the HELO greeting.
    pub async fn connect_tcp(addr: &str) -> ControlResult<Self> {
        Self::connect_tcp_with(addr, None).await
    }

    /// Connect to a TCP control address with an optional envelope.
    pub async fn connect_tcp_with(
        addr: &str,
        envelope: Option<ClientEnvelope>,
    ) -> ControlResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ControlError::Io)?;
        Self::finish_connect(stream, envelope).await
    }
}

impl<S> ControlClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn finish_connect(stream: S, envelope: Option<ClientEnvelope>) -> ControlResult<Self> {
        let mut client = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            envelope,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            server_version: None,
            service: None,
        };

        let (id, payload) = client.read_response(DEFAULT_CONNECT_TIMEOUT).await?;
        if id != CommandId::Helo.as_u16() {
            return Err(ControlError::Protocol("expected HELO".to_string()));
        }

        let version = payload
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| ControlError::Protocol("HELO without version".to_string()))?
            .to_string();
        if version_newer_than(&version, VERSION) {
            return Err(ControlError::ProtocolTooNew(version));
        }

        debug!(server_version = %version, "control connection established");
        client.server_version = Some(version);
        Ok(client)
    }

    /// Set the per-command response deadline.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// The version the server announced in its HELO.
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    /// The service selected on this connection, if any.
    pub fn selected_service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Authenticate. Must be the first command on the connection.
    pub async fn auth(&mut self, params: Value) -> ControlResult<bool> {
        let payload = self.command(CommandId::Auth.as_u16(), params).await?;
        Ok(payload
            .get("auth")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Bind the connection's scope to the service a path routes to.
    pub async fn select_service_by_path(&mut self, path: &str) -> ControlResult<String> {
        if !path.starts_with('/') || path.contains("://") {
            return Err(ControlError::ServicePath(path.to_string()));
        }
        let payload = self
            .command(CommandId::SelectService.as_u16(), json!({ "path": path }))
            .await?;
        self.store_selected(payload)
    }

    /// Bind the connection's scope to a service by name.
    pub async fn select_service_by_name(&mut self, name: &str) -> ControlResult<String> {
        let payload = self
            .command(CommandId::SelectService.as_u16(), json!({ "name": name }))
            .await?;
        self.store_selected(payload)
    }

    fn store_selected(&mut self, payload: Value) -> ControlResult<String> {
        let name = payload
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ControlError::MessageFormat("SELECT_SERVICE result missing".to_string())
            })?
            .to_string();
        self.service = Some(name.clone());
        Ok(name)
    }

    /// List every client in the selected scope.
    pub async fn list_clients(&mut self) -> ControlResult<Map<String, Value>> {
        let payload = self
            .command(CommandId::ListClients.as_u16(), json!({}))
            .await?;
        match payload.get("result") {
            Some(Value::Object(map)) => Ok(map.clone()),
            _ => Err(ControlError::MessageFormat(
                "LIST_CLIENTS result missing".to_string(),
            )),
        }
    }

    /// Deliver a message to one recipient (single-id wire form).
    pub async fn send_message_to(
        &mut self,
        message: &str,
        recipient: &str,
    ) -> ControlResult<Value> {
        let body = json!({ "message": message, "recipients": recipient });
        let payload = self.command(CommandId::SendMessage.as_u16(), body).await?;
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ControlError::MessageFormat("SEND_MESSAGE result missing".to_string()))
    }

    /// Deliver a message to many recipients.
    pub async fn send_message(
        &mut self,
        message: &str,
        recipients: &[String],
    ) -> ControlResult<Value> {
        let body = json!({ "message": message, "recipients": recipients });
        let payload = self.command(CommandId::SendMessage.as_u16(), body).await?;
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| ControlError::MessageFormat("SEND_MESSAGE result missing".to_string()))
    }

    /// Send an application-defined payload (COMMAND bit unset) and
    /// return the handler's JSON answer.
    pub async fn custom_command(&mut self, payload: &[u8]) -> ControlResult<Value> {
        self.send_frame(payload.to_vec(), 0).await?;
        let (id, body) = self.read_response(self.command_timeout).await?;
        if id != CommandId::CustomCmd.as_u16() {
            return Err(ControlError::MismatchedAnswer);
        }
        if let Some(err) = body.get("error").and_then(Value::as_u64) {
            if err != 0 {
                return Err(ControlError::Remote(err as u16));
            }
        }
        Ok(body)
    }

    /// Issue one command and wait for its (matching) response.
    async fn command(&mut self, id: u16, body: Value) -> ControlResult<Value> {
        let cleartext = codec::encode_command(id, &body)?;
        self.send_frame(cleartext, FLAG_COMMAND).await?;

        let (response_id, payload) = self.read_response(self.command_timeout).await?;
        if response_id != id {
            return Err(ControlError::MismatchedAnswer);
        }
        if let Some(err) = payload.get("error").and_then(Value::as_u64) {
            if err != 0 {
                return Err(ControlError::Remote(err as u16));
            }
        }
        Ok(payload)
    }

    async fn send_frame(&mut self, payload: Vec<u8>, flags: u8) -> ControlResult<()> {
        let (payload, flags) = match &self.envelope {
            Some(envelope) => (
                envelope.encrypt(&payload)?,
                flags | crate::command::FLAG_ENCRYPTED,
            ),
            None => (payload, flags),
        };

        let frame = codec::encode(flags, &payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read command frames until a non-system one arrives or the
    /// deadline passes. System messages (ids below 1000) have no
    /// defined members yet, so any is an error.
    async fn read_response(&mut self, timeout: Duration) -> ControlResult<(u16, Value)> {
        let deadline = Instant::now() + timeout;

        loop {
            if let DecodedControl::Frame(frame) = codec::decode(&mut self.buf) {
                let cleartext = match (&self.envelope, frame.is_encrypted()) {
                    (Some(envelope), true) => envelope.decrypt(&frame.payload)?,
                    (None, false) => frame.payload.to_vec(),
                    (Some(_), false) => return Err(ControlError::EncryptedExpected),
                    (None, true) => return Err(ControlError::EncryptedUnexpected),
                };

                let (id, body) = codec::decode_command(&cleartext)?;
                if id < SYSTEM_ID_LIMIT {
                    return Err(ControlError::UnknownSysMsg(id));
                }
                return Ok((id, body));
            }

            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ControlError::ResponseTimeout)?;

            match tokio::time::timeout(remaining, self.stream.read_buf(&mut self.buf)).await {
                Err(_) => return Err(ControlError::ResponseTimeout),
                Ok(Ok(0)) => return Err(ControlError::Disconnected),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(ControlError::Io(e)),
            }
        }
    }
}

fn version_newer_than(candidate: &str, reference: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let a = parse(candidate);
    let b = parse(reference);
    for i in 0..usize::max(a.len(), b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    false
}
