//! End-to-end engine tests over real sockets.
//!
//! A raw TCP client performs the opening handshake and speaks masked
//! frames at the server, while a recording client implementation
//! observes the callbacks the engine delivers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use iris_core::ErrorCode;
use iris_proto::frame::{self, Decoded, Frame};
use iris_proto::opcode::Opcode;
use iris_router::{Router, Rule};
use iris_server::{
    Client, ClientContext, PingConfig, Server, ServerConfig, ServerCore, Service, ShutdownHandle,
};

const HOST: &str = "test-host";
const ORIGIN: &str = "http://test-origin";

#[derive(Debug)]
enum Event {
    Open,
    Message(Opcode, Vec<u8>),
    Close(Option<ErrorCode>, String),
    Error(ErrorCode, String),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl Client for Recorder {
    fn on_open(&mut self, _ctx: &ClientContext) -> bool {
        let _ = self.tx.send(Event::Open);
        true
    }

    fn on_message(&mut self, _ctx: &ClientContext, opcode: Opcode, payload: &[u8]) {
        let _ = self.tx.send(Event::Message(opcode, payload.to_vec()));
    }

    fn on_close(&mut self, _ctx: &ClientContext, code: Option<ErrorCode>, reason: &str) {
        let _ = self.tx.send(Event::Close(code, reason.to_string()));
    }

    fn on_error(&mut self, _ctx: &ClientContext, code: ErrorCode, text: &str) {
        let _ = self.tx.send(Event::Error(code, text.to_string()));
    }
}

struct TestServer {
    addr: SocketAddr,
    events: mpsc::UnboundedReceiver<Event>,
    core: Arc<ServerCore>,
    shutdown: ShutdownHandle,
}

/// Start a server with a single recording service routed at `^/`.
async fn start_server(ping: Option<PingConfig>) -> TestServer {
    let (tx, events) = mpsc::unbounded_channel();

    let mut router = Router::new();
    router.add_rule(
        Rule::builder()
            .source("^/$")
            .destination("service", "the_only_service")
            .build()
            .unwrap(),
    );

    let mut service = Service::new("the_only_service", move |_ctx| {
        Box::new(Recorder { tx: tx.clone() }) as Box<dyn Client>
    });
    if let Some(ping) = ping {
        service = service.ping(ping);
    }

    let server = Server::builder()
        .config(
            ServerConfig::new()
                .addr("127.0.0.1:0")
                .allow_host(HOST)
                .allow_origin(ORIGIN)
                .tick_interval(Duration::from_millis(10)),
        )
        .router(router)
        .service(service)
        .build()
        .unwrap();

    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let core = bound.core();
    let shutdown = bound.shutdown_handle();
    tokio::spawn(bound.run());

    TestServer {
        addr,
        events,
        core,
        shutdown,
    }
}

struct WsClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl WsClient {
    async fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Open the connection and complete the handshake on `path`.
    async fn connect(addr: SocketAddr, path: &str) -> Self {
        let mut client = Self::connect_raw(addr).await;
        client.handshake(path, HOST, ORIGIN).await;
        let response = client.read_handshake_response().await.unwrap();
        assert!(response.contains("101 Switching Protocols"), "{response}");
        assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        client
    }

    async fn handshake(&mut self, path: &str, host: &str, origin: &str) {
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Origin: {origin}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        self.stream.write_all(request.as_bytes()).await.unwrap();
    }

    /// Read until the blank line ends the response headers, or `None`
    /// on EOF before any byte.
    async fn read_handshake_response(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = self.buf.split_to(pos + 4);
                return Some(String::from_utf8_lossy(&head).into_owned());
            }
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            if n == 0 {
                return None;
            }
        }
    }

    async fn send_frame(&mut self, opcode: Opcode, payload: &[u8], fin: bool) {
        let frame = frame::encode_frame(opcode, payload, fin, true);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            match frame::decode(&mut self.buf).unwrap() {
                Decoded::Frame(frame) => return Some(frame),
                Decoded::Incomplete => {
                    let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                    if n == 0 {
                        return None;
                    }
                }
            }
        }
    }

    /// The server closes abruptly; observe the EOF.
    async fn expect_eof(&mut self) {
        loop {
            self.buf.clear();
            let n = self.stream.read_buf(&mut self.buf).await.unwrap_or(0);
            if n == 0 {
                return;
            }
        }
    }
}

async fn next_event(server: &mut TestServer) -> Event {
    timeout(Duration::from_secs(2), server.events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn client_connects_and_sends_hello() {
    let mut server = start_server(None).await;
    let mut ws = WsClient::connect(server.addr, "/").await;

    assert!(matches!(next_event(&mut server).await, Event::Open));

    ws.send_frame(Opcode::Text, b"hello", true).await;
    match next_event(&mut server).await {
        Event::Message(opcode, payload) => {
            assert_eq!(opcode, Opcode::Text);
            assert_eq!(payload, b"hello");
        }
        other => panic!("expected a message, got {other:?}"),
    }

    // exactly once: no further events pending
    assert!(server.events.try_recv().is_err());
    assert_eq!(server.core.connection_count(), 1);

    server.shutdown.shutdown();
    ws.expect_eof().await;
}

#[tokio::test]
async fn fragmented_text_delivers_one_message() {
    let mut server = start_server(None).await;
    let mut ws = WsClient::connect(server.addr, "/").await;
    assert!(matches!(next_event(&mut server).await, Event::Open));

    ws.send_frame(Opcode::Text, b"one ", false).await;
    ws.send_frame(Opcode::Continuation, b"two ", false).await;
    ws.send_frame(Opcode::Continuation, b"three", true).await;

    match next_event(&mut server).await {
        Event::Message(opcode, payload) => {
            assert_eq!(opcode, Opcode::Text);
            assert_eq!(payload, b"one two three");
        }
        other => panic!("expected a message, got {other:?}"),
    }
    assert!(server.events.try_recv().is_err());
}

#[tokio::test]
async fn stray_continuation_is_a_protocol_error() {
    let mut server = start_server(None).await;
    let mut ws = WsClient::connect(server.addr, "/").await;
    assert!(matches!(next_event(&mut server).await, Event::Open));

    ws.send_frame(Opcode::Continuation, b"orphan", true).await;

    match next_event(&mut server).await {
        Event::Error(code, _) => assert_eq!(code, ErrorCode::ClientFrame),
        other => panic!("expected an error, got {other:?}"),
    }
    assert!(matches!(next_event(&mut server).await, Event::Close(_, _)));
    ws.expect_eof().await;
}

#[tokio::test]
async fn rejected_origin_gets_abrupt_close() {
    let mut server = start_server(None).await;
    let mut ws = WsClient::connect_raw(server.addr).await;
    ws.handshake("/", HOST, "http://evil.example").await;

    // no 101, no explanation: the connection just closes
    assert!(ws.read_handshake_response().await.is_none());
    // and no client callback ever fired
    assert!(server.events.try_recv().is_err());
}

#[tokio::test]
async fn unrouted_path_disconnects_after_upgrade() {
    let mut server = start_server(None).await;
    let mut ws = WsClient::connect_raw(server.addr).await;
    ws.handshake("/nowhere", HOST, ORIGIN).await;

    // the upgrade response is written before routing happens
    let response = ws.read_handshake_response().await.unwrap();
    assert!(response.contains("101"));
    ws.expect_eof().await;
    assert!(server.events.try_recv().is_err());
}

#[tokio::test]
async fn server_answers_ping_with_identical_pong() {
    let mut server = start_server(None).await;
    let mut ws = WsClient::connect(server.addr, "/").await;
    assert!(matches!(next_event(&mut server).await, Event::Open));

    ws.send_frame(Opcode::Ping, b"marco", true).await;
    let pong = ws.recv_frame().await.unwrap();
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(&pong.payload[..], b"marco");
}

#[tokio::test]
async fn liveness_ping_flows_and_inactive_client_is_dropped() {
    let ping = PingConfig::new(Duration::from_secs(0)).max_before_disconnect(2);
    let mut server = start_server(Some(ping)).await;
    let mut ws = WsClient::connect(server.addr, "/").await;
    assert!(matches!(next_event(&mut server).await, Event::Open));

    // answer the first two pings with matching payloads
    for _ in 0..2 {
        let ping = ws.recv_frame().await.unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        assert_eq!(&ping.payload[..], b"knock knock");
        ws.send_frame(Opcode::Pong, &ping.payload, true).await;
    }

    // the unanswered-ping budget is spent: next tick disconnects
    match next_event(&mut server).await {
        Event::Close(code, _) => assert_eq!(code, Some(ErrorCode::ClientInactive)),
        other => panic!("expected a close, got {other:?}"),
    }
    ws.expect_eof().await;
}

#[tokio::test]
async fn mismatched_pong_disconnects() {
    let ping = PingConfig::new(Duration::from_secs(0));
    let mut server = start_server(Some(ping)).await;
    let mut ws = WsClient::connect(server.addr, "/").await;
    assert!(matches!(next_event(&mut server).await, Event::Open));

    let ping = ws.recv_frame().await.unwrap();
    assert_eq!(ping.opcode, Opcode::Ping);
    ws.send_frame(Opcode::Pong, b"wrong payload", true).await;

    match next_event(&mut server).await {
        Event::Error(code, _) => assert_eq!(code, ErrorCode::ClientFrame),
        other => panic!("expected an error, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut server).await,
        Event::Close(Some(ErrorCode::ClientFrame), _)
    ));
    ws.expect_eof().await;
}

#[tokio::test]
async fn second_ping_while_outstanding_is_refused_and_disconnects() {
    let mut server = start_server(None).await;
    let mut ws = WsClient::connect(server.addr, "/").await;
    assert!(matches!(next_event(&mut server).await, Event::Open));

    let id = server.core.service("the_only_service").unwrap().client_ids()[0];
    let handle = server.core.connection(&id).unwrap();

    // first ping goes out fine
    handle.send_ping(b"are you there").unwrap();
    let ping = ws.recv_frame().await.unwrap();
    assert_eq!(ping.opcode, Opcode::Ping);

    // a second ping while one is outstanding is a strict violation:
    // refused, and the connection is torn down
    assert!(handle.send_ping(b"again").is_err());
    assert!(matches!(next_event(&mut server).await, Event::Close(_, _)));
    ws.expect_eof().await;
}

#[tokio::test]
async fn large_outbound_message_fragments_on_the_wire() {
    let mut server = start_server(None).await;
    let mut ws = WsClient::connect(server.addr, "/").await;
    assert!(matches!(next_event(&mut server).await, Event::Open));

    // push a 70 KB message back through the service send path
    let service = server.core.service("the_only_service").unwrap();
    let big = "x".repeat(70_000);
    let ids: Vec<String> = service.client_ids().iter().map(|i| i.to_string()).collect();
    let report = service.send_to(&ids, &big);
    assert!(report.all_sent());

    // reassemble: first frame Text without FIN, continuations after
    let first = ws.recv_frame().await.unwrap();
    assert_eq!(first.opcode, Opcode::Text);
    assert!(!first.fin);
    let mut payload = first.payload.to_vec();
    loop {
        let frame = ws.recv_frame().await.unwrap();
        assert_eq!(frame.opcode, Opcode::Continuation);
        payload.extend_from_slice(&frame.payload);
        if frame.fin {
            break;
        }
    }
    assert_eq!(payload.len(), 70_000);
}

#[tokio::test]
async fn send_report_flags_unknown_recipients() {
    let mut server = start_server(None).await;
    let mut ws = WsClient::connect(server.addr, "/").await;
    assert!(matches!(next_event(&mut server).await, Event::Open));

    let known: Vec<String> = server
        .core
        .service("the_only_service")
        .unwrap()
        .client_ids()
        .iter()
        .map(|i| i.to_string())
        .collect();

    let mut recipients = known.clone();
    recipients.push("not-a-client".to_string());

    let report = server.core.send_to(&recipients, "admin says hi");
    assert_eq!(report.sent.len(), 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(
        report.errors["not-a-client"].code,
        ErrorCode::UnknownClient.as_u16()
    );

    let frame = ws.recv_frame().await.unwrap();
    assert_eq!(frame.opcode, Opcode::Text);
    assert_eq!(&frame.payload[..], b"admin says hi");
}
