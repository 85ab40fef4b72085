//! A server with one service, liveness pings and a Unix control
//! interface.
//!
//! Run it, point a browser-side WebSocket at `ws://localhost:9100/`,
//! then administer it through the control socket:
//!
//! ```text
//! cargo run --example advanced_server
//! cargo run --example control_client -- /tmp/iris-server.sock
//! ```

use std::time::Duration;

use iris::prelude::*;
use iris_proto::opcode::Opcode;
use serde_json::json;

struct ChatClient {
    messages_seen: u64,
}

impl Client for ChatClient {
    fn on_open(&mut self, ctx: &ClientContext) -> bool {
        tracing::info!(connection_id = %ctx.id(), "chat client joined");
        true
    }

    fn on_message(&mut self, ctx: &ClientContext, opcode: Opcode, payload: &[u8]) {
        if opcode != Opcode::Text {
            return;
        }
        self.messages_seen += 1;
        let text = String::from_utf8_lossy(payload);
        let _ = ctx.send_text(&format!("echo: {text}"));
    }

    fn on_close(&mut self, ctx: &ClientContext, code: Option<ErrorCode>, _reason: &str) {
        tracing::info!(connection_id = %ctx.id(), code = ?code, "chat client left");
    }

    fn info(&self) -> Option<serde_json::Value> {
        Some(json!({ "messages_seen": self.messages_seen }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    iris_server::init_logging(&LogConfig::development()).ok();

    let mut router = Router::new();
    router.add_rule(
        Rule::builder()
            .source("^/$")
            .destination("service", "chat")
            .build()?,
    );

    let service = Service::new("chat", |_ctx| {
        Box::new(ChatClient { messages_seen: 0 }) as Box<dyn Client>
    })
    .ping(
        PingConfig::new(Duration::from_secs(300))
            .max_before_disconnect(3),
    );

    let control = UnixControlInterface::new("/tmp/iris-server.sock", SimpleAuthenticator::new())
        .file_mode(0o770);

    let server = Server::builder()
        .config(
            ServerConfig::new()
                .addr("0.0.0.0:9100")
                .allow_host("localhost:9100")
                .allow_origin("http://localhost"),
        )
        .router(router)
        .service(service)
        .control(control)
        .build()?;

    let bound = server.bind().await?;
    let shutdown = bound.shutdown_handle();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.shutdown();
    });

    bound.run().await?;
    Ok(())
}
