//! Administer a running server over its Unix control socket.
//!
//! ```text
//! cargo run --example control_client -- /tmp/iris-server.sock
//! ```

use serde_json::json;

use iris::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/iris-server.sock".to_string());

    let mut control = ControlClient::connect_unix(&path).await?;
    println!(
        "connected, server version {}",
        control.server_version().unwrap_or("unknown")
    );

    let authed = control
        .auth(json!({ "id": "admin", "secret": "password" }))
        .await?;
    anyhow::ensure!(authed, "authentication refused");

    let service = control.select_service_by_path("/").await?;
    println!("selected service {service}");

    let clients = control.list_clients().await?;
    println!("{} connected client(s)", clients.len());
    for (id, info) in &clients {
        println!("  {id}: {info}");
    }

    if let Some(first) = clients.keys().next() {
        let report = control
            .send_message_to("hello from the control channel", first)
            .await?;
        println!("send report: {report}");
    }

    Ok(())
}
