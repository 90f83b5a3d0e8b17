//! Signaling-Relay für Pulse Calls
//!
//! `RELAY_ADDR` setzt die Listen-Adresse (Standard `0.0.0.0:8787`).

use anyhow::Context;
use call_core::RelayServer;

const DEFAULT_RELAY_ADDR: &str = "0.0.0.0:8787";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    call_core::init_tracing();

    let addr = std::env::var("RELAY_ADDR").unwrap_or_else(|_| DEFAULT_RELAY_ADDR.to_string());
    let server = RelayServer::bind(addr.as_str())
        .await
        .with_context(|| format!("failed to bind relay to {}", addr))?;

    tokio::select! {
        _ = server.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            tracing::info!("Relay shutting down");
        }
    }

    Ok(())
}
