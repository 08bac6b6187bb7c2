//! A chatmux server backed by the loopback adapter.
//!
//! Every challenge is "scanned" three seconds after it is issued and every
//! outbound message is echoed back as an inbound one, so the whole
//! lifecycle can be driven with curl and a WebSocket client:
//!
//! ```text
//! curl -XPOST localhost:3000/create-session -H 'content-type: application/json' \
//!      -d '{"sessionId":"ventas"}'
//! websocat ws://localhost:3001
//! ```

use std::sync::Arc;
use std::time::Duration;

use chatmux::prelude::*;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), ChatmuxError> {
    init_tracing("info,chatmux_session=debug");

    let config = ServerConfig::from_env()?;
    let factory = LoopbackFactory::new()
        .with_auto_scan(Duration::from_secs(3))
        .with_echo();

    let server = ChatmuxServer::builder()
        .config(config)
        .adapter_factory(Arc::new(factory))
        .build()
        .await?;

    // Log the event feed the way an observer would see it.
    let mut events = server.registry().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::info!(session_id = %event.session_id(), topic = event.topic(), "event");
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!(
        http = %server.http_addr()?,
        events = %server.events_addr()?,
        "loopback bridge listening"
    );
    server.run().await
}
