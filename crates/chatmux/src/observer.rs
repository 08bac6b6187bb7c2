//! Per-connection observer handler.
//!
//! Each accepted observer connection gets its own Tokio task running this
//! handler. The flow is:
//!   1. Subscribe to the registry's broadcaster (every session by default)
//!   2. Loop: forward matching events, and apply `Subscribe` /
//!      `SubscribeAll` commands sent by the observer
//!
//! A slow observer that falls behind the broadcast buffer skips the events
//! it missed; it never stalls sessions or other observers.

use std::collections::HashSet;
use std::sync::Arc;

use chatmux_protocol::{Codec, JsonCodec, ObserverCommand, SessionEvent, SessionId};
use chatmux_session::SessionRegistry;
use chatmux_transport::{Connection, WebSocketConnection};
use tokio::sync::broadcast::error::RecvError;

use crate::ChatmuxError;

/// Which sessions an observer wants to hear about. `None` means all.
#[derive(Debug, Default)]
struct Filter(Option<HashSet<SessionId>>);

impl Filter {
    fn matches(&self, event: &SessionEvent) -> bool {
        match &self.0 {
            Some(ids) => ids.contains(event.session_id()),
            None => true,
        }
    }

    fn apply(&mut self, command: ObserverCommand) {
        self.0 = match command {
            ObserverCommand::Subscribe { session_ids } => Some(session_ids.into_iter().collect()),
            ObserverCommand::SubscribeAll => None,
        };
    }
}

/// Handles a single observer connection from accept to close.
pub(crate) async fn handle_observer(
    conn: WebSocketConnection,
    registry: Arc<SessionRegistry>,
) -> Result<(), ChatmuxError> {
    let conn_id = conn.id();
    let peer = conn.peer_addr();
    let mut events = registry.subscribe();
    let mut filter = Filter::default();
    let codec = JsonCodec;

    tracing::info!(%conn_id, %peer, "observer connected");

    loop {
        tokio::select! {
            incoming = conn.recv() => match incoming {
                Ok(Some(data)) => match codec.decode::<ObserverCommand>(&data) {
                    Ok(command) => {
                        tracing::debug!(%conn_id, ?command, "observer command");
                        filter.apply(command);
                    }
                    Err(e) => {
                        tracing::debug!(%conn_id, error = %e, "ignoring malformed observer command");
                    }
                },
                Ok(None) => {
                    tracing::info!(%conn_id, "observer disconnected");
                    break;
                }
                Err(e) => {
                    tracing::debug!(%conn_id, error = %e, "observer recv error");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if !filter.matches(&event) {
                        continue;
                    }
                    let frame = codec.encode(&event)?;
                    conn.send(&frame).await?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(%conn_id, skipped, "observer lagged, events dropped");
                }
                Err(RecvError::Closed) => {
                    let _ = conn.close().await;
                    break;
                }
            },
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: &str) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    fn ready(raw: &str) -> SessionEvent {
        SessionEvent::Ready {
            session_id: sid(raw),
        }
    }

    #[test]
    fn test_filter_default_matches_everything() {
        let filter = Filter::default();
        assert!(filter.matches(&ready("alice")));
        assert!(filter.matches(&ready("bob")));
    }

    #[test]
    fn test_filter_subscribe_narrows_then_subscribe_all_widens() {
        let mut filter = Filter::default();
        filter.apply(ObserverCommand::Subscribe {
            session_ids: vec![sid("alice")],
        });
        assert!(filter.matches(&ready("alice")));
        assert!(!filter.matches(&ready("bob")));

        filter.apply(ObserverCommand::SubscribeAll);
        assert!(filter.matches(&ready("bob")));
    }

    #[test]
    fn test_filter_empty_subscribe_matches_nothing() {
        let mut filter = Filter::default();
        filter.apply(ObserverCommand::Subscribe {
            session_ids: Vec::new(),
        });
        assert!(!filter.matches(&ready("alice")));
    }
}
