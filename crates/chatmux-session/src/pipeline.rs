//! Per-handle ordered event pipeline.
//!
//! Every event a handle publishes goes through one task, in the order the
//! handle produced it. Attachment downloads and writes happen in that task
//! too: the handle stays responsive to `close` and adapter events while a
//! download is in flight, and observers still see events in order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chatmux_protocol::{AttachmentRef, SessionEvent, SessionId};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::{
    AttachmentSink, ClientAdapter, EventBroadcaster, InboundMessage, SessionError,
    attachment_file_name,
};

/// Format of [`SessionEvent::Message`] timestamps.
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Renders `at` in `tz` as `DD-MM-YYYY HH:MM:SS`.
pub fn local_timestamp(at: DateTime<Utc>, tz: chrono_tz::Tz) -> String {
    at.with_timezone(&tz).format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) enum PipelineItem {
    /// Emitted as is.
    Lifecycle(SessionEvent),
    /// Filtered, attachment fetched, then emitted as a message event.
    Inbound {
        message: InboundMessage,
        adapter: Arc<dyn ClientAdapter>,
    },
}

pub(crate) type PipelineSender = mpsc::UnboundedSender<PipelineItem>;

pub(crate) struct EventPipeline {
    pub(crate) session_id: SessionId,
    pub(crate) broadcaster: EventBroadcaster,
    pub(crate) sink: Arc<dyn AttachmentSink>,
    pub(crate) timezone: chrono_tz::Tz,
    /// Set by the handle once it is terminated.
    pub(crate) terminated: Arc<AtomicBool>,
}

impl EventPipeline {
    pub(crate) async fn run(self, mut items: mpsc::UnboundedReceiver<PipelineItem>) {
        while let Some(item) = items.recv().await {
            match item {
                PipelineItem::Lifecycle(event) => {
                    self.broadcaster.emit(event);
                }
                PipelineItem::Inbound { message, adapter } => {
                    if let Some(event) = self.process_inbound(message, adapter.as_ref()).await {
                        self.broadcaster.emit(event);
                    }
                }
            }
        }
        tracing::debug!(session_id = %self.session_id, "event pipeline drained");
    }

    async fn process_inbound(
        &self,
        message: InboundMessage,
        adapter: &dyn ClientAdapter,
    ) -> Option<SessionEvent> {
        if message.is_status_broadcast() {
            return None;
        }

        let timestamp = local_timestamp(Utc::now(), self.timezone);

        let attachment = if message.has_attachment {
            match self.persist_attachment(&message, adapter).await {
                Ok(attachment) => Some(attachment),
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        message_id = %message.id,
                        error = %e,
                        "skipping inbound attachment"
                    );
                    return None;
                }
            }
        } else {
            None
        };

        Some(SessionEvent::Message {
            session_id: self.session_id.clone(),
            from: message.from,
            body: message.body,
            attachment,
            timestamp,
        })
    }

    async fn persist_attachment(
        &self,
        message: &InboundMessage,
        adapter: &dyn ClientAdapter,
    ) -> Result<AttachmentRef, SessionError> {
        let payload = adapter
            .download_attachment(message)
            .await
            .map_err(|e| SessionError::AttachmentFetchFailed(e.to_string()))?
            .filter(|payload| !payload.data.is_empty())
            .ok_or_else(|| SessionError::AttachmentFetchFailed("no media returned".into()))?;

        if self.terminated.load(Ordering::Acquire) {
            return Err(SessionError::Unavailable(self.session_id.clone()));
        }

        let file_name = attachment_file_name(Utc::now().timestamp_millis(), &payload.mime_type);
        let stored = self
            .sink
            .store(&self.session_id, &file_name, &payload.data)
            .await?;

        tracing::info!(
            session_id = %self.session_id,
            path = %stored.path,
            mime_type = %payload.mime_type,
            "attachment stored"
        );
        Ok(AttachmentRef {
            path: stored.path,
            file_name: stored.file_name,
            mime_type: payload.mime_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_local_timestamp_uses_configured_zone() {
        // Hermosillo is UTC-7 all year.
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 3, 4, 5).unwrap();
        assert_eq!(
            local_timestamp(at, chrono_tz::America::Hermosillo),
            "04-01-2024 20:04:05"
        );
        assert_eq!(local_timestamp(at, chrono_tz::UTC), "05-01-2024 03:04:05");
    }
}
