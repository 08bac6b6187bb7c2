//! An in-process protocol client.
//!
//! [`LoopbackFactory`] builds adapters that talk to nothing: the challenge
//! is "scanned" by calling [`LoopbackAdapter::scan`] (or automatically,
//! after a delay), inbound traffic is injected with
//! [`LoopbackAdapter::receive`], and outbound sends are recorded. It backs
//! the integration tests and the `loopback-bridge` demo.
//!
//! A scan saves a pairing artifact; an adapter that finds one on
//! `initialize` goes straight to `Ready`, like a real client resuming a
//! paired device.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatmux_protocol::{ChatId, SessionId};
use tokio::sync::Mutex;

use crate::{
    AdapterError, AdapterEvent, AdapterEvents, AdapterFactory, ArtifactScope, AttachmentPayload,
    ClientAdapter, InboundMessage,
};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Knobs shared by every adapter a factory builds.
#[derive(Debug, Default)]
struct Behavior {
    /// Factory calls that fail before one succeeds again.
    failing_creates: AtomicU32,
    fail_initialize: AtomicBool,
    fail_destroy: AtomicBool,
    /// Echo every outbound message back as an inbound one.
    echo: AtomicBool,
    /// Scan the challenge on the user's behalf after this many ms (0 = off).
    auto_scan_ms: AtomicU64,
    destroy_delay_ms: AtomicU64,
    download_delay_ms: AtomicU64,
}

/// Builds [`LoopbackAdapter`]s and keeps every one it built.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    behavior: Arc<Behavior>,
    built: Arc<Mutex<HashMap<SessionId, Vec<Arc<LoopbackAdapter>>>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans every challenge automatically after `delay`.
    pub fn with_auto_scan(self, delay: Duration) -> Self {
        self.behavior.auto_scan_ms.store(millis(delay).max(1), Ordering::Relaxed);
        self
    }

    /// Echoes outbound messages back as inbound ones.
    pub fn with_echo(self) -> Self {
        self.behavior.echo.store(true, Ordering::Relaxed);
        self
    }

    /// Makes the next `n` factory calls fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.behavior.failing_creates.store(n, Ordering::Relaxed);
    }

    /// Makes `initialize` fail on adapters built from now on.
    pub fn fail_initialize(&self, fail: bool) {
        self.behavior.fail_initialize.store(fail, Ordering::Relaxed);
    }

    /// Makes `destroy` fail on every adapter.
    pub fn fail_destroy(&self, fail: bool) {
        self.behavior.fail_destroy.store(fail, Ordering::Relaxed);
    }

    /// Makes `destroy` take `delay` before it returns.
    pub fn delay_destroy(&self, delay: Duration) {
        self.behavior.destroy_delay_ms.store(millis(delay), Ordering::Relaxed);
    }

    /// Makes attachment downloads take `delay` before they return.
    pub fn delay_downloads(&self, delay: Duration) {
        self.behavior.download_delay_ms.store(millis(delay), Ordering::Relaxed);
    }

    /// How many adapters were built for `session_id`.
    pub async fn construction_count(&self, session_id: &SessionId) -> usize {
        self.built.lock().await.get(session_id).map_or(0, Vec::len)
    }

    /// The most recently built adapter for `session_id`.
    pub async fn latest(&self, session_id: &SessionId) -> Option<Arc<LoopbackAdapter>> {
        self.built
            .lock()
            .await
            .get(session_id)
            .and_then(|adapters| adapters.last().cloned())
    }

    /// Every adapter built for `session_id`, oldest first.
    pub async fn all(&self, session_id: &SessionId) -> Vec<Arc<LoopbackAdapter>> {
        self.built
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl AdapterFactory for LoopbackFactory {
    async fn create(
        &self,
        session_id: &SessionId,
        artifacts: ArtifactScope,
        events: AdapterEvents,
    ) -> Result<Arc<dyn ClientAdapter>, AdapterError> {
        let failing = self
            .behavior
            .failing_creates
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(AdapterError::Initialize("loopback construction refused".into()));
        }

        let adapter = Arc::new(LoopbackAdapter {
            session_id: session_id.clone(),
            events,
            artifacts,
            behavior: Arc::clone(&self.behavior),
            fail_initialize: self.behavior.fail_initialize.load(Ordering::Relaxed),
            sent: Mutex::new(Vec::new()),
            media: Mutex::new(HashMap::new()),
            released: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });
        self.built
            .lock()
            .await
            .entry(session_id.clone())
            .or_default()
            .push(Arc::clone(&adapter));
        Ok(adapter)
    }
}

// ---------------------------------------------------------------------------
// LoopbackAdapter
// ---------------------------------------------------------------------------

/// One simulated client connection.
pub struct LoopbackAdapter {
    session_id: SessionId,
    events: AdapterEvents,
    artifacts: ArtifactScope,
    behavior: Arc<Behavior>,
    fail_initialize: bool,
    sent: Mutex<Vec<(ChatId, String)>>,
    /// Attachment payloads by message id. `None` simulates a message whose
    /// media could not be downloaded.
    media: Mutex<HashMap<String, Option<AttachmentPayload>>>,
    released: AtomicBool,
    destroyed: AtomicBool,
}

impl LoopbackAdapter {
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Completes the challenge: saves a pairing artifact and reports
    /// `Ready`.
    pub async fn scan(&self) -> Result<(), AdapterError> {
        self.artifacts
            .save(format!("paired:{}", self.session_id).as_bytes())
            .await
            .map_err(|e| AdapterError::Initialize(e.to_string()))?;
        self.events.emit(AdapterEvent::Ready);
        Ok(())
    }

    /// Re-issues the challenge.
    pub fn challenge(&self, qr: impl Into<String>) {
        self.events.emit(AdapterEvent::Challenge(qr.into()));
    }

    /// Injects an inbound text message.
    pub fn receive(&self, from: &str, body: &str) {
        self.events.emit(AdapterEvent::Message(InboundMessage {
            id: next_message_id(),
            from: from.to_owned(),
            body: body.to_owned(),
            has_attachment: false,
        }));
    }

    /// Injects an inbound media message. `payload: None` makes the
    /// download come back empty.
    pub async fn receive_media(&self, from: &str, caption: &str, payload: Option<AttachmentPayload>) {
        let id = next_message_id();
        self.media.lock().await.insert(id.clone(), payload);
        self.events.emit(AdapterEvent::Message(InboundMessage {
            id,
            from: from.to_owned(),
            body: caption.to_owned(),
            has_attachment: true,
        }));
    }

    /// Reports a dropped connection.
    pub fn disconnect(&self, reason: &str) {
        self.events.emit(AdapterEvent::Disconnected(reason.to_owned()));
    }

    /// Every message sent through this adapter.
    pub async fn sent(&self) -> Vec<(ChatId, String)> {
        self.sent.lock().await.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ClientAdapter for LoopbackAdapter {
    async fn initialize(&self) -> Result<(), AdapterError> {
        if self.fail_initialize {
            return Err(AdapterError::Initialize("loopback initialization refused".into()));
        }

        let paired = self
            .artifacts
            .load()
            .await
            .map_err(|e| AdapterError::Initialize(e.to_string()))?
            .is_some();
        if paired {
            tracing::debug!(session_id = %self.session_id, "resuming from saved artifact");
            self.events.emit(AdapterEvent::Ready);
            return Ok(());
        }

        self.challenge(format!("loopback:{}:{}", self.session_id, self.generation()));

        let auto_scan_ms = self.behavior.auto_scan_ms.load(Ordering::Relaxed);
        if auto_scan_ms > 0 {
            tokio::time::sleep(Duration::from_millis(auto_scan_ms)).await;
            if !self.is_destroyed() {
                self.scan().await?;
            }
        }
        Ok(())
    }

    async fn send_message(&self, chat: &ChatId, body: &str) -> Result<(), AdapterError> {
        if self.is_destroyed() {
            return Err(AdapterError::Send("client destroyed".into()));
        }
        self.sent.lock().await.push((chat.clone(), body.to_owned()));
        if self.behavior.echo.load(Ordering::Relaxed) {
            self.receive(chat.as_str(), body);
        }
        Ok(())
    }

    async fn download_attachment(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<AttachmentPayload>, AdapterError> {
        pause(&self.behavior.download_delay_ms).await;
        match self.media.lock().await.remove(&message.id) {
            Some(payload) => Ok(payload),
            None => Err(AdapterError::Download(format!("unknown message {}", message.id))),
        }
    }

    async fn release_resources(&self) -> Result<(), AdapterError> {
        self.released.store(true, Ordering::Release);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), AdapterError> {
        self.destroyed.store(true, Ordering::Release);
        pause(&self.behavior.destroy_delay_ms).await;
        if self.behavior.fail_destroy.load(Ordering::Relaxed) {
            return Err(AdapterError::Shutdown("loopback destroy refused".into()));
        }
        Ok(())
    }
}

fn next_message_id() -> String {
    format!("loopback-{}", NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

async fn pause(delay_ms: &AtomicU64) {
    let ms = delay_ms.load(Ordering::Relaxed);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
