//! The session registry: tracks every session handle by id.
//!
//! This is the entry point for session operations from higher layers
//! (the HTTP control plane, the observer channel).
//!
//! # Concurrency
//!
//! The map sits behind a `tokio::sync::Mutex` that is only held for map
//! operations, never while talking to a handle. Handles run their own
//! actors, so one session's slow adapter never stalls another session.
//!
//! ```text
//! create() ──→ [live handle] ──→ close() ──→ [removed]
//!                    │
//!                    └─ reconnect ceiling ──→ [Terminated] ──→ create() replaces it
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chatmux_protocol::{ChatId, SessionEvent, SessionId};
use futures_util::future::join_all;
use tokio::sync::{Mutex, broadcast};

use crate::handle::HandleDeps;
use crate::{
    AdapterFactory, AttachmentSink, AuthArtifactStore, EventBroadcaster, FsArtifactStore,
    FsAttachmentSink, SessionConfig, SessionError, SessionHandle, SessionStatus, TokenIssuer,
};

/// Default directory for [`FsArtifactStore`] when none is configured.
pub const DEFAULT_SESSIONS_DIR: &str = "sessions";

/// Default directory for [`FsAttachmentSink`] when none is configured.
pub const DEFAULT_ATTACHMENTS_DIR: &str = "public/attachments";

/// A registry entry as listed by [`SessionRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

/// Manages all sessions of the process.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    deps: HandleDeps,
}

impl SessionRegistry {
    /// Starts building a registry around an adapter factory and a token
    /// issuer.
    pub fn builder(
        factory: Arc<dyn AdapterFactory>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> SessionRegistryBuilder {
        SessionRegistryBuilder {
            factory,
            tokens,
            artifacts: None,
            sink: None,
            config: SessionConfig::default(),
        }
    }

    /// Spawns a handle for `session_id`.
    ///
    /// An entry whose handle terminated itself (reconnect ceiling reached)
    /// is replaced.
    ///
    /// # Errors
    /// [`SessionError::AlreadyExists`] if a live handle is registered.
    pub async fn create(&self, session_id: SessionId) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&session_id) {
            if existing.is_live() {
                return Err(SessionError::AlreadyExists(session_id));
            }
            tracing::info!(%session_id, "replacing terminated session");
        }

        let handle = SessionHandle::spawn(session_id.clone(), self.deps.clone());
        sessions.insert(session_id.clone(), handle.clone());
        tracing::info!(%session_id, total = sessions.len(), "session created");
        Ok(handle)
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Removes the entry without closing it. Idempotent.
    ///
    /// The returned handle keeps the session running; dropping it (and
    /// every other clone) shuts the adapter down.
    pub async fn remove(&self, session_id: &SessionId) -> Option<SessionHandle> {
        let removed = self.sessions.lock().await.remove(session_id);
        if removed.is_some() {
            tracing::info!(%session_id, "session removed");
        }
        removed
    }

    /// Terminates the session and removes its entry.
    ///
    /// The entry is removed even when the adapter's shutdown fails; the
    /// failure is still returned.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`] if no entry exists
    /// - [`SessionError::TerminationFailed`] if the adapter's shutdown failed
    pub async fn close(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let handle = self
            .get(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        // The entry stays while the adapter shuts down so a concurrent
        // create for the same id is refused.
        let outcome = handle.close().await;

        let mut sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some(current) if current.incarnation() == handle.incarnation() => {
                sessions.remove(session_id);
            }
            _ => {
                tracing::debug!(%session_id, "entry already replaced after close");
            }
        }
        drop(sessions);

        match &outcome {
            Ok(()) => tracing::info!(%session_id, "session closed"),
            Err(e) => tracing::error!(%session_id, error = %e, "session closed with errors"),
        }
        outcome
    }

    /// Maps a bearer token to its live handle.
    ///
    /// # Errors
    /// - [`SessionError::AuthInvalid`] / [`SessionError::AuthExpired`] from
    ///   verification
    /// - [`SessionError::NotFound`] if the token's handle is closed,
    ///   terminated or replaced
    pub async fn resolve_token(&self, token: &str) -> Result<SessionHandle, SessionError> {
        let now = chrono::Utc::now().timestamp();
        let claims = self.deps.tokens.verify(token, now)?;
        match self.get(&claims.session_id).await {
            Some(handle) if handle.incarnation() == claims.incarnation && handle.is_live() => {
                Ok(handle)
            }
            _ => Err(SessionError::NotFound(claims.session_id)),
        }
    }

    /// Resolves `token` and sends `body` to `chat` through its session.
    /// Returns the session the message went out on.
    pub async fn send_message(
        &self,
        token: &str,
        chat: ChatId,
        body: impl Into<String>,
    ) -> Result<SessionId, SessionError> {
        let handle = self.resolve_token(token).await?;
        handle.send(chat, body).await?;
        Ok(handle.session_id().clone())
    }

    /// Deletes the persisted artifacts of a session that is not live.
    ///
    /// # Errors
    /// [`SessionError::SessionLive`] while a live handle is registered.
    pub async fn purge_artifacts(&self, session_id: &SessionId) -> Result<(), SessionError> {
        if self.get(session_id).await.is_some_and(|h| h.is_live()) {
            return Err(SessionError::SessionLive(session_id.clone()));
        }
        self.deps.artifacts.delete(session_id).await?;
        tracing::info!(%session_id, "auth artifacts purged");
        Ok(())
    }

    /// Every registered session with its current status, sorted by id.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|handle| SessionSummary {
                session_id: handle.session_id().clone(),
                status: handle.status(),
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Subscribes to events of every session.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.deps.broadcaster.subscribe()
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.deps.broadcaster
    }

    pub fn config(&self) -> &SessionConfig {
        &self.deps.config
    }

    /// Closes every session concurrently and empties the registry.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.lock().await.drain().map(|(_, h)| h).collect();
        tracing::info!(count = handles.len(), "closing all sessions");

        let results = join_all(handles.iter().map(|handle| handle.close())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(session_id = %handle.session_id(), error = %e, "session shutdown failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SessionRegistryBuilder
// ---------------------------------------------------------------------------

/// Configures a [`SessionRegistry`]. Storage defaults to the filesystem
/// under [`DEFAULT_SESSIONS_DIR`] and [`DEFAULT_ATTACHMENTS_DIR`].
pub struct SessionRegistryBuilder {
    factory: Arc<dyn AdapterFactory>,
    tokens: Arc<dyn TokenIssuer>,
    artifacts: Option<Arc<dyn AuthArtifactStore>>,
    sink: Option<Arc<dyn AttachmentSink>>,
    config: SessionConfig,
}

impl SessionRegistryBuilder {
    pub fn artifacts(mut self, store: Arc<dyn AuthArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn attachments(mut self, sink: Arc<dyn AttachmentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SessionRegistry {
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(FsArtifactStore::new(PathBuf::from(DEFAULT_SESSIONS_DIR))));
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(FsAttachmentSink::new(PathBuf::from(DEFAULT_ATTACHMENTS_DIR))));
        let broadcaster = EventBroadcaster::new(self.config.event_capacity);

        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            deps: HandleDeps {
                factory: self.factory,
                artifacts,
                sink,
                tokens: self.tokens,
                broadcaster,
                config: Arc::new(self.config),
            },
        }
    }
}
