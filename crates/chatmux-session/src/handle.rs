//! Session handle actor: an isolated Tokio task that owns one adapter.
//!
//! Each session runs in its own task. The outside world talks to it
//! through a [`SessionHandle`] (a command channel plus a `watch` of its
//! current state); the adapter talks to it through [`AdapterEvents`].
//! Only the actor mutates session state.
//!
//! ```text
//!  SessionHandle ──commands──┐
//!                            ▼
//!  adapter ──AdapterEvents──► SessionActor ──PipelineItem──► EventPipeline ──► observers
//!                            │
//!                            └──watch──► SessionHandle::status / access_token
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chatmux_protocol::{ChatId, SessionEvent, SessionId};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::pipeline::{EventPipeline, PipelineItem, PipelineSender};
use crate::{
    AccessToken, AdapterEvent, AdapterEvents, AdapterFactory, ArtifactScope, AttachmentSink,
    AuthArtifactStore, ClientAdapter, EventBroadcaster, SessionConfig, SessionError,
    SessionStatus, TokenClaims, TokenIssuer, TokenRefresh,
};

/// Commands sent to a session actor through its channel.
pub(crate) enum HandleCommand {
    /// Deliver an outbound text message.
    Send {
        chat: ChatId,
        body: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Shut the adapter down and terminate.
    Close {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// A point-in-time view of a handle's state.
#[derive(Debug, Clone)]
pub struct HandleSnapshot {
    pub status: SessionStatus,
    pub access_token: Option<AccessToken>,
    /// Consecutive reconnect attempts since the last `Ready`.
    pub reconnect_attempts: u32,
    /// Generation of the current adapter.
    pub generation: u64,
}

/// Collaborators every handle shares with its registry.
#[derive(Clone)]
pub(crate) struct HandleDeps {
    pub(crate) factory: Arc<dyn AdapterFactory>,
    pub(crate) artifacts: Arc<dyn AuthArtifactStore>,
    pub(crate) sink: Arc<dyn AttachmentSink>,
    pub(crate) tokens: Arc<dyn TokenIssuer>,
    pub(crate) broadcaster: EventBroadcaster,
    pub(crate) config: Arc<SessionConfig>,
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Handle to a running session actor.
///
/// Cheap to clone. Dropping every clone without calling [`close`] makes the
/// actor shut its adapter down on its own.
///
/// [`close`]: SessionHandle::close
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    incarnation: u64,
    commands: mpsc::Sender<HandleCommand>,
    state: watch::Receiver<HandleSnapshot>,
}

impl SessionHandle {
    /// Spawns the actor and its event pipeline.
    pub(crate) fn spawn(session_id: SessionId, deps: HandleDeps) -> Self {
        let incarnation = rand::rng().random::<u64>();
        let (command_tx, command_rx) = mpsc::channel(deps.config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(HandleSnapshot {
            status: SessionStatus::Initializing,
            access_token: None,
            reconnect_attempts: 0,
            generation: 0,
        });
        let terminated = Arc::new(AtomicBool::new(false));

        let pipeline = EventPipeline {
            session_id: session_id.clone(),
            broadcaster: deps.broadcaster.clone(),
            sink: Arc::clone(&deps.sink),
            timezone: deps.config.timezone,
            terminated: Arc::clone(&terminated),
        };
        tokio::spawn(pipeline.run(pipeline_rx));

        let actor = SessionActor {
            session_id: session_id.clone(),
            incarnation,
            deps,
            status: SessionStatus::Initializing,
            adapter: None,
            generation: 0,
            token: None,
            attempts: 0,
            reconnect_at: None,
            commands: command_rx,
            event_tx,
            events: event_rx,
            pipeline: pipeline_tx,
            state: state_tx,
            terminated,
        };
        tokio::spawn(actor.run());

        Self {
            session_id,
            incarnation,
            commands: command_tx,
            state: state_rx,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Random value identifying this handle among every handle ever
    /// created for the same session id.
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    /// Returns `true` until the handle is terminated.
    pub fn is_live(&self) -> bool {
        self.status().is_live()
    }

    /// The most recently minted token, if the session has been `Ready`.
    pub fn access_token(&self) -> Option<AccessToken> {
        self.state.borrow().access_token.clone()
    }

    pub fn snapshot(&self) -> HandleSnapshot {
        self.state.borrow().clone()
    }

    /// Waits until the handle's state satisfies `predicate` and returns
    /// that state.
    ///
    /// # Errors
    /// [`SessionError::Unavailable`] if the actor stops first without ever
    /// satisfying it.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&HandleSnapshot) -> bool,
    ) -> Result<HandleSnapshot, SessionError> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| SessionError::Unavailable(self.session_id.clone()))?;
        Ok(snapshot.clone())
    }

    /// Sends a text message through the adapter.
    ///
    /// # Errors
    /// - [`SessionError::NotReady`] unless the status is `Ready`
    /// - [`SessionError::SendFailed`] if the adapter rejects the message
    pub async fn send(&self, chat: ChatId, body: impl Into<String>) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(HandleCommand::Send {
                chat,
                body: body.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.gone())?;
        reply_rx.await.map_err(|_| self.gone())?
    }

    /// Shuts the adapter down and terminates the handle.
    ///
    /// Closing a handle that already terminated itself succeeds.
    ///
    /// # Errors
    /// [`SessionError::TerminationFailed`] if the adapter's shutdown
    /// reported an error. The handle is terminated either way.
    pub async fn close(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(HandleCommand::Close { reply: reply_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    fn gone(&self) -> SessionError {
        match self.status() {
            SessionStatus::Terminated => SessionError::NotReady {
                session_id: self.session_id.clone(),
                status: SessionStatus::Terminated,
            },
            _ => SessionError::Unavailable(self.session_id.clone()),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SessionActor
// ---------------------------------------------------------------------------

/// What woke the actor loop.
enum Wake {
    Command(Option<HandleCommand>),
    Adapter(u64, AdapterEvent),
    Reconnect,
}

/// The internal handle state. Runs inside a Tokio task.
struct SessionActor {
    session_id: SessionId,
    incarnation: u64,
    deps: HandleDeps,
    status: SessionStatus,
    adapter: Option<Arc<dyn ClientAdapter>>,
    generation: u64,
    token: Option<AccessToken>,
    /// Consecutive failed connects since the last `Ready`.
    attempts: u32,
    reconnect_at: Option<Instant>,
    commands: mpsc::Receiver<HandleCommand>,
    event_tx: mpsc::UnboundedSender<(u64, AdapterEvent)>,
    events: mpsc::UnboundedReceiver<(u64, AdapterEvent)>,
    pipeline: PipelineSender,
    state: watch::Sender<HandleSnapshot>,
    terminated: Arc<AtomicBool>,
}

impl SessionActor {
    async fn run(mut self) {
        tracing::info!(session_id = %self.session_id, "session handle started");
        self.connect().await;

        while self.status.is_live() {
            let reconnect_at = self.reconnect_at;
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                Some((generation, event)) = self.events.recv() => Wake::Adapter(generation, event),
                () = reconnect_timer(reconnect_at) => Wake::Reconnect,
            };

            match wake {
                Wake::Command(Some(HandleCommand::Send { chat, body, reply })) => {
                    self.handle_send(chat, body, reply);
                }
                Wake::Command(Some(HandleCommand::Close { reply })) => {
                    let result = self.terminate().await;
                    let _ = reply.send(result);
                }
                Wake::Command(None) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        "all handles dropped without close, shutting adapter down"
                    );
                    if let Err(e) = self.terminate().await {
                        tracing::error!(session_id = %self.session_id, error = %e, "implicit close failed");
                    }
                }
                Wake::Adapter(generation, event) => {
                    self.handle_adapter_event(generation, event).await;
                }
                Wake::Reconnect => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
            }
        }

        tracing::info!(session_id = %self.session_id, "session handle stopped");
    }

    // -- State ------------------------------------------------------------

    fn publish(&self) {
        self.state.send_replace(HandleSnapshot {
            status: self.status,
            access_token: self.token.clone(),
            reconnect_attempts: self.attempts,
            generation: self.generation,
        });
    }

    /// Moves to `target` if the state machine allows it.
    fn transition(&mut self, target: SessionStatus) -> bool {
        if !self.status.can_transition_to(target) {
            tracing::debug!(
                session_id = %self.session_id,
                from = %self.status,
                to = %target,
                "ignoring invalid status transition"
            );
            return false;
        }
        tracing::debug!(session_id = %self.session_id, from = %self.status, to = %target, "status changed");
        self.status = target;
        if target == SessionStatus::Terminated {
            self.terminated.store(true, Ordering::Release);
        }
        self.publish();
        true
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.pipeline.send(PipelineItem::Lifecycle(event));
    }

    // -- Adapter lifecycle --------------------------------------------------

    /// Builds a new adapter generation and starts it.
    async fn connect(&mut self) {
        if self.status != SessionStatus::Initializing && !self.transition(SessionStatus::Initializing)
        {
            return;
        }
        self.generation += 1;
        self.publish();

        let events = AdapterEvents::new(self.generation, self.event_tx.clone());
        let artifacts = ArtifactScope::new(Arc::clone(&self.deps.artifacts), self.session_id.clone());

        let adapter = match self
            .deps
            .factory
            .create(&self.session_id, artifacts, events)
            .await
        {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "adapter construction failed");
                self.on_disconnected(e.to_string()).await;
                return;
            }
        };

        tracing::info!(session_id = %self.session_id, generation = self.generation, "adapter created");
        self.adapter = Some(Arc::clone(&adapter));

        let generation = self.generation;
        let events = self.event_tx.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.initialize().await {
                tracing::warn!(%session_id, generation, error = %e, "adapter initialization failed");
                let _ = events.send((generation, AdapterEvent::Disconnected(e.to_string())));
            }
        });
    }

    async fn handle_adapter_event(&mut self, generation: u64, event: AdapterEvent) {
        if generation != self.generation {
            tracing::debug!(
                session_id = %self.session_id,
                generation,
                current = self.generation,
                "ignoring event from replaced adapter"
            );
            return;
        }

        match event {
            AdapterEvent::Challenge(qr) => {
                if self.transition(SessionStatus::AwaitingChallenge) {
                    tracing::info!(session_id = %self.session_id, "challenge issued");
                    self.emit(SessionEvent::Challenge {
                        session_id: self.session_id.clone(),
                        qr,
                    });
                }
            }
            AdapterEvent::Ready => {
                if self.transition(SessionStatus::Ready) {
                    self.attempts = 0;
                    self.refresh_token();
                    self.publish();
                    tracing::info!(session_id = %self.session_id, "session ready");
                    self.emit(SessionEvent::Ready {
                        session_id: self.session_id.clone(),
                    });
                }
            }
            AdapterEvent::Message(message) => match &self.adapter {
                Some(adapter) if self.status.is_ready() => {
                    let _ = self.pipeline.send(PipelineItem::Inbound {
                        message,
                        adapter: Arc::clone(adapter),
                    });
                }
                _ => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        status = %self.status,
                        "dropping message received outside Ready"
                    );
                }
            },
            AdapterEvent::Disconnected(reason) => self.on_disconnected(reason).await,
        }
    }

    /// Discards the current adapter and schedules its replacement.
    async fn on_disconnected(&mut self, reason: String) {
        if !self.transition(SessionStatus::Disconnected) {
            return;
        }
        tracing::warn!(session_id = %self.session_id, %reason, "session disconnected");
        self.emit(SessionEvent::Disconnected {
            session_id: self.session_id.clone(),
            reason,
        });

        if let Some(adapter) = self.adapter.take() {
            if let Err(e) = adapter.release_resources().await {
                tracing::warn!(session_id = %self.session_id, error = %e, "releasing adapter resources failed");
            }
            if let Err(e) = adapter.destroy().await {
                tracing::warn!(session_id = %self.session_id, error = %e, "destroying adapter failed");
            }
        }

        let Some((attempt, delay)) = self.deps.config.reconnect.schedule(self.attempts) else {
            tracing::error!(
                session_id = %self.session_id,
                attempts = self.attempts,
                "reconnect attempts exhausted, terminating session"
            );
            self.transition(SessionStatus::Terminated);
            self.emit(SessionEvent::ReconnectAbandoned {
                session_id: self.session_id.clone(),
                attempts: self.attempts,
            });
            return;
        };

        self.attempts = attempt;
        self.reconnect_at = Some(Instant::now() + delay);
        self.publish();
        tracing::info!(
            session_id = %self.session_id,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
    }

    fn refresh_token(&mut self) {
        let now = chrono::Utc::now().timestamp();
        let keep = self.deps.config.token_refresh == TokenRefresh::KeepWhileValid
            && self.token.as_ref().is_some_and(|t| !t.is_expired_at(now));
        if keep {
            return;
        }

        let ttl = i64::try_from(self.deps.config.token_ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = TokenClaims::new(self.session_id.clone(), self.incarnation, now, ttl);
        match self.deps.tokens.issue(&claims) {
            Ok(token) => {
                tracing::info!(session_id = %self.session_id, exp = claims.exp, "access token minted");
                self.token = Some(AccessToken { token, claims });
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "minting access token failed");
            }
        }
    }

    // -- Commands -----------------------------------------------------------

    fn handle_send(
        &self,
        chat: ChatId,
        body: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    ) {
        let adapter = match &self.adapter {
            Some(adapter) if self.status.is_ready() => Arc::clone(adapter),
            _ => {
                let _ = reply.send(Err(SessionError::NotReady {
                    session_id: self.session_id.clone(),
                    status: self.status,
                }));
                return;
            }
        };

        // The send runs off the actor so a slow protocol round-trip never
        // delays lifecycle events.
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let result = adapter
                .send_message(&chat, &body)
                .await
                .map_err(|e| SessionError::SendFailed(session_id.clone(), e));
            match &result {
                Ok(()) => tracing::debug!(%session_id, %chat, "message sent"),
                Err(e) => tracing::warn!(%session_id, %chat, error = %e, "message send failed"),
            }
            let _ = reply.send(result);
        });
    }

    /// Shuts the adapter down, applies the artifact close policy and
    /// announces the close.
    ///
    /// The handle stays live until the adapter and artifact namespace are
    /// released, so the registry refuses a new handle for the same id until
    /// then. The pipeline stops writing attachments immediately.
    async fn terminate(&mut self) -> Result<(), SessionError> {
        self.terminated.store(true, Ordering::Release);
        self.reconnect_at = None;

        let mut result = Ok(());
        if let Some(adapter) = self.adapter.take() {
            if let Err(e) = adapter.destroy().await {
                tracing::error!(session_id = %self.session_id, error = %e, "adapter shutdown failed");
                result = Err(SessionError::TerminationFailed(self.session_id.clone(), e));
            }
        }

        let artifacts = ArtifactScope::new(Arc::clone(&self.deps.artifacts), self.session_id.clone());
        if let Err(e) = artifacts.on_close().await {
            tracing::warn!(session_id = %self.session_id, error = %e, "applying artifact close policy failed");
        }

        self.transition(SessionStatus::Terminated);
        tracing::info!(session_id = %self.session_id, "session closed");
        self.emit(SessionEvent::Closed {
            session_id: self.session_id.clone(),
        });
        result
    }
}

async fn reconnect_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
