//! `ChatmuxServer` builder and server loop.
//!
//! This is the entry point for running a chatmux process. It ties together
//! all the layers: the session registry, the HTTP control plane, and the
//! observer WebSocket channel.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use chatmux_session::{
    AdapterFactory, AttachmentSink, AuthArtifactStore, FsArtifactStore, FsAttachmentSink,
    HmacTokenIssuer, SessionRegistry, TokenIssuer,
};
use chatmux_transport::{Transport, WebSocketTransport};
use tokio::net::TcpListener;

use crate::control::{AttachmentRoute, build_control_plane};
use crate::observer::handle_observer;
use crate::{ChatmuxError, ServerConfig};

/// Builder for configuring and starting a chatmux server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use chatmux::prelude::*;
///
/// # async fn run() -> Result<(), ChatmuxError> {
/// let server = ChatmuxServer::builder()
///     .config(ServerConfig::from_env()?)
///     .adapter_factory(Arc::new(LoopbackFactory::new()))
///     .build()
///     .await?;
/// server.run().await
/// # }
/// ```
#[derive(Default)]
pub struct ChatmuxServerBuilder {
    config: ServerConfig,
    factory: Option<Arc<dyn AdapterFactory>>,
    tokens: Option<Arc<dyn TokenIssuer>>,
    artifacts: Option<Arc<dyn AuthArtifactStore>>,
    sink: Option<Arc<dyn AttachmentSink>>,
}

impl ChatmuxServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the control plane listen address.
    pub fn http_addr(mut self, addr: &str) -> Self {
        self.config.http_addr = addr.to_string();
        self
    }

    /// Sets the observer channel listen address.
    pub fn events_addr(mut self, addr: &str) -> Self {
        self.config.events_addr = addr.to_string();
        self
    }

    /// The factory every session's protocol client comes from. Required.
    pub fn adapter_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Overrides the HMAC issuer built from `token_secret`.
    pub fn token_issuer(mut self, tokens: Arc<dyn TokenIssuer>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Overrides the filesystem artifact store under `sessions_dir`.
    pub fn artifact_store(mut self, store: Arc<dyn AuthArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// Overrides the filesystem attachment sink under `attachments_dir`.
    pub fn attachment_sink(mut self, sink: Arc<dyn AttachmentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Binds both listeners and assembles the registry.
    ///
    /// # Errors
    /// [`ChatmuxError::Config`] without an adapter factory, or an I/O /
    /// transport error if an address cannot be bound.
    pub async fn build(self) -> Result<ChatmuxServer, ChatmuxError> {
        let factory = self
            .factory
            .ok_or_else(|| ChatmuxError::Config("an adapter factory is required".into()))?;
        let config = self.config;

        let tokens = self
            .tokens
            .unwrap_or_else(|| Arc::new(HmacTokenIssuer::new(&config.token_secret)));
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(FsArtifactStore::new(config.sessions_dir.clone())));
        let (sink, attachments): (Arc<dyn AttachmentSink>, AttachmentRoute) = match self.sink {
            Some(sink) => (Arc::clone(&sink), AttachmentRoute::Sink(sink)),
            None => (
                Arc::new(FsAttachmentSink::new(config.attachments_dir.clone())),
                AttachmentRoute::Dir(config.attachments_dir.clone()),
            ),
        };

        let registry = Arc::new(
            SessionRegistry::builder(factory, tokens)
                .artifacts(artifacts)
                .attachments(sink)
                .config(config.session.clone())
                .build(),
        );

        let listener = TcpListener::bind(&config.http_addr).await?;
        let transport = WebSocketTransport::bind(&config.events_addr).await?;
        let router = build_control_plane(Arc::clone(&registry), config.admin_key.clone(), attachments);

        Ok(ChatmuxServer {
            listener,
            transport,
            router,
            registry,
        })
    }
}

/// A bound chatmux server.
///
/// Call [`run()`](Self::run) to start serving.
pub struct ChatmuxServer {
    listener: TcpListener,
    transport: WebSocketTransport,
    router: axum::Router,
    registry: Arc<SessionRegistry>,
}

impl ChatmuxServer {
    /// Creates a new builder.
    pub fn builder() -> ChatmuxServerBuilder {
        ChatmuxServerBuilder::new()
    }

    /// Returns the address the control plane is bound to.
    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the address the observer channel is bound to.
    pub fn events_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// The registry behind the control plane.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serves until Ctrl-C.
    pub async fn run(self) -> Result<(), ChatmuxError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// Serves until `shutdown` resolves, then closes every session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ChatmuxError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            listener,
            mut transport,
            router,
            registry,
        } = self;

        tracing::info!(
            http = %listener.local_addr()?,
            events = %transport.local_addr()?,
            "chatmux server running"
        );

        let observers = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                loop {
                    match transport.accept().await {
                        Ok(conn) => {
                            let registry = Arc::clone(&registry);
                            tokio::spawn(async move {
                                if let Err(e) = handle_observer(conn, registry).await {
                                    tracing::debug!(error = %e, "observer ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "observer accept failed");
                        }
                    }
                }
            })
        };

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        observers.abort();
        registry.shutdown_all().await;
        tracing::info!("chatmux server stopped");

        served.map_err(ChatmuxError::Io)
    }
}
