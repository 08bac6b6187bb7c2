//! Server configuration.
//!
//! Every field has a default, and [`ServerConfig::from_env`] overrides them
//! from `CHATMUX_*` environment variables:
//!
//! | variable | field | default |
//! |---|---|---|
//! | `CHATMUX_HTTP_ADDR` | `http_addr` | `0.0.0.0:3000` |
//! | `CHATMUX_EVENTS_ADDR` | `events_addr` | `0.0.0.0:3001` |
//! | `CHATMUX_TOKEN_SECRET` | `token_secret` | random per process |
//! | `CHATMUX_TOKEN_TTL_SECS` | `session.token_ttl` | `3600` |
//! | `CHATMUX_SESSIONS_DIR` | `sessions_dir` | `sessions` |
//! | `CHATMUX_ATTACHMENTS_DIR` | `attachments_dir` | `public/attachments` |
//! | `CHATMUX_TIMEZONE` | `session.timezone` | `America/Hermosillo` |
//! | `CHATMUX_ADMIN_KEY` | `admin_key` | unset (admin routes disabled) |

use std::path::PathBuf;
use std::time::Duration;

use chatmux_session::{DEFAULT_ATTACHMENTS_DIR, DEFAULT_SESSIONS_DIR, SessionConfig};
use rand::Rng;

use crate::ChatmuxError;

/// Configuration for a [`ChatmuxServer`](crate::ChatmuxServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control plane listen address.
    pub http_addr: String,

    /// Observer WebSocket listen address.
    pub events_addr: String,

    /// Shared secret access tokens are signed with.
    pub token_secret: String,

    /// Root of the filesystem artifact store.
    pub sessions_dir: PathBuf,

    /// Root of the filesystem attachment sink, served under `/attachments`.
    pub attachments_dir: PathBuf,

    /// Key required by administrative routes. `None` disables them.
    pub admin_key: Option<String>,

    /// Lifecycle settings shared by every session.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:3000".to_string(),
            events_addr: "0.0.0.0:3001".to_string(),
            token_secret: random_secret(),
            sessions_dir: PathBuf::from(DEFAULT_SESSIONS_DIR),
            attachments_dir: PathBuf::from(DEFAULT_ATTACHMENTS_DIR),
            admin_key: None,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CHATMUX_*` environment variables.
    pub fn from_env() -> Result<Self, ChatmuxError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `CHATMUX_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ChatmuxError> {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(addr) = var("CHATMUX_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(addr) = var("CHATMUX_EVENTS_ADDR") {
            config.events_addr = addr;
        }
        match var("CHATMUX_TOKEN_SECRET") {
            Some(secret) => config.token_secret = secret,
            None => tracing::warn!(
                "CHATMUX_TOKEN_SECRET not set; tokens will not survive a restart"
            ),
        }
        if let Some(ttl) = var("CHATMUX_TOKEN_TTL_SECS") {
            let secs: u64 = ttl.trim().parse().map_err(|_| {
                ChatmuxError::Config(format!("CHATMUX_TOKEN_TTL_SECS must be seconds, got {ttl:?}"))
            })?;
            if secs == 0 {
                return Err(ChatmuxError::Config(
                    "CHATMUX_TOKEN_TTL_SECS must be positive".into(),
                ));
            }
            config.session.token_ttl = Duration::from_secs(secs);
        }
        if let Some(dir) = var("CHATMUX_SESSIONS_DIR") {
            config.sessions_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("CHATMUX_ATTACHMENTS_DIR") {
            config.attachments_dir = PathBuf::from(dir);
        }
        if let Some(tz) = var("CHATMUX_TIMEZONE") {
            config.session.timezone = tz.trim().parse().map_err(|_| {
                ChatmuxError::Config(format!("CHATMUX_TIMEZONE is not an IANA zone: {tz:?}"))
            })?;
        }
        config.admin_key = var("CHATMUX_ADMIN_KEY");

        Ok(config)
    }
}

/// 32 random bytes, hex encoded.
fn random_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
