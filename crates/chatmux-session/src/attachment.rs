//! Storage for inbound attachments.
//!
//! Attachments are written under a per-session directory and referenced
//! from [`SessionEvent::Message`](chatmux_protocol::SessionEvent::Message)
//! by a stable retrieval path such as
//! `/attachments/<session_id>/file_1700000000000.png`. The control plane
//! serves that prefix straight from the sink's root directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chatmux_protocol::SessionId;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::SessionError;

/// URL prefix attachments are served under.
pub const ATTACHMENT_URL_PREFIX: &str = "/attachments";

/// Where a stored attachment ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    /// Stable retrieval path.
    pub path: String,
    /// Final file name (may carry a `-N` suffix after a collision).
    pub file_name: String,
}

/// Persists attachment bytes and reads them back by retrieval path.
#[async_trait]
pub trait AttachmentSink: Send + Sync + 'static {
    async fn store(
        &self,
        session_id: &SessionId,
        file_name: &str,
        data: &[u8],
    ) -> Result<StoredAttachment, SessionError>;

    /// Reads back the bytes behind a retrieval path, `None` if unknown.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SessionError>;
}

/// The file extension for a MIME type: its subtype without parameters.
///
/// `image/png` → `png`, `audio/ogg; codecs=opus` → `ogg`. Anything that
/// would not make a safe file name falls back to `bin`.
pub fn extension_for(mime_type: &str) -> &str {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    match essence.split_once('/') {
        Some((_, subtype))
            if !subtype.is_empty()
                && subtype
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                && !subtype.starts_with('.') =>
        {
            subtype
        }
        _ => "bin",
    }
}

/// `file_<millis>.<ext>`, the name an inbound attachment is stored under.
pub fn attachment_file_name(received_at_millis: i64, mime_type: &str) -> String {
    format!("file_{received_at_millis}.{}", extension_for(mime_type))
}

fn retrieval_path(session_id: &SessionId, file_name: &str) -> String {
    format!("{ATTACHMENT_URL_PREFIX}/{session_id}/{file_name}")
}

/// Splits a retrieval path back into its session and file name.
fn parse_retrieval_path(path: &str) -> Option<(SessionId, &str)> {
    let rest = path.strip_prefix(ATTACHMENT_URL_PREFIX)?.strip_prefix('/')?;
    let (session, file_name) = rest.split_once('/')?;
    let session_id = SessionId::new(session).ok()?;
    if file_name.is_empty() || file_name.contains(['/', '\\']) || file_name.contains("..") {
        return None;
    }
    Some((session_id, file_name))
}

/// Suffixes `-n` before the extension: `file_1.png` → `file_1-2.png`.
fn with_suffix(file_name: &str, n: u32) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{n}.{ext}"),
        None => format!("{file_name}-{n}"),
    }
}

// ---------------------------------------------------------------------------
// FsAttachmentSink
// ---------------------------------------------------------------------------

/// Writes attachments to `<root>/<session_id>/<file_name>`.
#[derive(Debug, Clone)]
pub struct FsAttachmentSink {
    root: PathBuf,
}

impl FsAttachmentSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory the retrieval prefix maps to.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl AttachmentSink for FsAttachmentSink {
    async fn store(
        &self,
        session_id: &SessionId,
        file_name: &str,
        data: &[u8],
    ) -> Result<StoredAttachment, SessionError> {
        let dir = self.root.join(session_id.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SessionError::storage("creating attachment directory", e))?;

        // Never overwrite: two attachments in the same millisecond get
        // distinct names.
        let mut candidate = file_name.to_owned();
        let mut collisions = 0u32;
        let mut file = loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dir.join(&candidate))
                .await
            {
                Ok(file) => break file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    collisions += 1;
                    candidate = with_suffix(file_name, collisions);
                }
                Err(e) => return Err(SessionError::storage("creating attachment", e)),
            }
        };

        file.write_all(data)
            .await
            .map_err(|e| SessionError::storage("writing attachment", e))?;
        file.flush()
            .await
            .map_err(|e| SessionError::storage("flushing attachment", e))?;

        tracing::debug!(%session_id, file_name = %candidate, bytes = data.len(), "attachment stored");
        Ok(StoredAttachment {
            path: retrieval_path(session_id, &candidate),
            file_name: candidate,
        })
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SessionError> {
        let Some((session_id, file_name)) = parse_retrieval_path(path) else {
            return Ok(None);
        };
        match tokio::fs::read(self.root.join(session_id.as_str()).join(file_name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SessionError::storage("reading attachment", e)),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryAttachmentSink
// ---------------------------------------------------------------------------

/// In-process sink keyed by retrieval path.
#[derive(Debug, Default)]
pub struct MemoryAttachmentSink {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryAttachmentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.files.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.lock().await.is_empty()
    }
}

#[async_trait]
impl AttachmentSink for MemoryAttachmentSink {
    async fn store(
        &self,
        session_id: &SessionId,
        file_name: &str,
        data: &[u8],
    ) -> Result<StoredAttachment, SessionError> {
        let mut files = self.files.lock().await;
        let mut candidate = file_name.to_owned();
        let mut collisions = 0u32;
        while files.contains_key(&retrieval_path(session_id, &candidate)) {
            collisions += 1;
            candidate = with_suffix(file_name, collisions);
        }
        let path = retrieval_path(session_id, &candidate);
        files.insert(path.clone(), data.to_vec());
        Ok(StoredAttachment {
            path,
            file_name: candidate,
        })
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, SessionError> {
        Ok(self.files.lock().await.get(path).cloned())
    }
}
