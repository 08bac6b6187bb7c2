//! Persisted authentication artifacts.
//!
//! An artifact is whatever the protocol client needs to resume a session
//! without a new challenge (for WhatsApp Web, the paired-device state).
//! Each session owns one namespace; a reconnecting handle reads back what
//! its earlier adapter saved.
//!
//! Adapters never see the store itself, only an [`ArtifactScope`] bound
//! to their own session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chatmux_protocol::SessionId;
use rand::Rng;
use tokio::sync::Mutex;

use crate::SessionError;

/// Storage for authentication artifacts, one namespace per session.
#[async_trait]
pub trait AuthArtifactStore: Send + Sync + 'static {
    /// Reads the artifact for `session_id`, if one was saved.
    async fn load(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>, SessionError>;

    /// Replaces the artifact for `session_id`.
    async fn save(&self, session_id: &SessionId, artifact: &[u8]) -> Result<(), SessionError>;

    /// Removes the namespace. Removing a missing namespace succeeds.
    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Whether artifacts outlive a requested close.
    fn retain_on_close(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// ArtifactScope
// ---------------------------------------------------------------------------

/// A store view bound to one session.
#[derive(Clone)]
pub struct ArtifactScope {
    store: Arc<dyn AuthArtifactStore>,
    session_id: SessionId,
}

impl ArtifactScope {
    pub(crate) fn new(store: Arc<dyn AuthArtifactStore>, session_id: SessionId) -> Self {
        Self { store, session_id }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn load(&self) -> Result<Option<Vec<u8>>, SessionError> {
        self.store.load(&self.session_id).await
    }

    pub async fn save(&self, artifact: &[u8]) -> Result<(), SessionError> {
        self.store.save(&self.session_id, artifact).await
    }

    /// Applies the store's close policy.
    pub(crate) async fn on_close(&self) -> Result<(), SessionError> {
        if self.store.retain_on_close() {
            tracing::debug!(session_id = %self.session_id, "retaining auth artifacts");
            return Ok(());
        }
        self.store.delete(&self.session_id).await?;
        tracing::info!(session_id = %self.session_id, "auth artifacts removed on close");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FsArtifactStore
// ---------------------------------------------------------------------------

const ARTIFACT_FILE: &str = "artifact.bin";

/// Stores each artifact at `<root>/<session_id>/artifact.bin`.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash mid-write never leaves a truncated artifact behind.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
    retain_on_close: bool,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retain_on_close: true,
        }
    }

    pub fn with_retain_on_close(mut self, retain: bool) -> Self {
        self.retain_on_close = retain;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.as_str())
    }
}

#[async_trait]
impl AuthArtifactStore for FsArtifactStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>, SessionError> {
        let path = self.namespace(session_id).join(ARTIFACT_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SessionError::storage("reading artifact", e)),
        }
    }

    async fn save(&self, session_id: &SessionId, artifact: &[u8]) -> Result<(), SessionError> {
        let dir = self.namespace(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SessionError::storage("creating artifact directory", e))?;

        // one temp file per write; concurrent saves must not share it
        let nonce: u64 = rand::rng().random();
        let tmp = dir.join(format!("{ARTIFACT_FILE}.{nonce:016x}.tmp"));
        tokio::fs::write(&tmp, artifact)
            .await
            .map_err(|e| SessionError::storage("writing artifact", e))?;
        tokio::fs::rename(&tmp, dir.join(ARTIFACT_FILE))
            .await
            .map_err(|e| SessionError::storage("replacing artifact", e))?;

        tracing::debug!(%session_id, bytes = artifact.len(), "auth artifact saved");
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionError> {
        match tokio::fs::remove_dir_all(self.namespace(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::storage("removing artifact directory", e)),
        }
    }

    fn retain_on_close(&self) -> bool {
        self.retain_on_close
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-process store, for tests and the loopback demo.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<HashMap<SessionId, Vec<u8>>>,
    discard_on_close: bool,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose artifacts are deleted when their session closes.
    pub fn discarding_on_close() -> Self {
        Self {
            discard_on_close: true,
            ..Self::default()
        }
    }

    pub async fn contains(&self, session_id: &SessionId) -> bool {
        self.artifacts.lock().await.contains_key(session_id)
    }
}

#[async_trait]
impl AuthArtifactStore for MemoryArtifactStore {
    async fn load(&self, session_id: &SessionId) -> Result<Option<Vec<u8>>, SessionError> {
        Ok(self.artifacts.lock().await.get(session_id).cloned())
    }

    async fn save(&self, session_id: &SessionId, artifact: &[u8]) -> Result<(), SessionError> {
        self.artifacts
            .lock()
            .await
            .insert(session_id.clone(), artifact.to_vec());
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionError> {
        self.artifacts.lock().await.remove(session_id);
        Ok(())
    }

    fn retain_on_close(&self) -> bool {
        !self.discard_on_close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: &str) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_fs_store_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        assert_eq!(store.load(&sid("ventas")).await.unwrap(), None);
        store.save(&sid("ventas"), b"paired").await.unwrap();

        assert_eq!(
            store.load(&sid("ventas")).await.unwrap().as_deref(),
            Some(&b"paired"[..])
        );
        let names: Vec<String> = std::fs::read_dir(dir.path().join("ventas"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["artifact.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_fs_store_concurrent_saves_leave_one_complete_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsArtifactStore::new(dir.path()));
        let payloads: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 4096]).collect();

        let tasks: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.save(&sid("ventas"), &payload).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let saved = store.load(&sid("ventas")).await.unwrap().unwrap();
        assert!(payloads.contains(&saved));
        let leftovers = std::fs::read_dir(dir.path().join("ventas")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_fs_store_namespaces_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        store.save(&sid("a"), b"one").await.unwrap();
        store.save(&sid("b"), b"two").await.unwrap();
        store.delete(&sid("a")).await.unwrap();

        assert_eq!(store.load(&sid("a")).await.unwrap(), None);
        assert_eq!(store.load(&sid("b")).await.unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[tokio::test]
    async fn test_fs_store_delete_missing_namespace_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        assert!(store.delete(&sid("never-saved")).await.is_ok());
    }

    #[tokio::test]
    async fn test_scope_on_close_respects_retention() {
        let retaining: Arc<MemoryArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let scope = ArtifactScope::new(retaining.clone(), sid("keep"));
        scope.save(b"x").await.unwrap();
        scope.on_close().await.unwrap();
        assert!(retaining.contains(&sid("keep")).await);

        let discarding = Arc::new(MemoryArtifactStore::discarding_on_close());
        let scope = ArtifactScope::new(discarding.clone(), sid("drop"));
        scope.save(b"x").await.unwrap();
        scope.on_close().await.unwrap();
        assert!(!discarding.contains(&sid("drop")).await);
    }

    #[test]
    fn test_fs_store_retains_by_default() {
        assert!(FsArtifactStore::new("/tmp/x").retain_on_close());
        assert!(!FsArtifactStore::new("/tmp/x")
            .with_retain_on_close(false)
            .retain_on_close());
    }
}
