//! Per-session credential directories.
//!
//! The protocol library persists its multi-file auth state into a directory
//! scoped to one session. This module creates that directory, reads the
//! credentials back after a successful handshake, and removes the directory
//! on teardown. The file layout inside is owned by the library; only
//! `creds.json` is read here.
//!
//! ## Session string
//!
//! The deliverable of the whole service: the credentials JSON serialized to
//! bytes and base64-encoded (standard alphabet, padded). A bot process
//! reverses it with base64 → bytes → JSON.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::session::{SessionError, SessionId};

/// File the protocol library writes its primary credentials to.
pub const CREDS_FILE: &str = "creds.json";

/// Opaque credentials object as persisted by the protocol library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub serde_json::Value);

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credentials file {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize credentials: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("session string is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("session string does not hold JSON credentials: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Encode credentials into a session string.
pub fn encode_session_string(credentials: &Credentials) -> Result<String, CredentialError> {
    let bytes = serde_json::to_vec(credentials).map_err(CredentialError::Encode)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Decode a session string back into credentials.
pub fn decode_session_string(session_string: &str) -> Result<Credentials, CredentialError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(session_string.trim())?;
    serde_json::from_slice(&bytes).map_err(CredentialError::Deserialize)
}

/// Handle to one session's credential directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialHandle {
    session_id: SessionId,
    dir: PathBuf,
}

impl CredentialHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn creds_path(&self) -> PathBuf {
        self.dir.join(CREDS_FILE)
    }
}

/// Creates, reads back and destroys session-scoped credential directories
/// under a single root.
#[derive(Debug)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.to_string())
    }

    /// Remove everything left under the root by a previous process and make
    /// sure the root exists.
    pub async fn purge(&self) -> Result<usize, SessionError> {
        let io_err = |source| SessionError::Io {
            path: self.root.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.root).await.map_err(io_err)?;

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let result = if entry.file_type().await.map_err(io_err)?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to purge stale credentials"),
            }
        }
        Ok(removed)
    }

    /// Create a fresh, empty directory for `session_id`.
    pub async fn open(&self, session_id: &SessionId) -> Result<CredentialHandle, SessionError> {
        let dir = self.dir_for(session_id);

        // Session IDs are never reused, but never hand out a dirty directory.
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::warn!(session_id = %session_id, "Removed leftover credential directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(SessionError::Io { path: dir, source }),
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SessionError::Io {
                path: dir.clone(),
                source,
            })?;

        tracing::debug!(session_id = %session_id, dir = %dir.display(), "Credential directory created");
        Ok(CredentialHandle {
            session_id: *session_id,
            dir,
        })
    }

    /// Read back what the protocol library persisted. `Ok(None)` when no
    /// credentials file exists yet.
    pub async fn read_back(
        &self,
        handle: &CredentialHandle,
    ) -> Result<Option<Credentials>, CredentialError> {
        let path = handle.creds_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CredentialError::Io { path, source }),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| CredentialError::Parse { path, source })
    }

    /// Recursively remove the directory. Best-effort: failures are logged.
    pub async fn destroy(&self, handle: &CredentialHandle) {
        match tokio::fs::remove_dir_all(handle.dir()).await {
            Ok(()) => {
                tracing::debug!(session_id = %handle.session_id, "Credential directory removed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    session_id = %handle.session_id,
                    dir = %handle.dir.display(),
                    error = %e,
                    "Failed to remove credential directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_credentials() -> Credentials {
        Credentials(json!({
            "noiseKey": { "private": "AAEC", "public": "AwQF" },
            "registrationId": 4711,
            "me": { "id": "2347012345678:12@s.whatsapp.net", "name": "Sumo" },
            "platform": "android",
            "registered": true
        }))
    }

    #[test]
    fn session_string_round_trips() {
        let creds = sample_credentials();
        let encoded = encode_session_string(&creds).unwrap();
        assert!(!encoded.contains('{'));
        assert_eq!(decode_session_string(&encoded).unwrap(), creds);
    }

    #[test]
    fn session_string_is_plain_base64_json() {
        let encoded = encode_session_string(&sample_credentials()).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["registrationId"], 4711);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_session_string("not base64 !!"),
            Err(CredentialError::Decode(_))
        ));
        let not_json = base64::engine::general_purpose::STANDARD.encode(b"plain text");
        assert!(matches!(
            decode_session_string(&not_json),
            Err(CredentialError::Deserialize(_))
        ));
    }

    #[tokio::test]
    async fn open_creates_empty_scoped_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        let id = SessionId::new();

        let handle = store.open(&id).await.unwrap();
        assert_eq!(handle.session_id(), id);
        assert!(handle.dir().starts_with(tmp.path()));
        assert!(handle.dir().is_dir());
        assert_eq!(std::fs::read_dir(handle.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn open_fails_when_root_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("not-a-dir");
        std::fs::write(&root, b"x").unwrap();
        let store = CredentialStore::new(&root);

        match store.open(&SessionId::new()).await {
            Err(SessionError::Io { .. }) => {}
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_back_absent_then_present() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        let handle = store.open(&SessionId::new()).await.unwrap();

        assert!(store.read_back(&handle).await.unwrap().is_none());

        let creds = sample_credentials();
        std::fs::write(handle.creds_path(), serde_json::to_vec(&creds).unwrap()).unwrap();
        assert_eq!(store.read_back(&handle).await.unwrap(), Some(creds));
    }

    #[tokio::test]
    async fn read_back_reports_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        let handle = store.open(&SessionId::new()).await.unwrap();
        std::fs::write(handle.creds_path(), b"{ half").unwrap();

        assert!(matches!(
            store.read_back(&handle).await,
            Err(CredentialError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn destroy_removes_directory_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        let handle = store.open(&SessionId::new()).await.unwrap();
        std::fs::write(handle.dir().join("pre-key-1.json"), b"{}").unwrap();

        store.destroy(&handle).await;
        assert!(!handle.dir().exists());
        store.destroy(&handle).await;
    }

    #[tokio::test]
    async fn purge_clears_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("sessions");
        std::fs::create_dir_all(root.join("old-a")).unwrap();
        std::fs::create_dir_all(root.join("old-b")).unwrap();
        std::fs::write(root.join("stray.json"), b"{}").unwrap();

        let store = CredentialStore::new(&root);
        assert_eq!(store.purge().await.unwrap(), 3);
        assert!(root.is_dir());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }
}
