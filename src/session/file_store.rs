//! File-backed session store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::SessionError;
use crate::session::{Session, SessionStore};

const SESSION_FILE: &str = "session.json";

/// Stores each session at `<root>/<sanitized key>/session.json`.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the transcript for `key`.
    pub fn session_path(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key)).join(SESSION_FILE)
    }
}

/// Map a session key to a single safe path component.
///
/// `telegram:42` becomes `telegram_42`; anything that would escape the store
/// root collapses to underscores.
pub fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return "_".repeat(cleaned.len().max(1));
    }
    cleaned
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn reload(&self, key: &str) -> Result<Session, SessionError> {
        let path = self.session_path(key);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Session::new(key)),
            Err(e) => {
                return Err(SessionError::Io {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let mut session: Session =
            serde_json::from_str(&data).map_err(|e| SessionError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        session.key = key.to_string();
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        let path = self.session_path(&session.key);
        let io_err = |e: std::io::Error| SessionError::Io {
            key: session.key.clone(),
            reason: e.to_string(),
        };

        let body = serde_json::to_vec_pretty(session).map_err(|e| SessionError::Io {
            key: session.key.clone(),
            reason: e.to_string(),
        })?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        tracing::debug!(
            key = %session.key,
            messages = session.messages.len(),
            "Saved session"
        );
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("telegram:42"), "telegram_42");
        assert_eq!(sanitize_key("main:thread:ab12cd34"), "main_thread_ab12cd34");
        assert_eq!(sanitize_key("../etc"), ".._etc");
        assert_eq!(sanitize_key(".."), "__");
        assert_eq!(sanitize_key(""), "_");
    }

    #[tokio::test]
    async fn test_missing_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = store.reload("cli").await.unwrap();
        assert_eq!(session.key, "cli");
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());

        let mut session = Session::new("telegram:42");
        session.append([ChatMessage::user("hi"), ChatMessage::assistant("hello")]);
        store.save(&session).await.unwrap();

        assert!(dir.path().join("telegram_42").join("session.json").exists());
        let loaded = store.reload("telegram:42").await.unwrap();
        pretty_assertions::assert_eq!(loaded.messages, session.messages);
    }

    #[tokio::test]
    async fn test_corrupt_session_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let path = store.session_path("main");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            store.reload("main").await,
            Err(SessionError::Corrupt { .. })
        ));
    }
}
