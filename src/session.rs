// Chat session persistence: `<id>.json` metadata next to an opaque `<id>.state` blob

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::Token;
use crate::config::SamplerConfig;
use crate::error::{wrap, LlamaError, Result};
use crate::logger::Logger;
use crate::log_warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Metadata half of a saved session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    /// Model the `.state` blob was produced with.
    pub model_path: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub config: SamplerConfig,
    /// Tokens held in the KV cache when the state was saved.
    #[serde(default)]
    pub tokens: Vec<Token>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(model_path: impl Into<String>, config: SamplerConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_path: model_path.into(),
            history: Vec::new(),
            config,
            tokens: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        let now = Utc::now();
        self.history.push(ChatMessage {
            role,
            content: content.into(),
            timestamp: now,
        });
        self.updated_at = now;
    }

    /// Fails when the session was saved against a different model.
    pub fn ensure_model(&self, loaded_model: &str) -> Result<()> {
        if self.model_path == loaded_model {
            Ok(())
        } else {
            Err(LlamaError::SessionFailure(format!(
                "session {} was saved with model {}, but {} is loaded",
                self.id, self.model_path, loaded_model
            )))
        }
    }
}

/// Directory of saved sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    logger: Logger,
}

impl SessionStore {
    /// Open (creating if needed) a session directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(wrap(LlamaError::SessionFailure, "create session dir"))?;
        Ok(Self {
            dir,
            logger: Logger::new("session"),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `(metadata, state)` paths for a session id.
    pub fn paths(&self, id: &str) -> Result<(PathBuf, PathBuf)> {
        validate_id(id)?;
        Ok((
            self.dir.join(format!("{id}.json")),
            self.dir.join(format!("{id}.state")),
        ))
    }

    pub fn write_metadata(&self, session: &ChatSession) -> Result<()> {
        let (meta, _) = self.paths(&session.id)?;
        let json = serde_json::to_vec_pretty(session)
            .map_err(wrap(LlamaError::SessionFailure, "encode metadata"))?;

        // tmp + rename
        let tmp = meta.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(wrap(LlamaError::SessionFailure, "write metadata"))?;
        fs::rename(&tmp, &meta).map_err(wrap(LlamaError::SessionFailure, "commit metadata"))
    }

    pub fn read_metadata(&self, id: &str) -> Result<ChatSession> {
        let (meta, _) = self.paths(id)?;
        let bytes = fs::read(&meta).map_err(wrap(LlamaError::SessionFailure, "read metadata"))?;
        serde_json::from_slice(&bytes).map_err(wrap(LlamaError::SessionFailure, "decode metadata"))
    }

    /// All readable sessions, most recently updated first.
    pub fn list(&self) -> Result<Vec<ChatSession>> {
        let entries =
            fs::read_dir(&self.dir).map_err(wrap(LlamaError::SessionFailure, "list sessions"))?;

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_metadata(id) {
                Ok(session) => sessions.push(session),
                Err(e) => log_warn!(self.logger, "Skipping {}: {}", path.display(), e),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Remove both files of a session. Returns whether anything was deleted.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let (meta, state) = self.paths(id)?;
        let mut removed = false;
        for path in [meta, state] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(wrap(LlamaError::SessionFailure, "delete session")(e)),
            }
        }
        Ok(removed)
    }
}

fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(LlamaError::SessionFailure(format!("invalid session id {id:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> SessionStore {
        let dir = std::env::temp_dir().join(format!("llama-sessions-{}", uuid::Uuid::new_v4()));
        SessionStore::new(dir).unwrap()
    }

    #[test]
    fn test_metadata_round_trip() {
        let store = temp_store();
        let mut session = ChatSession::new("/models/a.gguf", SamplerConfig::deterministic());
        session.push(Role::User, "Hello");
        session.push(Role::Assistant, "Hi!");
        session.tokens = vec![1, 300, 301];

        store.write_metadata(&session).unwrap();
        let back = store.read_metadata(&session.id).unwrap();
        assert_eq!(back, session);

        let (meta, state) = store.paths(&session.id).unwrap();
        assert!(meta.ends_with(format!("{}.json", session.id)));
        assert!(state.ends_with(format!("{}.state", session.id)));
        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn test_list_orders_by_update_and_delete_removes() {
        let store = temp_store();
        let older = ChatSession::new("/m.gguf", SamplerConfig::default());
        let mut newer = ChatSession::new("/m.gguf", SamplerConfig::default());
        newer.updated_at = older.updated_at + chrono::Duration::seconds(5);
        store.write_metadata(&older).unwrap();
        store.write_metadata(&newer).unwrap();
        fs::write(store.dir().join("notes.txt"), "ignored").unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![newer.id.clone(), older.id.clone()]);

        assert!(store.delete(&newer.id).unwrap());
        assert!(!store.delete(&newer.id).unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
        let _ = fs::remove_dir_all(store.dir());
    }

    #[test]
    fn test_model_mismatch_is_rejected() {
        let session = ChatSession::new("/models/a.gguf", SamplerConfig::default());
        assert!(session.ensure_model("/models/a.gguf").is_ok());
        assert!(matches!(
            session.ensure_model("/models/b.gguf"),
            Err(LlamaError::SessionFailure(_))
        ));
    }

    #[test]
    fn test_path_traversal_ids_rejected() {
        let store = temp_store();
        assert!(store.paths("../etc/passwd").is_err());
        assert!(store.paths("").is_err());
        let _ = fs::remove_dir_all(store.dir());
    }
}
