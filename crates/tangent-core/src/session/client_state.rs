//! Local cache of per-conversation navigation state.
//!
//! Only the active leaf and the sibling map are cached. Message content always
//! comes from the server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::api::BranchMap;
use crate::app::domain::types::{ConversationId, MessageId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    pub active_leaf: Option<MessageId>,
    #[serde(default)]
    pub branches: BranchMap,
}

#[derive(Debug, Error)]
pub enum ClientStateError {
    #[error("Client state I/O error: {message}")]
    Io { message: String },

    #[error("Client state serialization error: {message}")]
    Serialization { message: String },

    #[error("Client state lock poisoned: {message}")]
    LockPoisoned { message: String },
}

#[async_trait]
pub trait ClientStateStore: Send + Sync {
    async fn load(
        &self,
        conversation: ConversationId,
    ) -> Result<Option<ClientState>, ClientStateError>;

    async fn save(
        &self,
        conversation: ConversationId,
        state: &ClientState,
    ) -> Result<(), ClientStateError>;
}

/// One JSON file per conversation under a data directory.
pub struct FileClientStateStore {
    dir: PathBuf,
}

impl FileClientStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, conversation: ConversationId) -> PathBuf {
        self.dir.join(format!("{conversation}.json"))
    }
}

#[async_trait]
impl ClientStateStore for FileClientStateStore {
    async fn load(
        &self,
        conversation: ConversationId,
    ) -> Result<Option<ClientState>, ClientStateError> {
        let path = self.path_for(conversation);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ClientStateError::Io {
                    message: format!("{}: {e}", path.display()),
                });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ClientStateError::Serialization {
                message: e.to_string(),
            })
    }

    async fn save(
        &self,
        conversation: ConversationId,
        state: &ClientState,
    ) -> Result<(), ClientStateError> {
        let json = serde_json::to_vec(state).map_err(|e| ClientStateError::Serialization {
            message: e.to_string(),
        })?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ClientStateError::Io {
                message: e.to_string(),
            })?;

        // Readers only ever see a complete file.
        let path = self.path_for(conversation);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ClientStateError::Io {
                message: format!("{}: {e}", tmp.display()),
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ClientStateError::Io {
                message: format!("{}: {e}", path.display()),
            })?;
        debug!(conversation_id = %conversation, path = %path.display(), "Saved client state");
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryClientStateStore {
    states: RwLock<HashMap<ConversationId, ClientState>>,
}

impl InMemoryClientStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientStateStore for InMemoryClientStateStore {
    async fn load(
        &self,
        conversation: ConversationId,
    ) -> Result<Option<ClientState>, ClientStateError> {
        let states = self
            .states
            .read()
            .map_err(|_| ClientStateError::LockPoisoned {
                message: "client states".to_string(),
            })?;
        Ok(states.get(&conversation).cloned())
    }

    async fn save(
        &self,
        conversation: ConversationId,
        state: &ClientState,
    ) -> Result<(), ClientStateError> {
        let mut states = self
            .states
            .write()
            .map_err(|_| ClientStateError::LockPoisoned {
                message: "client states".to_string(),
            })?;
        states.insert(conversation, state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::conversation::SiblingEntry;
    use chrono::Utc;

    fn sample() -> ClientState {
        let mut branches = BranchMap::new();
        branches.insert(
            "root".to_string(),
            vec![SiblingEntry::new(MessageId::from("m1"), Utc::now())],
        );
        ClientState {
            active_leaf: Some(MessageId::from("m1")),
            branches,
        }
    }

    #[tokio::test]
    async fn file_store_round_trips_and_misses_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileClientStateStore::new(dir.path().join("state"));
        let conversation = ConversationId::new();

        assert_eq!(store.load(conversation).await.unwrap(), None);

        let state = sample();
        store.save(conversation, &state).await.unwrap();
        assert_eq!(store.load(conversation).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn corrupt_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileClientStateStore::new(dir.path());
        let conversation = ConversationId::new();
        std::fs::write(dir.path().join(format!("{conversation}.json")), b"{not json").unwrap();

        assert!(matches!(
            store.load(conversation).await,
            Err(ClientStateError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn memory_store_keeps_latest_state() {
        let store = InMemoryClientStateStore::new();
        let conversation = ConversationId::new();
        store.save(conversation, &ClientState::default()).await.unwrap();
        let state = sample();
        store.save(conversation, &state).await.unwrap();
        assert_eq!(store.load(conversation).await.unwrap(), Some(state));
    }
}
