//! Authoritative in-memory conversation store.
//!
//! Messages are kept as a flat arena with parent back-references. Paths are
//! resolved by walking parent links; the newest-descendant leaf is found by
//! repeatedly following the most recently created child.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ApiError, BranchMap, ConversationApi, PathQuery, PathResponse};
use crate::app::conversation::{
    Message, MessagePart, ParentKey, Role, SiblingEntry, collect_subtree,
};
use crate::app::domain::types::{ConversationId, MessageId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub active_leaf: Option<MessageId>,
}

impl ConversationRecord {
    fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id() == id)
    }

    fn newest_child(&self, parent: &MessageId) -> Option<&Message> {
        self.messages
            .iter()
            .filter(|m| m.parent_id() == Some(parent))
            .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
    }

    /// Follow the newest child from `id` until a leaf is reached.
    fn newest_leaf_from(&self, id: &MessageId) -> MessageId {
        let mut current = id.clone();
        for _ in 0..self.messages.len() {
            match self.newest_child(&current) {
                Some(child) => current = child.id.clone(),
                None => break,
            }
        }
        current
    }

    /// Root→`leaf` path, oldest first.
    fn path_to(&self, leaf: &MessageId) -> Vec<Message> {
        let mut path = Vec::new();
        let mut current = self.get(leaf);
        while let Some(message) = current {
            if path.len() > self.messages.len() {
                break;
            }
            path.push(message.clone());
            current = message.parent_id().and_then(|parent| self.get(parent));
        }
        path.reverse();
        path
    }

    /// The stored active leaf, or the newest message's newest descendant.
    fn canonical_leaf(&self) -> Option<MessageId> {
        if let Some(leaf) = &self.active_leaf
            && self.get(leaf).is_some()
        {
            return Some(leaf.clone());
        }
        self.messages
            .iter()
            .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .map(|newest| self.newest_leaf_from(newest.id()))
    }

    fn branches(&self) -> BranchMap {
        let mut branches: BranchMap = BTreeMap::new();
        for message in &self.messages {
            branches
                .entry(ParentKey::of(message.parent_id()).to_wire())
                .or_default()
                .push(SiblingEntry::new(message.id.clone(), message.created_at));
        }
        for entries in branches.values_mut() {
            entries.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        }
        branches
    }
}

/// Keep only the newest `limit` messages of a path.
fn page(mut path: Vec<Message>, limit: Option<usize>) -> (Vec<Message>, bool) {
    match limit {
        Some(limit) if path.len() > limit => {
            let cut = path.len() - limit;
            (path.split_off(cut), true)
        }
        _ => (path, false),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub conversations: BTreeMap<ConversationId, ConversationRecord>,
}

pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<ConversationId, ConversationRecord>>,
    snapshot_path: Option<PathBuf>,
    /// Held across snapshot and write so saves land in mutation order.
    flush_lock: Mutex<()>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            snapshot_path: None,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            conversations: RwLock::new(snapshot.conversations.into_iter().collect()),
            snapshot_path: None,
            flush_lock: Mutex::new(()),
        }
    }

    /// Load a JSON snapshot from `path` (an absent file yields an empty store)
    /// and write the snapshot back after every mutation.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ApiError> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoreSnapshot>(&bytes)
                .map_err(|e| ApiError::serialization(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreSnapshot::default(),
            Err(e) => return Err(ApiError::io(format!("{}: {e}", path.display()))),
        };
        info!(
            path = %path.display(),
            conversations = snapshot.conversations.len(),
            "Opened conversation store"
        );
        let mut store = Self::from_snapshot(snapshot);
        store.snapshot_path = Some(path);
        Ok(store)
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot, ApiError> {
        let conversations = self
            .conversations
            .read()
            .map_err(|_| ApiError::lock_poisoned("conversations"))?;
        Ok(StoreSnapshot {
            conversations: conversations
                .iter()
                .map(|(id, record)| (*id, record.clone()))
                .collect(),
        })
    }

    pub async fn save_to(&self, path: &Path) -> Result<(), ApiError> {
        let _guard = self.flush_lock.lock().await;
        let snapshot = self.snapshot()?;
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| ApiError::serialization(e.to_string()))?;
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ApiError::io(e.to_string()))?;
        }

        // Readers only ever see a complete file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ApiError::io(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ApiError::io(format!("{}: {e}", path.display())))
    }

    async fn flush(&self) -> Result<(), ApiError> {
        match &self.snapshot_path {
            Some(path) => self.save_to(path).await,
            None => Ok(()),
        }
    }

    /// Insert messages verbatim into `conversation`, creating it if needed.
    pub fn seed(&self, conversation: ConversationId, messages: Vec<Message>) -> Result<(), ApiError> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|_| ApiError::lock_poisoned("conversations"))?;
        conversations
            .entry(conversation)
            .or_default()
            .messages
            .extend(messages);
        Ok(())
    }

    pub fn conversation_ids(&self) -> Result<Vec<ConversationId>, ApiError> {
        let conversations = self
            .conversations
            .read()
            .map_err(|_| ApiError::lock_poisoned("conversations"))?;
        let mut ids: Vec<_> = conversations.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    /// Every stored message of `conversation`, in insertion order.
    pub fn messages(&self, conversation: ConversationId) -> Result<Vec<Message>, ApiError> {
        self.read(conversation, |record| Ok(record.messages.clone()))
    }

    fn read<T>(
        &self,
        conversation: ConversationId,
        f: impl FnOnce(&ConversationRecord) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let conversations = self
            .conversations
            .read()
            .map_err(|_| ApiError::lock_poisoned("conversations"))?;
        let record = conversations
            .get(&conversation)
            .ok_or_else(|| ApiError::not_found(format!("conversation {conversation}")))?;
        f(record)
    }

    fn write<T>(
        &self,
        conversation: ConversationId,
        f: impl FnOnce(&mut ConversationRecord) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|_| ApiError::lock_poisoned("conversations"))?;
        let record = conversations
            .get_mut(&conversation)
            .ok_or_else(|| ApiError::not_found(format!("conversation {conversation}")))?;
        f(record)
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationApi for InMemoryConversationStore {
    async fn create_conversation(&self) -> Result<ConversationId, ApiError> {
        let id = ConversationId::new();
        {
            let mut conversations = self
                .conversations
                .write()
                .map_err(|_| ApiError::lock_poisoned("conversations"))?;
            conversations.insert(id, ConversationRecord::default());
        }
        info!(conversation_id = %id, "Created conversation");
        self.flush().await?;
        Ok(id)
    }

    async fn fetch_path(
        &self,
        conversation: ConversationId,
        query: &PathQuery,
    ) -> Result<PathResponse, ApiError> {
        self.read(conversation, |record| {
            if query.strict {
                let boundary = query
                    .message_id
                    .as_ref()
                    .ok_or_else(|| ApiError::invalid("strict lookups require messageId"))?;
                if record.get(boundary).is_none() {
                    return Err(ApiError::not_found(format!("message {boundary}")));
                }
                let mut ancestors = record.path_to(boundary);
                ancestors.pop();
                let (messages, has_more) = page(ancestors, query.limit);
                let leaf_id = messages.last().map(|m| m.id.clone());
                return Ok(PathResponse {
                    messages,
                    leaf_id,
                    has_more,
                });
            }

            let leaf = match &query.message_id {
                Some(id) => {
                    if record.get(id).is_none() {
                        return Err(ApiError::not_found(format!("message {id}")));
                    }
                    Some(record.newest_leaf_from(id))
                }
                None => record.canonical_leaf(),
            };
            let Some(leaf) = leaf else {
                return Ok(PathResponse::empty());
            };
            let (messages, has_more) = page(record.path_to(&leaf), query.limit);
            debug!(
                conversation_id = %conversation,
                leaf = %leaf,
                count = messages.len(),
                has_more,
                "Resolved path"
            );
            Ok(PathResponse {
                messages,
                leaf_id: Some(leaf),
                has_more,
            })
        })
    }

    async fn fetch_branches(&self, conversation: ConversationId) -> Result<BranchMap, ApiError> {
        self.read(conversation, |record| Ok(record.branches()))
    }

    async fn save_message(
        &self,
        conversation: ConversationId,
        message: &Message,
    ) -> Result<(), ApiError> {
        self.write(conversation, |record| {
            if record.get(message.id()).is_some() {
                return Err(ApiError::conflict(format!(
                    "message {} already exists",
                    message.id
                )));
            }
            if let Some(parent) = message.parent_id()
                && record.get(parent).is_none()
            {
                return Err(ApiError::invalid(format!("parent {parent} does not exist")));
            }
            record.messages.push(message.clone());
            record.active_leaf = Some(message.id.clone());
            Ok(())
        })?;
        self.flush().await
    }

    async fn update_message(
        &self,
        conversation: ConversationId,
        message_id: &MessageId,
        parts: &[MessagePart],
    ) -> Result<(), ApiError> {
        self.write(conversation, |record| {
            let message = record
                .messages
                .iter_mut()
                .find(|m| m.id() == message_id)
                .ok_or_else(|| ApiError::not_found(format!("message {message_id}")))?;
            if message.role == Role::User {
                return Err(ApiError::invalid(
                    "user messages cannot be updated in place",
                ));
            }
            message.parts = parts.to_vec();
            Ok(())
        })?;
        self.flush().await
    }

    async fn delete_message(
        &self,
        conversation: ConversationId,
        message_id: &MessageId,
    ) -> Result<Vec<MessageId>, ApiError> {
        let deleted = self.write(conversation, |record| {
            let parent = record
                .get(message_id)
                .ok_or_else(|| ApiError::not_found(format!("message {message_id}")))?
                .parent_id
                .clone();
            let doomed = collect_subtree(&record.messages, message_id);
            record.messages.retain(|m| !doomed.contains(m.id()));

            if record
                .active_leaf
                .as_ref()
                .is_some_and(|leaf| doomed.contains(leaf))
            {
                record.active_leaf = parent.map(|parent| record.newest_leaf_from(&parent));
            }

            let mut deleted: Vec<MessageId> = doomed.into_iter().collect();
            deleted.sort();
            Ok(deleted)
        })?;
        info!(
            conversation_id = %conversation,
            message_id = %message_id,
            removed = deleted.len(),
            "Deleted subtree"
        );
        self.flush().await?;
        Ok(deleted)
    }

    async fn set_active_leaf(
        &self,
        conversation: ConversationId,
        leaf: Option<&MessageId>,
    ) -> Result<(), ApiError> {
        self.write(conversation, |record| {
            if let Some(leaf) = leaf
                && record.get(leaf).is_none()
            {
                return Err(ApiError::not_found(format!("message {leaf}")));
            }
            record.active_leaf = leaf.cloned();
            Ok(())
        })?;
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    /// m1 ─ m2 ─ m3
    ///        └─ m4 ─ m5     (m4 newer than m3)
    fn forked() -> (InMemoryConversationStore, ConversationId) {
        let store = InMemoryConversationStore::new();
        let conversation = ConversationId::from(uuid::Uuid::from_u128(1));
        let t = Utc::now();
        let m1 = MessageId::from("m1");
        let m2 = MessageId::from("m2");
        let m4 = MessageId::from("m4");
        store
            .seed(
                conversation,
                vec![
                    Message::user(None, "hi").with_id("m1").with_created_at(t),
                    Message::assistant(Some(m1), "hello")
                        .with_id("m2")
                        .with_created_at(t + Duration::seconds(1)),
                    Message::user(Some(m2.clone()), "a")
                        .with_id("m3")
                        .with_created_at(t + Duration::seconds(2)),
                    Message::user(Some(m2), "b")
                        .with_id("m4")
                        .with_created_at(t + Duration::seconds(3)),
                    Message::assistant(Some(m4), "c")
                        .with_id("m5")
                        .with_created_at(t + Duration::seconds(4)),
                ],
            )
            .unwrap();
        (store, conversation)
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn path_through_target_follows_newest_descendant() {
        let (store, conversation) = forked();

        let response = store
            .fetch_path(conversation, &PathQuery::through(MessageId::from("m3")))
            .await
            .unwrap();
        assert_eq!(ids(&response.messages), vec!["m1", "m2", "m3"]);
        assert_eq!(response.leaf_id, Some(MessageId::from("m3")));

        let response = store
            .fetch_path(conversation, &PathQuery::through(MessageId::from("m2")))
            .await
            .unwrap();
        assert_eq!(ids(&response.messages), vec!["m1", "m2", "m4", "m5"]);
    }

    #[tokio::test]
    async fn canonical_path_prefers_active_leaf() {
        let (store, conversation) = forked();

        let response = store
            .fetch_path(conversation, &PathQuery::canonical())
            .await
            .unwrap();
        assert_eq!(response.leaf_id, Some(MessageId::from("m5")));

        store
            .set_active_leaf(conversation, Some(&MessageId::from("m3")))
            .await
            .unwrap();
        let response = store
            .fetch_path(conversation, &PathQuery::canonical())
            .await
            .unwrap();
        assert_eq!(ids(&response.messages), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn strict_query_pages_ancestors() {
        let (store, conversation) = forked();

        let response = store
            .fetch_path(conversation, &PathQuery::before(MessageId::from("m5"), 2))
            .await
            .unwrap();
        assert_eq!(ids(&response.messages), vec!["m2", "m4"]);
        assert!(response.has_more);

        let response = store
            .fetch_path(conversation, &PathQuery::before(MessageId::from("m2"), 10))
            .await
            .unwrap();
        assert_eq!(ids(&response.messages), vec!["m1"]);
        assert!(!response.has_more);
    }

    #[tokio::test]
    async fn branches_are_keyed_by_parent_with_root_sentinel() {
        let (store, conversation) = forked();
        let branches = store.fetch_branches(conversation).await.unwrap();

        assert_eq!(branches["root"].len(), 1);
        let at_m2: Vec<_> = branches["m2"].iter().map(|e| e.id.as_str()).collect();
        assert_eq!(at_m2, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn delete_removes_subtree_and_moves_active_leaf() {
        let (store, conversation) = forked();
        store
            .set_active_leaf(conversation, Some(&MessageId::from("m5")))
            .await
            .unwrap();

        let deleted = store
            .delete_message(conversation, &MessageId::from("m4"))
            .await
            .unwrap();
        assert_eq!(deleted, vec![MessageId::from("m4"), MessageId::from("m5")]);

        let response = store
            .fetch_path(conversation, &PathQuery::canonical())
            .await
            .unwrap();
        assert_eq!(ids(&response.messages), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn save_rejects_duplicates_and_orphans() {
        let (store, conversation) = forked();

        let duplicate = Message::user(None, "again").with_id("m1");
        assert!(matches!(
            store.save_message(conversation, &duplicate).await,
            Err(ApiError::Conflict { .. })
        ));

        let orphan = Message::user(Some(MessageId::from("ghost")), "x");
        assert!(matches!(
            store.save_message(conversation, &orphan).await,
            Err(ApiError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn user_messages_cannot_be_updated_in_place() {
        let (store, conversation) = forked();
        let result = store
            .update_message(conversation, &MessageId::from("m1"), &[MessagePart::text("x")])
            .await;
        assert!(matches!(result, Err(ApiError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = InMemoryConversationStore::open(&path).await.unwrap();
        let conversation = store.create_conversation().await.unwrap();
        store
            .save_message(conversation, &Message::user(None, "persisted").with_id("p1"))
            .await
            .unwrap();

        let reopened = InMemoryConversationStore::open(&path).await.unwrap();
        let response = reopened
            .fetch_path(conversation, &PathQuery::canonical())
            .await
            .unwrap();
        assert_eq!(ids(&response.messages), vec!["p1"]);
    }

    #[tokio::test]
    async fn concurrent_saves_leave_a_complete_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = InMemoryConversationStore::open(&path).await.unwrap();
        let conversation = store.create_conversation().await.unwrap();
        let messages: Vec<Message> = (0..16)
            .map(|n| Message::user(None, format!("root {n}")).with_id(format!("r{n:02}")))
            .collect();
        let results = futures::future::join_all(
            messages
                .iter()
                .map(|message| store.save_message(conversation, message)),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));

        assert!(!path.with_extension("json.tmp").exists());
        let reopened = InMemoryConversationStore::open(&path).await.unwrap();
        let snapshot = reopened.snapshot().unwrap();
        let mut saved = ids(&snapshot.conversations[&conversation].messages);
        saved.sort();
        let expected: Vec<String> = (0..16).map(|n| format!("r{n:02}")).collect();
        assert_eq!(saved, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = InMemoryConversationStore::new();
        let result = store.fetch_branches(ConversationId::new()).await;
        assert!(matches!(result, Err(ApiError::NotFound { .. })));
    }
}
