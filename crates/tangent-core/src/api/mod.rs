//! Boundary with the persistence server.
//!
//! The server is the single authoritative store of the conversation tree. The
//! client only ever asks it for root→leaf paths, the precomputed sibling map,
//! and confirms destructive or content-changing operations through it.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::app::conversation::{Message, MessagePart, SiblingEntry};
use crate::app::domain::types::{ConversationId, MessageId};

pub use http::HttpConversationClient;
pub use memory::InMemoryConversationStore;

/// Sibling lists keyed by parent message id, or `"root"`.
pub type BranchMap = BTreeMap<String, Vec<SiblingEntry>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Server returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Storage I/O error: {message}")]
    Io { message: String },

    #[error("Store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }
}

/// Parameters of `GET /messages`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathQuery {
    /// Start of the lookup; `None` asks for the canonical current path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Return only the ancestors strictly before `message_id` (history pages).
    #[serde(default)]
    pub strict: bool,
    /// Keep only the newest `limit` messages of the path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl PathQuery {
    pub fn canonical() -> Self {
        Self::default()
    }

    pub fn through(message_id: MessageId) -> Self {
        Self {
            message_id: Some(message_id),
            ..Self::default()
        }
    }

    pub fn before(message_id: MessageId, limit: usize) -> Self {
        Self {
            message_id: Some(message_id),
            strict: true,
            limit: Some(limit),
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResponse {
    pub messages: Vec<Message>,
    pub leaf_id: Option<MessageId>,
    /// Older messages exist before the first one returned.
    #[serde(default)]
    pub has_more: bool,
}

impl PathResponse {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            leaf_id: None,
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchesResponse {
    pub branches: BranchMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessageRequest {
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessageResponse {
    pub deleted: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLeafRequest {
    pub leaf_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    pub id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn create_conversation(&self) -> Result<ConversationId, ApiError>;

    async fn fetch_path(
        &self,
        conversation: ConversationId,
        query: &PathQuery,
    ) -> Result<PathResponse, ApiError>;

    async fn fetch_branches(&self, conversation: ConversationId) -> Result<BranchMap, ApiError>;

    async fn save_message(
        &self,
        conversation: ConversationId,
        message: &Message,
    ) -> Result<(), ApiError>;

    async fn update_message(
        &self,
        conversation: ConversationId,
        message_id: &MessageId,
        parts: &[MessagePart],
    ) -> Result<(), ApiError>;

    /// Delete `message_id` and its descendants; returns every removed id.
    async fn delete_message(
        &self,
        conversation: ConversationId,
        message_id: &MessageId,
    ) -> Result<Vec<MessageId>, ApiError>;

    async fn set_active_leaf(
        &self,
        conversation: ConversationId,
        leaf: Option<&MessageId>,
    ) -> Result<(), ApiError>;
}
