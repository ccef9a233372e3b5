//! Message types for conversation representation.
//!
//! This module contains the core message types used throughout the application:
//! - `Message` - a node of the conversation tree, linked to its parent by id
//! - `MessagePart` - typed content, opaque to the branching logic
//! - `Role` - who authored the message

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::app::domain::types::MessageId;

/// Role in the conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub mime_type: String,
    pub url: String,
}

/// One piece of message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    Media { media: MediaRef },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }
}

/// Incremental content produced while a response streams in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum ContentDelta {
    Text(String),
    Reasoning(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub parent_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(
        role: Role,
        parent_id: Option<MessageId>,
        created_at: DateTime<Utc>,
        parts: Vec<MessagePart>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            role,
            parent_id,
            created_at,
            parts,
        }
    }

    pub fn user(parent_id: Option<MessageId>, text: impl Into<String>) -> Self {
        Self::new(Role::User, parent_id, Utc::now(), vec![MessagePart::text(text)])
    }

    pub fn assistant(parent_id: Option<MessageId>, text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            parent_id,
            Utc::now(),
            vec![MessagePart::text(text)],
        )
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn parent_id(&self) -> Option<&MessageId> {
        self.parent_id.as_ref()
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Fold a streamed delta into the trailing part of matching kind, or start a new part.
    pub fn apply_delta(&mut self, delta: ContentDelta) {
        match delta {
            ContentDelta::Text(chunk) => {
                if let Some(MessagePart::Text { text }) = self.parts.last_mut() {
                    text.push_str(&chunk);
                } else {
                    self.parts.push(MessagePart::Text { text: chunk });
                }
            }
            ContentDelta::Reasoning(chunk) => {
                if let Some(MessagePart::Reasoning { text }) = self.parts.last_mut() {
                    text.push_str(&chunk);
                } else {
                    self.parts.push(MessagePart::Reasoning { text: chunk });
                }
            }
        }
    }

    /// Extract text content from the message
    pub fn extract_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Reasoning { .. } | MessagePart::Media { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Get a string representation of the message content
    pub fn content_string(&self) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                MessagePart::Text { text } => text.clone(),
                MessagePart::Reasoning { text } => format!("[Reasoning: {text}]"),
                MessagePart::Media { media } => format!("[Media: {}]", media.mime_type),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_extend_the_trailing_part_of_the_same_kind() {
        let mut message = Message::new(Role::Assistant, None, Utc::now(), Vec::new());
        message.apply_delta(ContentDelta::Reasoning("think".to_string()));
        message.apply_delta(ContentDelta::Reasoning("ing".to_string()));
        message.apply_delta(ContentDelta::Text("Hel".to_string()));
        message.apply_delta(ContentDelta::Text("lo".to_string()));

        assert_eq!(
            message.parts,
            vec![
                MessagePart::Reasoning {
                    text: "thinking".to_string()
                },
                MessagePart::text("Hello"),
            ]
        );
        assert_eq!(message.extract_text(), "Hello");
    }

    #[test]
    fn wire_format_uses_camel_case_fields() {
        let message = Message::user(None, "hi").with_id("m1");
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["id"], "m1");
        assert_eq!(json["role"], "user");
        assert!(json["parentId"].is_null());
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["parts"][0]["type"], "text");
    }
}
