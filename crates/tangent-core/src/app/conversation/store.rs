//! MessageStore - the materialized root→leaf path currently being viewed.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use strum_macros::Display;
use thiserror::Error;
use tracing::debug;

use super::message::{ContentDelta, Message, MessagePart};
use super::subtree::collect_subtree;
use crate::app::domain::types::MessageId;

/// Status of the streaming transport as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Ready,
    Submitted,
    Streaming,
    Error,
}

impl StreamStatus {
    /// A response is in flight; mutating the tree now would tear it.
    pub fn is_busy(self) -> bool {
        matches!(self, StreamStatus::Submitted | StreamStatus::Streaming)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("message {child} at position {index} is not a child of {expected}")]
    Disconnected {
        index: usize,
        child: MessageId,
        expected: MessageId,
    },

    #[error("message {id} appears more than once in the path")]
    Duplicate { id: MessageId },

    #[error("path starts at {id}, which is not a root message")]
    NotRooted { id: MessageId },

    #[error("leaf {leaf} does not match the last message {last}")]
    LeafMismatch { leaf: MessageId, last: MessageId },

    #[error("leaf {leaf} returned for an empty path")]
    UnexpectedLeaf { leaf: MessageId },

    #[error("target {target} is missing from the returned path")]
    MissingTarget { target: MessageId },
}

/// Check that every message in `messages` is the child of the one before it.
///
/// With `rooted`, the first message must also be a root message (no older
/// history left to load).
pub fn validate_path(messages: &[Message], rooted: bool) -> Result<(), PathError> {
    let mut seen = HashSet::with_capacity(messages.len());
    for (index, message) in messages.iter().enumerate() {
        if !seen.insert(message.id()) {
            return Err(PathError::Duplicate {
                id: message.id.clone(),
            });
        }
        if index == 0 {
            if rooted && message.parent_id.is_some() {
                return Err(PathError::NotRooted {
                    id: message.id.clone(),
                });
            }
            continue;
        }
        let previous = &messages[index - 1];
        if message.parent_id() != Some(previous.id()) {
            return Err(PathError::Disconnected {
                index,
                child: message.id.clone(),
                expected: previous.id.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    status: StreamStatus,
    /// Bumped on every mutation for dirty tracking
    revision: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            status: StreamStatus::Ready,
            revision: 0,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Returns `true` if the status changed.
    pub fn set_status(&mut self, status: StreamStatus) -> bool {
        if self.status == status {
            return false;
        }
        debug!(target: "message_store::status", from = %self.status, to = %status, "Status change");
        self.status = status;
        self.revision += 1;
        true
    }

    pub fn leaf(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn leaf_id(&self) -> Option<&MessageId> {
        self.messages.last().map(Message::id)
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn oldest_id(&self) -> Option<&MessageId> {
        self.messages.first().map(Message::id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id() == id)
    }

    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    /// Messages from the oldest loaded one up to and including `id`.
    pub fn path_through(&self, id: &MessageId) -> Option<&[Message]> {
        let position = self.position(id)?;
        Some(&self.messages[..=position])
    }

    /// Replace the whole active path.
    pub fn replace(&mut self, messages: Vec<Message>) {
        debug!(target: "message_store::replace", count = messages.len(), "Replacing active path");
        self.messages = messages;
        self.revision += 1;
    }

    pub fn clear(&mut self) {
        self.replace(Vec::new());
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.revision += 1;
    }

    /// Append a message, or overwrite the tail if it already carries this id.
    pub fn upsert_tail(&mut self, message: Message) {
        match self.messages.last_mut() {
            Some(last) if last.id == message.id => *last = message,
            _ => self.messages.push(message),
        }
        self.revision += 1;
    }

    pub fn apply_delta(&mut self, id: &MessageId, delta: ContentDelta) -> bool {
        let Some(message) = self.messages.iter_mut().rev().find(|m| m.id() == id) else {
            return false;
        };
        message.apply_delta(delta);
        self.revision += 1;
        true
    }

    /// Splice older history onto the front; ids already present are skipped.
    ///
    /// Returns the number of messages inserted.
    pub fn prepend(&mut self, older: Vec<Message>) -> usize {
        let present: HashSet<MessageId> = self.messages.iter().map(|m| m.id.clone()).collect();
        let fresh: Vec<Message> = older
            .into_iter()
            .filter(|m| !present.contains(m.id()))
            .collect();
        let count = fresh.len();
        if count > 0 {
            self.messages.splice(0..0, fresh);
            self.revision += 1;
        }
        count
    }

    /// Drop `id` and everything after it from the active path.
    pub fn truncate_from(&mut self, id: &MessageId) -> Vec<Message> {
        let Some(position) = self.position(id) else {
            return Vec::new();
        };
        let removed = self.messages.split_off(position);
        self.revision += 1;
        removed
    }

    /// Substitute `replacement` for `id`, discarding everything after it.
    pub fn replace_from(&mut self, id: &MessageId, replacement: Message) -> Vec<Message> {
        let removed = self.truncate_from(id);
        self.push(replacement);
        removed
    }

    /// Overwrite the content of `id` in place, returning the previous parts.
    pub fn update_parts(&mut self, id: &MessageId, parts: Vec<MessagePart>) -> Option<Vec<MessagePart>> {
        let message = self.messages.iter_mut().find(|m| m.id() == id)?;
        let previous = std::mem::replace(&mut message.parts, parts);
        self.revision += 1;
        Some(previous)
    }

    /// Remove `id` and all of its descendants in a single filter pass.
    pub fn delete_subtree(&mut self, id: &MessageId) -> HashSet<MessageId> {
        let doomed = collect_subtree(&self.messages, id);
        let before = self.messages.len();
        self.messages.retain(|m| !doomed.contains(m.id()));
        if self.messages.len() != before {
            self.revision += 1;
        }
        doomed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::conversation::message::Role;
    use proptest::prelude::*;
    use rstest::rstest;

    fn chain(ids: &[&str]) -> Vec<Message> {
        let mut parent: Option<MessageId> = None;
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                let mut message = Message::user(parent.clone(), *id).with_id(*id);
                message.role = role;
                parent = Some(message.id.clone());
                message
            })
            .collect()
    }

    fn ids(store: &MessageStore) -> Vec<&str> {
        store.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn busy_statuses() {
        assert!(!StreamStatus::Ready.is_busy());
        assert!(StreamStatus::Submitted.is_busy());
        assert!(StreamStatus::Streaming.is_busy());
        assert!(!StreamStatus::Error.is_busy());
    }

    #[rstest]
    #[case::empty(&[], true)]
    #[case::single(&["m1"], true)]
    #[case::chain(&["m1", "m2", "m3"], true)]
    fn valid_chains_pass(#[case] path: &[&str], #[case] rooted: bool) {
        assert_eq!(validate_path(&chain(path), rooted), Ok(()));
    }

    #[test]
    fn disconnected_path_is_rejected() {
        let mut messages = chain(&["m1", "m2", "m3"]);
        messages[2].parent_id = Some(MessageId::from("elsewhere"));
        assert!(matches!(
            validate_path(&messages, true),
            Err(PathError::Disconnected { index: 2, .. })
        ));
    }

    #[test]
    fn unrooted_page_is_only_rejected_when_rooted() {
        let messages = chain(&["m1", "m2", "m3"])[1..].to_vec();
        assert_eq!(validate_path(&messages, false), Ok(()));
        assert!(matches!(
            validate_path(&messages, true),
            Err(PathError::NotRooted { .. })
        ));
    }

    #[test]
    fn prepend_skips_overlap_and_keeps_order() {
        let all = chain(&["m1", "m2", "m3", "m4"]);
        let mut store = MessageStore::from_messages(all[2..].to_vec());

        let inserted = store.prepend(all[..3].to_vec());

        assert_eq!(inserted, 2);
        assert_eq!(ids(&store), vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(validate_path(store.messages(), true), Ok(()));
    }

    #[test]
    fn replace_from_discards_descendants() {
        let mut store = MessageStore::from_messages(chain(&["m1", "m2", "m3", "m4"]));
        let replacement = Message::assistant(Some(MessageId::from("m1")), "edited").with_id("m5");

        let removed = store.replace_from(&MessageId::from("m2"), replacement);

        assert_eq!(removed.len(), 3);
        assert_eq!(ids(&store), vec!["m1", "m5"]);
    }

    #[test]
    fn upsert_tail_overwrites_streaming_message() {
        let mut store = MessageStore::from_messages(chain(&["m1"]));
        let mut reply = Message::assistant(Some(MessageId::from("m1")), "Hel").with_id("m2");
        store.upsert_tail(reply.clone());
        reply.parts = vec![MessagePart::text("Hello")];
        store.upsert_tail(reply);

        assert_eq!(store.len(), 2);
        assert_eq!(store.leaf().unwrap().extract_text(), "Hello");
    }

    #[test]
    fn update_parts_returns_previous_content() {
        let mut store = MessageStore::from_messages(chain(&["m1", "m2"]));
        let previous = store
            .update_parts(&MessageId::from("m2"), vec![MessagePart::text("new")])
            .unwrap();
        assert_eq!(previous, vec![MessagePart::text("m2")]);
        assert_eq!(store.leaf().unwrap().extract_text(), "new");
        assert!(store
            .update_parts(&MessageId::from("missing"), Vec::new())
            .is_none());
    }

    #[test]
    fn delete_subtree_removes_tail_of_path() {
        let mut store = MessageStore::from_messages(chain(&["m1", "m2", "m3"]));
        let revision = store.revision();

        let removed = store.delete_subtree(&MessageId::from("m2"));

        assert_eq!(removed.len(), 2);
        assert_eq!(ids(&store), vec!["m1"]);
        assert!(store.revision() > revision);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_path_stays_connected_after_mutations(
            len in 1usize..20,
            cut in any::<prop::sample::Index>(),
            appended in 0usize..5,
        ) {
            let names: Vec<String> = (0..len).map(|i| format!("m{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut store = MessageStore::from_messages(chain(&refs));

            let target = store.messages()[cut.index(len)].id.clone();
            let parent = store.get(&target).and_then(|m| m.parent_id.clone());
            store.replace_from(&target, Message::user(parent, "edit").with_id("edited"));

            for i in 0..appended {
                let parent = store.leaf_id().cloned();
                store.push(Message::assistant(parent, "more").with_id(format!("extra{i}")));
            }

            prop_assert_eq!(validate_path(store.messages(), true), Ok(()));
        }
    }
}
