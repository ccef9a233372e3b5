//! Registry of the alternatives that exist at each fork point.
//!
//! The index is a projection: it records which sibling ids exist under a parent
//! and in what order, never their content. It may hold ids that are no longer
//! materialized in the message store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::app::domain::types::MessageId;

/// Wire key used for messages without a parent.
pub const ROOT_PARENT_KEY: &str = "root";

/// A fork point: either the conversation root or a parent message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParentKey {
    Root,
    Message(MessageId),
}

impl ParentKey {
    pub fn of(parent_id: Option<&MessageId>) -> Self {
        parent_id.map_or(ParentKey::Root, |id| ParentKey::Message(id.clone()))
    }

    pub fn from_wire(key: &str) -> Self {
        if key == ROOT_PARENT_KEY {
            ParentKey::Root
        } else {
            ParentKey::Message(MessageId::from(key))
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            ParentKey::Root => ROOT_PARENT_KEY.to_string(),
            ParentKey::Message(id) => id.to_string(),
        }
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            ParentKey::Root => None,
            ParentKey::Message(id) => Some(id),
        }
    }
}

impl From<Option<MessageId>> for ParentKey {
    fn from(value: Option<MessageId>) -> Self {
        value.map_or(ParentKey::Root, ParentKey::Message)
    }
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiblingEntry {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

impl SiblingEntry {
    pub fn new(id: MessageId, created_at: DateTime<Utc>) -> Self {
        Self { id, created_at }
    }
}

/// Where a sibling sits among its alternatives; `index` is zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingPosition {
    pub index: usize,
    pub total: usize,
}

impl fmt::Display for SiblingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.index + 1, self.total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

#[derive(Debug, Clone)]
struct Slot {
    entry: SiblingEntry,
    seq: u64,
}

impl Slot {
    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.entry.created_at, self.seq)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BranchIndex {
    forks: HashMap<ParentKey, Vec<Slot>>,
    next_seq: u64,
}

impl BranchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from the server's precomputed `branches` map.
    pub fn from_wire(branches: &BTreeMap<String, Vec<SiblingEntry>>) -> Self {
        let mut index = Self::new();
        index.merge_wire(branches);
        index
    }

    /// Register every entry of a wire map; existing ids are left in place.
    pub fn merge_wire(&mut self, branches: &BTreeMap<String, Vec<SiblingEntry>>) {
        for (key, entries) in branches {
            let key = ParentKey::from_wire(key);
            for entry in entries {
                self.register_sibling(key.clone(), entry.clone());
            }
        }
    }

    pub fn to_wire(&self) -> BTreeMap<String, Vec<SiblingEntry>> {
        self.forks
            .iter()
            .map(|(key, slots)| {
                (
                    key.to_wire(),
                    slots.iter().map(|slot| slot.entry.clone()).collect(),
                )
            })
            .collect()
    }

    /// Insert `entry` under `parent`, keeping ascending `created_at` order.
    ///
    /// Returns `false` without touching the list if the id is already registered.
    pub fn register_sibling(&mut self, parent: ParentKey, entry: SiblingEntry) -> bool {
        let seq = self.next_seq;
        let slots = self.forks.entry(parent).or_default();
        if slots.iter().any(|slot| slot.entry.id == entry.id) {
            return false;
        }

        let slot = Slot { entry, seq };
        let at = slots.partition_point(|existing| existing.sort_key() <= slot.sort_key());
        slots.insert(at, slot);
        self.next_seq += 1;
        true
    }

    /// Register a fork produced by regenerate or edit: `previous` is the message
    /// being superseded and must order strictly before `next`.
    ///
    /// `next` is ordered no earlier than `previous`, whatever the clocks said;
    /// a tie falls back to registration order.
    pub fn register_successor(
        &mut self,
        parent: ParentKey,
        previous: SiblingEntry,
        next: SiblingEntry,
    ) {
        let previous_at = self
            .siblings(&parent)
            .iter()
            .find(|entry| entry.id == previous.id)
            .map_or(previous.created_at, |entry| entry.created_at);

        self.register_sibling(parent.clone(), previous);

        let mut next = next;
        if next.created_at < previous_at {
            debug!(
                target: "branch_index::register_successor",
                parent = %parent,
                next = %next.id,
                "Successor timestamp precedes the superseded sibling; clamping order"
            );
            next.created_at = previous_at;
        }
        self.register_sibling(parent, next);
    }

    /// Drop an entry registered by an optimistic operation that was rolled back.
    pub fn unregister(&mut self, parent: &ParentKey, id: &MessageId) -> bool {
        let Some(slots) = self.forks.get_mut(parent) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|slot| &slot.entry.id != id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            self.forks.remove(parent);
        }
        removed
    }

    /// Forget deleted messages: their entries and any fork keyed by them.
    pub fn prune(&mut self, removed: &HashSet<MessageId>) {
        self.forks.retain(|key, slots| {
            if key.message_id().is_some_and(|id| removed.contains(id)) {
                return false;
            }
            slots.retain(|slot| !removed.contains(&slot.entry.id));
            !slots.is_empty()
        });
    }

    pub fn siblings(&self, parent: &ParentKey) -> Vec<SiblingEntry> {
        self.forks
            .get(parent)
            .map(|slots| slots.iter().map(|slot| slot.entry.clone()).collect())
            .unwrap_or_default()
    }

    pub fn sibling_ids(&self, parent: &ParentKey) -> Vec<MessageId> {
        self.forks
            .get(parent)
            .map(|slots| slots.iter().map(|slot| slot.entry.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn sibling_count(&self, parent: &ParentKey) -> usize {
        self.forks.get(parent).map_or(0, Vec::len)
    }

    pub fn contains(&self, parent: &ParentKey, id: &MessageId) -> bool {
        self.forks
            .get(parent)
            .is_some_and(|slots| slots.iter().any(|slot| &slot.entry.id == id))
    }

    pub fn position(&self, parent: &ParentKey, id: &MessageId) -> Option<SiblingPosition> {
        let slots = self.forks.get(parent)?;
        let index = slots.iter().position(|slot| &slot.entry.id == id)?;
        Some(SiblingPosition {
            index,
            total: slots.len(),
        })
    }

    /// The fork `id` is registered under.
    pub fn parent_of(&self, id: &MessageId) -> Option<&ParentKey> {
        self.forks
            .iter()
            .find(|(_, slots)| slots.iter().any(|slot| &slot.entry.id == id))
            .map(|(key, _)| key)
    }

    /// The sibling before or after `id` at `parent`, if any.
    pub fn neighbor(
        &self,
        parent: &ParentKey,
        id: &MessageId,
        direction: Direction,
    ) -> Option<&MessageId> {
        let slots = self.forks.get(parent)?;
        let index = slots.iter().position(|slot| &slot.entry.id == id)?;
        let target = match direction {
            Direction::Previous => index.checked_sub(1)?,
            Direction::Next => index + 1,
        };
        slots.get(target).map(|slot| &slot.entry.id)
    }

    /// Fork points with more than one known alternative.
    pub fn fork_points(&self) -> impl Iterator<Item = &ParentKey> + '_ {
        self.forks
            .iter()
            .filter(|(_, slots)| slots.len() > 1)
            .map(|(key, _)| key)
    }

    pub fn is_empty(&self) -> bool {
        self.forks.is_empty()
    }
}
