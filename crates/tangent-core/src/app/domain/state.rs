use std::collections::HashMap;

use crate::app::conversation::{
    BranchIndex, Message, MessagePart, MessageStore, ParentKey, SiblingEntry, StreamStatus,
};
use crate::app::domain::types::{ConversationId, MessageId, OpId, RequestId};
use crate::session::ClientState;

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct SessionState {
    pub conversation_id: ConversationId,

    pub store: MessageStore,
    pub branches: BranchIndex,
    pub active_leaf: Option<MessageId>,

    pub navigation: Option<PendingSwitch>,
    pub history: HistoryState,

    pub stream: Option<ActiveStream>,

    pub pending_writes: HashMap<RequestId, PendingWrite>,
    pub pending_deletes: HashMap<RequestId, PendingDelete>,

    pub page_size: usize,
}

/// A branch fetch in flight. Only the newest one may land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSwitch {
    pub request_id: RequestId,
    pub target: Option<MessageId>,
    pub fork: ParentKey,
    /// The first result was inconsistent and the canonical path was requested.
    pub recovering: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryState {
    /// Older messages exist before the oldest loaded one.
    pub has_more: bool,
    pub in_flight: Option<RequestId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationKind {
    /// A reply to a freshly placed user message (send or edit).
    Reply,
    /// A new alternative for `previous`, which stays visible until the stream starts.
    Regenerate { previous: MessageId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStream {
    pub op_id: OpId,
    pub parent: Option<MessageId>,
    pub kind: GenerationKind,
    /// Known once the transport reports the stream started.
    pub message_id: Option<MessageId>,
    /// Restores the path if a reply fails before its first chunk.
    pub rollback: Option<ReplyRollback>,
}

/// The path as it was before a send or edit placed its user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRollback {
    pub path: Vec<Message>,
    pub active_leaf: Option<MessageId>,
    pub parent: ParentKey,
    pub message_id: MessageId,
}

/// Undo information for an optimistic write awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Fork {
        path: Vec<Message>,
        active_leaf: Option<MessageId>,
        parent: ParentKey,
        message_id: MessageId,
    },
    Update {
        message_id: MessageId,
        previous: Vec<MessagePart>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelete {
    pub message_id: MessageId,
    pub parent: ParentKey,
}

impl SessionState {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            store: MessageStore::new(),
            branches: BranchIndex::new(),
            active_leaf: None,
            navigation: None,
            history: HistoryState::default(),
            stream: None,
            pending_writes: HashMap::new(),
            pending_deletes: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn status(&self) -> StreamStatus {
        self.store.status()
    }

    pub fn is_busy(&self) -> bool {
        self.store.status().is_busy()
    }

    pub fn is_switching(&self) -> bool {
        self.navigation.is_some()
    }

    pub fn is_deleting(&self) -> bool {
        !self.pending_deletes.is_empty()
    }

    pub fn is_loading_more(&self) -> bool {
        self.history.in_flight.is_some()
    }

    pub fn client_state(&self) -> ClientState {
        ClientState {
            active_leaf: self.active_leaf.clone(),
            branches: self.branches.to_wire(),
        }
    }

    /// Register every message of a path at its parent's fork.
    pub fn register_path(&mut self, messages: &[Message]) {
        for message in messages {
            self.branches.register_sibling(
                ParentKey::of(message.parent_id()),
                SiblingEntry::new(message.id.clone(), message.created_at),
            );
        }
    }
}
