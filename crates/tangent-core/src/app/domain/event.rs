use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::app::conversation::{ContentDelta, Message, ParentKey, SiblingEntry, StreamStatus};
use crate::app::domain::types::{MessageId, OpId, RequestId};

/// Why the active path was swapped wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReplaceReason {
    Navigation,
    Recovery,
    Fork,
    Deletion,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GenerationOutcome {
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    PathReplaced {
        leaf: Option<MessageId>,
        reason: ReplaceReason,
    },

    /// Emitted before the fetch goes out so the viewport can pin the fork.
    BranchSwitchStarted {
        request_id: RequestId,
        fork: ParentKey,
        target: Option<MessageId>,
    },

    BranchSwitchCompleted {
        request_id: RequestId,
        leaf: Option<MessageId>,
    },

    BranchSwitchFailed {
        request_id: RequestId,
        error: String,
    },

    /// A newer request made this one irrelevant; its result will be dropped.
    RequestSuperseded {
        request_id: RequestId,
    },

    HistoryPrepended {
        request_id: RequestId,
        previous_oldest: MessageId,
        count: usize,
        has_more: bool,
    },

    HistoryFailed {
        request_id: RequestId,
        error: String,
    },

    MessageAppended {
        message: Message,
    },

    MessageChanged {
        message: Message,
    },

    MessageDelta {
        message_id: MessageId,
        delta: ContentDelta,
    },

    SiblingsChanged {
        parent: ParentKey,
        siblings: Vec<SiblingEntry>,
    },

    StatusChanged {
        status: StreamStatus,
    },

    GenerationFinished {
        op_id: OpId,
        message_id: Option<MessageId>,
        outcome: GenerationOutcome,
    },

    WriteConfirmed {
        request_id: RequestId,
        message_id: MessageId,
    },

    WriteFailed {
        request_id: RequestId,
        message_id: MessageId,
        error: String,
    },

    SubtreeDeleted {
        request_id: RequestId,
        message_id: MessageId,
        removed: Vec<MessageId>,
    },

    DeleteFailed {
        request_id: RequestId,
        message_id: MessageId,
        error: String,
    },

    Notice {
        level: NoticeLevel,
        message: String,
    },
}

impl SessionEvent {
    /// The request this event settles, if it is the last word on one.
    pub fn settles(&self) -> Option<RequestId> {
        match self {
            SessionEvent::BranchSwitchCompleted { request_id, .. }
            | SessionEvent::BranchSwitchFailed { request_id, .. }
            | SessionEvent::RequestSuperseded { request_id }
            | SessionEvent::HistoryPrepended { request_id, .. }
            | SessionEvent::HistoryFailed { request_id, .. }
            | SessionEvent::WriteConfirmed { request_id, .. }
            | SessionEvent::WriteFailed { request_id, .. }
            | SessionEvent::SubtreeDeleted { request_id, .. }
            | SessionEvent::DeleteFailed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}
