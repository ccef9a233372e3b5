use chrono::{DateTime, Utc};

use crate::api::{ApiError, BranchMap, PathResponse};
use crate::app::conversation::{ContentDelta, Direction, Message, MessagePart, ParentKey};
use crate::app::domain::types::{MessageId, OpId, RequestId};

#[derive(Debug, Clone)]
pub enum Action {
    /// Seed the branch index from the server map or the local cache.
    Hydrate {
        branches: BranchMap,
    },

    SwitchBranch {
        request_id: RequestId,
        /// `None` asks for the canonical current path.
        target: Option<MessageId>,
        fork: ParentKey,
    },

    StepSibling {
        request_id: RequestId,
        message_id: MessageId,
        direction: Direction,
    },

    BranchPathLoaded {
        request_id: RequestId,
        result: Result<PathResponse, ApiError>,
    },

    SendMessage {
        op_id: OpId,
        message_id: MessageId,
        parts: Vec<MessagePart>,
        timestamp: DateTime<Utc>,
    },

    Regenerate {
        op_id: OpId,
        message_id: MessageId,
    },

    EditMessage {
        op_id: OpId,
        message_id: MessageId,
        new_message_id: MessageId,
        parts: Vec<MessagePart>,
        timestamp: DateTime<Utc>,
    },

    EditAsNew {
        request_id: RequestId,
        message_id: MessageId,
        new_message_id: MessageId,
        parts: Vec<MessagePart>,
        timestamp: DateTime<Utc>,
    },

    UpdateInPlace {
        request_id: RequestId,
        message_id: MessageId,
        parts: Vec<MessagePart>,
    },

    WriteCompleted {
        request_id: RequestId,
        result: Result<(), ApiError>,
    },

    DeleteSubtree {
        request_id: RequestId,
        message_id: MessageId,
    },

    DeleteCompleted {
        request_id: RequestId,
        result: Result<Vec<MessageId>, ApiError>,
    },

    LoadOlderHistory {
        request_id: RequestId,
    },

    HistoryLoaded {
        request_id: RequestId,
        result: Result<PathResponse, ApiError>,
    },

    StreamStarted {
        op_id: OpId,
        message: Message,
    },

    StreamDelta {
        op_id: OpId,
        message_id: MessageId,
        delta: ContentDelta,
    },

    StreamFinished {
        op_id: OpId,
        message_id: MessageId,
    },

    StreamFailed {
        op_id: OpId,
        error: String,
    },

    StopGeneration,
}

impl Action {
    /// Request id for actions that complete asynchronously.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Action::SwitchBranch { request_id, .. }
            | Action::StepSibling { request_id, .. }
            | Action::BranchPathLoaded { request_id, .. }
            | Action::EditAsNew { request_id, .. }
            | Action::UpdateInPlace { request_id, .. }
            | Action::WriteCompleted { request_id, .. }
            | Action::DeleteSubtree { request_id, .. }
            | Action::DeleteCompleted { request_id, .. }
            | Action::LoadOlderHistory { request_id }
            | Action::HistoryLoaded { request_id, .. } => Some(*request_id),
            Action::Hydrate { .. }
            | Action::SendMessage { .. }
            | Action::Regenerate { .. }
            | Action::EditMessage { .. }
            | Action::StreamStarted { .. }
            | Action::StreamDelta { .. }
            | Action::StreamFinished { .. }
            | Action::StreamFailed { .. }
            | Action::StopGeneration => None,
        }
    }
}
