use crate::api::PathQuery;
use crate::app::conversation::{Message, MessagePart};
use crate::app::domain::types::{MessageId, OpId, RequestId};
use crate::session::ClientState;
use crate::transport::GenerationRequest;

use super::event::SessionEvent;

#[derive(Debug, Clone)]
pub enum Effect {
    EmitEvent {
        event: SessionEvent,
    },

    FetchPath {
        request_id: RequestId,
        query: PathQuery,
    },

    FetchHistory {
        request_id: RequestId,
        query: PathQuery,
    },

    CancelRequest {
        request_id: RequestId,
    },

    StartGeneration {
        op_id: OpId,
        request: GenerationRequest,
    },

    CancelGeneration {
        op_id: OpId,
    },

    SaveMessage {
        request_id: RequestId,
        message: Message,
    },

    UpdateMessage {
        request_id: RequestId,
        message_id: MessageId,
        parts: Vec<MessagePart>,
    },

    DeleteMessage {
        request_id: RequestId,
        message_id: MessageId,
    },

    /// Cache navigation state locally and report the active leaf to the server.
    PersistClientState {
        state: ClientState,
    },
}
