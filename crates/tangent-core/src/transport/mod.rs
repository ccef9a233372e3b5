//! Boundary with the append-only response stream.
//!
//! A transport turns a generation request into a stream of events. The
//! session is the only consumer and the only writer of the results into the
//! message store.

pub mod scripted;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::ApiError;
use crate::app::conversation::{ContentDelta, Message};
use crate::app::domain::types::{ConversationId, MessageId, OpId};

pub use scripted::{ReplyScript, ScriptedTransport};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Generation failed: {message}")]
    Generation { message: String },

    #[error("Persistence failed: {0}")]
    Api(#[from] ApiError),

    #[error("Generation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: ConversationId,
    pub op_id: OpId,
    /// Parent of the assistant message about to be produced.
    pub parent_id: Option<MessageId>,
    /// A new user message to persist alongside the request (send and edit).
    pub user_message: Option<Message>,
    /// The path the model sees, oldest first, ending at `parent_id`.
    pub context: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Started { message: Message },
    Delta { message_id: MessageId, delta: ContentDelta },
    Finished { message_id: MessageId },
    Failed { error: String },
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn generate(
        &self,
        request: GenerationRequest,
        token: CancellationToken,
    ) -> Result<GenerationStream, TransportError>;
}
