use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ApiError, BranchMap, ConversationApi, PathQuery, PathResponse};
use crate::app::conversation::{Message, MessagePart};
use crate::app::domain::types::{ConversationId, MessageId};
use crate::session::{ClientState, ClientStateError, ClientStateStore};
use crate::transport::{GenerationRequest, GenerationStream, StreamTransport, TransportError};

/// Runs the I/O side of effects for one conversation.
#[derive(Clone)]
pub struct EffectInterpreter {
    conversation_id: ConversationId,
    api: Arc<dyn ConversationApi>,
    transport: Arc<dyn StreamTransport>,
    client_state: Arc<dyn ClientStateStore>,
}

impl EffectInterpreter {
    pub fn new(
        conversation_id: ConversationId,
        api: Arc<dyn ConversationApi>,
        transport: Arc<dyn StreamTransport>,
        client_state: Arc<dyn ClientStateStore>,
    ) -> Self {
        Self {
            conversation_id,
            api,
            transport,
            client_state,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub async fn fetch_path(&self, query: &PathQuery) -> Result<PathResponse, ApiError> {
        self.api.fetch_path(self.conversation_id, query).await
    }

    pub async fn fetch_branches(&self) -> Result<BranchMap, ApiError> {
        self.api.fetch_branches(self.conversation_id).await
    }

    pub async fn save_message(&self, message: &Message) -> Result<(), ApiError> {
        self.api.save_message(self.conversation_id, message).await
    }

    pub async fn update_message(
        &self,
        message_id: &MessageId,
        parts: &[MessagePart],
    ) -> Result<(), ApiError> {
        self.api
            .update_message(self.conversation_id, message_id, parts)
            .await
    }

    pub async fn delete_message(&self, message_id: &MessageId) -> Result<Vec<MessageId>, ApiError> {
        self.api
            .delete_message(self.conversation_id, message_id)
            .await
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
        token: CancellationToken,
    ) -> Result<GenerationStream, TransportError> {
        self.transport.generate(request, token).await
    }

    pub async fn load_client_state(&self) -> Result<Option<ClientState>, ClientStateError> {
        self.client_state.load(self.conversation_id).await
    }

    /// Cache `state` locally and report its active leaf to the server.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn persist_client_state(&self, state: &ClientState) {
        if let Err(e) = self.client_state.save(self.conversation_id, state).await {
            warn!(
                target: "interpreter::persist_client_state",
                conversation_id = %self.conversation_id,
                error = %e,
                "Failed to cache client state"
            );
        }

        match self
            .api
            .set_active_leaf(self.conversation_id, state.active_leaf.as_ref())
            .await
        {
            Ok(()) => debug!(
                target: "interpreter::persist_client_state",
                conversation_id = %self.conversation_id,
                leaf = ?state.active_leaf,
                "Reported active leaf"
            ),
            Err(e) => warn!(
                target: "interpreter::persist_client_state",
                conversation_id = %self.conversation_id,
                error = %e,
                "Failed to report active leaf"
            ),
        }
    }
}
