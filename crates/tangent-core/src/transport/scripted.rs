use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{GenerationRequest, GenerationStream, StreamEvent, StreamTransport, TransportError};
use crate::api::ConversationApi;
use crate::app::conversation::{ContentDelta, Message, MessagePart, Role};

/// What the scripted persona answers.
#[derive(Debug, Clone)]
pub enum ReplyScript {
    /// Quote the last user message back.
    Echo,
    /// Cycle through fixed replies.
    Canned(Vec<String>),
}

/// Local transport that streams a scripted reply word by word and persists
/// both sides of the exchange through the conversation API.
pub struct ScriptedTransport {
    api: Arc<dyn ConversationApi>,
    script: ReplyScript,
    chunk_delay: Duration,
    turn: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(api: Arc<dyn ConversationApi>, script: ReplyScript) -> Self {
        Self {
            api,
            script,
            chunk_delay: Duration::from_millis(30),
            turn: AtomicUsize::new(0),
        }
    }

    pub fn with_chunk_delay(mut self, chunk_delay: Duration) -> Self {
        self.chunk_delay = chunk_delay;
        self
    }

    fn reply_for(&self, request: &GenerationRequest) -> String {
        let turn = self.turn.fetch_add(1, Ordering::Relaxed);
        match &self.script {
            ReplyScript::Echo => {
                let prompt = request
                    .user_message
                    .as_ref()
                    .or_else(|| request.context.iter().rev().find(|m| m.is_user()))
                    .map(Message::extract_text)
                    .unwrap_or_default();
                if turn == 0 {
                    format!("You said: {prompt}")
                } else {
                    format!("You said: {prompt} (take {})", turn + 1)
                }
            }
            ReplyScript::Canned(replies) if replies.is_empty() => String::new(),
            ReplyScript::Canned(replies) => replies[turn % replies.len()].clone(),
        }
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn generate(
        &self,
        request: GenerationRequest,
        token: CancellationToken,
    ) -> Result<GenerationStream, TransportError> {
        let conversation = request.conversation_id;
        if let Some(user) = &request.user_message {
            self.api.save_message(conversation, user).await?;
        }
        if token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let reply = self.reply_for(&request);
        let message = Message::new(
            Role::Assistant,
            request.parent_id.clone(),
            Utc::now(),
            Vec::new(),
        );
        self.api.save_message(conversation, &message).await?;
        debug!(
            target: "scripted_transport::generate",
            op_id = %request.op_id,
            message_id = %message.id,
            "Streaming scripted reply"
        );

        let api = self.api.clone();
        let delay = self.chunk_delay;
        let chunks: Vec<String> = reply.split_inclusive(' ').map(str::to_string).collect();

        Ok(Box::pin(async_stream::stream! {
            let message_id = message.id.clone();
            yield StreamEvent::Started { message };

            let mut text = String::new();
            let mut cancelled = false;
            for chunk in chunks {
                tokio::select! {
                    () = token.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                text.push_str(&chunk);
                yield StreamEvent::Delta {
                    message_id: message_id.clone(),
                    delta: ContentDelta::Text(chunk),
                };
            }

            let parts = vec![MessagePart::text(text)];
            match api.update_message(conversation, &message_id, &parts).await {
                Ok(()) if cancelled => {
                    debug!(message_id = %message_id, "Persisted partial reply after stop");
                }
                Ok(()) => yield StreamEvent::Finished { message_id },
                Err(e) if cancelled => {
                    warn!(message_id = %message_id, error = %e, "Failed to persist partial reply");
                }
                Err(e) => yield StreamEvent::Failed { error: e.to_string() },
            }
        }))
    }
}
