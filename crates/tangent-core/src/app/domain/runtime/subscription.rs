use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::app::conversation::ContentDelta;
use crate::app::domain::event::SessionEvent;
use crate::app::domain::types::ConversationId;

#[derive(Debug, Clone)]
pub struct SessionEventEnvelope {
    pub seq: u64,
    pub event: SessionEvent,
}

/// One consumer's view of a session's events. Dropping it unsubscribes.
pub struct SessionEventSubscription {
    pub conversation_id: ConversationId,
    rx: broadcast::Receiver<SessionEventEnvelope>,
    /// Read ahead while coalescing and not yet handed out.
    held: Option<SessionEventEnvelope>,
    unsubscribe_tx: mpsc::UnboundedSender<UnsubscribeSignal>,
}

pub(crate) struct UnsubscribeSignal;

impl SessionEventSubscription {
    pub(crate) fn new(
        conversation_id: ConversationId,
        rx: broadcast::Receiver<SessionEventEnvelope>,
        unsubscribe_tx: mpsc::UnboundedSender<UnsubscribeSignal>,
    ) -> Self {
        Self {
            conversation_id,
            rx,
            held: None,
            unsubscribe_tx,
        }
    }

    /// Next event in order. `None` once the session has shut down.
    pub async fn recv(&mut self) -> Option<SessionEventEnvelope> {
        if let Some(envelope) = self.held.take() {
            return Some(envelope);
        }
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        target: "session::subscription",
                        conversation_id = %self.conversation_id,
                        lagged = n,
                        "Event subscriber lagged, some events were dropped"
                    );
                }
            }
        }
    }

    /// Like [`recv`](Self::recv), but folds already-queued chunks of the same
    /// streaming message into one `MessageDelta`.
    ///
    /// Consumers that redraw per event (a viewport, a terminal) fall behind a
    /// fast stream otherwise. Never waits for more chunks than are queued, and
    /// the merged envelope carries the sequence number of its last chunk.
    pub async fn recv_coalesced(&mut self) -> Option<SessionEventEnvelope> {
        let mut envelope = self.recv().await?;
        loop {
            let next = match self.rx.try_recv() {
                Ok(next) => next,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(
                        target: "session::subscription",
                        conversation_id = %self.conversation_id,
                        lagged = n,
                        "Event subscriber lagged while coalescing"
                    );
                    continue;
                }
                Err(_) => break,
            };
            if !coalesce(&mut envelope.event, &next.event) {
                self.held = Some(next);
                break;
            }
            envelope.seq = next.seq;
        }
        Some(envelope)
    }
}

/// Append `next` onto `into` when both are chunks of one kind for one message.
fn coalesce(into: &mut SessionEvent, next: &SessionEvent) -> bool {
    let (
        SessionEvent::MessageDelta {
            message_id,
            delta: current,
        },
        SessionEvent::MessageDelta {
            message_id: next_id,
            delta: incoming,
        },
    ) = (into, next)
    else {
        return false;
    };
    if *message_id != *next_id {
        return false;
    }
    match (current, incoming) {
        (ContentDelta::Text(text), ContentDelta::Text(more))
        | (ContentDelta::Reasoning(text), ContentDelta::Reasoning(more)) => {
            text.push_str(more);
            true
        }
        _ => false,
    }
}

impl Drop for SessionEventSubscription {
    fn drop(&mut self) {
        let _ = self.unsubscribe_tx.send(UnsubscribeSignal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::domain::event::GenerationOutcome;
    use crate::app::domain::types::{MessageId, OpId};

    fn subscription() -> (
        broadcast::Sender<SessionEventEnvelope>,
        mpsc::UnboundedReceiver<UnsubscribeSignal>,
        SessionEventSubscription,
    ) {
        let (tx, rx) = broadcast::channel(32);
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::unbounded_channel();
        let subscription = SessionEventSubscription::new(ConversationId::new(), rx, unsubscribe_tx);
        (tx, unsubscribe_rx, subscription)
    }

    fn delta(seq: u64, message_id: &str, delta: ContentDelta) -> SessionEventEnvelope {
        SessionEventEnvelope {
            seq,
            event: SessionEvent::MessageDelta {
                message_id: MessageId::from(message_id),
                delta,
            },
        }
    }

    fn text(seq: u64, message_id: &str, chunk: &str) -> SessionEventEnvelope {
        delta(seq, message_id, ContentDelta::Text(chunk.to_string()))
    }

    #[tokio::test]
    async fn queued_chunks_merge_into_one_delta() {
        let (tx, _unsubscribe, mut subscription) = subscription();
        tx.send(text(1, "m4", "Hel")).unwrap();
        tx.send(text(2, "m4", "lo, ")).unwrap();
        tx.send(text(3, "m4", "world")).unwrap();

        let merged = subscription.recv_coalesced().await.unwrap();
        assert_eq!(merged.seq, 3);
        assert!(matches!(
            merged.event,
            SessionEvent::MessageDelta { delta: ContentDelta::Text(ref t), .. } if t == "Hello, world"
        ));
    }

    #[tokio::test]
    async fn boundaries_are_kept_and_nothing_is_lost() {
        let (tx, _unsubscribe, mut subscription) = subscription();
        let op_id = OpId::new();
        tx.send(text(1, "m4", "a")).unwrap();
        tx.send(delta(2, "m4", ContentDelta::Reasoning("hmm".to_string())))
            .unwrap();
        tx.send(text(3, "m5", "b")).unwrap();
        tx.send(SessionEventEnvelope {
            seq: 4,
            event: SessionEvent::GenerationFinished {
                op_id,
                message_id: Some(MessageId::from("m5")),
                outcome: GenerationOutcome::Completed,
            },
        })
        .unwrap();
        drop(tx);

        let mut seqs = Vec::new();
        while let Some(envelope) = subscription.recv_coalesced().await {
            seqs.push(envelope.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn plain_recv_hands_out_a_held_event_first() {
        let (tx, _unsubscribe, mut subscription) = subscription();
        tx.send(text(1, "m4", "a")).unwrap();
        tx.send(text(2, "m5", "b")).unwrap();

        assert_eq!(subscription.recv_coalesced().await.unwrap().seq, 1);
        assert_eq!(subscription.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn dropping_unsubscribes() {
        let (_tx, mut unsubscribe, subscription) = subscription();
        drop(subscription);
        assert!(unsubscribe.recv().await.is_some());
    }
}
