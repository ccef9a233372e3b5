use std::collections::HashMap;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, PathQuery, PathResponse};
use crate::app::conversation::{Direction, MessagePart, ParentKey};
use crate::app::domain::action::Action;
use crate::app::domain::effect::Effect;
use crate::app::domain::event::SessionEvent;
use crate::app::domain::reduce::{InvalidActionKind, ReduceError, reduce};
use crate::app::domain::state::{DEFAULT_PAGE_SIZE, SessionState};
use crate::app::domain::types::{ConversationId, MessageId, OpId, RequestId};
use crate::session::ClientState;
use crate::transport::{GenerationRequest, StreamEvent, TransportError};

use super::interpreter::EffectInterpreter;
use super::subscription::{SessionEventEnvelope, SessionEventSubscription, UnsubscribeSignal};

const EVENT_BROADCAST_CAPACITY: usize = 256;

type Waiter = oneshot::Sender<Result<SessionEvent, SessionError>>;

pub(crate) enum SessionCmd {
    Dispatch {
        action: Box<Action>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Dispatch and hold the reply until the request settles.
    Request {
        action: Box<Action>,
        reply: Waiter,
    },
    Hydrate {
        reply: oneshot::Sender<Result<Option<MessageId>, SessionError>>,
    },
    Subscribe {
        reply: oneshot::Sender<SessionEventSubscription>,
    },
    GetState {
        reply: oneshot::Sender<SessionState>,
    },
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        kind: InvalidActionKind,
    },

    #[error("Reduce error: {message}")]
    ReduceError { message: String },

    #[error("Branch switch failed: {message}")]
    Navigation { message: String },

    #[error("Delete failed: {message}")]
    Deletion { message: String },

    #[error("Save failed: {message}")]
    Write { message: String },

    #[error("Loading older messages failed: {message}")]
    History { message: String },

    #[error("Persistence error: {0}")]
    Api(#[from] ApiError),

    #[error("Session shutting down")]
    ShuttingDown,

    #[error("Channel closed")]
    ChannelClosed,
}

impl SessionError {
    pub fn kind(&self) -> Option<InvalidActionKind> {
        match self {
            SessionError::InvalidInput { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    fn unexpected(event: &SessionEvent) -> Self {
        SessionError::ReduceError {
            message: format!("Unexpected settlement: {event:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Applied { leaf: Option<MessageId> },
    /// A newer switch replaced this one before its path arrived.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Prepended { count: usize, has_more: bool },
    Superseded,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub page_size: usize,
    pub event_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            event_capacity: EVENT_BROADCAST_CAPACITY,
        }
    }
}

/// Client-side handle to one conversation's session actor.
#[derive(Clone)]
pub struct SessionHandle {
    conversation_id: ConversationId,
    cmd_tx: mpsc::Sender<SessionCmd>,
}

impl SessionHandle {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub async fn dispatch(&self, action: Action) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCmd::Dispatch {
                action: Box::new(action),
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    async fn request(&self, action: Action) -> Result<SessionEvent, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCmd::Request {
                action: Box::new(action),
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ShuttingDown)?
    }

    /// Seed the branch index and load the path to show.
    ///
    /// The locally cached leaf wins over the server's; if it no longer
    /// exists the canonical path is loaded instead.
    pub async fn open(&self) -> Result<SwitchOutcome, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCmd::Hydrate { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        let cached_leaf = reply_rx.await.map_err(|_| SessionError::ChannelClosed)??;

        if let Some(leaf) = cached_leaf {
            match self.switch_branch(Some(leaf.clone()), ParentKey::Root).await {
                Err(SessionError::Navigation { message }) => {
                    warn!(
                        conversation_id = %self.conversation_id,
                        leaf = %leaf,
                        error = %message,
                        "Cached leaf could not be loaded; falling back to the current path"
                    );
                }
                other => return other,
            }
        }
        self.switch_branch(None, ParentKey::Root).await
    }

    pub async fn switch_branch(
        &self,
        target: Option<MessageId>,
        fork: ParentKey,
    ) -> Result<SwitchOutcome, SessionError> {
        let event = self
            .request(Action::SwitchBranch {
                request_id: RequestId::new(),
                target,
                fork,
            })
            .await?;
        switch_outcome(event)
    }

    pub async fn step_sibling(
        &self,
        message_id: MessageId,
        direction: Direction,
    ) -> Result<SwitchOutcome, SessionError> {
        let event = self
            .request(Action::StepSibling {
                request_id: RequestId::new(),
                message_id,
                direction,
            })
            .await?;
        switch_outcome(event)
    }

    pub async fn send_message(&self, parts: Vec<MessagePart>) -> Result<OpId, SessionError> {
        let op_id = OpId::new();
        self.dispatch(Action::SendMessage {
            op_id,
            message_id: MessageId::new(),
            parts,
            timestamp: Utc::now(),
        })
        .await?;
        Ok(op_id)
    }

    pub async fn regenerate(&self, message_id: MessageId) -> Result<OpId, SessionError> {
        let op_id = OpId::new();
        self.dispatch(Action::Regenerate { op_id, message_id })
            .await?;
        Ok(op_id)
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        parts: Vec<MessagePart>,
    ) -> Result<OpId, SessionError> {
        let op_id = OpId::new();
        self.dispatch(Action::EditMessage {
            op_id,
            message_id,
            new_message_id: MessageId::new(),
            parts,
            timestamp: Utc::now(),
        })
        .await?;
        Ok(op_id)
    }

    /// Replace an assistant message with new content on a new branch.
    ///
    /// Resolves with the new message id once the server has stored it.
    pub async fn edit_as_new(
        &self,
        message_id: MessageId,
        parts: Vec<MessagePart>,
    ) -> Result<MessageId, SessionError> {
        let event = self
            .request(Action::EditAsNew {
                request_id: RequestId::new(),
                message_id,
                new_message_id: MessageId::new(),
                parts,
                timestamp: Utc::now(),
            })
            .await?;
        match event {
            SessionEvent::WriteConfirmed { message_id, .. } => Ok(message_id),
            SessionEvent::WriteFailed { error, .. } => Err(SessionError::Write { message: error }),
            other => Err(SessionError::unexpected(&other)),
        }
    }

    pub async fn update_in_place(
        &self,
        message_id: MessageId,
        parts: Vec<MessagePart>,
    ) -> Result<(), SessionError> {
        let event = self
            .request(Action::UpdateInPlace {
                request_id: RequestId::new(),
                message_id,
                parts,
            })
            .await?;
        match event {
            SessionEvent::WriteConfirmed { .. } => Ok(()),
            SessionEvent::WriteFailed { error, .. } => Err(SessionError::Write { message: error }),
            other => Err(SessionError::unexpected(&other)),
        }
    }

    /// Delete `message_id` and its descendants once the server agrees.
    pub async fn delete_subtree(&self, message_id: MessageId) -> Result<Vec<MessageId>, SessionError> {
        let event = self
            .request(Action::DeleteSubtree {
                request_id: RequestId::new(),
                message_id,
            })
            .await?;
        match event {
            SessionEvent::SubtreeDeleted { removed, .. } => Ok(removed),
            SessionEvent::DeleteFailed { error, .. } => {
                Err(SessionError::Deletion { message: error })
            }
            other => Err(SessionError::unexpected(&other)),
        }
    }

    pub async fn load_older(&self) -> Result<HistoryOutcome, SessionError> {
        let event = self
            .request(Action::LoadOlderHistory {
                request_id: RequestId::new(),
            })
            .await?;
        match event {
            SessionEvent::HistoryPrepended {
                count, has_more, ..
            } => Ok(HistoryOutcome::Prepended { count, has_more }),
            SessionEvent::RequestSuperseded { .. } => Ok(HistoryOutcome::Superseded),
            SessionEvent::HistoryFailed { error, .. } => {
                Err(SessionError::History { message: error })
            }
            other => Err(SessionError::unexpected(&other)),
        }
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.dispatch(Action::StopGeneration).await
    }

    pub async fn subscribe(&self) -> Result<SessionEventSubscription, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCmd::Subscribe { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    pub async fn state(&self) -> Result<SessionState, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCmd::GetState { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(SessionCmd::Shutdown);
    }
}

fn switch_outcome(event: SessionEvent) -> Result<SwitchOutcome, SessionError> {
    match event {
        SessionEvent::BranchSwitchCompleted { leaf, .. } => Ok(SwitchOutcome::Applied { leaf }),
        SessionEvent::RequestSuperseded { .. } => Ok(SwitchOutcome::Superseded),
        SessionEvent::BranchSwitchFailed { error, .. } => {
            Err(SessionError::Navigation { message: error })
        }
        other => Err(SessionError::unexpected(&other)),
    }
}

struct SessionActor {
    conversation_id: ConversationId,
    state: SessionState,
    interpreter: EffectInterpreter,
    active_requests: HashMap<RequestId, CancellationToken>,
    active_generations: HashMap<OpId, CancellationToken>,
    waiters: HashMap<RequestId, Waiter>,
    event_broadcast: broadcast::Sender<SessionEventEnvelope>,
    next_seq: u64,
    subscriber_count: usize,
    unsubscribe_rx: mpsc::UnboundedReceiver<UnsubscribeSignal>,
    unsubscribe_tx: mpsc::UnboundedSender<UnsubscribeSignal>,
    internal_action_tx: mpsc::Sender<Action>,
    internal_action_rx: mpsc::Receiver<Action>,
    persist_tx: mpsc::UnboundedSender<ClientState>,
}

impl SessionActor {
    fn new(
        state: SessionState,
        interpreter: EffectInterpreter,
        event_capacity: usize,
        persist_tx: mpsc::UnboundedSender<ClientState>,
    ) -> Self {
        let (event_broadcast, _) = broadcast::channel(event_capacity.max(1));
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::unbounded_channel();
        let (internal_action_tx, internal_action_rx) = mpsc::channel(64);

        Self {
            conversation_id: state.conversation_id,
            state,
            interpreter,
            active_requests: HashMap::new(),
            active_generations: HashMap::new(),
            waiters: HashMap::new(),
            event_broadcast,
            next_seq: 0,
            subscriber_count: 0,
            unsubscribe_rx,
            unsubscribe_tx,
            internal_action_tx,
            internal_action_rx,
            persist_tx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCmd>) {
        info!(conversation_id = %self.conversation_id, "Session started");

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCmd::Dispatch { action, reply }) => {
                            let result = self.handle_action(*action);
                            let _ = reply.send(result);
                        }
                        Some(SessionCmd::Request { action, reply }) => {
                            self.handle_request(*action, reply);
                        }
                        Some(SessionCmd::Hydrate { reply }) => {
                            let result = self.hydrate().await;
                            let _ = reply.send(result);
                        }
                        Some(SessionCmd::Subscribe { reply }) => {
                            let subscription = self.create_subscription();
                            let _ = reply.send(subscription);
                        }
                        Some(SessionCmd::GetState { reply }) => {
                            let _ = reply.send(self.state.clone());
                        }
                        Some(SessionCmd::Shutdown) | None => {
                            self.cancel_all_operations();
                            break;
                        }
                    }
                }

                Some(action) = self.internal_action_rx.recv() => {
                    if let Err(e) = self.handle_action(action) {
                        error!(
                            conversation_id = %self.conversation_id,
                            error = %e,
                            "Failed to handle internal action"
                        );
                    }
                }

                Some(UnsubscribeSignal) = self.unsubscribe_rx.recv() => {
                    self.subscriber_count = self.subscriber_count.saturating_sub(1);
                    debug!(
                        conversation_id = %self.conversation_id,
                        subscriber_count = self.subscriber_count,
                        "Subscriber disconnected"
                    );
                }
            }
        }

        debug!(conversation_id = %self.conversation_id, "Session actor stopped");
    }

    async fn hydrate(&mut self) -> Result<Option<MessageId>, SessionError> {
        let branches = self.interpreter.fetch_branches().await?;
        self.handle_action(Action::Hydrate { branches })?;

        let cached = match self.interpreter.load_client_state().await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    error = %e,
                    "Ignoring unreadable client state"
                );
                None
            }
        };
        let Some(cached) = cached else {
            return Ok(None);
        };

        self.handle_action(Action::Hydrate {
            branches: cached.branches,
        })?;
        Ok(cached.active_leaf)
    }

    fn handle_request(&mut self, action: Action, reply: Waiter) {
        let Some(request_id) = action.request_id() else {
            let _ = reply.send(Err(SessionError::ReduceError {
                message: "action does not settle asynchronously".to_string(),
            }));
            return;
        };

        self.waiters.insert(request_id, reply);
        if let Err(e) = self.handle_action(action)
            && let Some(reply) = self.waiters.remove(&request_id)
        {
            let _ = reply.send(Err(e));
        }
    }

    fn handle_action(&mut self, action: Action) -> Result<(), SessionError> {
        self.release_finished(&action);

        let effects = reduce(&mut self.state, action).map_err(|err| match err {
            ReduceError::InvalidAction { message, kind } => {
                SessionError::InvalidInput { message, kind }
            }
            ReduceError::Invariant { message } => SessionError::ReduceError { message },
        })?;

        for effect in effects {
            self.handle_effect(effect);
        }

        Ok(())
    }

    /// Results that finish a task release its cancellation token.
    fn release_finished(&mut self, action: &Action) {
        match action {
            Action::BranchPathLoaded { request_id, .. }
            | Action::HistoryLoaded { request_id, .. } => {
                self.active_requests.remove(request_id);
            }
            Action::StreamFinished { op_id, .. } | Action::StreamFailed { op_id, .. } => {
                self.active_generations.remove(op_id);
            }
            _ => {}
        }
    }

    fn handle_effect(&mut self, effect: Effect) {
        match effect {
            Effect::EmitEvent { event } => self.emit(event),

            Effect::FetchPath { request_id, query } => {
                self.spawn_fetch(request_id, query, |request_id, result| {
                    Action::BranchPathLoaded { request_id, result }
                });
            }

            Effect::FetchHistory { request_id, query } => {
                self.spawn_fetch(request_id, query, |request_id, result| {
                    Action::HistoryLoaded { request_id, result }
                });
            }

            Effect::CancelRequest { request_id } => {
                if let Some(token) = self.active_requests.remove(&request_id) {
                    debug!(
                        conversation_id = %self.conversation_id,
                        request_id = %request_id,
                        "Cancelling request"
                    );
                    token.cancel();
                }
            }

            Effect::StartGeneration { op_id, request } => self.spawn_generation(op_id, request),

            Effect::CancelGeneration { op_id } => {
                if let Some(token) = self.active_generations.remove(&op_id) {
                    debug!(
                        conversation_id = %self.conversation_id,
                        op_id = %op_id,
                        "Cancelling generation"
                    );
                    token.cancel();
                }
            }

            Effect::SaveMessage {
                request_id,
                message,
            } => {
                let interpreter = self.interpreter.clone();
                let action_tx = self.internal_action_tx.clone();
                tokio::spawn(async move {
                    let result = interpreter.save_message(&message).await;
                    let _ = action_tx
                        .send(Action::WriteCompleted { request_id, result })
                        .await;
                });
            }

            Effect::UpdateMessage {
                request_id,
                message_id,
                parts,
            } => {
                let interpreter = self.interpreter.clone();
                let action_tx = self.internal_action_tx.clone();
                tokio::spawn(async move {
                    let result = interpreter.update_message(&message_id, &parts).await;
                    let _ = action_tx
                        .send(Action::WriteCompleted { request_id, result })
                        .await;
                });
            }

            Effect::DeleteMessage {
                request_id,
                message_id,
            } => {
                let interpreter = self.interpreter.clone();
                let action_tx = self.internal_action_tx.clone();
                tokio::spawn(async move {
                    let result = interpreter.delete_message(&message_id).await;
                    let _ = action_tx
                        .send(Action::DeleteCompleted { request_id, result })
                        .await;
                });
            }

            Effect::PersistClientState { state } => {
                if self.persist_tx.send(state).is_err() {
                    warn!(
                        conversation_id = %self.conversation_id,
                        "Client state writer has stopped"
                    );
                }
            }
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.next_seq += 1;
        if let Some(request_id) = event.settles()
            && let Some(waiter) = self.waiters.remove(&request_id)
        {
            let _ = waiter.send(Ok(event.clone()));
        }

        let envelope = SessionEventEnvelope {
            seq: self.next_seq,
            event,
        };
        let _ = self.event_broadcast.send(envelope);
    }

    fn spawn_fetch(
        &mut self,
        request_id: RequestId,
        query: PathQuery,
        complete: fn(RequestId, Result<PathResponse, ApiError>) -> Action,
    ) {
        let token = self.active_requests.entry(request_id).or_default().clone();
        let interpreter = self.interpreter.clone();
        let action_tx = self.internal_action_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(request_id = %request_id, "Fetch cancelled before completion");
                }
                result = interpreter.fetch_path(&query) => {
                    let _ = action_tx.send(complete(request_id, result)).await;
                }
            }
        });
    }

    fn spawn_generation(&mut self, op_id: OpId, request: GenerationRequest) {
        let token = self.active_generations.entry(op_id).or_default().clone();
        let interpreter = self.interpreter.clone();
        let action_tx = self.internal_action_tx.clone();

        tokio::spawn(async move {
            let mut stream = match interpreter.generate(request, token.clone()).await {
                Ok(stream) => stream,
                Err(TransportError::Cancelled) => {
                    debug!(op_id = %op_id, "Generation cancelled before streaming");
                    return;
                }
                Err(e) => {
                    let _ = action_tx
                        .send(Action::StreamFailed {
                            op_id,
                            error: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            while let Some(event) = stream.next().await {
                let action = match event {
                    StreamEvent::Started { message } => Action::StreamStarted { op_id, message },
                    StreamEvent::Delta { message_id, delta } => Action::StreamDelta {
                        op_id,
                        message_id,
                        delta,
                    },
                    StreamEvent::Finished { message_id } => {
                        Action::StreamFinished { op_id, message_id }
                    }
                    StreamEvent::Failed { error } => Action::StreamFailed { op_id, error },
                };
                if action_tx.send(action).await.is_err() || token.is_cancelled() {
                    break;
                }
            }
        });
    }

    fn create_subscription(&mut self) -> SessionEventSubscription {
        self.subscriber_count += 1;
        debug!(
            conversation_id = %self.conversation_id,
            subscriber_count = self.subscriber_count,
            "New subscriber"
        );

        let rx = self.event_broadcast.subscribe();
        SessionEventSubscription::new(self.conversation_id, rx, self.unsubscribe_tx.clone())
    }

    fn cancel_all_operations(&mut self) {
        for (_, token) in self.active_requests.drain() {
            token.cancel();
        }
        for (_, token) in self.active_generations.drain() {
            token.cancel();
        }
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(SessionError::ShuttingDown));
        }
    }
}

/// Start the actor for the interpreter's conversation and return its handle.
pub fn spawn_session(
    interpreter: EffectInterpreter,
    options: SessionOptions,
) -> SessionHandle {
    let conversation_id = interpreter.conversation_id();
    let state = SessionState::new(conversation_id).with_page_size(options.page_size);

    // A single writer keeps client state saves in dispatch order.
    let (persist_tx, mut persist_rx) = mpsc::unbounded_channel::<ClientState>();
    let writer = interpreter.clone();
    tokio::spawn(async move {
        while let Some(state) = persist_rx.recv().await {
            writer.persist_client_state(&state).await;
        }
    });

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let actor = SessionActor::new(state, interpreter, options.event_capacity, persist_tx);
    tokio::spawn(actor.run(cmd_rx));

    SessionHandle {
        conversation_id,
        cmd_tx,
    }
}
