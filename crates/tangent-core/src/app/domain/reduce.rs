use std::collections::HashSet;

use chrono::{DateTime, Utc};
use strum_macros::Display;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{ApiError, PathQuery, PathResponse};
use crate::app::conversation::{
    ContentDelta, Direction, Message, MessagePart, ParentKey, PathError, Role, SiblingEntry,
    StreamStatus, validate_path,
};
use crate::app::domain::action::Action;
use crate::app::domain::effect::Effect;
use crate::app::domain::event::{
    GenerationOutcome, NoticeLevel, ReplaceReason, SessionEvent,
};
use crate::app::domain::state::{
    ActiveStream, GenerationKind, PendingDelete, PendingSwitch, PendingWrite, ReplyRollback,
    SessionState,
};
use crate::app::domain::types::{MessageId, OpId, RequestId};
use crate::transport::GenerationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum InvalidActionKind {
    Busy,
    SwitchInFlight,
    DeletePending,
    HistoryInFlight,
    UnknownMessage,
    WrongRole,
    NoSibling,
    NothingToLoad,
    NotStreaming,
    EmptyContent,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReduceError {
    #[error("{message}")]
    InvalidAction {
        message: String,
        kind: InvalidActionKind,
    },

    #[error("Invariant violated: {message}")]
    Invariant { message: String },
}

impl ReduceError {
    fn invalid(kind: InvalidActionKind, message: impl Into<String>) -> Self {
        Self::InvalidAction {
            message: message.into(),
            kind,
        }
    }

    fn unknown(message_id: &MessageId) -> Self {
        Self::invalid(
            InvalidActionKind::UnknownMessage,
            format!("Message {message_id} is not on the active path"),
        )
    }

    pub fn kind(&self) -> Option<InvalidActionKind> {
        match self {
            ReduceError::InvalidAction { kind, .. } => Some(*kind),
            ReduceError::Invariant { .. } => None,
        }
    }
}

/// Apply `action` to `state`, returning the side effects to run.
///
/// A rejected action leaves `state` untouched.
pub fn reduce(state: &mut SessionState, action: Action) -> Result<Vec<Effect>, ReduceError> {
    match action {
        Action::Hydrate { branches } => {
            state.branches.merge_wire(&branches);
            Ok(vec![])
        }

        Action::SwitchBranch {
            request_id,
            target,
            fork,
        } => handle_switch_branch(state, request_id, target, fork),

        Action::StepSibling {
            request_id,
            message_id,
            direction,
        } => handle_step_sibling(state, request_id, &message_id, direction),

        Action::BranchPathLoaded { request_id, result } => {
            Ok(handle_branch_path_loaded(state, request_id, result))
        }

        Action::SendMessage {
            op_id,
            message_id,
            parts,
            timestamp,
        } => handle_send_message(state, op_id, message_id, parts, timestamp),

        Action::Regenerate { op_id, message_id } => handle_regenerate(state, op_id, &message_id),

        Action::EditMessage {
            op_id,
            message_id,
            new_message_id,
            parts,
            timestamp,
        } => handle_edit_message(state, op_id, &message_id, new_message_id, parts, timestamp),

        Action::EditAsNew {
            request_id,
            message_id,
            new_message_id,
            parts,
            timestamp,
        } => handle_edit_as_new(
            state,
            request_id,
            &message_id,
            new_message_id,
            parts,
            timestamp,
        ),

        Action::UpdateInPlace {
            request_id,
            message_id,
            parts,
        } => handle_update_in_place(state, request_id, message_id, parts),

        Action::WriteCompleted { request_id, result } => {
            Ok(handle_write_completed(state, request_id, result))
        }

        Action::DeleteSubtree {
            request_id,
            message_id,
        } => handle_delete_subtree(state, request_id, message_id),

        Action::DeleteCompleted { request_id, result } => {
            Ok(handle_delete_completed(state, request_id, result))
        }

        Action::LoadOlderHistory { request_id } => handle_load_older_history(state, request_id),

        Action::HistoryLoaded { request_id, result } => {
            Ok(handle_history_loaded(state, request_id, result))
        }

        Action::StreamStarted { op_id, message } => Ok(handle_stream_started(state, op_id, message)),

        Action::StreamDelta {
            op_id,
            message_id,
            delta,
        } => Ok(handle_stream_delta(state, op_id, message_id, delta)),

        Action::StreamFinished { op_id, message_id } => {
            Ok(handle_stream_finished(state, op_id, message_id))
        }

        Action::StreamFailed { op_id, error } => Ok(handle_stream_failed(state, op_id, &error)),

        Action::StopGeneration => handle_stop_generation(state),
    }
}

fn emit(event: SessionEvent) -> Effect {
    Effect::EmitEvent { event }
}

fn notice(level: NoticeLevel, message: impl Into<String>) -> Effect {
    emit(SessionEvent::Notice {
        level,
        message: message.into(),
    })
}

fn siblings_changed(state: &SessionState, parent: &ParentKey) -> Effect {
    emit(SessionEvent::SiblingsChanged {
        parent: parent.clone(),
        siblings: state.branches.siblings(parent),
    })
}

fn set_status(state: &mut SessionState, status: StreamStatus, effects: &mut Vec<Effect>) {
    if state.store.set_status(status) {
        effects.push(emit(SessionEvent::StatusChanged { status }));
    }
}

fn entry_for(message: &Message) -> SiblingEntry {
    SiblingEntry::new(message.id.clone(), message.created_at)
}

/// Tree-changing operations require an idle stream and a settled path.
fn ensure_mutable(state: &SessionState) -> Result<(), ReduceError> {
    if state.is_busy() {
        return Err(ReduceError::invalid(
            InvalidActionKind::Busy,
            "A response is still being generated",
        ));
    }
    if state.is_switching() {
        return Err(ReduceError::invalid(
            InvalidActionKind::SwitchInFlight,
            "A branch switch is in progress",
        ));
    }
    ensure_no_delete(state)
}

/// A pending delete may remove any part of the path once acknowledged.
fn ensure_no_delete(state: &SessionState) -> Result<(), ReduceError> {
    if state.is_deleting() {
        return Err(ReduceError::invalid(
            InvalidActionKind::DeletePending,
            "A delete is waiting for the server",
        ));
    }
    Ok(())
}

fn ensure_content(parts: &[MessagePart]) -> Result<(), ReduceError> {
    if parts.is_empty() {
        return Err(ReduceError::invalid(
            InvalidActionKind::EmptyContent,
            "Message content cannot be empty",
        ));
    }
    Ok(())
}

fn message_with_role(
    state: &SessionState,
    message_id: &MessageId,
    role: Role,
    message: &str,
) -> Result<Message, ReduceError> {
    let found = state
        .store
        .get(message_id)
        .ok_or_else(|| ReduceError::unknown(message_id))?;
    if found.role != role {
        return Err(ReduceError::invalid(InvalidActionKind::WrongRole, message));
    }
    Ok(found.clone())
}

fn path_query(target: Option<MessageId>, page_size: usize) -> PathQuery {
    PathQuery {
        message_id: target,
        strict: false,
        limit: Some(page_size),
    }
}

// ---------------------------------------------------------------------------
// Navigation
// ---------------------------------------------------------------------------

fn handle_switch_branch(
    state: &mut SessionState,
    request_id: RequestId,
    target: Option<MessageId>,
    fork: ParentKey,
) -> Result<Vec<Effect>, ReduceError> {
    if state.is_busy() {
        return Err(ReduceError::invalid(
            InvalidActionKind::Busy,
            "Cannot switch branches while a response is being generated",
        ));
    }
    ensure_no_delete(state)?;

    let mut effects = Vec::new();

    if let Some(previous) = state.navigation.take() {
        debug!(
            target: "reduce::switch_branch",
            superseded = %previous.request_id,
            request_id = %request_id,
            "Superseding in-flight branch switch"
        );
        effects.push(Effect::CancelRequest {
            request_id: previous.request_id,
        });
        effects.push(emit(SessionEvent::RequestSuperseded {
            request_id: previous.request_id,
        }));
    }

    if let Some(history_request) = state.history.in_flight.take() {
        debug!(
            target: "reduce::switch_branch",
            superseded = %history_request,
            "Cancelling history page for the old branch"
        );
        effects.push(Effect::CancelRequest {
            request_id: history_request,
        });
        effects.push(emit(SessionEvent::RequestSuperseded {
            request_id: history_request,
        }));
    }

    state.navigation = Some(PendingSwitch {
        request_id,
        target: target.clone(),
        fork: fork.clone(),
        recovering: false,
    });

    effects.push(emit(SessionEvent::BranchSwitchStarted {
        request_id,
        fork,
        target: target.clone(),
    }));
    effects.push(Effect::FetchPath {
        request_id,
        query: path_query(target, state.page_size),
    });

    Ok(effects)
}

fn handle_step_sibling(
    state: &mut SessionState,
    request_id: RequestId,
    message_id: &MessageId,
    direction: Direction,
) -> Result<Vec<Effect>, ReduceError> {
    let parent = match state.store.get(message_id) {
        Some(message) => ParentKey::of(message.parent_id()),
        None => state
            .branches
            .parent_of(message_id)
            .cloned()
            .ok_or_else(|| ReduceError::unknown(message_id))?,
    };

    let neighbor = state
        .branches
        .neighbor(&parent, message_id, direction)
        .cloned()
        .ok_or_else(|| {
            ReduceError::invalid(
                InvalidActionKind::NoSibling,
                format!("Message {message_id} has no {direction:?} sibling"),
            )
        })?;

    handle_switch_branch(state, request_id, Some(neighbor), parent)
}

/// Reject a fetched path that would break the active-path invariant.
fn check_fetched_path(
    response: &PathResponse,
    target: Option<&MessageId>,
) -> Result<(), PathError> {
    validate_path(&response.messages, !response.has_more)?;

    match (response.messages.last(), &response.leaf_id) {
        (None, Some(leaf)) => {
            return Err(PathError::UnexpectedLeaf { leaf: leaf.clone() });
        }
        (Some(last), Some(leaf)) if &last.id != leaf => {
            return Err(PathError::LeafMismatch {
                leaf: leaf.clone(),
                last: last.id.clone(),
            });
        }
        _ => {}
    }

    // A truncated page may legitimately start below the target.
    if let Some(target) = target
        && !response.has_more
        && !response.messages.iter().any(|m| m.id() == target)
    {
        return Err(PathError::MissingTarget {
            target: target.clone(),
        });
    }

    Ok(())
}

fn handle_branch_path_loaded(
    state: &mut SessionState,
    request_id: RequestId,
    result: Result<PathResponse, ApiError>,
) -> Vec<Effect> {
    let Some(pending) = state
        .navigation
        .as_ref()
        .filter(|pending| pending.request_id == request_id)
        .cloned()
    else {
        debug!(
            target: "reduce::branch_path_loaded",
            request_id = %request_id,
            "Discarding stale branch path"
        );
        return vec![];
    };

    let response = match result {
        Ok(response) => response,
        Err(error) => {
            state.navigation = None;
            warn!(
                target: "reduce::branch_path_loaded",
                request_id = %request_id,
                error = %error,
                "Branch switch failed"
            );
            return vec![emit(SessionEvent::BranchSwitchFailed {
                request_id,
                error: error.to_string(),
            })];
        }
    };

    if let Err(error) = check_fetched_path(&response, pending.target.as_ref()) {
        if pending.recovering {
            state.navigation = None;
            warn!(
                target: "reduce::branch_path_loaded",
                request_id = %request_id,
                error = %error,
                "Canonical path is inconsistent as well"
            );
            return vec![emit(SessionEvent::BranchSwitchFailed {
                request_id,
                error: error.to_string(),
            })];
        }

        warn!(
            target: "reduce::branch_path_loaded",
            request_id = %request_id,
            error = %error,
            "Fetched path is inconsistent; reloading the canonical path"
        );
        state.navigation = Some(PendingSwitch {
            target: None,
            recovering: true,
            ..pending
        });
        return vec![
            notice(
                NoticeLevel::Warning,
                "That branch could not be shown consistently; reloading the conversation",
            ),
            Effect::FetchPath {
                request_id,
                query: path_query(None, state.page_size),
            },
        ];
    }

    state.navigation = None;

    let leaf = response
        .leaf_id
        .clone()
        .or_else(|| response.messages.last().map(|m| m.id.clone()));

    state.register_path(&response.messages);
    state.store.replace(response.messages);
    state.active_leaf = leaf.clone();
    state.history.has_more = response.has_more;

    let mut effects = Vec::new();
    if state.status() == StreamStatus::Error {
        set_status(state, StreamStatus::Ready, &mut effects);
    }

    let reason = if pending.recovering {
        ReplaceReason::Recovery
    } else {
        ReplaceReason::Navigation
    };
    effects.push(emit(SessionEvent::PathReplaced {
        leaf: leaf.clone(),
        reason,
    }));
    effects.push(Effect::PersistClientState {
        state: state.client_state(),
    });
    effects.push(emit(SessionEvent::BranchSwitchCompleted { request_id, leaf }));
    effects
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

fn begin_generation(
    state: &mut SessionState,
    op_id: OpId,
    parent: Option<MessageId>,
    kind: GenerationKind,
    user_message: Option<Message>,
    rollback: Option<ReplyRollback>,
    effects: &mut Vec<Effect>,
) {
    let context = parent
        .as_ref()
        .and_then(|parent| state.store.path_through(parent))
        .map(<[Message]>::to_vec)
        .unwrap_or_default();

    state.stream = Some(ActiveStream {
        op_id,
        parent: parent.clone(),
        kind,
        message_id: None,
        rollback,
    });
    set_status(state, StreamStatus::Submitted, effects);

    effects.push(Effect::StartGeneration {
        op_id,
        request: GenerationRequest {
            conversation_id: state.conversation_id,
            op_id,
            parent_id: parent,
            user_message,
            context,
        },
    });
}

fn handle_send_message(
    state: &mut SessionState,
    op_id: OpId,
    message_id: MessageId,
    parts: Vec<MessagePart>,
    timestamp: DateTime<Utc>,
) -> Result<Vec<Effect>, ReduceError> {
    ensure_mutable(state)?;
    ensure_content(&parts)?;

    let parent = state.store.leaf_id().cloned();
    let message = Message {
        id: message_id,
        role: Role::User,
        parent_id: parent,
        created_at: timestamp,
        parts,
    };
    let key = ParentKey::of(message.parent_id());
    let rollback = ReplyRollback {
        path: state.store.messages().to_vec(),
        active_leaf: state.active_leaf.clone(),
        parent: key.clone(),
        message_id: message.id.clone(),
    };

    state.branches.register_sibling(key.clone(), entry_for(&message));
    state.store.push(message.clone());
    state.active_leaf = Some(message.id.clone());

    let mut effects = vec![
        emit(SessionEvent::MessageAppended {
            message: message.clone(),
        }),
        siblings_changed(state, &key),
    ];
    begin_generation(
        state,
        op_id,
        Some(message.id.clone()),
        GenerationKind::Reply,
        Some(message),
        Some(rollback),
        &mut effects,
    );
    Ok(effects)
}

fn handle_regenerate(
    state: &mut SessionState,
    op_id: OpId,
    message_id: &MessageId,
) -> Result<Vec<Effect>, ReduceError> {
    ensure_mutable(state)?;
    let message = message_with_role(
        state,
        message_id,
        Role::Assistant,
        "Only assistant messages can be regenerated",
    )?;

    // The old reply stays visible until the new one starts streaming.
    let key = ParentKey::of(message.parent_id());
    state.branches.register_sibling(key.clone(), entry_for(&message));

    let mut effects = vec![siblings_changed(state, &key)];
    begin_generation(
        state,
        op_id,
        message.parent_id.clone(),
        GenerationKind::Regenerate {
            previous: message.id,
        },
        None,
        None,
        &mut effects,
    );
    Ok(effects)
}

fn handle_edit_message(
    state: &mut SessionState,
    op_id: OpId,
    message_id: &MessageId,
    new_message_id: MessageId,
    parts: Vec<MessagePart>,
    timestamp: DateTime<Utc>,
) -> Result<Vec<Effect>, ReduceError> {
    ensure_mutable(state)?;
    ensure_content(&parts)?;
    let original = message_with_role(
        state,
        message_id,
        Role::User,
        "Only user messages can be edited; use edit-as-new for replies",
    )?;

    let edited = Message {
        id: new_message_id,
        role: Role::User,
        parent_id: original.parent_id.clone(),
        created_at: timestamp,
        parts,
    };
    let key = ParentKey::of(original.parent_id());
    let rollback = ReplyRollback {
        path: state.store.messages().to_vec(),
        active_leaf: state.active_leaf.clone(),
        parent: key.clone(),
        message_id: edited.id.clone(),
    };

    state
        .branches
        .register_successor(key.clone(), entry_for(&original), entry_for(&edited));
    state.store.replace_from(&original.id, edited.clone());
    state.active_leaf = Some(edited.id.clone());

    let mut effects = vec![
        emit(SessionEvent::PathReplaced {
            leaf: state.active_leaf.clone(),
            reason: ReplaceReason::Fork,
        }),
        siblings_changed(state, &key),
    ];
    begin_generation(
        state,
        op_id,
        Some(edited.id.clone()),
        GenerationKind::Reply,
        Some(edited),
        Some(rollback),
        &mut effects,
    );
    Ok(effects)
}

fn handle_edit_as_new(
    state: &mut SessionState,
    request_id: RequestId,
    message_id: &MessageId,
    new_message_id: MessageId,
    parts: Vec<MessagePart>,
    timestamp: DateTime<Utc>,
) -> Result<Vec<Effect>, ReduceError> {
    ensure_mutable(state)?;
    ensure_content(&parts)?;
    let original = message_with_role(
        state,
        message_id,
        Role::Assistant,
        "Only assistant messages can be edited as a new branch",
    )?;

    let replacement = Message {
        id: new_message_id,
        role: Role::Assistant,
        parent_id: original.parent_id.clone(),
        created_at: timestamp,
        parts,
    };
    let key = ParentKey::of(original.parent_id());

    let rollback = PendingWrite::Fork {
        path: state.store.messages().to_vec(),
        active_leaf: state.active_leaf.clone(),
        parent: key.clone(),
        message_id: replacement.id.clone(),
    };

    state
        .branches
        .register_successor(key.clone(), entry_for(&original), entry_for(&replacement));
    state.store.replace_from(&original.id, replacement.clone());
    state.active_leaf = Some(replacement.id.clone());
    state.pending_writes.insert(request_id, rollback);

    Ok(vec![
        emit(SessionEvent::PathReplaced {
            leaf: state.active_leaf.clone(),
            reason: ReplaceReason::Fork,
        }),
        siblings_changed(state, &key),
        Effect::SaveMessage {
            request_id,
            message: replacement,
        },
    ])
}

fn handle_update_in_place(
    state: &mut SessionState,
    request_id: RequestId,
    message_id: MessageId,
    parts: Vec<MessagePart>,
) -> Result<Vec<Effect>, ReduceError> {
    ensure_mutable(state)?;
    ensure_content(&parts)?;
    message_with_role(
        state,
        &message_id,
        Role::Assistant,
        "User messages cannot be updated in place",
    )?;

    let previous = state
        .store
        .update_parts(&message_id, parts.clone())
        .ok_or_else(|| ReduceError::unknown(&message_id))?;
    state.pending_writes.insert(
        request_id,
        PendingWrite::Update {
            message_id: message_id.clone(),
            previous,
        },
    );

    let mut effects = Vec::new();
    if let Some(message) = state.store.get(&message_id) {
        effects.push(emit(SessionEvent::MessageChanged {
            message: message.clone(),
        }));
    }
    effects.push(Effect::UpdateMessage {
        request_id,
        message_id,
        parts,
    });
    Ok(effects)
}

fn handle_write_completed(
    state: &mut SessionState,
    request_id: RequestId,
    result: Result<(), ApiError>,
) -> Vec<Effect> {
    let Some(pending) = state.pending_writes.remove(&request_id) else {
        debug!(
            target: "reduce::write_completed",
            request_id = %request_id,
            "No pending write for acknowledgment"
        );
        return vec![];
    };

    match (result, pending) {
        (Ok(()), PendingWrite::Fork { message_id, .. }) => vec![
            Effect::PersistClientState {
                state: state.client_state(),
            },
            emit(SessionEvent::WriteConfirmed {
                request_id,
                message_id,
            }),
        ],

        (Ok(()), PendingWrite::Update { message_id, .. }) => {
            vec![emit(SessionEvent::WriteConfirmed {
                request_id,
                message_id,
            })]
        }

        (
            Err(error),
            PendingWrite::Fork {
                path,
                active_leaf,
                parent,
                message_id,
            },
        ) => {
            warn!(
                target: "reduce::write_completed",
                request_id = %request_id,
                message_id = %message_id,
                error = %error,
                "Rolling back unsaved branch"
            );
            state.branches.unregister(&parent, &message_id);
            let mut effects = vec![siblings_changed(state, &parent)];

            if state.store.contains(&message_id) {
                state.store.replace(path);
                state.active_leaf = active_leaf;
                effects.push(emit(SessionEvent::PathReplaced {
                    leaf: state.active_leaf.clone(),
                    reason: ReplaceReason::Rollback,
                }));
            }

            effects.push(notice(
                NoticeLevel::Error,
                format!("Could not save the edit: {error}"),
            ));
            effects.push(emit(SessionEvent::WriteFailed {
                request_id,
                message_id,
                error: error.to_string(),
            }));
            effects
        }

        (Err(error), PendingWrite::Update { message_id, previous }) => {
            warn!(
                target: "reduce::write_completed",
                request_id = %request_id,
                message_id = %message_id,
                error = %error,
                "Restoring previous message content"
            );
            let mut effects = Vec::new();
            if state.store.update_parts(&message_id, previous).is_some()
                && let Some(message) = state.store.get(&message_id)
            {
                effects.push(emit(SessionEvent::MessageChanged {
                    message: message.clone(),
                }));
            }
            effects.push(notice(
                NoticeLevel::Error,
                format!("Could not save the change: {error}"),
            ));
            effects.push(emit(SessionEvent::WriteFailed {
                request_id,
                message_id,
                error: error.to_string(),
            }));
            effects
        }
    }
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

fn handle_delete_subtree(
    state: &mut SessionState,
    request_id: RequestId,
    message_id: MessageId,
) -> Result<Vec<Effect>, ReduceError> {
    ensure_mutable(state)?;

    let parent = match state.store.get(&message_id) {
        Some(message) => ParentKey::of(message.parent_id()),
        None => state
            .branches
            .parent_of(&message_id)
            .cloned()
            .ok_or_else(|| ReduceError::unknown(&message_id))?,
    };

    state.pending_deletes.insert(
        request_id,
        PendingDelete {
            message_id: message_id.clone(),
            parent,
        },
    );
    Ok(vec![Effect::DeleteMessage {
        request_id,
        message_id,
    }])
}

fn handle_delete_completed(
    state: &mut SessionState,
    request_id: RequestId,
    result: Result<Vec<MessageId>, ApiError>,
) -> Vec<Effect> {
    let Some(pending) = state.pending_deletes.remove(&request_id) else {
        debug!(
            target: "reduce::delete_completed",
            request_id = %request_id,
            "No pending delete for acknowledgment"
        );
        return vec![];
    };

    let deleted = match result {
        Ok(deleted) => deleted,
        Err(error) => {
            warn!(
                target: "reduce::delete_completed",
                request_id = %request_id,
                message_id = %pending.message_id,
                error = %error,
                "Server rejected delete"
            );
            return vec![
                notice(
                    NoticeLevel::Error,
                    format!("Could not delete the message: {error}"),
                ),
                emit(SessionEvent::DeleteFailed {
                    request_id,
                    message_id: pending.message_id,
                    error: error.to_string(),
                }),
            ];
        }
    };

    let mut removed: HashSet<MessageId> = deleted.into_iter().collect();
    let before = state.store.len();
    removed.extend(state.store.delete_subtree(&pending.message_id));
    let path_changed = state.store.len() != before;

    state.branches.prune(&removed);
    if state
        .active_leaf
        .as_ref()
        .is_some_and(|leaf| removed.contains(leaf))
    {
        state.active_leaf = state.store.leaf_id().cloned();
    }

    let mut effects = vec![siblings_changed(state, &pending.parent)];
    if path_changed {
        effects.push(emit(SessionEvent::PathReplaced {
            leaf: state.active_leaf.clone(),
            reason: ReplaceReason::Deletion,
        }));
    }
    effects.push(Effect::PersistClientState {
        state: state.client_state(),
    });

    let mut removed: Vec<MessageId> = removed.into_iter().collect();
    removed.sort();
    effects.push(emit(SessionEvent::SubtreeDeleted {
        request_id,
        message_id: pending.message_id,
        removed,
    }));
    effects
}

// ---------------------------------------------------------------------------
// History pagination
// ---------------------------------------------------------------------------

fn handle_load_older_history(
    state: &mut SessionState,
    request_id: RequestId,
) -> Result<Vec<Effect>, ReduceError> {
    if state.is_switching() {
        return Err(ReduceError::invalid(
            InvalidActionKind::SwitchInFlight,
            "A branch switch is in progress",
        ));
    }
    if state.is_loading_more() {
        return Err(ReduceError::invalid(
            InvalidActionKind::HistoryInFlight,
            "Older messages are already loading",
        ));
    }
    let Some(oldest) = state
        .store
        .oldest_id()
        .filter(|_| state.history.has_more)
        .cloned()
    else {
        return Err(ReduceError::invalid(
            InvalidActionKind::NothingToLoad,
            "No older messages to load",
        ));
    };

    state.history.in_flight = Some(request_id);
    Ok(vec![Effect::FetchHistory {
        request_id,
        query: PathQuery::before(oldest, state.page_size),
    }])
}

fn handle_history_loaded(
    state: &mut SessionState,
    request_id: RequestId,
    result: Result<PathResponse, ApiError>,
) -> Vec<Effect> {
    if state.history.in_flight != Some(request_id) {
        debug!(
            target: "reduce::history_loaded",
            request_id = %request_id,
            "Discarding stale history page"
        );
        return vec![];
    }
    state.history.in_flight = None;

    let failed = |error: String| {
        vec![emit(SessionEvent::HistoryFailed { request_id, error })]
    };

    let response = match result {
        Ok(response) => response,
        Err(error) => return failed(error.to_string()),
    };
    let Some(previous_oldest) = state.store.oldest().cloned() else {
        return failed("no messages are loaded".to_string());
    };

    if let Err(error) = validate_path(&response.messages, !response.has_more) {
        warn!(target: "reduce::history_loaded", request_id = %request_id, error = %error, "Rejecting history page");
        return failed(error.to_string());
    }
    let joins = match response.messages.last() {
        Some(last) => previous_oldest.parent_id() == Some(last.id()),
        None => previous_oldest.parent_id().is_none(),
    };
    if !joins {
        warn!(
            target: "reduce::history_loaded",
            request_id = %request_id,
            oldest = %previous_oldest.id,
            "History page does not end at the parent of the oldest loaded message"
        );
        return failed(format!(
            "history page does not connect to {}",
            previous_oldest.id
        ));
    }

    state.register_path(&response.messages);
    let count = state.store.prepend(response.messages);
    state.history.has_more = response.has_more;

    vec![emit(SessionEvent::HistoryPrepended {
        request_id,
        previous_oldest: previous_oldest.id,
        count,
        has_more: response.has_more,
    })]
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

fn current_stream(state: &SessionState, op_id: OpId) -> Option<ActiveStream> {
    state
        .stream
        .as_ref()
        .filter(|stream| stream.op_id == op_id)
        .cloned()
}

fn handle_stream_started(state: &mut SessionState, op_id: OpId, message: Message) -> Vec<Effect> {
    let Some(stream) = current_stream(state, op_id) else {
        debug!(target: "reduce::stream_started", op_id = %op_id, "Ignoring start of stale stream");
        return vec![];
    };

    // The new message must attach to what will be the tail of the path.
    let expected_tail = match &stream.kind {
        GenerationKind::Regenerate { previous } => match state.store.position(previous) {
            Some(0) => None,
            Some(position) => Some(state.store.messages()[position - 1].id.clone()),
            None => state.store.leaf_id().cloned(),
        },
        GenerationKind::Reply => state.store.leaf_id().cloned(),
    };
    if message.parent_id != stream.parent || message.parent_id != expected_tail {
        warn!(
            target: "reduce::stream_started",
            op_id = %op_id,
            message_id = %message.id,
            "Streamed message does not attach to the active path"
        );
        return fail_stream(
            state,
            op_id,
            "the response does not belong to the current branch",
            true,
        );
    }

    let key = ParentKey::of(message.parent_id());
    let entry = entry_for(&message);
    let mut effects = Vec::new();

    match &stream.kind {
        GenerationKind::Regenerate { previous } => {
            let previous_entry = state
                .branches
                .siblings(&key)
                .into_iter()
                .find(|candidate| &candidate.id == previous);
            match previous_entry {
                Some(previous_entry) => {
                    state
                        .branches
                        .register_successor(key.clone(), previous_entry, entry);
                }
                None => {
                    state.branches.register_sibling(key.clone(), entry);
                }
            }
            state.store.truncate_from(previous);
            state.store.push(message.clone());
            state.active_leaf = Some(message.id.clone());
            effects.push(emit(SessionEvent::PathReplaced {
                leaf: state.active_leaf.clone(),
                reason: ReplaceReason::Fork,
            }));
        }
        GenerationKind::Reply => {
            state.branches.register_sibling(key.clone(), entry);
            state.store.push(message.clone());
            state.active_leaf = Some(message.id.clone());
            effects.push(emit(SessionEvent::MessageAppended {
                message: message.clone(),
            }));
        }
    }

    if let Some(active) = state.stream.as_mut() {
        active.message_id = Some(message.id);
    }
    effects.push(siblings_changed(state, &key));
    set_status(state, StreamStatus::Streaming, &mut effects);
    effects
}

fn handle_stream_delta(
    state: &mut SessionState,
    op_id: OpId,
    message_id: MessageId,
    delta: ContentDelta,
) -> Vec<Effect> {
    let current = state
        .stream
        .as_ref()
        .is_some_and(|s| s.op_id == op_id && s.message_id.as_ref() == Some(&message_id));
    if !current {
        debug!(target: "reduce::stream_delta", op_id = %op_id, "Dropping delta for stale stream");
        return vec![];
    }

    if state.store.apply_delta(&message_id, delta.clone()) {
        vec![emit(SessionEvent::MessageDelta { message_id, delta })]
    } else {
        vec![]
    }
}

fn handle_stream_finished(
    state: &mut SessionState,
    op_id: OpId,
    message_id: MessageId,
) -> Vec<Effect> {
    if current_stream(state, op_id).is_none() {
        debug!(target: "reduce::stream_finished", op_id = %op_id, "Ignoring end of stale stream");
        return vec![];
    }
    state.stream = None;

    let mut effects = Vec::new();
    set_status(state, StreamStatus::Ready, &mut effects);
    effects.push(Effect::PersistClientState {
        state: state.client_state(),
    });
    effects.push(emit(SessionEvent::GenerationFinished {
        op_id,
        message_id: Some(message_id),
        outcome: GenerationOutcome::Completed,
    }));
    effects
}

fn handle_stream_failed(state: &mut SessionState, op_id: OpId, error: &str) -> Vec<Effect> {
    if current_stream(state, op_id).is_none() {
        debug!(target: "reduce::stream_failed", op_id = %op_id, "Ignoring failure of stale stream");
        return vec![];
    }
    fail_stream(state, op_id, error, false)
}

fn fail_stream(state: &mut SessionState, op_id: OpId, error: &str, cancel: bool) -> Vec<Effect> {
    let stream = state.stream.take();
    let mut effects = Vec::new();
    if cancel {
        effects.push(Effect::CancelGeneration { op_id });
    }

    let message_id = stream.as_ref().and_then(|s| s.message_id.clone());
    // No reply ever attached, so the placed user message is undone.
    if message_id.is_none()
        && let Some(rollback) = stream.and_then(|s| s.rollback)
    {
        warn!(
            target: "reduce::stream_failed",
            op_id = %op_id,
            message_id = %rollback.message_id,
            "Rolling back reply that never started"
        );
        state
            .branches
            .unregister(&rollback.parent, &rollback.message_id);
        effects.push(siblings_changed(state, &rollback.parent));
        if state.store.contains(&rollback.message_id) {
            state.store.replace(rollback.path);
            state.active_leaf = rollback.active_leaf;
            effects.push(emit(SessionEvent::PathReplaced {
                leaf: state.active_leaf.clone(),
                reason: ReplaceReason::Rollback,
            }));
        }
    }

    set_status(state, StreamStatus::Error, &mut effects);
    effects.push(notice(
        NoticeLevel::Error,
        format!("The response failed: {error}"),
    ));
    effects.push(emit(SessionEvent::GenerationFinished {
        op_id,
        message_id,
        outcome: GenerationOutcome::Failed,
    }));
    effects
}

fn handle_stop_generation(state: &mut SessionState) -> Result<Vec<Effect>, ReduceError> {
    let Some(stream) = state.stream.take() else {
        return Err(ReduceError::invalid(
            InvalidActionKind::NotStreaming,
            "No response is being generated",
        ));
    };

    let mut effects = vec![Effect::CancelGeneration {
        op_id: stream.op_id,
    }];
    set_status(state, StreamStatus::Ready, &mut effects);
    effects.push(Effect::PersistClientState {
        state: state.client_state(),
    });
    effects.push(emit(SessionEvent::GenerationFinished {
        op_id: stream.op_id,
        message_id: stream.message_id,
        outcome: GenerationOutcome::Stopped,
    }));
    Ok(effects)
}
