use chrono::{DateTime, Duration, Utc};

use crate::api::PathResponse;
use crate::app::conversation::{ContentDelta, Message, MessagePart, ParentKey, Role};
use crate::app::domain::action::Action;
use crate::app::domain::effect::Effect;
use crate::app::domain::event::SessionEvent;
use crate::app::domain::reduce::reduce;
use crate::app::domain::state::SessionState;
use crate::app::domain::types::{ConversationId, MessageId, OpId, RequestId};
use crate::transport::GenerationRequest;

pub fn conversation_id() -> ConversationId {
    ConversationId::from(uuid::Uuid::from_u128(0x1234_5678_1234_1234_1234_1234_5678_9abc))
}

pub fn request_id(n: u128) -> RequestId {
    RequestId::from(uuid::Uuid::from_u128(n))
}

pub fn op_id(n: u128) -> OpId {
    OpId::from(uuid::Uuid::from_u128(n))
}

pub fn id(s: &str) -> MessageId {
    MessageId::from_string(s)
}

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

pub fn text(s: &str) -> Vec<MessagePart> {
    vec![MessagePart::text(s)]
}

pub fn user(message_id: &str, parent: Option<&str>, secs: i64) -> Message {
    Message {
        id: id(message_id),
        role: Role::User,
        parent_id: parent.map(id),
        created_at: at(secs),
        parts: text(message_id),
    }
}

pub fn assistant(message_id: &str, parent: Option<&str>, secs: i64) -> Message {
    Message {
        role: Role::Assistant,
        ..user(message_id, parent, secs)
    }
}

pub fn path_ids(state: &SessionState) -> Vec<&str> {
    state.store.messages().iter().map(|m| m.id.as_str()).collect()
}

pub fn sibling_ids(state: &SessionState, parent: Option<&str>) -> Vec<String> {
    state
        .branches
        .sibling_ids(&ParentKey::of(parent.map(id).as_ref()))
        .into_iter()
        .map(|id| id.0)
        .collect()
}

pub fn events(effects: &[Effect]) -> Vec<SessionEvent> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::EmitEvent { event } => Some(event.clone()),
            _ => None,
        })
        .collect()
}

pub fn generation_request(effects: &[Effect]) -> Option<GenerationRequest> {
    effects.iter().find_map(|effect| match effect {
        Effect::StartGeneration { request, .. } => Some(request.clone()),
        _ => None,
    })
}

pub fn loaded(path: Vec<Message>) -> SessionState {
    let mut state = SessionState::new(conversation_id());
    load_path(&mut state, request_id(0xfeed), path);
    state
}

/// Run a canonical switch that lands `path` in the store.
pub fn load_path(state: &mut SessionState, request: RequestId, path: Vec<Message>) {
    reduce(
        state,
        Action::SwitchBranch {
            request_id: request,
            target: None,
            fork: ParentKey::Root,
        },
    )
    .unwrap();
    let leaf_id = path.last().map(|m| m.id.clone());
    reduce(
        state,
        Action::BranchPathLoaded {
            request_id: request,
            result: Ok(PathResponse {
                messages: path,
                leaf_id,
                has_more: false,
            }),
        },
    )
    .unwrap();
}

/// Play the part of the transport for the generation `effects` asked for.
pub fn complete_generation(
    state: &mut SessionState,
    effects: &[Effect],
    reply_id: &str,
    created_at: DateTime<Utc>,
) -> Vec<Effect> {
    let request = generation_request(effects).expect("generation requested");
    let message = Message {
        id: id(reply_id),
        role: Role::Assistant,
        parent_id: request.parent_id.clone(),
        created_at,
        parts: vec![],
    };

    let mut emitted = reduce(
        state,
        Action::StreamStarted {
            op_id: request.op_id,
            message,
        },
    )
    .unwrap();
    emitted.extend(
        reduce(
            state,
            Action::StreamDelta {
                op_id: request.op_id,
                message_id: id(reply_id),
                delta: ContentDelta::Text("hello".to_string()),
            },
        )
        .unwrap(),
    );
    emitted.extend(
        reduce(
            state,
            Action::StreamFinished {
                op_id: request.op_id,
                message_id: id(reply_id),
            },
        )
        .unwrap(),
    );
    emitted
}

pub fn seconds(n: i64) -> Duration {
    Duration::seconds(n)
}
