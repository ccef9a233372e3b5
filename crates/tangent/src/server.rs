//! HTTP front of the persistence API, served by `tangent serve`.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use std::sync::Arc;
use tracing::{debug, warn};

use tangent_core::api::{
    ApiError, BranchesResponse, ConversationApi, CreateConversationResponse,
    DeleteMessageResponse, ErrorBody, PathQuery, PathResponse, SetLeafRequest,
    UpdateMessageRequest,
};
use tangent_core::app::conversation::Message;
use tangent_core::app::domain::types::{ConversationId, MessageId};

#[derive(Clone)]
struct ServerState {
    api: Arc<dyn ConversationApi>,
}

/// `ApiError` rendered as a JSON `ErrorBody` with a matching status.
struct HttpError(ApiError);

impl From<ApiError> for HttpError {
    fn from(value: ApiError) -> Self {
        Self(value)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::InvalidRequest { .. } | ApiError::Serialization { .. } => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Http { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Transport { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Io { .. } | ApiError::LockPoisoned { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(target: "server", error = %self.0, "Request failed");
        }
        let message = match self.0 {
            ApiError::NotFound { what } => what,
            ApiError::Conflict { message }
            | ApiError::InvalidRequest { message }
            | ApiError::Http { message, .. }
            | ApiError::Transport { message }
            | ApiError::Serialization { message }
            | ApiError::Io { message }
            | ApiError::LockPoisoned { message } => message,
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type HttpResult<T> = Result<T, HttpError>;

pub fn router(api: Arc<dyn ConversationApi>) -> Router {
    Router::new()
        .route("/conversations", post(create_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(fetch_path).post(save_message),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}",
            patch(update_message).delete(delete_message),
        )
        .route(
            "/conversations/{conversation_id}/branches",
            get(fetch_branches),
        )
        .route("/conversations/{conversation_id}/leaf", put(set_active_leaf))
        .with_state(ServerState { api })
}

async fn create_conversation(
    State(state): State<ServerState>,
) -> HttpResult<(StatusCode, Json<CreateConversationResponse>)> {
    let id = state.api.create_conversation().await?;
    Ok((StatusCode::CREATED, Json(CreateConversationResponse { id })))
}

async fn fetch_path(
    State(state): State<ServerState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<PathQuery>,
) -> HttpResult<Json<PathResponse>> {
    debug!(target: "server::fetch_path", %conversation_id, ?query, "GET messages");
    Ok(Json(state.api.fetch_path(conversation_id, &query).await?))
}

async fn fetch_branches(
    State(state): State<ServerState>,
    Path(conversation_id): Path<ConversationId>,
) -> HttpResult<Json<BranchesResponse>> {
    let branches = state.api.fetch_branches(conversation_id).await?;
    Ok(Json(BranchesResponse { branches }))
}

async fn save_message(
    State(state): State<ServerState>,
    Path(conversation_id): Path<ConversationId>,
    Json(message): Json<Message>,
) -> HttpResult<StatusCode> {
    debug!(
        target: "server::save_message",
        %conversation_id,
        message_id = %message.id,
        "POST message"
    );
    state.api.save_message(conversation_id, &message).await?;
    Ok(StatusCode::CREATED)
}

async fn update_message(
    State(state): State<ServerState>,
    Path((conversation_id, message_id)): Path<(ConversationId, MessageId)>,
    Json(body): Json<UpdateMessageRequest>,
) -> HttpResult<StatusCode> {
    state
        .api
        .update_message(conversation_id, &message_id, &body.parts)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_message(
    State(state): State<ServerState>,
    Path((conversation_id, message_id)): Path<(ConversationId, MessageId)>,
) -> HttpResult<Json<DeleteMessageResponse>> {
    let deleted = state
        .api
        .delete_message(conversation_id, &message_id)
        .await?;
    Ok(Json(DeleteMessageResponse { deleted }))
}

async fn set_active_leaf(
    State(state): State<ServerState>,
    Path(conversation_id): Path<ConversationId>,
    Json(body): Json<SetLeafRequest>,
) -> HttpResult<StatusCode> {
    state
        .api
        .set_active_leaf(conversation_id, body.leaf_id.as_ref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
