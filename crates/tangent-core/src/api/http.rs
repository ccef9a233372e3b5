use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::{
    ApiError, BranchMap, BranchesResponse, ConversationApi, CreateConversationResponse,
    DeleteMessageResponse, ErrorBody, PathQuery, PathResponse, SetLeafRequest,
    UpdateMessageRequest,
};
use crate::app::conversation::{Message, MessagePart};
use crate::app::domain::types::{ConversationId, MessageId};

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            ApiError::serialization(value.to_string())
        } else {
            ApiError::transport(value.to_string())
        }
    }
}

/// `ConversationApi` backed by a remote `tangent serve` instance.
#[derive(Debug, Clone)]
pub struct HttpConversationClient {
    http_client: Client,
    base_url: Url,
}

impl HttpConversationClient {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http_client: Client, base_url: Url) -> Self {
        Self {
            http_client,
            base_url,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::invalid(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn conversation_endpoint(
        &self,
        conversation: ConversationId,
        rest: &[&str],
    ) -> Result<Url, ApiError> {
        let id = conversation.to_string();
        let mut segments = vec!["conversations", id.as_str()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }
}

async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body).map_or(body, |error| error.error);
    Err(match status {
        StatusCode::NOT_FOUND => ApiError::NotFound { what: message },
        StatusCode::CONFLICT => ApiError::Conflict { message },
        StatusCode::BAD_REQUEST => ApiError::InvalidRequest { message },
        _ => ApiError::Http {
            status: status.as_u16(),
            message,
        },
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    Ok(check(response).await?.json::<T>().await?)
}

#[async_trait]
impl ConversationApi for HttpConversationClient {
    async fn create_conversation(&self) -> Result<ConversationId, ApiError> {
        let url = self.endpoint(&["conversations"])?;
        let response = self.http_client.post(url).send().await?;
        let created: CreateConversationResponse = decode(response).await?;
        Ok(created.id)
    }

    async fn fetch_path(
        &self,
        conversation: ConversationId,
        query: &PathQuery,
    ) -> Result<PathResponse, ApiError> {
        let url = self.conversation_endpoint(conversation, &["messages"])?;
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(id) = &query.message_id {
            params.push(("messageId", id.to_string()));
        }
        if query.strict {
            params.push(("strict", "true".to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        debug!(target: "http_client::fetch_path", %conversation, ?params, "GET messages");
        let response = self.http_client.get(url).query(&params).send().await?;
        decode(response).await
    }

    async fn fetch_branches(&self, conversation: ConversationId) -> Result<BranchMap, ApiError> {
        let url = self.conversation_endpoint(conversation, &["branches"])?;
        let response = self.http_client.get(url).send().await?;
        let branches: BranchesResponse = decode(response).await?;
        Ok(branches.branches)
    }

    async fn save_message(
        &self,
        conversation: ConversationId,
        message: &Message,
    ) -> Result<(), ApiError> {
        let url = self.conversation_endpoint(conversation, &["messages"])?;
        let response = self.http_client.post(url).json(message).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn update_message(
        &self,
        conversation: ConversationId,
        message_id: &MessageId,
        parts: &[MessagePart],
    ) -> Result<(), ApiError> {
        let url = self.conversation_endpoint(conversation, &["messages", message_id.as_str()])?;
        let body = UpdateMessageRequest {
            parts: parts.to_vec(),
        };
        let response = self.http_client.patch(url).json(&body).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        conversation: ConversationId,
        message_id: &MessageId,
    ) -> Result<Vec<MessageId>, ApiError> {
        let url = self.conversation_endpoint(conversation, &["messages", message_id.as_str()])?;
        let response = self.http_client.delete(url).send().await?;
        let deleted: DeleteMessageResponse = decode(response).await?;
        Ok(deleted.deleted)
    }

    async fn set_active_leaf(
        &self,
        conversation: ConversationId,
        leaf: Option<&MessageId>,
    ) -> Result<(), ApiError> {
        let url = self.conversation_endpoint(conversation, &["leaf"])?;
        let body = SetLeafRequest {
            leaf_id: leaf.cloned(),
        };
        let response = self.http_client.put(url).json(&body).send().await?;
        check(response).await?;
        Ok(())
    }
}
