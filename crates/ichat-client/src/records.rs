//! The record store: the HTTP service that persists conversations, messages,
//! reactions and published public keys.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use ichat_shared::protocol::{NewMessage, PublicKeyUpdate, ReactionUpdate, WireMessage};
use ichat_shared::{Conversation, ConversationId, MessageId};

use crate::error::RecordStoreError;

const AUTH_HEADER: &str = "x-auth-token";

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, RecordStoreError>;

    /// History in ascending server order. Expired messages are never returned.
    async fn list_messages(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<WireMessage>, RecordStoreError>;

    async fn create_message(
        &self,
        conversation: &ConversationId,
        message: &NewMessage,
    ) -> Result<WireMessage, RecordStoreError>;

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), RecordStoreError>;

    /// Toggle the caller's reaction. Returns the authoritative reaction map.
    async fn react(
        &self,
        message: &MessageId,
        emoji: &str,
    ) -> Result<ReactionUpdate, RecordStoreError>;

    async fn update_public_key(&self, public_key: &str) -> Result<(), RecordStoreError>;
}

/// [`RecordStore`] over the JSON REST API.
#[derive(Debug, Clone)]
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRecordStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        debug!(%method, %url, "record store request");
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header(AUTH_HEADER, token),
            None => builder,
        }
    }
}

async fn check(resp: Response) -> Result<Response, RecordStoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RecordStoreError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, RecordStoreError> {
    let resp = check(resp).await?;
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| RecordStoreError::Decode(e.to_string()))
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, RecordStoreError> {
        let resp = self.request(Method::GET, "/chat").send().await?;
        decode(resp).await
    }

    async fn list_messages(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<WireMessage>, RecordStoreError> {
        let path = format!("/chat/{conversation}/messages");
        let resp = self.request(Method::GET, &path).send().await?;
        decode(resp).await
    }

    async fn create_message(
        &self,
        conversation: &ConversationId,
        message: &NewMessage,
    ) -> Result<WireMessage, RecordStoreError> {
        let path = format!("/chat/{conversation}/messages");
        let resp = self.request(Method::POST, &path).json(message).send().await?;
        decode(resp).await
    }

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), RecordStoreError> {
        let path = format!("/chat/{conversation}/read");
        let resp = self.request(Method::PUT, &path).send().await?;
        check(resp).await?;
        Ok(())
    }

    async fn react(
        &self,
        message: &MessageId,
        emoji: &str,
    ) -> Result<ReactionUpdate, RecordStoreError> {
        let path = format!("/chat/messages/{message}/react");
        let resp = self
            .request(Method::POST, &path)
            .json(&json!({ "emoji": emoji }))
            .send()
            .await?;
        decode(resp).await
    }

    async fn update_public_key(&self, public_key: &str) -> Result<(), RecordStoreError> {
        let body = PublicKeyUpdate {
            public_key: public_key.to_string(),
        };
        let resp = self.request(Method::PUT, "/auth/key").json(&body).send().await?;
        check(resp).await?;
        Ok(())
    }
}
