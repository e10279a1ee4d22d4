use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChatId, FileId, MemberRole, MessageId, UserId},
    error::ApiError,
    protocol::{
        AddAttachmentRequest, AddMemberRequest, ChatAction, ChatDetail, ChatSummary,
        CreateChatRequest, EditMessageRequest, MarkReadRequest, MemberSummary, MessagePayload,
        ReadStateResponse, SendMessageRequest, SetMemberRoleRequest, ToggleReactionRequest,
        ToggleReactionResponse,
    },
};

pub mod error;
pub mod listeners;
pub mod polling;
pub mod sync;
pub mod timeline;
pub mod transport;

pub use error::TransportError;
pub use listeners::{Listener, ListenerId, ListenerRegistry};
pub use polling::{LatestMessageSource, PollingClient, PollingConfig};
pub use sync::{SyncEngine, SyncListener, SyncMode};
pub use timeline::{seen_by_recipient, MessageTimeline};
pub use transport::{
    ConnectionState, Dialer, ReconnectPolicy, RealtimeTransport, TransportConfig,
    WebSocketDialer,
};

/// REST client for the chat server, authenticated with a session token.
#[derive(Clone)]
pub struct ChatApiClient {
    http: Client,
    server_url: String,
    token: String,
}

impl ChatApiClient {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let server_url: String = server_url.into();
        Self {
            http: Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Transport settings for the same server and identity.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new(self.server_url.clone(), self.token.clone())
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        self.send(self.http.get(self.url("/chats"))).await
    }

    pub async fn chat(&self, chat_id: ChatId) -> Result<ChatDetail> {
        self.send(self.http.get(self.url(&format!("/chats/{chat_id}"))))
            .await
    }

    pub async fn direct_chat(&self, recipient_id: UserId) -> Result<ChatSummary> {
        self.send(self.http.get(self.url(&format!("/chats/direct/{recipient_id}"))))
            .await
    }

    pub async fn create_chat(&self, request: &CreateChatRequest) -> Result<ChatSummary> {
        self.send(
            self.http
                .post(self.url("/chats"))
                .json(&ChatAction::Create(request.clone())),
        )
        .await
    }

    pub async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload> {
        self.send(
            self.http
                .post(self.url("/chats"))
                .json(&ChatAction::Message(request.clone())),
        )
        .await
    }

    /// One page, ascending by id. Pass the oldest id already held as
    /// `before` to page further back.
    pub async fn list_messages(
        &self,
        chat_id: ChatId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let mut request = self
            .http
            .get(self.url(&format!("/chats/{chat_id}/messages")))
            .query(&[("limit", i64::from(limit))]);
        if let Some(before) = before {
            request = request.query(&[("before", before.0)]);
        }
        self.send(request).await
    }

    pub async fn mark_read(
        &self,
        chat_id: ChatId,
        up_to: Option<DateTime<Utc>>,
    ) -> Result<ReadStateResponse> {
        self.send(
            self.http
                .post(self.url(&format!("/chats/{chat_id}/read")))
                .json(&MarkReadRequest { up_to }),
        )
        .await
    }

    pub async fn unread_count(&self, chat_id: ChatId) -> Result<ReadStateResponse> {
        self.send(self.http.get(self.url(&format!("/chats/{chat_id}/unread"))))
            .await
    }

    pub async fn add_member(&self, chat_id: ChatId, user_id: UserId) -> Result<MemberSummary> {
        self.send(
            self.http
                .post(self.url(&format!("/chats/{chat_id}/members")))
                .json(&AddMemberRequest { user_id }),
        )
        .await
    }

    pub async fn remove_member(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        let url = self.url(&format!("/chats/{chat_id}/members/{user_id}"));
        let response = self
            .authorized(self.http.delete(url))
            .send()
            .await
            .context("remove member request failed")?;
        check(response).await?;
        Ok(())
    }

    pub async fn set_member_role(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<MemberSummary> {
        self.send(
            self.http
                .patch(self.url(&format!("/chats/{chat_id}/members/{user_id}")))
                .json(&SetMemberRoleRequest { role }),
        )
        .await
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessagePayload> {
        self.send(
            self.http
                .patch(self.url(&format!("/messages/{message_id}")))
                .json(&EditMessageRequest {
                    content: content.to_string(),
                }),
        )
        .await
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<MessagePayload> {
        self.send(self.http.delete(self.url(&format!("/messages/{message_id}"))))
            .await
    }

    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<ToggleReactionResponse> {
        self.send(
            self.http
                .post(self.url(&format!("/messages/{message_id}/reactions")))
                .json(&ToggleReactionRequest {
                    emoji: emoji.to_string(),
                }),
        )
        .await
    }

    pub async fn add_attachment(
        &self,
        message_id: MessageId,
        file_id: FileId,
    ) -> Result<MessagePayload> {
        self.send(
            self.http
                .post(self.url(&format!("/messages/{message_id}/attachments")))
                .json(&AddAttachmentRequest { file_id }),
        )
        .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.server_url))?;
        let response = check(response).await?;
        response
            .json::<T>()
            .await
            .context("server returned an unreadable response")
    }
}

/// Turns an error status into the server's `ApiError` when the body has one,
/// so callers can `downcast_ref::<ApiError>()`.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    match serde_json::from_slice::<ApiError>(&body) {
        Ok(api_error) => Err(api_error.into()),
        Err(_) => Err(anyhow::anyhow!("server responded with {status}")),
    }
}

#[async_trait]
impl LatestMessageSource for ChatApiClient {
    async fn latest_message(&self, chat_id: ChatId) -> Result<Option<MessagePayload>> {
        let mut page = self.list_messages(chat_id, 1, None).await?;
        Ok(page.pop())
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
