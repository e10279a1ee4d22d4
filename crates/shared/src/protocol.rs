use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AttachmentId, ChatId, ChatType, FileId, MemberRole, MessageId, MessageType, ProjectId, TeamId,
    UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Sender identity attached to every message so it can be rendered without a
/// second lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderSummary {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl From<UserProfile> for SenderSummary {
    fn from(profile: UserProfile) -> Self {
        Self {
            id: profile.id,
            display_name: profile.full_name.unwrap_or(profile.username),
            avatar_url: profile.avatar_url,
        }
    }
}

/// Pointer to a file owned by the external file service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub file_id: FileId,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub file_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    pub id: AttachmentId,
    pub message_id: MessageId,
    pub file_id: FileId,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub file_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl ReactionPayload {
    pub fn same_reaction(&self, other: &ReactionPayload) -> bool {
        self.message_id == other.message_id
            && self.user_id == other.user_id
            && self.emoji == other.emoji
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender: SenderSummary,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    pub reactions: Vec<ReactionPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MessagePayload {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSummary {
    pub chat_id: ChatId,
    pub user: UserProfile,
    pub role: MemberRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: ChatId,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub members: Vec<MemberSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    #[serde(default)]
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDetail {
    #[serde(flatten)]
    pub chat: ChatSummary,
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub chat_id: ChatId,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub attachment_ids: Vec<FileId>,
}

/// Body of `POST /chats`, discriminated by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChatAction {
    Create(CreateChatRequest),
    Message(SendMessageRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleReactionResponse {
    pub added: bool,
    pub reaction: ReactionPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStateResponse {
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAttachmentRequest {
    pub file_id: FileId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMemberRoleRequest {
    pub role: MemberRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    MessageSent,
    MessageUpdated,
    MessageDeleted,
    ReactionAdded,
    ReactionRemoved,
    Typing,
    UserJoined,
    UserLeft,
    Error,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::Message,
        EventType::MessageSent,
        EventType::MessageUpdated,
        EventType::MessageDeleted,
        EventType::ReactionAdded,
        EventType::ReactionRemoved,
        EventType::Typing,
        EventType::UserJoined,
        EventType::UserLeft,
        EventType::Error,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    pub is_typing: bool,
}

/// A frame on the live connection. Every variant is keyed by `type`; payload
/// fields are present only where that event type carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatEvent {
    Message {
        chat_id: ChatId,
        message: MessagePayload,
    },
    MessageSent {
        chat_id: ChatId,
        message: MessagePayload,
    },
    MessageUpdated {
        chat_id: ChatId,
        message: MessagePayload,
    },
    MessageDeleted {
        chat_id: ChatId,
        message: MessagePayload,
    },
    ReactionAdded {
        chat_id: ChatId,
        reaction: ReactionPayload,
    },
    ReactionRemoved {
        chat_id: ChatId,
        reaction: ReactionPayload,
    },
    Typing {
        chat_id: ChatId,
        user_id: UserId,
        #[serde(default)]
        data: TypingState,
    },
    UserJoined {
        chat_id: ChatId,
        user_id: UserId,
    },
    UserLeft {
        chat_id: ChatId,
        user_id: UserId,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<ChatId>,
        error: String,
    },
}

impl ChatEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Message { .. } => EventType::Message,
            Self::MessageSent { .. } => EventType::MessageSent,
            Self::MessageUpdated { .. } => EventType::MessageUpdated,
            Self::MessageDeleted { .. } => EventType::MessageDeleted,
            Self::ReactionAdded { .. } => EventType::ReactionAdded,
            Self::ReactionRemoved { .. } => EventType::ReactionRemoved,
            Self::Typing { .. } => EventType::Typing,
            Self::UserJoined { .. } => EventType::UserJoined,
            Self::UserLeft { .. } => EventType::UserLeft,
            Self::Error { .. } => EventType::Error,
        }
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            Self::Message { chat_id, .. }
            | Self::MessageSent { chat_id, .. }
            | Self::MessageUpdated { chat_id, .. }
            | Self::MessageDeleted { chat_id, .. }
            | Self::ReactionAdded { chat_id, .. }
            | Self::ReactionRemoved { chat_id, .. }
            | Self::Typing { chat_id, .. }
            | Self::UserJoined { chat_id, .. }
            | Self::UserLeft { chat_id, .. } => Some(*chat_id),
            Self::Error { chat_id, .. } => *chat_id,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            chat_id: None,
            error: message.into(),
        }
    }
}

/// Frames a client sends over the live connection. These are advisory and
/// never acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    JoinChat { chat_id: ChatId },
    LeaveChat { chat_id: ChatId },
    Typing { chat_id: ChatId, is_typing: bool },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
