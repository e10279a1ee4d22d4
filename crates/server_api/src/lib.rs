use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ChatId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AttachmentPayload, ChatEvent, ChatSummary, MemberSummary, MessagePayload,
        ReactionPayload,
    },
};
use storage::{Storage, StoredChat, StoredMember, StoredMessage};

pub mod auth;
pub mod chats;
pub mod files;
pub mod messages;

pub use auth::{issue_session_token, verify_session_token, SessionKeys};
pub use chats::*;
pub use files::{FileDirectory, InMemoryFileDirectory, MissingFileDirectory};
pub use messages::*;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub files: Arc<dyn FileDirectory>,
    pub session: SessionKeys,
}

/// Result of a mutation together with the live event it produces, if any.
/// The caller decides how to fan the event out.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub event: Option<ChatEvent>,
}

impl<T> Outcome<T> {
    fn quiet(value: T) -> Self {
        Self { value, event: None }
    }

    fn with_event(value: T, event: ChatEvent) -> Self {
        Self {
            value,
            event: Some(event),
        }
    }
}

/// Loads the chat and the caller's membership. A missing chat and a chat the
/// caller does not belong to produce the same error.
pub async fn require_member(
    ctx: &ApiContext,
    chat_id: ChatId,
    user_id: UserId,
) -> Result<(StoredChat, StoredMember), ApiError> {
    let member = ctx
        .storage
        .member(chat_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("chat"))?;
    let chat = ctx
        .storage
        .chat(chat_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("chat"))?;
    Ok((chat, member))
}

/// Loads a message the caller can see through chat membership.
async fn visible_message(
    ctx: &ApiContext,
    message_id: MessageId,
    user_id: UserId,
) -> Result<StoredMessage, ApiError> {
    let message = ctx
        .storage
        .message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message"))?;
    let membership = ctx
        .storage
        .member(message.chat_id, user_id)
        .await
        .map_err(internal)?;
    if membership.is_none() {
        return Err(ApiError::not_found("message"));
    }
    Ok(message)
}

/// Enriches stored messages with attachments and reactions, one query per
/// kind regardless of how many messages are passed.
async fn message_payloads(
    ctx: &ApiContext,
    messages: Vec<StoredMessage>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let ids: Vec<MessageId> = messages.iter().map(|m| m.message_id).collect();
    let attachments = ctx
        .storage
        .attachments_for_messages(&ids)
        .await
        .map_err(internal)?;
    let reactions = ctx
        .storage
        .reactions_for_messages(&ids)
        .await
        .map_err(internal)?;

    let mut attachments_by_message: HashMap<MessageId, Vec<AttachmentPayload>> = HashMap::new();
    for attachment in attachments {
        attachments_by_message
            .entry(attachment.message_id)
            .or_default()
            .push(AttachmentPayload {
                id: attachment.attachment_id,
                message_id: attachment.message_id,
                file_id: attachment.file.file_id,
                file_name: attachment.file.file_name,
                file_type: attachment.file.file_type,
                file_size: attachment.file.file_size,
                file_url: attachment.file.file_url,
            });
    }
    let mut reactions_by_message: HashMap<MessageId, Vec<ReactionPayload>> = HashMap::new();
    for reaction in reactions {
        reactions_by_message
            .entry(reaction.message_id)
            .or_default()
            .push(ReactionPayload {
                message_id: reaction.message_id,
                user_id: reaction.user_id,
                emoji: reaction.emoji,
                created_at: reaction.created_at,
            });
    }

    Ok(messages
        .into_iter()
        .map(|message| MessagePayload {
            id: message.message_id,
            chat_id: message.chat_id,
            sender: message.sender.into(),
            content: message.content,
            message_type: message.message_type,
            reply_to_id: message.reply_to_id,
            metadata: message.metadata,
            attachments: attachments_by_message
                .remove(&message.message_id)
                .unwrap_or_default(),
            reactions: reactions_by_message
                .remove(&message.message_id)
                .unwrap_or_default(),
            created_at: message.created_at,
            updated_at: message.updated_at,
            edited_at: message.edited_at,
            deleted_at: message.deleted_at,
        })
        .collect())
}

async fn message_payload(
    ctx: &ApiContext,
    message: StoredMessage,
) -> Result<MessagePayload, ApiError> {
    message_payloads(ctx, vec![message])
        .await?
        .pop()
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "message payload was not built"))
}

fn member_summary(member: StoredMember) -> MemberSummary {
    MemberSummary {
        chat_id: member.chat_id,
        user: member.user,
        role: member.role,
        last_read_at: member.last_read_at,
        joined_at: member.joined_at,
    }
}

/// Builds summaries for a set of chats with batched member, last-message and
/// unread lookups.
async fn chat_summaries(
    ctx: &ApiContext,
    viewer: UserId,
    chats: Vec<StoredChat>,
) -> Result<Vec<ChatSummary>, ApiError> {
    let chat_ids: Vec<ChatId> = chats.iter().map(|c| c.chat_id).collect();
    let members = ctx
        .storage
        .members_for_chats(&chat_ids)
        .await
        .map_err(internal)?;
    let latest = ctx
        .storage
        .latest_messages(&chat_ids)
        .await
        .map_err(internal)?;
    let unread = ctx
        .storage
        .unread_counts_for_user(viewer)
        .await
        .map_err(internal)?;

    let mut members_by_chat: HashMap<ChatId, Vec<MemberSummary>> = HashMap::new();
    for member in members {
        members_by_chat
            .entry(member.chat_id)
            .or_default()
            .push(member_summary(member));
    }
    let mut latest_by_chat: HashMap<ChatId, MessagePayload> = message_payloads(ctx, latest)
        .await?
        .into_iter()
        .map(|message| (message.chat_id, message))
        .collect();

    Ok(chats
        .into_iter()
        .map(|chat| ChatSummary {
            id: chat.chat_id,
            chat_type: chat.chat_type,
            name: chat.name,
            project_id: chat.project_id,
            team_id: chat.team_id,
            created_by: chat.created_by,
            created_at: chat.created_at,
            updated_at: chat.updated_at,
            members: members_by_chat.remove(&chat.chat_id).unwrap_or_default(),
            last_message: latest_by_chat.remove(&chat.chat_id),
            unread_count: unread.get(&chat.chat_id).copied().unwrap_or(0),
        })
        .collect())
}

async fn chat_summary(
    ctx: &ApiContext,
    viewer: UserId,
    chat: StoredChat,
) -> Result<ChatSummary, ApiError> {
    chat_summaries(ctx, viewer, vec![chat])
        .await?
        .pop()
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "chat summary was not built"))
}

fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %err, "storage failure");
    ApiError::new(ErrorCode::Internal, err.to_string())
}
