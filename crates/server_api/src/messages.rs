use chrono::Utc;
use shared::{
    domain::{ChatId, FileId, MessageId, MessageType, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatEvent, FileDescriptor, MessagePayload, ReactionPayload, SendMessageRequest,
        ToggleReactionResponse,
    },
};
use storage::{NewMessage, ReactionToggle};
use tracing::{debug, info};

use crate::{
    internal, message_payload, message_payloads, require_member, visible_message, ApiContext,
    Outcome, MAX_PAGE_SIZE,
};

const MAX_EMOJI_BYTES: usize = 64;

/// Persists a message from a chat member, together with its attachments in
/// one write, and returns it with sender, attachments and reactions attached.
pub async fn send_message(
    ctx: &ApiContext,
    user_id: UserId,
    request: &SendMessageRequest,
) -> Result<Outcome<MessagePayload>, ApiError> {
    let chat_id = request.chat_id;
    require_member(ctx, chat_id, user_id).await?;

    if request.message_type == MessageType::System {
        return Err(ApiError::validation("system messages cannot be sent by users"));
    }
    if request.content.trim().is_empty() && request.attachment_ids.is_empty() {
        return Err(ApiError::validation("message content is empty"));
    }
    if let Some(reply_to_id) = request.reply_to_id {
        let target = ctx.storage.message(reply_to_id).await.map_err(internal)?;
        match target {
            Some(target) if target.chat_id == chat_id => {}
            Some(_) => {
                return Err(ApiError::validation(
                    "reply target belongs to a different chat",
                ))
            }
            None => return Err(ApiError::validation("reply target does not exist")),
        }
    }
    let files = resolve_files(ctx, &request.attachment_ids).await?;

    let now = Utc::now();
    let stored = ctx
        .storage
        .insert_message(
            &NewMessage {
                chat_id,
                sender_id: user_id,
                content: &request.content,
                message_type: request.message_type,
                reply_to_id: request.reply_to_id,
                metadata: request.metadata.as_ref(),
                attachments: &files,
            },
            now,
        )
        .await
        .map_err(internal)?;
    info!(
        %chat_id,
        message_id = %stored.message_id,
        sender_id = %user_id,
        attachments = files.len(),
        "message stored"
    );

    let message = message_payload(ctx, stored).await?;
    Ok(Outcome::with_event(
        message.clone(),
        ChatEvent::Message { chat_id, message },
    ))
}

/// Pages backwards through a chat. Results are ascending by id; `limit` is
/// clamped to `1..=MAX_PAGE_SIZE`.
pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    limit: u32,
    before: Option<MessageId>,
) -> Result<Vec<MessagePayload>, ApiError> {
    require_member(ctx, chat_id, user_id).await?;
    let messages = ctx
        .storage
        .list_chat_messages(chat_id, limit.clamp(1, MAX_PAGE_SIZE), before)
        .await
        .map_err(internal)?;
    message_payloads(ctx, messages).await
}

/// Attaches a pre-uploaded file to one of the caller's own messages.
pub async fn add_attachment(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    file_id: FileId,
) -> Result<Outcome<MessagePayload>, ApiError> {
    let message = visible_message(ctx, message_id, user_id).await?;
    if message.sender.id != user_id {
        return Err(ApiError::forbidden(
            "only the sender can attach files to a message",
        ));
    }
    if message.deleted_at.is_some() {
        return Err(ApiError::validation("message was deleted"));
    }
    if message.attachments.iter().any(|a| a.file_id == file_id) {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            "file is already attached to this message",
        ));
    }
    let files = resolve_files(ctx, &[file_id]).await?;
    for file in &files {
        ctx.storage
            .insert_attachment(message_id, file, Utc::now())
            .await
            .map_err(internal)?;
    }
    updated_message(ctx, message_id).await
}

pub async fn toggle_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    emoji: &str,
) -> Result<Outcome<ToggleReactionResponse>, ApiError> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.len() > MAX_EMOJI_BYTES {
        return Err(ApiError::validation("emoji must be between 1 and 64 bytes"));
    }
    let message = visible_message(ctx, message_id, user_id).await?;
    if message.deleted_at.is_some() {
        return Err(ApiError::validation("message was deleted"));
    }

    let now = Utc::now();
    let toggle = ctx
        .storage
        .toggle_reaction(message_id, user_id, emoji, now)
        .await
        .map_err(internal)?;
    if toggle == ReactionToggle::AlreadyPresent {
        debug!(%message_id, %user_id, emoji, "concurrent reaction insert resolved as added");
    }

    let added = toggle != ReactionToggle::Removed;
    let reaction = ReactionPayload {
        message_id,
        user_id,
        emoji: emoji.to_string(),
        created_at: now,
    };
    let chat_id = message.chat_id;
    let event = if added {
        ChatEvent::ReactionAdded {
            chat_id,
            reaction: reaction.clone(),
        }
    } else {
        ChatEvent::ReactionRemoved {
            chat_id,
            reaction: reaction.clone(),
        }
    };
    Ok(Outcome::with_event(
        ToggleReactionResponse { added, reaction },
        event,
    ))
}

pub async fn edit_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    content: &str,
) -> Result<Outcome<MessagePayload>, ApiError> {
    let message = visible_message(ctx, message_id, user_id).await?;
    if message.sender.id != user_id {
        return Err(ApiError::forbidden("only the sender can edit a message"));
    }
    if content.trim().is_empty() {
        return Err(ApiError::validation("message content is empty"));
    }
    let edited = ctx
        .storage
        .edit_message(message_id, content, Utc::now())
        .await
        .map_err(internal)?;
    if !edited {
        return Err(ApiError::validation("deleted messages cannot be edited"));
    }
    updated_message(ctx, message_id).await
}

/// Soft-deletes one of the caller's messages. Deleting twice succeeds and
/// returns the already redacted message.
pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<Outcome<MessagePayload>, ApiError> {
    let message = visible_message(ctx, message_id, user_id).await?;
    if message.sender.id != user_id {
        return Err(ApiError::forbidden("only the sender can delete a message"));
    }
    let deleted = ctx
        .storage
        .soft_delete_message(message_id, Utc::now())
        .await
        .map_err(internal)?;
    if deleted {
        info!(%message_id, chat_id = %message.chat_id, "message deleted");
    }

    let stored = ctx
        .storage
        .message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message"))?;
    let message = message_payload(ctx, stored).await?;
    Ok(Outcome::with_event(
        message.clone(),
        ChatEvent::MessageDeleted {
            chat_id: message.chat_id,
            message,
        },
    ))
}

async fn updated_message(
    ctx: &ApiContext,
    message_id: MessageId,
) -> Result<Outcome<MessagePayload>, ApiError> {
    let stored = ctx
        .storage
        .message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message"))?;
    let message = message_payload(ctx, stored).await?;
    Ok(Outcome::with_event(
        message.clone(),
        ChatEvent::MessageUpdated {
            chat_id: message.chat_id,
            message,
        },
    ))
}

async fn resolve_files(
    ctx: &ApiContext,
    file_ids: &[FileId],
) -> Result<Vec<FileDescriptor>, ApiError> {
    let mut files: Vec<FileDescriptor> = Vec::with_capacity(file_ids.len());
    for file_id in file_ids {
        if files.iter().any(|f| f.file_id == *file_id) {
            continue;
        }
        let file = ctx
            .files
            .describe(*file_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::validation(format!("unknown file {file_id}")))?;
        files.push(file);
    }
    Ok(files)
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
