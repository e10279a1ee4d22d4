use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, ChatType, MemberRole, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatDetail, ChatEvent, ChatSummary, CreateChatRequest, MemberSummary, ReadStateResponse,
    },
};
use storage::NewChat;
use tracing::info;

use crate::{
    chat_summaries, chat_summary, internal, member_summary, message_payloads, require_member,
    ApiContext, Outcome, DEFAULT_PAGE_SIZE,
};

pub async fn list_user_chats(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ChatSummary>, ApiError> {
    let chats = ctx
        .storage
        .list_chats_for_user(user_id)
        .await
        .map_err(internal)?;
    chat_summaries(ctx, user_id, chats).await
}

/// Chat summary plus the most recent page of messages.
pub async fn get_chat(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
) -> Result<ChatDetail, ApiError> {
    let (chat, _) = require_member(ctx, chat_id, user_id).await?;
    let chat = chat_summary(ctx, user_id, chat).await?;
    let messages = ctx
        .storage
        .list_chat_messages(chat_id, DEFAULT_PAGE_SIZE, None)
        .await
        .map_err(internal)?;
    let messages = message_payloads(ctx, messages).await?;
    Ok(ChatDetail { chat, messages })
}

pub async fn get_or_create_direct_chat(
    ctx: &ApiContext,
    user_id: UserId,
    recipient_id: UserId,
) -> Result<ChatSummary, ApiError> {
    if recipient_id == user_id {
        return Err(ApiError::validation("cannot open a direct chat with yourself"));
    }
    ctx.storage
        .user_profile(recipient_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user"))?;

    let (chat, created) = ctx
        .storage
        .get_or_create_direct_chat(user_id, recipient_id, Utc::now())
        .await
        .map_err(internal)?;
    if created {
        info!(chat_id = %chat.chat_id, %user_id, %recipient_id, "direct chat created");
    }
    chat_summary(ctx, user_id, chat).await
}

/// Creates a chat of any type. Direct requests are routed through the
/// idempotent pair lookup; every other type gets the creator as admin.
pub async fn create_chat(
    ctx: &ApiContext,
    user_id: UserId,
    request: &CreateChatRequest,
) -> Result<ChatSummary, ApiError> {
    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    match request.chat_type {
        ChatType::Direct => {
            let recipient = request
                .recipient_id
                .ok_or_else(|| ApiError::validation("direct chats require recipientId"))?;
            if request.project_id.is_some() || request.team_id.is_some() {
                return Err(ApiError::validation(
                    "direct chats cannot be scoped to a project or team",
                ));
            }
            return get_or_create_direct_chat(ctx, user_id, recipient).await;
        }
        ChatType::Group => {
            if name.is_none() {
                return Err(ApiError::validation("group chats require a name"));
            }
            if request.project_id.is_some() || request.team_id.is_some() {
                return Err(ApiError::validation(
                    "group chats cannot be scoped to a project or team",
                ));
            }
        }
        ChatType::Project => {
            let project_id = request
                .project_id
                .ok_or_else(|| ApiError::validation("project chats require projectId"))?;
            if request.team_id.is_some() {
                return Err(ApiError::validation(
                    "a chat cannot belong to both a project and a team",
                ));
            }
            if !ctx.storage.project_exists(project_id).await.map_err(internal)? {
                return Err(ApiError::not_found("project"));
            }
        }
        ChatType::Team => {
            let team_id = request
                .team_id
                .ok_or_else(|| ApiError::validation("team chats require teamId"))?;
            if request.project_id.is_some() {
                return Err(ApiError::validation(
                    "a chat cannot belong to both a project and a team",
                ));
            }
            if !ctx.storage.team_exists(team_id).await.map_err(internal)? {
                return Err(ApiError::not_found("team"));
            }
        }
    }

    let mut roster = vec![(user_id, MemberRole::Admin)];
    for member_id in &request.member_ids {
        if roster.iter().any(|(id, _)| id == member_id) {
            continue;
        }
        ctx.storage
            .user_profile(*member_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::validation(format!("unknown user {member_id}")))?;
        roster.push((*member_id, MemberRole::Member));
    }

    let chat = ctx
        .storage
        .create_chat(
            &NewChat {
                chat_type: request.chat_type,
                name,
                project_id: request.project_id,
                team_id: request.team_id,
                created_by: user_id,
            },
            &roster,
            Utc::now(),
        )
        .await
        .map_err(internal)?;
    info!(
        chat_id = %chat.chat_id,
        chat_type = %chat.chat_type,
        members = roster.len(),
        "chat created"
    );
    chat_summary(ctx, user_id, chat).await
}

/// Advances the caller's read watermark. Timestamps in the future are clamped
/// to now so unseen messages cannot be pre-acknowledged.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    up_to: Option<DateTime<Utc>>,
) -> Result<ReadStateResponse, ApiError> {
    require_member(ctx, chat_id, user_id).await?;
    let now = Utc::now();
    let up_to = up_to.map_or(now, |requested| requested.min(now));
    ctx.storage
        .mark_read(chat_id, user_id, up_to)
        .await
        .map_err(internal)?;
    unread_count(ctx, user_id, chat_id).await
}

pub async fn unread_count(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
) -> Result<ReadStateResponse, ApiError> {
    let (_, member) = require_member(ctx, chat_id, user_id).await?;
    let unread_count = ctx
        .storage
        .unread_count(chat_id, user_id)
        .await
        .map_err(internal)?;
    Ok(ReadStateResponse {
        chat_id,
        last_read_at: member.last_read_at,
        unread_count,
    })
}

pub async fn add_member(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    new_member: UserId,
) -> Result<Outcome<MemberSummary>, ApiError> {
    let (chat, caller) = require_member(ctx, chat_id, user_id).await?;
    if chat.chat_type == ChatType::Direct {
        return Err(ApiError::validation("direct chats have fixed membership"));
    }
    if caller.role != MemberRole::Admin {
        return Err(ApiError::forbidden("only chat admins can add members"));
    }
    ctx.storage
        .user_profile(new_member)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user"))?;

    let inserted = ctx
        .storage
        .add_member(chat_id, new_member, MemberRole::Member, Utc::now())
        .await
        .map_err(internal)?;
    let member = ctx
        .storage
        .member(chat_id, new_member)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "member missing after insert"))?;

    if inserted {
        info!(%chat_id, user_id = %new_member, "member added");
        Ok(Outcome::with_event(
            member_summary(member),
            ChatEvent::UserJoined {
                chat_id,
                user_id: new_member,
            },
        ))
    } else {
        Ok(Outcome::quiet(member_summary(member)))
    }
}

/// Removes a member. Admins may remove anyone; other members may only leave.
pub async fn remove_member(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    target: UserId,
) -> Result<Outcome<()>, ApiError> {
    let (chat, caller) = require_member(ctx, chat_id, user_id).await?;
    if chat.chat_type == ChatType::Direct {
        return Err(ApiError::validation("direct chats have fixed membership"));
    }
    if target != user_id && caller.role != MemberRole::Admin {
        return Err(ApiError::forbidden("only chat admins can remove other members"));
    }
    let member = ctx
        .storage
        .member(chat_id, target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("member"))?;
    if member.role == MemberRole::Admin {
        ensure_other_admin(ctx, chat_id).await?;
    }

    if !ctx
        .storage
        .remove_member(chat_id, target)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found("member"));
    }
    info!(%chat_id, user_id = %target, removed_by = %user_id, "member removed");
    Ok(Outcome::with_event(
        (),
        ChatEvent::UserLeft {
            chat_id,
            user_id: target,
        },
    ))
}

pub async fn set_member_role(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ChatId,
    target: UserId,
    role: MemberRole,
) -> Result<MemberSummary, ApiError> {
    let (chat, caller) = require_member(ctx, chat_id, user_id).await?;
    if chat.chat_type == ChatType::Direct {
        return Err(ApiError::validation("direct chats have no roles to change"));
    }
    if caller.role != MemberRole::Admin {
        return Err(ApiError::forbidden("only chat admins can change roles"));
    }
    let member = ctx
        .storage
        .member(chat_id, target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("member"))?;
    if member.role == role {
        return Ok(member_summary(member));
    }
    if member.role == MemberRole::Admin {
        ensure_other_admin(ctx, chat_id).await?;
    }

    ctx.storage
        .set_member_role(chat_id, target, role)
        .await
        .map_err(internal)?;
    let member = ctx
        .storage
        .member(chat_id, target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("member"))?;
    Ok(member_summary(member))
}

async fn ensure_other_admin(ctx: &ApiContext, chat_id: ChatId) -> Result<(), ApiError> {
    let admins = ctx.storage.count_admins(chat_id).await.map_err(internal)?;
    if admins <= 1 {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            "a chat must keep at least one admin",
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/chats_tests.rs"]
mod tests;
