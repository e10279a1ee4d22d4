use std::sync::Arc;

use super::*;
use crate::{send_message, InMemoryFileDirectory, SessionKeys};
use shared::{
    domain::{ProjectId, TeamId},
    protocol::{SendMessageRequest, UserProfile},
};
use storage::Storage;

async fn setup(users: &[i64]) -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for id in users {
        storage
            .upsert_user(&UserProfile {
                id: UserId(*id),
                email: None,
                username: format!("user{id}"),
                full_name: Some(format!("User {id}")),
                avatar_url: None,
            })
            .await
            .expect("user");
    }
    ApiContext {
        storage,
        files: Arc::new(InMemoryFileDirectory::default()),
        session: SessionKeys {
            secret: "s".into(),
            ttl_seconds: 60,
        },
    }
}

fn group_request(name: Option<&str>, members: &[i64]) -> CreateChatRequest {
    CreateChatRequest {
        chat_type: ChatType::Group,
        name: name.map(str::to_string),
        recipient_id: None,
        member_ids: members.iter().copied().map(UserId).collect(),
        project_id: None,
        team_id: None,
    }
}

async fn say(ctx: &ApiContext, user: i64, chat_id: ChatId, content: &str) {
    send_message(
        ctx,
        UserId(user),
        &SendMessageRequest {
            chat_id,
            content: content.to_string(),
            message_type: Default::default(),
            reply_to_id: None,
            metadata: None,
            attachment_ids: Vec::new(),
        },
    )
    .await
    .expect("send");
}

#[tokio::test]
async fn group_creation_makes_creator_admin_and_others_members() {
    let ctx = setup(&[1, 2, 3]).await;
    let chat = create_chat(&ctx, UserId(1), &group_request(Some("Launch"), &[2, 3]))
        .await
        .expect("chat");

    let mut roster: Vec<_> = chat.members.iter().map(|m| (m.user.id, m.role)).collect();
    roster.sort_by_key(|(id, _)| *id);
    assert_eq!(
        roster,
        vec![
            (UserId(1), MemberRole::Admin),
            (UserId(2), MemberRole::Member),
            (UserId(3), MemberRole::Member),
        ]
    );
}

#[tokio::test]
async fn creator_listed_in_member_ids_is_still_single_admin() {
    let ctx = setup(&[1, 2]).await;
    let chat = create_chat(&ctx, UserId(1), &group_request(Some("dup"), &[1, 2, 2]))
        .await
        .expect("chat");
    assert_eq!(chat.members.len(), 2);
    assert!(chat
        .members
        .iter()
        .any(|m| m.user.id == UserId(1) && m.role == MemberRole::Admin));
}

#[tokio::test]
async fn group_without_name_is_rejected() {
    let ctx = setup(&[1]).await;
    for name in [None, Some("   ")] {
        let err = create_chat(&ctx, UserId(1), &group_request(name, &[]))
            .await
            .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Validation);
    }
}

#[tokio::test]
async fn unknown_member_is_rejected() {
    let ctx = setup(&[1]).await;
    let err = create_chat(&ctx, UserId(1), &group_request(Some("x"), &[99]))
        .await
        .expect_err("should fail");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn direct_chat_is_idempotent_across_argument_order() {
    let ctx = setup(&[1, 2]).await;
    let first = get_or_create_direct_chat(&ctx, UserId(1), UserId(2))
        .await
        .expect("first");
    let again = get_or_create_direct_chat(&ctx, UserId(1), UserId(2))
        .await
        .expect("again");
    let swapped = get_or_create_direct_chat(&ctx, UserId(2), UserId(1))
        .await
        .expect("swapped");
    assert_eq!(first.id, again.id);
    assert_eq!(first.id, swapped.id);
    assert_eq!(first.members.len(), 2);

    let via_create = create_chat(
        &ctx,
        UserId(2),
        &CreateChatRequest {
            chat_type: ChatType::Direct,
            name: None,
            recipient_id: Some(UserId(1)),
            member_ids: Vec::new(),
            project_id: None,
            team_id: None,
        },
    )
    .await
    .expect("create action");
    assert_eq!(via_create.id, first.id);
}

#[tokio::test]
async fn direct_chat_with_self_or_unknown_user_fails() {
    let ctx = setup(&[1]).await;
    let err = get_or_create_direct_chat(&ctx, UserId(1), UserId(1))
        .await
        .expect_err("self");
    assert_eq!(err.code, ErrorCode::Validation);
    let err = get_or_create_direct_chat(&ctx, UserId(1), UserId(77))
        .await
        .expect_err("unknown");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn project_and_team_chats_require_existing_scope() {
    let ctx = setup(&[1]).await;
    ctx.storage
        .upsert_project(ProjectId(5), "Website")
        .await
        .expect("project");

    let request = CreateChatRequest {
        chat_type: ChatType::Project,
        name: None,
        recipient_id: None,
        member_ids: Vec::new(),
        project_id: Some(ProjectId(5)),
        team_id: None,
    };
    let chat = create_chat(&ctx, UserId(1), &request).await.expect("chat");
    assert_eq!(chat.project_id, Some(ProjectId(5)));

    let missing_team = CreateChatRequest {
        chat_type: ChatType::Team,
        team_id: Some(TeamId(9)),
        project_id: None,
        ..request.clone()
    };
    let err = create_chat(&ctx, UserId(1), &missing_team)
        .await
        .expect_err("unknown team");
    assert_eq!(err.code, ErrorCode::NotFound);

    let both = CreateChatRequest {
        team_id: Some(TeamId(9)),
        ..request
    };
    let err = create_chat(&ctx, UserId(1), &both)
        .await
        .expect_err("both scopes");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn non_member_sees_not_found_for_existing_chat() {
    let ctx = setup(&[1, 2, 3]).await;
    let chat = create_chat(&ctx, UserId(1), &group_request(Some("private"), &[2]))
        .await
        .expect("chat");
    let hidden = get_chat(&ctx, UserId(3), chat.id).await.expect_err("hidden");
    let missing = get_chat(&ctx, UserId(3), ChatId(9999))
        .await
        .expect_err("missing");
    assert_eq!(hidden, missing);
}

#[tokio::test]
async fn listing_enriches_members_last_message_and_unread() {
    let ctx = setup(&[1, 2]).await;
    let quiet = create_chat(&ctx, UserId(1), &group_request(Some("quiet"), &[2]))
        .await
        .expect("quiet");
    let busy = create_chat(&ctx, UserId(1), &group_request(Some("busy"), &[2]))
        .await
        .expect("busy");
    say(&ctx, 2, busy.id, "one").await;
    say(&ctx, 2, busy.id, "two").await;

    let chats = list_user_chats(&ctx, UserId(1)).await.expect("list");
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].id, busy.id);
    assert_eq!(chats[0].members.len(), 2);
    assert_eq!(
        chats[0].last_message.as_ref().map(|m| m.content.as_str()),
        Some("two")
    );
    assert_eq!(chats[0].unread_count, 2);
    assert_eq!(chats[1].id, quiet.id);
    assert!(chats[1].last_message.is_none());
    assert_eq!(chats[1].unread_count, 0);
}

#[tokio::test]
async fn unread_count_drops_to_zero_after_mark_read() {
    let ctx = setup(&[1, 2]).await;
    let chat = create_chat(&ctx, UserId(1), &group_request(Some("news"), &[2]))
        .await
        .expect("chat");
    mark_read(&ctx, UserId(2), chat.id, None)
        .await
        .expect("baseline");
    for n in 0..5 {
        say(&ctx, 1, chat.id, &format!("m{n}")).await;
    }
    say(&ctx, 2, chat.id, "own").await;

    let state = unread_count(&ctx, UserId(2), chat.id).await.expect("count");
    assert_eq!(state.unread_count, 5);

    let state = mark_read(&ctx, UserId(2), chat.id, None)
        .await
        .expect("mark");
    assert_eq!(state.unread_count, 0);
    assert!(state.last_read_at.is_some());
}

#[tokio::test]
async fn stale_mark_read_does_not_rewind_watermark() {
    let ctx = setup(&[1]).await;
    let chat = create_chat(&ctx, UserId(1), &group_request(Some("w"), &[]))
        .await
        .expect("chat");
    let t1 = Utc::now();
    let t0 = t1 - chrono::Duration::hours(1);
    let first = mark_read(&ctx, UserId(1), chat.id, Some(t1))
        .await
        .expect("t1");
    let second = mark_read(&ctx, UserId(1), chat.id, Some(t0))
        .await
        .expect("t0");
    assert_eq!(first.last_read_at, Some(t1));
    assert_eq!(second.last_read_at, Some(t1));
}

#[tokio::test]
async fn membership_management_requires_admin_and_emits_events() {
    let ctx = setup(&[1, 2, 3]).await;
    let chat = create_chat(&ctx, UserId(1), &group_request(Some("team"), &[2]))
        .await
        .expect("chat");

    let err = add_member(&ctx, UserId(2), chat.id, UserId(3))
        .await
        .expect_err("member cannot add");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let added = add_member(&ctx, UserId(1), chat.id, UserId(3))
        .await
        .expect("admin adds");
    assert_eq!(added.value.role, MemberRole::Member);
    assert!(matches!(
        added.event,
        Some(ChatEvent::UserJoined { user_id: UserId(3), .. })
    ));

    let again = add_member(&ctx, UserId(1), chat.id, UserId(3))
        .await
        .expect("idempotent");
    assert!(again.event.is_none());

    let left = remove_member(&ctx, UserId(3), chat.id, UserId(3))
        .await
        .expect("self leave");
    assert!(matches!(
        left.event,
        Some(ChatEvent::UserLeft { user_id: UserId(3), .. })
    ));

    let err = remove_member(&ctx, UserId(2), chat.id, UserId(1))
        .await
        .expect_err("member cannot remove admin");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn last_admin_cannot_be_demoted_or_removed() {
    let ctx = setup(&[1, 2]).await;
    let chat = create_chat(&ctx, UserId(1), &group_request(Some("solo"), &[2]))
        .await
        .expect("chat");
    let err = set_member_role(&ctx, UserId(1), chat.id, UserId(1), MemberRole::Member)
        .await
        .expect_err("demote");
    assert_eq!(err.code, ErrorCode::Conflict);

    let promoted = set_member_role(&ctx, UserId(1), chat.id, UserId(2), MemberRole::Admin)
        .await
        .expect("promote");
    assert_eq!(promoted.role, MemberRole::Admin);
    remove_member(&ctx, UserId(1), chat.id, UserId(1))
        .await
        .expect("leave once another admin exists");
}

#[tokio::test]
async fn direct_chats_reject_membership_changes() {
    let ctx = setup(&[1, 2, 3]).await;
    let chat = get_or_create_direct_chat(&ctx, UserId(1), UserId(2))
        .await
        .expect("direct");
    let err = add_member(&ctx, UserId(1), chat.id, UserId(3))
        .await
        .expect_err("fixed");
    assert_eq!(err.code, ErrorCode::Validation);
}
