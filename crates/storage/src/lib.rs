use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};

use shared::{
    domain::{
        direct_pair_key, AttachmentId, ChatId, ChatType, FileId, MemberRole, MessageId,
        MessageType, ProjectId, TeamId, UserId,
    },
    protocol::{FileDescriptor, UserProfile},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredChat {
    pub chat_id: ChatId,
    pub chat_type: ChatType,
    pub name: Option<String>,
    pub project_id: Option<ProjectId>,
    pub team_id: Option<TeamId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChat {
    pub chat_type: ChatType,
    pub name: Option<String>,
    pub project_id: Option<ProjectId>,
    pub team_id: Option<TeamId>,
    pub created_by: UserId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMember {
    pub chat_id: ChatId,
    pub user: UserProfile,
    pub role: MemberRole,
    pub last_read_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender: UserProfile,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<MessageId>,
    pub metadata: Option<serde_json::Value>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: &'a str,
    pub message_type: MessageType,
    pub reply_to_id: Option<MessageId>,
    pub metadata: Option<&'a serde_json::Value>,
    /// Written in the same transaction as the message row.
    pub attachments: &'a [FileDescriptor],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub attachment_id: AttachmentId,
    pub message_id: MessageId,
    pub file: FileDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionToggle {
    Added,
    Removed,
    /// A concurrent toggle inserted the same row first; the reaction exists.
    AlreadyPresent,
}

const CHAT_COLUMNS: &str =
    "c.id, c.type, c.name, c.project_id, c.team_id, c.created_by, c.created_at, c.updated_at";

const MEMBER_COLUMNS: &str = "cm.chat_id, cm.role, cm.last_read_at, cm.joined_at, \
     u.id AS user_id, u.email, u.username, u.full_name, u.avatar_url";

const MESSAGE_COLUMNS: &str = "m.id, m.chat_id, m.content, m.message_type, m.reply_to_id, \
     m.metadata, m.edited_at, m.deleted_at, m.created_at, m.updated_at, \
     u.id AS user_id, u.email, u.username, u.full_name, u.avatar_url";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_user(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, email, username, full_name, avatar_url)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                username = excluded.username,
                full_name = excluded.full_name,
                avatar_url = excluded.avatar_url",
        )
        .bind(profile.id.0)
        .bind(profile.email.as_deref())
        .bind(&profile.username)
        .bind(profile.full_name.as_deref())
        .bind(profile.avatar_url.as_deref())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert user {}", profile.id))?;
        Ok(())
    }

    pub async fn user_profile(&self, user_id: UserId) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT u.id AS user_id, u.email, u.username, u.full_name, u.avatar_url
             FROM users u WHERE u.id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    pub async fn upsert_project(&self, project_id: ProjectId, name: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(project_id.0)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_team(&self, team_id: TeamId, name: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO teams (id, name) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(team_id.0)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn project_exists(&self, project_id: ProjectId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM projects WHERE id = ?")
            .bind(project_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn team_exists(&self, team_id: TeamId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM teams WHERE id = ?")
            .bind(team_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Returns the direct chat for the unordered pair, creating it and both
    /// memberships in one transaction when absent. The `direct_key` unique
    /// constraint decides races: the losing insert falls through to the lookup.
    pub async fn get_or_create_direct_chat(
        &self,
        user_a: UserId,
        user_b: UserId,
        now: DateTime<Utc>,
    ) -> Result<(StoredChat, bool)> {
        if user_a == user_b {
            return Err(anyhow!("direct chat requires two distinct users"));
        }
        let key = direct_pair_key(user_a, user_b);

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO chats (type, direct_key, created_by, created_at, updated_at)
             VALUES ('direct', ?, ?, ?, ?)
             ON CONFLICT(direct_key) DO NOTHING
             RETURNING id",
        )
        .bind(&key)
        .bind(user_a.0)
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to insert direct chat")?;

        let created = inserted.is_some();
        let chat_id = match inserted {
            Some(row) => {
                let chat_id = ChatId(row.try_get::<i64, _>("id")?);
                for user_id in [user_a, user_b] {
                    sqlx::query(
                        "INSERT INTO chat_members (chat_id, user_id, role, joined_at)
                         VALUES (?, ?, 'member', ?)
                         ON CONFLICT(chat_id, user_id) DO NOTHING",
                    )
                    .bind(chat_id.0)
                    .bind(user_id.0)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .context("failed to insert direct chat member")?;
                }
                chat_id
            }
            None => {
                let row = sqlx::query("SELECT id FROM chats WHERE direct_key = ?")
                    .bind(&key)
                    .fetch_one(&mut *tx)
                    .await
                    .context("direct chat vanished after conflicting insert")?;
                ChatId(row.try_get::<i64, _>("id")?)
            }
        };
        tx.commit().await?;

        let chat = self
            .chat(chat_id)
            .await?
            .ok_or_else(|| anyhow!("direct chat {chat_id} missing after commit"))?;
        Ok((chat, created))
    }

    /// Creates a non-direct chat together with its initial memberships.
    pub async fn create_chat(
        &self,
        chat: &NewChat,
        members: &[(UserId, MemberRole)],
        now: DateTime<Utc>,
    ) -> Result<StoredChat> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO chats (type, name, project_id, team_id, created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(chat.chat_type.as_str())
        .bind(chat.name.as_deref())
        .bind(chat.project_id.map(|id| id.0))
        .bind(chat.team_id.map(|id| id.0))
        .bind(chat.created_by.0)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert chat")?;
        let chat_id = ChatId(row.try_get::<i64, _>("id")?);

        for (user_id, role) in members {
            sqlx::query(
                "INSERT INTO chat_members (chat_id, user_id, role, joined_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(chat_id, user_id) DO NOTHING",
            )
            .bind(chat_id.0)
            .bind(user_id.0)
            .bind(role.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to add member {user_id} to chat {chat_id}"))?;
        }
        tx.commit().await?;

        self.chat(chat_id)
            .await?
            .ok_or_else(|| anyhow!("chat {chat_id} missing after commit"))
    }

    pub async fn chat(&self, chat_id: ChatId) -> Result<Option<StoredChat>> {
        let row = sqlx::query(&format!("SELECT {CHAT_COLUMNS} FROM chats c WHERE c.id = ?"))
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chat_from_row).transpose()
    }

    pub async fn list_chats_for_user(&self, user_id: UserId) -> Result<Vec<StoredChat>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS}
             FROM chats c
             INNER JOIN chat_members cm ON cm.chat_id = c.id
             WHERE cm.user_id = ?
             ORDER BY c.updated_at DESC, c.id DESC"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chat_from_row).collect()
    }

    pub async fn member(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<StoredMember>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS}
             FROM chat_members cm
             INNER JOIN users u ON u.id = cm.user_id
             WHERE cm.chat_id = ? AND cm.user_id = ?"
        ))
        .bind(chat_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(member_from_row).transpose()
    }

    /// Batch-fetches the member lists of several chats in one query.
    pub async fn members_for_chats(&self, chat_ids: &[ChatId]) -> Result<Vec<StoredMember>> {
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MEMBER_COLUMNS}
             FROM chat_members cm
             INNER JOIN users u ON u.id = cm.user_id
             WHERE cm.chat_id IN ("
        ));
        let mut ids = query.separated(", ");
        for chat_id in chat_ids {
            ids.push_bind(chat_id.0);
        }
        ids.push_unseparated(") ORDER BY cm.chat_id ASC, cm.id ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(member_from_row).collect()
    }

    /// Returns `true` when a membership row was created, `false` when the user
    /// was already a member.
    pub async fn add_member(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        role: MemberRole,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO chat_members (chat_id, user_id, role, joined_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(chat_id, user_id) DO NOTHING",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn remove_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_member_role(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        role: MemberRole,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE chat_members SET role = ? WHERE chat_id = ? AND user_id = ?")
                .bind(role.as_str())
                .bind(chat_id.0)
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_admins(&self, chat_id: ChatId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chat_members WHERE chat_id = ? AND role = 'admin'",
        )
        .bind(chat_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Moves the read watermark forward to `up_to`. Returns `false` when the
    /// stored watermark is already at or past `up_to` (or the member is
    /// missing), in which case nothing changes.
    pub async fn mark_read(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        up_to: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE chat_members
             SET last_read_at = ?
             WHERE chat_id = ? AND user_id = ?
               AND (last_read_at IS NULL OR last_read_at < ?)",
        )
        .bind(up_to)
        .bind(chat_id.0)
        .bind(user_id.0)
        .bind(up_to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn unread_count(&self, chat_id: ChatId, user_id: UserId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(m.id)
             FROM chat_members cm
             INNER JOIN chat_messages m ON m.chat_id = cm.chat_id
             WHERE cm.chat_id = ? AND cm.user_id = ?
               AND m.sender_id <> cm.user_id
               AND m.deleted_at IS NULL
               AND (cm.last_read_at IS NULL OR m.created_at > cm.last_read_at)",
        )
        .bind(chat_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Unread counts for every chat the user belongs to, in one grouped query.
    pub async fn unread_counts_for_user(&self, user_id: UserId) -> Result<HashMap<ChatId, u64>> {
        let rows = sqlx::query(
            "SELECT cm.chat_id, COUNT(m.id) AS unread
             FROM chat_members cm
             LEFT JOIN chat_messages m
               ON m.chat_id = cm.chat_id
              AND m.sender_id <> cm.user_id
              AND m.deleted_at IS NULL
              AND (cm.last_read_at IS NULL OR m.created_at > cm.last_read_at)
             WHERE cm.user_id = ?
             GROUP BY cm.chat_id",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    ChatId(row.try_get::<i64, _>("chat_id")?),
                    row.try_get::<i64, _>("unread")?.max(0) as u64,
                ))
            })
            .collect()
    }

    pub async fn insert_message(
        &self,
        message: &NewMessage<'_>,
        now: DateTime<Utc>,
    ) -> Result<StoredMessage> {
        let metadata = message
            .metadata
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode message metadata")?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO chat_messages
                (chat_id, sender_id, content, message_type, reply_to_id, metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.chat_id.0)
        .bind(message.sender_id.0)
        .bind(message.content)
        .bind(message.message_type.as_str())
        .bind(message.reply_to_id.map(|id| id.0))
        .bind(metadata)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert chat message")?;
        let message_id = MessageId(row.try_get::<i64, _>("id")?);
        for file in message.attachments {
            insert_attachment_row(&mut tx, message_id, file, now).await?;
        }

        sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(message.chat_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.message(message_id)
            .await?
            .ok_or_else(|| anyhow!("message {message_id} missing after commit"))
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM chat_messages m
             INNER JOIN users u ON u.id = m.sender_id
             WHERE m.id = ?"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Newest `limit` messages (optionally older than `before`), returned in
    /// ascending id order.
    pub async fn list_chat_messages(
        &self,
        chat_id: ChatId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM chat_messages m
             INNER JOIN users u ON u.id = m.sender_id
             WHERE m.chat_id = "
        ));
        query.push_bind(chat_id.0);
        if let Some(before) = before {
            query.push(" AND m.id < ").push_bind(before.0);
        }
        query.push(" ORDER BY m.id DESC LIMIT ").push_bind(i64::from(limit));

        let mut rows = query.build().fetch_all(&self.pool).await?;
        rows.reverse();
        rows.iter().map(message_from_row).collect()
    }

    /// Most recent message of each given chat, one query for all of them.
    pub async fn latest_messages(&self, chat_ids: &[ChatId]) -> Result<Vec<StoredMessage>> {
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM chat_messages m
             INNER JOIN users u ON u.id = m.sender_id
             WHERE m.id IN (
                SELECT MAX(id) FROM chat_messages WHERE chat_id IN ("
        ));
        let mut ids = query.separated(", ");
        for chat_id in chat_ids {
            ids.push_bind(chat_id.0);
        }
        ids.push_unseparated(") GROUP BY chat_id)");
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE chat_messages
             SET content = ?, edited_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(content)
        .bind(now)
        .bind(now)
        .bind(message_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Redacts the message in place. The row, its reply edges and its
    /// reactions stay. Returns `false` if it was already deleted.
    pub async fn soft_delete_message(
        &self,
        message_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE chat_messages
             SET content = '', metadata = NULL, deleted_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(message_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Attaches a file to an existing message and bumps the message's
    /// `updated_at` so clients holding an older copy take the new one.
    pub async fn insert_attachment(
        &self,
        message_id: MessageId,
        file: &FileDescriptor,
        now: DateTime<Utc>,
    ) -> Result<StoredAttachment> {
        let mut tx = self.pool.begin().await?;
        let attachment = insert_attachment_row(&mut tx, message_id, file, now).await?;
        touch_message(&mut tx, message_id, now).await?;
        tx.commit().await?;
        Ok(attachment)
    }

    pub async fn attachments_for_messages(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<StoredAttachment>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, message_id, file_id, file_name, file_type, file_size, file_url
             FROM chat_message_attachments
             WHERE message_id IN (",
        );
        let mut ids = query.separated(", ");
        for message_id in message_ids {
            ids.push_bind(message_id.0);
        }
        ids.push_unseparated(") ORDER BY id ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(StoredAttachment {
                    attachment_id: AttachmentId(row.try_get::<i64, _>("id")?),
                    message_id: MessageId(row.try_get::<i64, _>("message_id")?),
                    file: FileDescriptor {
                        file_id: FileId(row.try_get::<i64, _>("file_id")?),
                        file_name: row.try_get("file_name")?,
                        file_type: row.try_get("file_type")?,
                        file_size: row.try_get::<i64, _>("file_size")?.max(0) as u64,
                        file_url: row.try_get("file_url")?,
                    },
                })
            })
            .collect()
    }

    /// Removes the reaction if present, otherwise adds it. Either change
    /// bumps the message's `updated_at`.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
        now: DateTime<Utc>,
    ) -> Result<ReactionToggle> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let toggle = if removed > 0 {
            ReactionToggle::Removed
        } else if insert_reaction_row(&mut tx, message_id, user_id, emoji, now).await? {
            ReactionToggle::Added
        } else {
            ReactionToggle::AlreadyPresent
        };
        if toggle != ReactionToggle::AlreadyPresent {
            touch_message(&mut tx, message_id, now).await?;
        }
        tx.commit().await?;
        Ok(toggle)
    }

    /// Inserts the reaction row. A unique-constraint violation means someone
    /// else inserted the same triple first and is reported as `false`.
    pub async fn add_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_reaction_row(&mut tx, message_id, user_id, emoji, now).await?;
        if inserted {
            touch_message(&mut tx, message_id, now).await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn reactions_for_messages(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<StoredReaction>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT message_id, user_id, emoji, created_at
             FROM message_reactions
             WHERE message_id IN (",
        );
        let mut ids = query.separated(", ");
        for message_id in message_ids {
            ids.push_bind(message_id.0);
        }
        ids.push_unseparated(") ORDER BY id ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(StoredReaction {
                    message_id: MessageId(row.try_get::<i64, _>("message_id")?),
                    user_id: UserId(row.try_get::<i64, _>("user_id")?),
                    emoji: row.try_get("emoji")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

async fn insert_attachment_row(
    conn: &mut SqliteConnection,
    message_id: MessageId,
    file: &FileDescriptor,
    now: DateTime<Utc>,
) -> Result<StoredAttachment> {
    let row = sqlx::query(
        "INSERT INTO chat_message_attachments
            (message_id, file_id, file_name, file_type, file_size, file_url, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         RETURNING id",
    )
    .bind(message_id.0)
    .bind(file.file_id.0)
    .bind(&file.file_name)
    .bind(&file.file_type)
    .bind(i64::try_from(file.file_size).unwrap_or(i64::MAX))
    .bind(&file.file_url)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("failed to attach file {} to message {message_id}", file.file_id))?;

    Ok(StoredAttachment {
        attachment_id: AttachmentId(row.try_get::<i64, _>("id")?),
        message_id,
        file: file.clone(),
    })
}

async fn insert_reaction_row(
    conn: &mut SqliteConnection,
    message_id: MessageId,
    user_id: UserId,
    emoji: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let inserted = sqlx::query(
        "INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(message_id.0)
    .bind(user_id.0)
    .bind(emoji)
    .bind(now)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Ok(false),
        Err(err) => Err(err).context("failed to insert reaction"),
    }
}

/// Never moves `updated_at` backwards.
async fn touch_message(
    conn: &mut SqliteConnection,
    message_id: MessageId,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE chat_messages SET updated_at = ? WHERE id = ? AND updated_at < ?")
        .bind(now)
        .bind(message_id.0)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn profile_from_row(row: &SqliteRow) -> Result<UserProfile> {
    Ok(UserProfile {
        id: UserId(row.try_get::<i64, _>("user_id")?),
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        full_name: row.try_get("full_name")?,
        avatar_url: row.try_get("avatar_url")?,
    })
}

fn chat_from_row(row: &SqliteRow) -> Result<StoredChat> {
    let raw_type: String = row.try_get("type")?;
    Ok(StoredChat {
        chat_id: ChatId(row.try_get::<i64, _>("id")?),
        chat_type: ChatType::parse(&raw_type)
            .ok_or_else(|| anyhow!("unknown chat type '{raw_type}'"))?,
        name: row.try_get("name")?,
        project_id: row.try_get::<Option<i64>, _>("project_id")?.map(ProjectId),
        team_id: row.try_get::<Option<i64>, _>("team_id")?.map(TeamId),
        created_by: UserId(row.try_get::<i64, _>("created_by")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn member_from_row(row: &SqliteRow) -> Result<StoredMember> {
    let raw_role: String = row.try_get("role")?;
    Ok(StoredMember {
        chat_id: ChatId(row.try_get::<i64, _>("chat_id")?),
        user: profile_from_row(row)?,
        role: MemberRole::parse(&raw_role)
            .ok_or_else(|| anyhow!("unknown member role '{raw_role}'"))?,
        last_read_at: row.try_get("last_read_at")?,
        joined_at: row.try_get("joined_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let raw_type: String = row.try_get("message_type")?;
    let metadata = row
        .try_get::<Option<String>, _>("metadata")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("stored message metadata is not valid json")?;
    Ok(StoredMessage {
        message_id: MessageId(row.try_get::<i64, _>("id")?),
        chat_id: ChatId(row.try_get::<i64, _>("chat_id")?),
        sender: profile_from_row(row)?,
        content: row.try_get("content")?,
        message_type: MessageType::parse(&raw_type)
            .ok_or_else(|| anyhow!("unknown message type '{raw_type}'"))?,
        reply_to_id: row.try_get::<Option<i64>, _>("reply_to_id")?.map(MessageId),
        metadata,
        edited_at: row.try_get("edited_at")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
