use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{GuildId, MessageId, MessageKind, Role, RoomKey, UserId, UserProfile},
    protocol::{FileReference, GuildSummary, MessagePayload, PollOption, PollPayload},
};

const MESSAGE_COLUMNS: &str = "id, author_id, author_name, guild_id, kind, content, file_url, file_name, poll_question, poll_options, seen_by, version, created_at, updated_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message: MessagePayload,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub guild_id: Option<GuildId>,
    pub kind: MessageKind,
    pub content: String,
    pub file: Option<FileReference>,
    pub poll: Option<PollPayload>,
    pub created_at: DateTime<Utc>,
}

/// Columns left as `None` keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub seen_by: Option<BTreeSet<UserId>>,
    pub poll_options: Option<Vec<PollOption>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(StoredMessage),
    /// The row moved past the expected version.
    Stale,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredGuild {
    pub guild_id: GuildId,
    pub name: String,
    pub owner_id: UserId,
    pub invite_code: String,
    pub created_at: DateTime<Utc>,
}

impl StoredGuild {
    pub fn summary(self, role: Option<Role>) -> GuildSummary {
        GuildSummary {
            guild_id: self.guild_id,
            name: self.name,
            owner_id: self.owner_id,
            invite_code: self.invite_code,
            created_at: self.created_at,
            role,
        }
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn upsert_user(
        &self,
        handle: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
        email: Option<&str>,
    ) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (handle, first_name, last_name, email, created_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(handle) DO UPDATE SET
                first_name = COALESCE(excluded.first_name, users.first_name),
                last_name = COALESCE(excluded.last_name, users.last_name),
                email = COALESCE(excluded.email, users.email)
             RETURNING id",
        )
        .bind(handle)
        .bind(first_name)
        .bind(last_name)
        .bind(email)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to upsert user '{handle}'"))?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn find_user(&self, user_id: UserId) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT id, handle, first_name, last_name, email FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserProfile {
            user_id: UserId(r.get::<i64, _>(0)),
            handle: Some(r.get::<String, _>(1)),
            first_name: r.get::<Option<String>, _>(2),
            last_name: r.get::<Option<String>, _>(3),
            emails: r.get::<Option<String>, _>(4).into_iter().collect(),
        }))
    }

    /// Inserts the guild and its owner membership; `None` when the invite code is taken.
    pub async fn insert_guild(
        &self,
        name: &str,
        owner_user_id: UserId,
        invite_code: &str,
    ) -> Result<Option<StoredGuild>> {
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO guilds (name, owner_user_id, invite_code, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(invite_code) DO NOTHING
             RETURNING id",
        )
        .bind(name)
        .bind(owner_user_id.0)
        .bind(invite_code)
        .bind(created_at)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to insert guild")?;
        let Some(rec) = rec else {
            tx.rollback().await?;
            return Ok(None);
        };
        let guild_id = GuildId(rec.get::<i64, _>(0));

        sqlx::query("INSERT INTO memberships (guild_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)")
            .bind(guild_id.0)
            .bind(owner_user_id.0)
            .bind(Role::Owner.as_str())
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .context("failed to insert owner membership")?;
        tx.commit().await?;

        Ok(Some(StoredGuild {
            guild_id,
            name: name.to_string(),
            owner_id: owner_user_id,
            invite_code: invite_code.to_string(),
            created_at,
        }))
    }

    pub async fn find_guild(&self, guild_id: GuildId) -> Result<Option<StoredGuild>> {
        let row = sqlx::query(
            "SELECT id, name, owner_user_id, invite_code, created_at FROM guilds WHERE id = ?",
        )
        .bind(guild_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| guild_from_row(&r)))
    }

    pub async fn find_guild_by_invite_code(&self, invite_code: &str) -> Result<Option<StoredGuild>> {
        let row = sqlx::query(
            "SELECT id, name, owner_user_id, invite_code, created_at FROM guilds WHERE invite_code = ?",
        )
        .bind(invite_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| guild_from_row(&r)))
    }

    /// Returns `false` when the (guild, user) row already exists.
    pub async fn insert_membership(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        role: Role,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO memberships (guild_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(guild_id, user_id) DO NOTHING",
        )
        .bind(guild_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn find_membership(&self, guild_id: GuildId, user_id: UserId) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT role FROM memberships WHERE guild_id = ? AND user_id = ?")
            .bind(guild_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Role::parse(&r.get::<String, _>(0))))
    }

    pub async fn list_guilds_for_user(&self, user_id: UserId) -> Result<Vec<(StoredGuild, Role)>> {
        let rows = sqlx::query(
            "SELECT g.id, g.name, g.owner_user_id, g.invite_code, g.created_at, m.role
             FROM memberships m
             INNER JOIN guilds g ON g.id = m.guild_id
             WHERE m.user_id = ?
             ORDER BY m.joined_at ASC, m.rowid ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (guild_from_row(&r), Role::parse(&r.get::<String, _>(5))))
            .collect())
    }

    pub async fn insert_message(&self, draft: NewMessage) -> Result<StoredMessage> {
        let (poll_question, poll_options) = match &draft.poll {
            Some(poll) => (
                Some(poll.question.as_str()),
                Some(serde_json::to_string(&poll.options)?),
            ),
            None => (None, None),
        };
        let row = sqlx::query(&format!(
            "INSERT INTO messages (id, author_id, author_name, guild_id, kind, content, file_url, file_name, poll_question, poll_options, seen_by, version, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '[]', 0, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(draft.id.0.to_string())
        .bind(draft.author_id.0)
        .bind(&draft.author_name)
        .bind(draft.guild_id.map(|id| id.0))
        .bind(draft.kind.as_str())
        .bind(&draft.content)
        .bind(draft.file.as_ref().map(|file| file.url.as_str()))
        .bind(draft.file.as_ref().and_then(|file| file.name.as_deref()))
        .bind(poll_question)
        .bind(poll_options)
        .bind(draft.created_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;
        message_from_row(&row)
    }

    pub async fn find_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Messages of a room in server receipt order.
    pub async fn find_messages_by_room(&self, room: RoomKey) -> Result<Vec<StoredMessage>> {
        let rows = match room {
            RoomKey::Global => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE guild_id IS NULL ORDER BY rowid ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
            RoomKey::Guild(guild_id) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE guild_id = ? ORDER BY rowid ASC"
                ))
                .bind(guild_id.0)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(message_from_row).collect()
    }

    /// Applies `patch` only if the row is still at `expected_version`.
    pub async fn update_message(
        &self,
        message_id: MessageId,
        expected_version: i64,
        patch: &MessagePatch,
    ) -> Result<UpdateOutcome> {
        let seen_by = patch.seen_by.as_ref().map(serde_json::to_string).transpose()?;
        let poll_options = patch
            .poll_options
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let row = sqlx::query(&format!(
            "UPDATE messages SET
                content = COALESCE(?, content),
                updated_at = COALESCE(?, updated_at),
                seen_by = COALESCE(?, seen_by),
                poll_options = COALESCE(?, poll_options),
                version = version + 1
             WHERE id = ? AND version = ?
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(patch.content.as_deref())
        .bind(patch.updated_at)
        .bind(seen_by)
        .bind(poll_options)
        .bind(message_id.0.to_string())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to update message {message_id}"))?;

        if let Some(row) = row {
            return Ok(UpdateOutcome::Updated(message_from_row(&row)?));
        }
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM messages WHERE id = ?")
            .bind(message_id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(if exists.is_some() {
            UpdateOutcome::Stale
        } else {
            UpdateOutcome::Missing
        })
    }

    /// Returns `false` when no such message existed.
    pub async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.0.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }
}

fn guild_from_row(r: &SqliteRow) -> StoredGuild {
    StoredGuild {
        guild_id: GuildId(r.get::<i64, _>(0)),
        name: r.get::<String, _>(1),
        owner_id: UserId(r.get::<i64, _>(2)),
        invite_code: r.get::<String, _>(3),
        created_at: r.get::<DateTime<Utc>, _>(4),
    }
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    let raw_id: String = r.try_get("id")?;
    let id = MessageId::from_str(&raw_id).with_context(|| format!("malformed message id '{raw_id}'"))?;
    let raw_kind: String = r.try_get("kind")?;
    let kind = MessageKind::parse(&raw_kind)
        .with_context(|| format!("message {id} has unknown kind '{raw_kind}'"))?;

    let raw_seen_by: String = r.try_get("seen_by")?;
    let seen_by: BTreeSet<UserId> = serde_json::from_str(&raw_seen_by)
        .with_context(|| format!("message {id} has a malformed seen_by column"))?;

    let poll = match r.try_get::<Option<String>, _>("poll_question")? {
        Some(question) => {
            let raw_options = r.try_get::<Option<String>, _>("poll_options")?.unwrap_or_else(|| "[]".into());
            let options: Vec<PollOption> = serde_json::from_str(&raw_options)
                .with_context(|| format!("message {id} has malformed poll options"))?;
            Some(PollPayload { question, options })
        }
        None => None,
    };

    let file = r
        .try_get::<Option<String>, _>("file_url")?
        .map(|url| -> Result<FileReference> {
            Ok(FileReference {
                url,
                name: r.try_get::<Option<String>, _>("file_name")?,
            })
        })
        .transpose()?;

    Ok(StoredMessage {
        message: MessagePayload {
            id,
            author_id: UserId(r.try_get("author_id")?),
            author_name: r.try_get("author_name")?,
            guild_id: r.try_get::<Option<i64>, _>("guild_id")?.map(GuildId),
            kind,
            content: r.try_get("content")?,
            file,
            poll,
            seen_by,
            created_at: r.try_get("created_at")?,
            updated_at: r.try_get("updated_at")?,
        },
        version: r.try_get("version")?,
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
