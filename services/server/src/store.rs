//! SQLite-backed store for users, sessions, guilds, and messages.
//!
//! All multi-row mutations run inside explicit transactions; the hub is only
//! told about a mutation after the transaction commits, so a store failure
//! never leaves the in-memory indices ahead of disk.

use chrono::{DateTime, Duration, Utc};
use concord_protocol::events::{GuildSnapshot, MemberProfile};
use concord_protocol::{
    Channel, ChannelId, ChannelKind, Message, MessageId, MessageKind, Permissions, Role, RoleId,
    Server, ServerId, ServerMember, Status, User, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("storage/schema.sql");

/// Sessions expire 30 days after issuance.
const SESSION_TTL_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("username or email already taken")]
    Conflict,
    #[error("not found")]
    NotFound,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A validated session, resolved from a bearer token hash.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

pub struct Store {
    conn: Connection,
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(t) => t.parse().map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
    }
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(t) => DateTime::parse_from_rfc3339(&t)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

fn status_str(status: Status) -> &'static str {
    match status {
        Status::Online => "online",
        Status::Idle => "idle",
        Status::Dnd => "dnd",
        Status::Offline => "offline",
    }
}

fn status_from(text: &str) -> Status {
    match text {
        "online" => Status::Online,
        "idle" => Status::Idle,
        "dnd" => Status::Dnd,
        _ => Status::Offline,
    }
}

fn kind_str(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Text => "text",
        ChannelKind::Voice => "voice",
        ChannelKind::Category => "category",
    }
}

fn kind_from(text: &str) -> ChannelKind {
    match text {
        "voice" => ChannelKind::Voice,
        "category" => ChannelKind::Category,
        _ => ChannelKind::Text,
    }
}

const USER_COLS: &str = "id, username, display_name, email, status, status_text";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_col(row, 0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        email: row.get(3)?,
        status: status_from(&row.get::<_, String>(4)?),
        status_text: row.get(5)?,
    })
}

const CHANNEL_COLS: &str = "id, server_id, name, kind, category_id, position, topic";

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: uuid_col(row, 0)?,
        server_id: uuid_col(row, 1)?,
        name: row.get(2)?,
        kind: kind_from(&row.get::<_, String>(3)?),
        category_id: opt_uuid_col(row, 4)?,
        position: row.get(5)?,
        topic: row.get(6)?,
    })
}

const MESSAGE_COLS: &str = "id, channel_id, author_id, content, created_at, reply_to_id, kind";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_col(row, 0)?,
        channel_id: uuid_col(row, 1)?,
        author_id: uuid_col(row, 2)?,
        content: row.get(3)?,
        created_at: time_col(row, 4)?,
        reply_to_id: opt_uuid_col(row, 5)?,
        kind: if row.get::<_, String>(6)? == "system" {
            MessageKind::System
        } else {
            MessageKind::Default
        },
    })
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // -- users & credentials -------------------------------------------------

    pub fn create_user(
        &mut self,
        username: &str,
        display_name: &str,
        email: &str,
        password_hash: &str,
        password_salt: &str,
    ) -> StoreResult<User> {
        let taken: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM users WHERE username = ?1 OR email = ?2",
                params![username, email],
                |r| r.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(StoreError::Conflict);
        }
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO users (id, username, display_name, email, password_hash, password_salt, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'offline', ?7)",
            params![
                id.to_string(),
                username,
                display_name,
                email,
                password_hash,
                password_salt,
                now.to_rfc3339()
            ],
        )?;
        Ok(User {
            id,
            username: username.to_owned(),
            display_name: display_name.to_owned(),
            email: email.to_owned(),
            status: Status::Offline,
            status_text: String::new(),
        })
    }

    pub fn user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                user_from_row,
            )
            .optional()?)
    }

    pub fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE email = ?1"),
                params![email],
                user_from_row,
            )
            .optional()?)
    }

    /// The stored (hash, salt) pair for a login attempt.
    pub fn credentials_by_email(&self, email: &str) -> StoreResult<Option<(UserId, String, String)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, password_hash, password_salt FROM users WHERE email = ?1",
                params![email],
                |r| Ok((uuid_col(r, 0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?)
    }

    pub fn set_user_status(&self, id: UserId, status: Status, status_text: Option<&str>) -> StoreResult<()> {
        match status_text {
            Some(text) => self.conn.execute(
                "UPDATE users SET status = ?2, status_text = ?3 WHERE id = ?1",
                params![id.to_string(), status_str(status), text],
            )?,
            None => self.conn.execute(
                "UPDATE users SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status_str(status)],
            )?,
        };
        Ok(())
    }

    pub fn is_admin(&self, id: UserId) -> StoreResult<bool> {
        let flag: Option<i64> = self
            .conn
            .query_row(
                "SELECT is_admin FROM users WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Startup grant for `--admin-email`. Returns false when no such user
    /// exists yet (the grant is retried on next startup).
    pub fn grant_admin(&self, email: &str) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET is_admin = 1 WHERE email = ?1",
            params![email],
        )?;
        Ok(changed > 0)
    }

    // -- sessions ------------------------------------------------------------

    pub fn create_session(&self, user_id: UserId, token_hash: &str) -> StoreResult<SessionRecord> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + Duration::days(SESSION_TTL_DAYS);
        self.conn.execute(
            "INSERT INTO sessions (id, token_hash, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                token_hash,
                user_id.to_string(),
                now.to_rfc3339(),
                expires_at.to_rfc3339()
            ],
        )?;
        Ok(SessionRecord { session_id, user_id, expires_at })
    }

    /// Look up a session by token hash. Expired sessions resolve to `None`
    /// and are deleted on sight.
    pub fn session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<SessionRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, user_id, expires_at FROM sessions WHERE token_hash = ?1",
                params![token_hash],
                |r| {
                    Ok(SessionRecord {
                        session_id: r.get(0)?,
                        user_id: uuid_col(r, 1)?,
                        expires_at: time_col(r, 2)?,
                    })
                },
            )
            .optional()?;
        match record {
            Some(r) if r.expires_at <= Utc::now() => {
                self.conn.execute(
                    "DELETE FROM sessions WHERE id = ?1",
                    params![r.session_id],
                )?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub fn update_session_seq(&self, session_id: &str, last_seq: u64) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE sessions SET last_seq = ?2 WHERE id = ?1",
            params![session_id, i64::try_from(last_seq).unwrap_or(i64::MAX)],
        )?;
        Ok(())
    }

    // -- servers, members, roles ---------------------------------------------

    /// Create a guild with its default role and a #general text channel,
    /// owned and joined by `owner_id`.
    pub fn create_server(&mut self, name: &str, owner_id: UserId) -> StoreResult<Server> {
        let server_id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO servers (id, name, owner_id) VALUES (?1, ?2, ?3)",
            params![server_id.to_string(), name, owner_id.to_string()],
        )?;
        let role_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO roles (id, server_id, name, position, is_default, permissions)
             VALUES (?1, ?2, 'everyone', 0, 1, ?3)",
            params![
                role_id.to_string(),
                server_id.to_string(),
                i64::try_from(Permissions::SEND_MESSAGES.bits()).unwrap_or(0)
            ],
        )?;
        tx.execute(
            "INSERT INTO channels (id, server_id, name, kind, position)
             VALUES (?1, ?2, 'general', 'text', 0)",
            params![Uuid::new_v4().to_string(), server_id.to_string()],
        )?;
        tx.execute(
            "INSERT INTO members (user_id, server_id, joined_at) VALUES (?1, ?2, ?3)",
            params![owner_id.to_string(), server_id.to_string(), now],
        )?;
        tx.execute(
            "INSERT INTO member_roles (user_id, server_id, role_id) VALUES (?1, ?2, ?3)",
            params![owner_id.to_string(), server_id.to_string(), role_id.to_string()],
        )?;
        tx.commit()?;
        Ok(Server { id: server_id, name: name.to_owned(), owner_id })
    }

    pub fn server_by_id(&self, id: ServerId) -> StoreResult<Option<Server>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, owner_id FROM servers WHERE id = ?1",
                params![id.to_string()],
                |r| {
                    Ok(Server {
                        id: uuid_col(r, 0)?,
                        name: r.get(1)?,
                        owner_id: uuid_col(r, 2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn server_by_name(&self, name: &str) -> StoreResult<Option<Server>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, owner_id FROM servers WHERE name = ?1",
                params![name],
                |r| {
                    Ok(Server {
                        id: uuid_col(r, 0)?,
                        name: r.get(1)?,
                        owner_id: uuid_col(r, 2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn servers_for_user(&self, user_id: UserId) -> StoreResult<Vec<Server>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.name, s.owner_id FROM servers s
             JOIN members m ON m.server_id = s.id
             WHERE m.user_id = ?1 ORDER BY s.name",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |r| {
            Ok(Server {
                id: uuid_col(r, 0)?,
                name: r.get(1)?,
                owner_id: uuid_col(r, 2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Add a member with the server's default role. Banned users are
    /// rejected as `NotFound` (the guild does not exist, as far as they know).
    pub fn add_member(&mut self, server_id: ServerId, user_id: UserId) -> StoreResult<ServerMember> {
        let banned: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM bans WHERE user_id = ?1 AND server_id = ?2",
                params![user_id.to_string(), server_id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        if banned.is_some() {
            return Err(StoreError::NotFound);
        }
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO members (user_id, server_id, joined_at) VALUES (?1, ?2, ?3)",
            params![
                user_id.to_string(),
                server_id.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO member_roles (user_id, server_id, role_id)
             SELECT ?1, ?2, id FROM roles WHERE server_id = ?2 AND is_default = 1",
            params![user_id.to_string(), server_id.to_string()],
        )?;
        tx.commit()?;
        self.member(server_id, user_id)?.ok_or(StoreError::NotFound)
    }

    pub fn member(&self, server_id: ServerId, user_id: UserId) -> StoreResult<Option<ServerMember>> {
        let base = self
            .conn
            .query_row(
                "SELECT is_muted, muted_until FROM members WHERE user_id = ?1 AND server_id = ?2",
                params![user_id.to_string(), server_id.to_string()],
                |r| Ok((r.get::<_, i64>(0)? != 0, opt_time_col(r, 1)?)),
            )
            .optional()?;
        let Some((is_muted, muted_until)) = base else {
            return Ok(None);
        };
        let mut stmt = self.conn.prepare(
            "SELECT role_id FROM member_roles WHERE user_id = ?1 AND server_id = ?2",
        )?;
        let role_ids = stmt
            .query_map(params![user_id.to_string(), server_id.to_string()], |r| {
                uuid_col(r, 0)
            })?
            .collect::<Result<Vec<RoleId>, _>>()?;
        Ok(Some(ServerMember {
            user_id,
            server_id,
            role_ids,
            is_muted,
            muted_until,
        }))
    }

    pub fn member_roles(&self, server_id: ServerId, user_id: UserId) -> StoreResult<Vec<Role>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.server_id, r.name, r.position, r.is_default, r.is_hoisted, r.color, r.permissions
             FROM roles r
             JOIN member_roles mr ON mr.role_id = r.id
             WHERE mr.user_id = ?1 AND mr.server_id = ?2",
        )?;
        let rows = stmt.query_map(params![user_id.to_string(), server_id.to_string()], role_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn role_by_name(&self, server_id: ServerId, name: &str) -> StoreResult<Option<Role>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, server_id, name, position, is_default, is_hoisted, color, permissions
                 FROM roles WHERE server_id = ?1 AND name = ?2",
                params![server_id.to_string(), name],
                role_from_row,
            )
            .optional()?)
    }

    pub fn assign_role(&self, server_id: ServerId, user_id: UserId, role_id: RoleId) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO member_roles (user_id, server_id, role_id) VALUES (?1, ?2, ?3)",
            params![user_id.to_string(), server_id.to_string(), role_id.to_string()],
        )?;
        Ok(())
    }

    pub fn remove_role(&self, server_id: ServerId, user_id: UserId, role_id: RoleId) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM member_roles WHERE user_id = ?1 AND server_id = ?2 AND role_id = ?3",
            params![user_id.to_string(), server_id.to_string(), role_id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_member_muted(&self, server_id: ServerId, user_id: UserId, muted: bool) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE members SET is_muted = ?3, muted_until = NULL
             WHERE user_id = ?1 AND server_id = ?2",
            params![user_id.to_string(), server_id.to_string(), i64::from(muted)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Remove a member; with `ban_reason` set, also records the ban.
    pub fn remove_member(
        &mut self,
        server_id: ServerId,
        user_id: UserId,
        ban_reason: Option<&str>,
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM members WHERE user_id = ?1 AND server_id = ?2",
            params![user_id.to_string(), server_id.to_string()],
        )?;
        if removed == 0 {
            return Err(StoreError::NotFound);
        }
        tx.execute(
            "DELETE FROM member_roles WHERE user_id = ?1 AND server_id = ?2",
            params![user_id.to_string(), server_id.to_string()],
        )?;
        if let Some(reason) = ban_reason {
            tx.execute(
                "INSERT OR REPLACE INTO bans (user_id, server_id, reason, banned_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    user_id.to_string(),
                    server_id.to_string(),
                    reason,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The full state of one guild, as dispatched in `SERVER_CREATE`.
    pub fn guild_snapshot(&self, server_id: ServerId) -> StoreResult<GuildSnapshot> {
        let server = self.server_by_id(server_id)?.ok_or(StoreError::NotFound)?;
        let channels = self.channels_for_server(server_id)?;

        let mut stmt = self.conn.prepare(
            "SELECT id, server_id, name, position, is_default, is_hoisted, color, permissions
             FROM roles WHERE server_id = ?1 ORDER BY position DESC",
        )?;
        let roles = stmt
            .query_map(params![server_id.to_string()], role_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT m.user_id, m.is_muted, m.muted_until, {}
             FROM members m JOIN users u ON u.id = m.user_id
             WHERE m.server_id = ?1 ORDER BY u.username",
            USER_COLS
                .split(", ")
                .map(|c| format!("u.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let bases = stmt
            .query_map(params![server_id.to_string()], |r| {
                let user_id = uuid_col(r, 0)?;
                let is_muted = r.get::<_, i64>(1)? != 0;
                let muted_until = opt_time_col(r, 2)?;
                let user = User {
                    id: uuid_col(r, 3)?,
                    username: r.get(4)?,
                    display_name: r.get(5)?,
                    email: r.get(6)?,
                    status: status_from(&r.get::<_, String>(7)?),
                    status_text: r.get(8)?,
                };
                Ok((user_id, is_muted, muted_until, user))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut members = Vec::with_capacity(bases.len());
        for (user_id, is_muted, muted_until, user) in bases {
            let mut stmt = self.conn.prepare(
                "SELECT role_id FROM member_roles WHERE user_id = ?1 AND server_id = ?2",
            )?;
            let role_ids = stmt
                .query_map(params![user_id.to_string(), server_id.to_string()], |r| {
                    uuid_col(r, 0)
                })?
                .collect::<Result<Vec<RoleId>, _>>()?;
            members.push(MemberProfile {
                member: ServerMember { user_id, server_id, role_ids, is_muted, muted_until },
                user,
            });
        }

        Ok(GuildSnapshot { server, channels, members, roles })
    }

    // -- channels ------------------------------------------------------------

    pub fn channel_by_id(&self, id: ChannelId) -> StoreResult<Option<Channel>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {CHANNEL_COLS} FROM channels WHERE id = ?1"),
                params![id.to_string()],
                channel_from_row,
            )
            .optional()?)
    }

    pub fn channels_for_server(&self, server_id: ServerId) -> StoreResult<Vec<Channel>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHANNEL_COLS} FROM channels WHERE server_id = ?1 ORDER BY position, name"
        ))?;
        let rows = stmt.query_map(params![server_id.to_string()], channel_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The server's first text channel, used for system announcements.
    pub fn default_channel(&self, server_id: ServerId) -> StoreResult<Option<Channel>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {CHANNEL_COLS} FROM channels
                     WHERE server_id = ?1 AND kind = 'text' ORDER BY position, name LIMIT 1"
                ),
                params![server_id.to_string()],
                channel_from_row,
            )
            .optional()?)
    }

    pub fn create_channel(&self, channel: &Channel) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO channels (id, server_id, name, kind, category_id, position, topic)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                channel.id.to_string(),
                channel.server_id.to_string(),
                channel.name,
                kind_str(channel.kind),
                channel.category_id.map(|c| c.to_string()),
                channel.position,
                channel.topic
            ],
        )?;
        Ok(())
    }

    pub fn update_channel(&self, channel: &Channel) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE channels SET name = ?2, category_id = ?3, position = ?4, topic = ?5
             WHERE id = ?1",
            params![
                channel.id.to_string(),
                channel.name,
                channel.category_id.map(|c| c.to_string()),
                channel.position,
                channel.topic
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Delete a channel and its messages. Deleting a category detaches its
    /// leaves to top level (schema `ON DELETE SET NULL`).
    pub fn delete_channel(&mut self, id: ChannelId) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE channel_id = ?1",
            params![id.to_string()],
        )?;
        let removed = tx.execute("DELETE FROM channels WHERE id = ?1", params![id.to_string()])?;
        tx.commit()?;
        if removed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // -- messages ------------------------------------------------------------

    pub fn insert_message(&self, message: &Message) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO messages (id, channel_id, author_id, content, created_at, reply_to_id, kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                message.channel_id.to_string(),
                message.author_id.to_string(),
                message.content,
                message.created_at.to_rfc3339(),
                message.reply_to_id.map(|m| m.to_string()),
                match message.kind {
                    MessageKind::Default => "default",
                    MessageKind::System => "system",
                }
            ],
        )?;
        Ok(())
    }

    /// Up to `limit` most recent messages (oldest first in the result),
    /// optionally only those created before `before`, plus a has-more hint.
    pub fn recent_messages(
        &self,
        channel_id: ChannelId,
        limit: usize,
        before: Option<MessageId>,
    ) -> StoreResult<(Vec<Message>, Vec<User>, bool)> {
        let boundary = match before {
            Some(id) => self
                .conn
                .query_row(
                    "SELECT created_at FROM messages WHERE id = ?1",
                    params![id.to_string()],
                    |r| r.get::<_, String>(0),
                )
                .optional()?,
            None => None,
        };

        let fetch = i64::try_from(limit + 1).unwrap_or(i64::MAX);
        let mut messages = match &boundary {
            Some(cutoff) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {MESSAGE_COLS} FROM messages
                     WHERE channel_id = ?1 AND created_at < ?2
                     ORDER BY created_at DESC, id DESC LIMIT ?3"
                ))?;
                let rows = stmt.query_map(
                    params![channel_id.to_string(), cutoff, fetch],
                    message_from_row,
                )?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {MESSAGE_COLS} FROM messages WHERE channel_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ))?;
                let rows =
                    stmt.query_map(params![channel_id.to_string(), fetch], message_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        let has_more = messages.len() > limit;
        messages.truncate(limit);
        messages.reverse();

        let mut authors: Vec<User> = Vec::new();
        for message in &messages {
            if authors.iter().any(|u| u.id == message.author_id) {
                continue;
            }
            if let Some(user) = self.user_by_id(message.author_id)? {
                authors.push(user);
            }
        }
        Ok((messages, authors, has_more))
    }
}

fn role_from_row(row: &Row<'_>) -> rusqlite::Result<Role> {
    Ok(Role {
        id: uuid_col(row, 0)?,
        server_id: uuid_col(row, 1)?,
        name: row.get(2)?,
        position: row.get(3)?,
        is_default: row.get::<_, i64>(4)? != 0,
        is_hoisted: row.get::<_, i64>(5)? != 0,
        color: row.get(6)?,
        permissions: Permissions::from_bits_truncate(row.get::<_, i64>(7)? as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_user(username: &str, email: &str) -> (Store, User) {
        let mut store = Store::open_in_memory().unwrap();
        let user = store
            .create_user(username, username, email, "hash", "salt")
            .unwrap();
        (store, user)
    }

    #[test]
    fn duplicate_username_or_email_conflicts() {
        let (mut store, _) = store_with_user("alice", "a@x");
        assert!(matches!(
            store.create_user("alice", "alice", "other@x", "h", "s"),
            Err(StoreError::Conflict)
        ));
        assert!(matches!(
            store.create_user("someone", "someone", "a@x", "h", "s"),
            Err(StoreError::Conflict)
        ));
    }

    #[test]
    fn create_server_seeds_default_role_channel_and_owner_membership() {
        let (mut store, owner) = store_with_user("alice", "a@x");
        let server = store.create_server("home", owner.id).unwrap();

        let snapshot = store.guild_snapshot(server.id).unwrap();
        assert_eq!(snapshot.server.owner_id, owner.id);
        assert_eq!(snapshot.channels.len(), 1);
        assert_eq!(snapshot.channels[0].name, "general");
        assert_eq!(snapshot.roles.len(), 1);
        assert!(snapshot.roles[0].is_default);
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.members[0].member.role_ids.len(), 1);
    }

    #[test]
    fn expired_sessions_resolve_to_none() {
        let (store, user) = store_with_user("alice", "a@x");
        let session = store.create_session(user.id, "deadbeef").unwrap();
        assert!(store.session_by_token_hash("deadbeef").unwrap().is_some());

        store
            .conn
            .execute(
                "UPDATE sessions SET expires_at = ?2 WHERE id = ?1",
                params![
                    session.session_id,
                    (Utc::now() - Duration::days(1)).to_rfc3339()
                ],
            )
            .unwrap();
        assert!(store.session_by_token_hash("deadbeef").unwrap().is_none());
        // Deleted on sight, not just filtered.
        let remaining: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn banned_users_cannot_rejoin() {
        let (mut store, owner) = store_with_user("alice", "a@x");
        let bob = store.create_user("bob", "bob", "b@x", "h", "s").unwrap();
        let server = store.create_server("home", owner.id).unwrap();
        store.add_member(server.id, bob.id).unwrap();
        store.remove_member(server.id, bob.id, Some("spam")).unwrap();
        assert!(matches!(
            store.add_member(server.id, bob.id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn recent_messages_pages_oldest_first_with_has_more() {
        let (mut store, owner) = store_with_user("alice", "a@x");
        let server = store.create_server("home", owner.id).unwrap();
        let channel = store.default_channel(server.id).unwrap().unwrap();

        for i in 0..5 {
            store
                .insert_message(&Message {
                    id: Uuid::new_v4(),
                    channel_id: channel.id,
                    author_id: owner.id,
                    content: format!("m{i}"),
                    created_at: Utc::now() + Duration::milliseconds(i),
                    reply_to_id: None,
                    kind: MessageKind::Default,
                })
                .unwrap();
        }

        let (messages, authors, has_more) = store.recent_messages(channel.id, 3, None).unwrap();
        assert_eq!(
            messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m2", "m3", "m4"]
        );
        assert!(has_more);
        assert_eq!(authors.len(), 1);

        let (older, _, has_more) = store
            .recent_messages(channel.id, 3, Some(messages[0].id))
            .unwrap();
        assert_eq!(
            older.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m0", "m1"]
        );
        assert!(!has_more);
    }

    #[test]
    fn mute_toggle_round_trips_through_member_lookup() {
        let (mut store, owner) = store_with_user("alice", "a@x");
        let server = store.create_server("home", owner.id).unwrap();
        store.set_member_muted(server.id, owner.id, true).unwrap();
        assert!(store.member(server.id, owner.id).unwrap().unwrap().is_muted);
        store.set_member_muted(server.id, owner.id, false).unwrap();
        assert!(!store.member(server.id, owner.id).unwrap().unwrap().is_muted);
    }
}
