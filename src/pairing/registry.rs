//! Pairing session registry: create, look up, bind, expire, and delete
//! station sessions.
//!
//! Two backends implement [`SessionRegistry`]:
//! - [`SqliteSessionRegistry`]: rows in the shared station database, so the
//!   gateway process and station processes see the same sessions
//! - [`MemorySessionRegistry`]: an in-process table for single-process
//!   stations and tests
//!
//! ## Invariants
//! - Tokens are 32 CSPRNG bytes, hex-encoded, unique per registry
//! - A session past `expires_at` reports `expired` on every read, whatever
//!   its stored status, and can never be bound
//! - Binding is a single compare-and-swap from `pending`/`connected` to
//!   `authenticated`; under concurrent attempts exactly one wins

use crate::clock::{self, Clock};
use crate::store::Store;
use crate::{Result, StationError};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Insert attempts before giving up on a colliding token.
const MAX_TOKEN_ATTEMPTS: usize = 3;

/// Lifecycle state of a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Issued, waiting for a mobile device to scan.
    Pending,
    /// A mobile device scanned the code; credentials not yet submitted.
    Connected,
    /// A verified user is bound to the session.
    #[serde(alias = "active")]
    Authenticated,
    /// TTL elapsed. Terminal.
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Expired => "expired",
        }
    }

    /// Unknown strings fall back to `Expired` so a corrupt row is never bindable.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "connected" => Self::Connected,
            "authenticated" | "active" => Self::Authenticated,
            _ => Self::Expired,
        }
    }

    /// Whether a user may still be bound in this state.
    pub fn is_bindable(self) -> bool {
        matches!(self, Self::Pending | Self::Connected)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pairing session as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub status: SessionStatus,
    #[serde(rename = "boundUserID", skip_serializing_if = "Option::is_none")]
    pub bound_user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub qr_payload: String,
}

impl Session {
    pub fn is_past_ttl(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Settings shared by every registry backend.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub ttl: Duration,
    pub qr_prefix: String,
}

impl RegistrySettings {
    pub fn new(ttl: Duration, qr_prefix: impl Into<String>) -> Self {
        Self {
            ttl,
            qr_prefix: qr_prefix.into(),
        }
    }

    pub fn qr_payload(&self, token: &str) -> String {
        format!("{}{}", self.qr_prefix, token)
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::new(
            Duration::seconds(crate::config::DEFAULT_SESSION_TTL_SECS as i64),
            crate::config::DEFAULT_QR_PREFIX,
        )
    }
}

/// Owner of the session lifecycle.
pub trait SessionRegistry: Send + Sync {
    /// Mint a fresh `pending` session. Returns only after the row is stored.
    fn create_session(&self) -> Result<Session>;

    /// Look up a session, marking it `expired` first if its TTL has elapsed.
    fn get_session(&self, token: &str) -> Result<Session>;

    /// `pending` -> `connected`: a mobile device scanned the code.
    /// Idempotent on `connected`.
    fn mark_connected(&self, token: &str) -> Result<Session>;

    /// Bind a user exactly once: `pending`/`connected` -> `authenticated`.
    fn bind_user(&self, token: &str, user_id: i64) -> Result<Session>;

    /// Delete the session. Deleting an absent session is not an error.
    fn consume_session(&self, token: &str) -> Result<()>;

    /// Mark the session `expired` if its TTL has elapsed.
    /// Returns whether the session is now expired.
    fn expire_if_stale(&self, token: &str) -> Result<bool>;

    /// Delete every session whose TTL has elapsed. Returns the number removed.
    fn sweep_expired(&self) -> Result<u64>;
}

/// First characters of a token, safe to put in logs.
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(token.len());
    &token[..end]
}

/// First whole second at which a row with integer `expires_at` below it is
/// past its TTL. Agrees with [`Session::is_past_ttl`] at sub-second precision:
/// `now > expires_at` exactly when `expires_at < expiry_cutoff(now)`.
fn expiry_cutoff(now: DateTime<Utc>) -> i64 {
    let secs = now.timestamp();
    if now.timestamp_subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Generate a random session token (hex-encoded).
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── SQLite backend ──────────────────────────────────────────────────

pub struct SqliteSessionRegistry {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    settings: RegistrySettings,
}

impl SqliteSessionRegistry {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, settings: RegistrySettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    fn load(&self, conn: &Connection, token: &str) -> Result<Option<Session>> {
        let session = conn
            .query_row(
                "SELECT token, status, user_id, created_at, expires_at
                 FROM sessions WHERE token = ?1",
                rusqlite::params![token],
                |row| {
                    let token: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    Ok(Session {
                        qr_payload: self.settings.qr_payload(&token),
                        token,
                        status: SessionStatus::from_str_lossy(&status),
                        bound_user_id: row.get(2)?,
                        created_at: clock::from_secs(row.get(3)?),
                        expires_at: clock::from_secs(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    /// Load with read-time expiry enforcement.
    fn load_fresh(&self, conn: &Connection, token: &str) -> Result<Session> {
        let mut session = self
            .load(conn, token)?
            .ok_or_else(StationError::session_not_found)?;

        if session.status != SessionStatus::Expired && session.is_past_ttl(self.clock.now()) {
            conn.execute(
                "UPDATE sessions SET status = 'expired' WHERE token = ?1 AND status != 'expired'",
                rusqlite::params![token],
            )?;
            tracing::debug!(token = token_prefix(token), "Session expired on read");
            session.status = SessionStatus::Expired;
        }
        Ok(session)
    }
}

impl SessionRegistry for SqliteSessionRegistry {
    fn create_session(&self) -> Result<Session> {
        let now = self.clock.now_secs();
        let expires_at = now + self.settings.ttl.num_seconds();
        let conn = self.store.lock();

        let mut attempt = 0;
        let token = loop {
            attempt += 1;
            let token = generate_token();
            let inserted = conn.execute(
                "INSERT INTO sessions (token, status, user_id, created_at, expires_at)
                 VALUES (?1, 'pending', NULL, ?2, ?3)",
                rusqlite::params![token, now, expires_at],
            );
            match inserted {
                Ok(_) => break token,
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation
                        && attempt < MAX_TOKEN_ATTEMPTS =>
                {
                    tracing::warn!("Session token collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(
            token = token_prefix(&token),
            "Pairing session created (expires in {}s)",
            self.settings.ttl.num_seconds()
        );

        Ok(Session {
            qr_payload: self.settings.qr_payload(&token),
            token,
            status: SessionStatus::Pending,
            bound_user_id: None,
            created_at: clock::from_secs(now),
            expires_at: clock::from_secs(expires_at),
        })
    }

    fn get_session(&self, token: &str) -> Result<Session> {
        let conn = self.store.lock();
        self.load_fresh(&conn, token)
    }

    fn mark_connected(&self, token: &str) -> Result<Session> {
        let cutoff = expiry_cutoff(self.clock.now());
        let conn = self.store.lock();
        conn.execute(
            "UPDATE sessions SET status = 'connected'
             WHERE token = ?1 AND status = 'pending' AND expires_at >= ?2",
            rusqlite::params![token, cutoff],
        )?;

        let session = self.load_fresh(&conn, token)?;
        match session.status {
            SessionStatus::Connected => Ok(session),
            SessionStatus::Expired => Err(StationError::Expired),
            SessionStatus::Authenticated | SessionStatus::Pending => {
                Err(StationError::AlreadyBound)
            }
        }
    }

    fn bind_user(&self, token: &str, user_id: i64) -> Result<Session> {
        let cutoff = expiry_cutoff(self.clock.now());
        let conn = self.store.lock();
        let updated = conn.execute(
            "UPDATE sessions SET user_id = ?2, status = 'authenticated'
             WHERE token = ?1
               AND status IN ('pending', 'connected')
               AND user_id IS NULL
               AND expires_at >= ?3",
            rusqlite::params![token, user_id, cutoff],
        )?;

        let session = self.load_fresh(&conn, token)?;
        if session.status == SessionStatus::Expired {
            return Err(StationError::Expired);
        }
        if updated == 1 {
            tracing::info!(
                token = token_prefix(token),
                user_id = user_id,
                "User bound to pairing session"
            );
            return Ok(session);
        }

        Err(StationError::AlreadyBound)
    }

    fn consume_session(&self, token: &str) -> Result<()> {
        let conn = self.store.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE token = ?1",
            rusqlite::params![token],
        )?;
        if deleted > 0 {
            tracing::info!(token = token_prefix(token), "Pairing session consumed");
        }
        Ok(())
    }

    fn expire_if_stale(&self, token: &str) -> Result<bool> {
        let conn = self.store.lock();
        let session = self.load_fresh(&conn, token)?;
        Ok(session.status == SessionStatus::Expired)
    }

    fn sweep_expired(&self) -> Result<u64> {
        let cutoff = expiry_cutoff(self.clock.now());
        let conn = self.store.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE expires_at < ?1 OR status = 'expired'",
            rusqlite::params![cutoff],
        )?;
        if deleted > 0 {
            tracing::info!(count = deleted, "Swept expired pairing sessions");
        }
        Ok(deleted as u64)
    }
}

// ── In-process backend ──────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SessionRecord {
    status: SessionStatus,
    bound_user_id: Option<i64>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Session table held in process memory. Same protocol, no shared storage.
pub struct MemorySessionRegistry {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    clock: Arc<dyn Clock>,
    settings: RegistrySettings,
}

impl MemorySessionRegistry {
    pub fn new(clock: Arc<dyn Clock>, settings: RegistrySettings) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
            settings,
        }
    }

    fn snapshot(&self, token: &str, record: &SessionRecord) -> Session {
        Session {
            token: token.to_string(),
            status: record.status,
            bound_user_id: record.bound_user_id,
            created_at: record.created_at,
            expires_at: record.expires_at,
            qr_payload: self.settings.qr_payload(token),
        }
    }

    /// Look up a record, applying read-time expiry in place.
    fn fresh<'a>(
        &self,
        sessions: &'a mut HashMap<String, SessionRecord>,
        token: &str,
    ) -> Result<&'a mut SessionRecord> {
        let now = self.clock.now();
        let record = sessions
            .get_mut(token)
            .ok_or_else(StationError::session_not_found)?;
        if now > record.expires_at {
            record.status = SessionStatus::Expired;
        }
        Ok(record)
    }
}

impl SessionRegistry for MemorySessionRegistry {
    fn create_session(&self) -> Result<Session> {
        let now = self.clock.now();
        let record = SessionRecord {
            status: SessionStatus::Pending,
            bound_user_id: None,
            created_at: now,
            expires_at: now + self.settings.ttl,
        };

        let mut sessions = self.sessions.lock();
        let mut token = generate_token();
        while sessions.contains_key(&token) {
            token = generate_token();
        }
        let session = self.snapshot(&token, &record);
        sessions.insert(token, record);

        tracing::info!(
            token = token_prefix(&session.token),
            "Pairing session created (expires in {}s)",
            self.settings.ttl.num_seconds()
        );
        Ok(session)
    }

    fn get_session(&self, token: &str) -> Result<Session> {
        let mut sessions = self.sessions.lock();
        let record = self.fresh(&mut sessions, token)?;
        let record = record.clone();
        Ok(self.snapshot(token, &record))
    }

    fn mark_connected(&self, token: &str) -> Result<Session> {
        let mut sessions = self.sessions.lock();
        let record = self.fresh(&mut sessions, token)?;
        match record.status {
            SessionStatus::Pending | SessionStatus::Connected => {
                record.status = SessionStatus::Connected;
            }
            SessionStatus::Expired => return Err(StationError::Expired),
            SessionStatus::Authenticated => return Err(StationError::AlreadyBound),
        }
        let record = record.clone();
        Ok(self.snapshot(token, &record))
    }

    fn bind_user(&self, token: &str, user_id: i64) -> Result<Session> {
        let mut sessions = self.sessions.lock();
        let record = self.fresh(&mut sessions, token)?;
        if record.status == SessionStatus::Expired {
            return Err(StationError::Expired);
        }
        if !record.status.is_bindable() || record.bound_user_id.is_some() {
            return Err(StationError::AlreadyBound);
        }
        record.status = SessionStatus::Authenticated;
        record.bound_user_id = Some(user_id);
        let record = record.clone();

        tracing::info!(
            token = token_prefix(token),
            user_id = user_id,
            "User bound to pairing session"
        );
        Ok(self.snapshot(token, &record))
    }

    fn consume_session(&self, token: &str) -> Result<()> {
        if self.sessions.lock().remove(token).is_some() {
            tracing::info!(token = token_prefix(token), "Pairing session consumed");
        }
        Ok(())
    }

    fn expire_if_stale(&self, token: &str) -> Result<bool> {
        let mut sessions = self.sessions.lock();
        let record = self.fresh(&mut sessions, token)?;
        Ok(record.status == SessionStatus::Expired)
    }

    fn sweep_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, record| {
            now <= record.expires_at && record.status != SessionStatus::Expired
        });
        Ok((before - sessions.len()) as u64)
    }
}
