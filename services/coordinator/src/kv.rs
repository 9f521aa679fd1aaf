//! Durable backend for per-session state (spec §6.3).
//!
//! `Durable` is the seam the donor repository draws between `repo/*`
//! (SQL) and `state.rs` (in-memory actor bookkeeping): a real `sqlx`
//! Postgres implementation backs production, and an in-memory
//! implementation backs coordinator-actor tests without a database.

use async_trait::async_trait;
use share_protocol::ShareError;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// A loaded session row, or the absence of one.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub ses_id: String,
    pub secret: String,
}

#[async_trait]
pub trait Durable: Send + Sync {
    /// Look up the immutable session identity for `share_name`, if any.
    async fn load_session(&self, share_name: &str) -> Result<Option<SessionRow>, ShareError>;

    /// First-wins creation of the session row. If a row already exists this
    /// is a no-op (the caller is expected to have already checked
    /// `load_session` and handled the idempotent-share case).
    async fn create_session(
        &self,
        share_name: &str,
        ses_id: &str,
        secret: &str,
    ) -> Result<(), ShareError>;

    /// Write `content` at `key` to both the kv table and the blob mirror in
    /// one durable step (spec §3-I2).
    async fn put_entry(
        &self,
        share_name: &str,
        key: &str,
        content: &serde_json::Value,
    ) -> Result<(), ShareError>;

    /// List every `session/*` entry for `share_name` in insertion order.
    async fn list_entries(
        &self,
        share_name: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, ShareError>;

    /// Delete every `session/*` entry (kv + blob mirror) for `share_name`.
    /// The session row itself (and its secret) survives (spec §3-I4).
    async fn clear_session(&self, share_name: &str) -> Result<(), ShareError>;
}

// ---------------------------------------------------------------------------
// Postgres-backed implementation
// ---------------------------------------------------------------------------

pub struct PgDurable {
    pool: PgPool,
}

impl PgDurable {
    pub fn new(pool: PgPool) -> Self {
        PgDurable { pool }
    }
}

#[async_trait]
impl Durable for PgDurable {
    async fn load_session(&self, share_name: &str) -> Result<Option<SessionRow>, ShareError> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT ses_id, secret FROM share_sessions WHERE share_name = $1",
        )
        .bind(share_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(ses_id, secret)| SessionRow { ses_id, secret }))
    }

    async fn create_session(
        &self,
        share_name: &str,
        ses_id: &str,
        secret: &str,
    ) -> Result<(), ShareError> {
        sqlx::query(
            "INSERT INTO share_sessions (share_name, ses_id, secret)
             VALUES ($1, $2, $3)
             ON CONFLICT (share_name) DO NOTHING",
        )
        .bind(share_name)
        .bind(ses_id)
        .bind(secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_entry(
        &self,
        share_name: &str,
        key: &str,
        content: &serde_json::Value,
    ) -> Result<(), ShareError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO share_entries (share_name, key, content)
             VALUES ($1, $2, $3)
             ON CONFLICT (share_name, key) DO UPDATE SET content = EXCLUDED.content",
        )
        .bind(share_name)
        .bind(key)
        .bind(content)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO share_blobs (share_name, key, content)
             VALUES ($1, $2, $3)
             ON CONFLICT (share_name, key) DO UPDATE SET content = EXCLUDED.content",
        )
        .bind(share_name)
        .bind(key)
        .bind(content)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_entries(
        &self,
        share_name: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, ShareError> {
        let rows = sqlx::query_as::<_, (String, serde_json::Value)>(
            "SELECT key, content FROM share_entries WHERE share_name = $1 ORDER BY ord ASC",
        )
        .bind(share_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn clear_session(&self, share_name: &str) -> Result<(), ShareError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM share_entries WHERE share_name = $1")
            .bind(share_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM share_blobs WHERE share_name = $1")
            .bind(share_name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemSession {
    ses_id: String,
    secret: String,
    entries: BTreeMap<u64, (String, serde_json::Value)>,
}

#[derive(Default)]
pub struct InMemoryDurable {
    sessions: Mutex<HashMap<String, MemSession>>,
    next_ord: Mutex<u64>,
}

impl InMemoryDurable {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_ord(&self) -> u64 {
        let mut next = self.next_ord.lock().unwrap();
        let ord = *next;
        *next += 1;
        ord
    }
}

#[async_trait]
impl Durable for InMemoryDurable {
    async fn load_session(&self, share_name: &str) -> Result<Option<SessionRow>, ShareError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(share_name)
            .map(|s| SessionRow {
                ses_id: s.ses_id.clone(),
                secret: s.secret.clone(),
            }))
    }

    async fn create_session(
        &self,
        share_name: &str,
        ses_id: &str,
        secret: &str,
    ) -> Result<(), ShareError> {
        self.sessions
            .lock()
            .unwrap()
            .entry(share_name.to_owned())
            .or_insert_with(|| MemSession {
                ses_id: ses_id.to_owned(),
                secret: secret.to_owned(),
                entries: BTreeMap::new(),
            });
        Ok(())
    }

    async fn put_entry(
        &self,
        share_name: &str,
        key: &str,
        content: &serde_json::Value,
    ) -> Result<(), ShareError> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(share_name)
            .ok_or_else(|| ShareError::Internal("put_entry on unknown session".to_owned()))?;
        // A key already present keeps its original `ord` so it doesn't move
        // in `list_entries`' output — matching `PgDurable`'s `ON CONFLICT
        // ... DO UPDATE SET content` against a BIGSERIAL assigned only on
        // the initial INSERT (spec §3 "ordered mapping", §4.6 "insertion
        // order").
        let existing_ord = session
            .entries
            .iter()
            .find(|(_, (existing_key, _))| existing_key == key)
            .map(|(ord, _)| *ord);
        let ord = existing_ord.unwrap_or_else(|| self.alloc_ord());
        session.entries.insert(ord, (key.to_owned(), content.clone()));
        Ok(())
    }

    async fn list_entries(
        &self,
        share_name: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, ShareError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(share_name)
            .map(|s| s.entries.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_session(&self, share_name: &str) -> Result<(), ShareError> {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(share_name) {
            session.entries.clear();
        }
        Ok(())
    }
}
