//! Encrypted browser session persistence
//!
//! A session saved here can be restored by a later run of the same task, so
//! logins and storage survive restarts. Cookies and web storage are sealed
//! with [`SessionCipher`] before they reach a [`SessionStore`]; the store
//! only ever sees ciphertext for those columns.
//!
//! Persistence is a cache. Every `SessionPersistence` operation logs
//! failures and degrades to `false`, `None`, or `0`.
//!
//! File layout for [`FileSessionStore`]:
//! ```text
//! ~/.taskpilot/sessions/
//! ├── <sha256(session_id, user_id)>.json
//! └── ...
//! ```

use crate::config::{PersistenceConfig, StoreBackend};
use crate::crypto::SessionCipher;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default lifetime of a saved session
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Types
// =============================================================================

/// Browser viewport size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Browser state captured by the automation engine, ready to be saved
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub task_id: Option<String>,
    pub storage_state: serde_json::Value,
    pub cookies: Vec<serde_json::Value>,
    pub local_storage: HashMap<String, String>,
    pub session_storage: HashMap<String, String>,
    pub current_url: Option<String>,
    pub viewport: Viewport,
    pub user_agent: Option<String>,
}

/// A restored session with its lifecycle metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PersistedSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Row as held by a [`SessionStore`]. Browser state columns are sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub task_id: Option<String>,
    pub storage_state: String,
    pub cookies: String,
    pub local_storage: String,
    pub session_storage: String,
    pub current_url: Option<String>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

// =============================================================================
// Stores
// =============================================================================

/// Backing store for session rows, keyed by session id and user id
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str, user_id: &str) -> Result<Option<SessionRecord>>;

    /// Insert or replace
    async fn put(&self, record: SessionRecord) -> Result<()>;

    /// Returns whether a row was removed
    async fn delete(&self, session_id: &str, user_id: &str) -> Result<bool>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionRecord>>;

    async fn list_all(&self) -> Result<Vec<SessionRecord>>;
}

type RecordKey = (String, String);

/// In-memory store, mostly for tests and ephemeral runs
#[derive(Default)]
pub struct MemorySessionStore {
    records: Arc<RwLock<HashMap<RecordKey, SessionRecord>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str, user_id: &str) -> Result<Option<SessionRecord>> {
        let key = (session_id.to_string(), user_id.to_string());
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn put(&self, record: SessionRecord) -> Result<()> {
        let key = (record.session_id.clone(), record.user_id.clone());
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn delete(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let key = (session_id.to_string(), user_id.to_string());
        Ok(self.records.write().await.remove(&key).is_some())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// One pretty-printed JSON file per record
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Open (and create) a store rooted at `dir`
    pub async fn new(dir: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Default directory (~/.taskpilot/sessions/)
    pub fn default_dir() -> PathBuf {
        dirs_next::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskpilot")
            .join("sessions")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str, user_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(user_id.as_bytes());
        let name: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    async fn read_all(&self) -> Result<Vec<SessionRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<SessionRecord>(&content) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Failed to parse {}: {}", path.display(), e),
                },
                Err(e) => tracing::warn!("Failed to read {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, session_id: &str, user_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.path_for(session_id, user_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, record: SessionRecord) -> Result<()> {
        let path = self.path_for(&record.session_id, &record.user_id);
        let json = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let path = self.path_for(session_id, user_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let mut records = self.read_all().await?;
        records.retain(|r| r.user_id == user_id);
        Ok(records)
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>> {
        self.read_all().await
    }
}

// =============================================================================
// SessionPersistence
// =============================================================================

/// Best-effort save/restore of browser sessions
pub struct SessionPersistence {
    store: Arc<dyn SessionStore>,
    cipher: SessionCipher,
    ttl: Duration,
}

impl SessionPersistence {
    pub fn new(store: Arc<dyn SessionStore>, cipher: SessionCipher) -> Self {
        Self {
            store,
            cipher,
            ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Build the configured backend, cipher and TTL
    pub async fn from_config(config: &PersistenceConfig) -> Result<Self> {
        let store: Arc<dyn SessionStore> = match config.backend {
            StoreBackend::Memory => Arc::new(MemorySessionStore::new()),
            StoreBackend::File => Arc::new(FileSessionStore::new(config.data_dir()).await?),
        };
        Ok(Self::new(store, config.cipher()?).with_ttl(config.ttl()))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Save or refresh a session. `created_at` survives re-saves.
    pub async fn save_session(&self, snapshot: SessionSnapshot) -> bool {
        match self.try_save(snapshot).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to save browser session: {}", e);
                false
            }
        }
    }

    /// Restore a session. Expired rows are deleted and yield `None`.
    pub async fn load_session(&self, session_id: &str, user_id: &str) -> Option<PersistedSession> {
        match self.try_load(session_id, user_id).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(session_id, "Failed to load browser session: {}", e);
                None
            }
        }
    }

    /// Active, unexpired sessions for a user, most recently updated first
    pub async fn list_sessions(&self, user_id: &str) -> Vec<PersistedSession> {
        let records = match self.store.list_by_user(user_id).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(user_id, "Failed to list browser sessions: {}", e);
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut sessions: Vec<PersistedSession> = records
            .into_iter()
            .filter(|r| r.is_active && !r.is_expired_at(now))
            .filter_map(|r| match self.unseal(r) {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::warn!("Skipping unreadable browser session: {}", e);
                    None
                }
            })
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Keep the row but mark it inactive
    pub async fn deactivate_session(&self, session_id: &str, user_id: &str) -> bool {
        self.modify(session_id, user_id, "deactivate", |record, now| {
            record.is_active = false;
            record.updated_at = now;
            Ok(())
        })
        .await
    }

    pub async fn delete_session(&self, session_id: &str, user_id: &str) -> bool {
        match self.store.delete(session_id, user_id).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(session_id, "Failed to delete browser session: {}", e);
                false
            }
        }
    }

    /// Push the expiry to `now + by`. Already-expired sessions are not revived.
    pub async fn extend_session(&self, session_id: &str, user_id: &str, by: Duration) -> bool {
        let by = match ChronoDuration::from_std(by) {
            Ok(by) => by,
            Err(e) => {
                tracing::warn!(session_id, "Invalid session extension: {}", e);
                return false;
            }
        };
        self.modify(session_id, user_id, "extend", move |record, now| {
            record.expires_at = expiry_after(now, by)?;
            record.updated_at = now;
            Ok(())
        })
        .await
    }

    /// Delete every expired row. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let records = match self.store.list_all().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Failed to scan browser sessions: {}", e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut removed = 0;
        for record in records.iter().filter(|r| r.is_expired_at(now)) {
            match self.store.delete(&record.session_id, &record.user_id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    session_id = %record.session_id,
                    "Failed to delete expired browser session: {}",
                    e
                ),
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Expired browser sessions cleaned up");
        }
        removed
    }

    async fn try_save(&self, snapshot: SessionSnapshot) -> Result<()> {
        if snapshot.session_id.is_empty() || snapshot.user_id.is_empty() {
            return Err(Error::Persistence(
                "Session id and user id are required".to_string(),
            ));
        }

        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.ttl)
            .map_err(|e| Error::Persistence(format!("Invalid session TTL: {}", e)))?;
        let created_at = self
            .store
            .get(&snapshot.session_id, &snapshot.user_id)
            .await?
            .filter(|r| !r.is_expired_at(now))
            .map(|r| r.created_at)
            .unwrap_or(now);

        let record = SessionRecord {
            storage_state: self.cipher.seal_json(&snapshot.storage_state)?,
            cookies: self.cipher.seal_json(&snapshot.cookies)?,
            local_storage: self.cipher.seal_json(&snapshot.local_storage)?,
            session_storage: self.cipher.seal_json(&snapshot.session_storage)?,
            session_id: snapshot.session_id,
            user_id: snapshot.user_id,
            task_id: snapshot.task_id,
            current_url: snapshot.current_url,
            viewport_width: snapshot.viewport.width,
            viewport_height: snapshot.viewport.height,
            user_agent: snapshot.user_agent,
            is_active: true,
            created_at,
            updated_at: now,
            expires_at: expiry_after(now, ttl)?,
        };

        tracing::debug!(session_id = %record.session_id, "Saving browser session");
        self.store.put(record).await
    }

    async fn try_load(&self, session_id: &str, user_id: &str) -> Result<Option<PersistedSession>> {
        let Some(record) = self.store.get(session_id, user_id).await? else {
            return Ok(None);
        };

        if record.is_expired_at(Utc::now()) {
            tracing::debug!(session_id, "Browser session expired, removing");
            self.store.delete(session_id, user_id).await?;
            return Ok(None);
        }

        self.unseal(record).map(Some)
    }

    async fn modify<F>(&self, session_id: &str, user_id: &str, op: &str, f: F) -> bool
    where
        F: FnOnce(&mut SessionRecord, DateTime<Utc>) -> Result<()> + Send,
    {
        let result: Result<bool> = async {
            let Some(mut record) = self.store.get(session_id, user_id).await? else {
                return Ok(false);
            };
            let now = Utc::now();
            if record.is_expired_at(now) {
                self.store.delete(session_id, user_id).await?;
                return Ok(false);
            }
            f(&mut record, now)?;
            self.store.put(record).await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(session_id, "Failed to {} browser session: {}", op, e);
                false
            }
        }
    }

    fn unseal(&self, record: SessionRecord) -> Result<PersistedSession> {
        Ok(PersistedSession {
            snapshot: SessionSnapshot {
                storage_state: self.cipher.open_json(&record.storage_state)?,
                cookies: self.cipher.open_json(&record.cookies)?,
                local_storage: self.cipher.open_json(&record.local_storage)?,
                session_storage: self.cipher.open_json(&record.session_storage)?,
                session_id: record.session_id,
                user_id: record.user_id,
                task_id: record.task_id,
                current_url: record.current_url,
                viewport: Viewport {
                    width: record.viewport_width,
                    height: record.viewport_height,
                },
                user_agent: record.user_agent,
            },
            is_active: record.is_active,
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
        })
    }
}

fn expiry_after(now: DateTime<Utc>, by: ChronoDuration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(by)
        .ok_or_else(|| Error::Persistence(format!("Session expiry out of range: now + {}", by)))
}

impl std::fmt::Debug for SessionPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPersistence")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
