//! Per-session resource limits for browser automation
//!
//! One `ResourceLimiter` is shared by every running task. Session entries
//! live in a `DashMap`, so each session is locked independently, and the
//! global browser-context count is an atomic. Check methods are pure; the
//! register/unregister pairs and the scoped guards are the only mutators.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Resource ceilings, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Advisory only; reported but not enforced
    pub max_memory_mb: u64,
    pub max_pages: usize,
    pub max_contexts: usize,
    pub navigation_timeout_ms: u64,
    pub action_timeout_ms: u64,
    pub max_concurrent_actions: usize,
    pub max_session_duration_ms: u64,
    pub max_download_size_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 1024,
            max_pages: 10,
            max_contexts: 5,
            navigation_timeout_ms: 60_000,
            action_timeout_ms: 30_000,
            max_concurrent_actions: 3,
            max_session_duration_ms: 3_600_000,
            max_download_size_mb: 100,
        }
    }
}

impl ResourceLimits {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// Counters for one browser session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResources {
    pub page_count: usize,
    /// Total actions started over the session's life
    pub action_count: u64,
    pub concurrent_actions: usize,
    /// Unix millis
    pub start_time: i64,
    /// Unix millis
    pub last_activity_time: i64,
    pub total_bytes_downloaded: u64,
    /// Distinguishes re-initialised entries that reuse a session id
    #[serde(skip)]
    generation: u64,
}

impl SessionResources {
    fn new(now: i64, generation: u64) -> Self {
        Self {
            page_count: 0,
            action_count: 0,
            concurrent_actions: 0,
            start_time: now,
            last_activity_time: now,
            total_bytes_downloaded: 0,
            generation,
        }
    }
}

/// Result of a limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitCheck {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl LimitCheck {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            current_value: None,
            limit: None,
        }
    }

    fn deny(reason: impl Into<String>, current_value: u64, limit: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            current_value: Some(current_value),
            limit: Some(limit),
        }
    }

    fn unknown_session(session_id: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(format!("Session {} not found", session_id)),
            current_value: None,
            limit: None,
        }
    }
}

/// Aggregate view across all sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub active_contexts: usize,
    pub sessions: usize,
    pub total_pages: usize,
    pub total_concurrent_actions: usize,
    pub total_bytes_downloaded: u64,
}

/// Shared per-session resource bookkeeping
pub struct ResourceLimiter {
    limits: ResourceLimits,
    sessions: Arc<DashMap<String, SessionResources>>,
    contexts: Arc<AtomicUsize>,
    next_generation: AtomicU64,
}

impl ResourceLimiter {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            sessions: Arc::new(DashMap::new()),
            contexts: Arc::new(AtomicUsize::new(0)),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Create the entry for `session_id`. Returns false if it already exists.
    pub fn init_session(&self, session_id: &str) -> bool {
        self.init_session_at(session_id, now_ms())
    }

    fn init_session_at(&self, session_id: &str, now: i64) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                slot.insert(SessionResources::new(now, generation));
                self.contexts.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(session_id, "Browser session registered");
                true
            }
        }
    }

    /// Remove the entry for `session_id`. Returns whether it existed.
    pub fn cleanup_session(&self, session_id: &str) -> bool {
        if self.sessions.remove(session_id).is_some() {
            decrement(&self.contexts);
            tracing::debug!(session_id, "Browser session released");
            true
        } else {
            false
        }
    }

    // =========================================================================
    // Pure checks
    // =========================================================================

    pub fn can_create_context(&self) -> LimitCheck {
        let current = self.contexts.load(Ordering::SeqCst);
        if current >= self.limits.max_contexts {
            LimitCheck::deny(
                format!("Maximum browser contexts ({}) reached", self.limits.max_contexts),
                current as u64,
                self.limits.max_contexts as u64,
            )
        } else {
            LimitCheck::allow()
        }
    }

    pub fn can_create_page(&self, session_id: &str) -> LimitCheck {
        match self.sessions.get(session_id) {
            Some(res) => check_page(&res, &self.limits),
            None => LimitCheck::unknown_session(session_id),
        }
    }

    pub fn can_execute_action(&self, session_id: &str) -> LimitCheck {
        self.can_execute_action_at(session_id, now_ms())
    }

    fn can_execute_action_at(&self, session_id: &str, now: i64) -> LimitCheck {
        match self.sessions.get(session_id) {
            Some(res) => check_action(&res, &self.limits, now),
            None => LimitCheck::unknown_session(session_id),
        }
    }

    /// Check a single download of `size_bytes`
    pub fn can_download(&self, session_id: &str, size_bytes: u64) -> LimitCheck {
        if !self.sessions.contains_key(session_id) {
            return LimitCheck::unknown_session(session_id);
        }
        let limit = self.limits.max_download_size_mb.saturating_mul(BYTES_PER_MB);
        if size_bytes > limit {
            LimitCheck::deny(
                format!(
                    "Download size {} bytes exceeds limit of {} MB",
                    size_bytes, self.limits.max_download_size_mb
                ),
                size_bytes,
                limit,
            )
        } else {
            LimitCheck::allow()
        }
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    pub fn register_page(&self, session_id: &str) -> bool {
        self.update(session_id, |res| res.page_count += 1)
    }

    pub fn unregister_page(&self, session_id: &str) -> bool {
        self.update(session_id, |res| res.page_count = res.page_count.saturating_sub(1))
    }

    pub fn register_action_start(&self, session_id: &str) -> bool {
        self.update(session_id, |res| {
            res.concurrent_actions += 1;
            res.action_count += 1;
        })
    }

    pub fn register_action_end(&self, session_id: &str) -> bool {
        self.update(session_id, |res| {
            res.concurrent_actions = res.concurrent_actions.saturating_sub(1)
        })
    }

    pub fn register_download(&self, session_id: &str, bytes: u64) -> bool {
        self.update(session_id, |res| {
            res.total_bytes_downloaded = res.total_bytes_downloaded.saturating_add(bytes)
        })
    }

    fn update(&self, session_id: &str, f: impl FnOnce(&mut SessionResources)) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut res) => {
                f(&mut *res);
                res.last_activity_time = now_ms();
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Scoped acquisition
    // =========================================================================

    /// Check and register a page in one step. The page is released when the
    /// guard drops.
    pub fn try_acquire_page(&self, session_id: &str) -> Result<PageGuard, LimitCheck> {
        let mut res = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| LimitCheck::unknown_session(session_id))?;
        let check = check_page(&res, &self.limits);
        if !check.allowed {
            return Err(check);
        }
        res.page_count += 1;
        res.last_activity_time = now_ms();
        Ok(PageGuard {
            sessions: Arc::clone(&self.sessions),
            session_id: session_id.to_string(),
            generation: res.generation,
        })
    }

    /// Check and register an action in one step. The action ends when the
    /// guard drops.
    pub fn try_begin_action(&self, session_id: &str) -> Result<ActionGuard, LimitCheck> {
        let now = now_ms();
        let mut res = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| LimitCheck::unknown_session(session_id))?;
        let check = check_action(&res, &self.limits, now);
        if !check.allowed {
            return Err(check);
        }
        res.concurrent_actions += 1;
        res.action_count += 1;
        res.last_activity_time = now;
        Ok(ActionGuard {
            sessions: Arc::clone(&self.sessions),
            session_id: session_id.to_string(),
            generation: res.generation,
        })
    }

    // =========================================================================
    // Sweeping and stats
    // =========================================================================

    /// Remove sessions idle longer than `max_idle` or older than the session
    /// TTL. Returns the removed ids.
    pub fn cleanup_stale_sessions(&self, max_idle: Duration) -> Vec<String> {
        self.cleanup_stale_sessions_at(max_idle, now_ms())
    }

    fn cleanup_stale_sessions_at(&self, max_idle: Duration, now: i64) -> Vec<String> {
        let max_idle_ms = i64::try_from(max_idle.as_millis()).unwrap_or(i64::MAX);
        let max_duration_ms = i64::try_from(self.limits.max_session_duration_ms).unwrap_or(i64::MAX);

        let mut removed = Vec::new();
        self.sessions.retain(|session_id, res| {
            let idle = now.saturating_sub(res.last_activity_time) > max_idle_ms;
            let expired = now.saturating_sub(res.start_time) >= max_duration_ms;
            if idle || expired {
                removed.push(session_id.clone());
                false
            } else {
                true
            }
        });

        for _ in &removed {
            decrement(&self.contexts);
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), sessions = ?removed, "Removed stale browser sessions");
        }
        removed
    }

    /// Snapshot of one session's counters
    pub fn session_stats(&self, session_id: &str) -> Option<SessionResources> {
        self.sessions.get(session_id).map(|res| res.clone())
    }

    pub fn global_stats(&self) -> GlobalStats {
        let mut stats = GlobalStats {
            active_contexts: self.contexts.load(Ordering::SeqCst),
            sessions: 0,
            total_pages: 0,
            total_concurrent_actions: 0,
            total_bytes_downloaded: 0,
        };
        for entry in self.sessions.iter() {
            stats.sessions += 1;
            stats.total_pages += entry.page_count;
            stats.total_concurrent_actions += entry.concurrent_actions;
            stats.total_bytes_downloaded += entry.total_bytes_downloaded;
        }
        stats
    }

    /// Run [`cleanup_stale_sessions`](Self::cleanup_stale_sessions) every
    /// `interval` until the returned handle is aborted.
    pub fn spawn_stale_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.cleanup_stale_sessions(max_idle);
            }
        })
    }
}

impl std::fmt::Debug for ResourceLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLimiter")
            .field("limits", &self.limits)
            .field("sessions", &self.sessions.len())
            .field("contexts", &self.contexts.load(Ordering::SeqCst))
            .finish()
    }
}

/// Open page slot; released on drop
#[derive(Debug)]
#[must_use = "the page slot is released as soon as the guard is dropped"]
pub struct PageGuard {
    sessions: Arc<DashMap<String, SessionResources>>,
    session_id: String,
    generation: u64,
}

impl PageGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(mut res) = self.sessions.get_mut(&self.session_id) {
            // Slot belonged to an entry that has since been replaced
            if res.generation != self.generation {
                return;
            }
            res.page_count = res.page_count.saturating_sub(1);
            res.last_activity_time = now_ms();
        }
    }
}

/// In-flight action slot; released on drop
#[derive(Debug)]
#[must_use = "the action slot is released as soon as the guard is dropped"]
pub struct ActionGuard {
    sessions: Arc<DashMap<String, SessionResources>>,
    session_id: String,
    generation: u64,
}

impl ActionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        if let Some(mut res) = self.sessions.get_mut(&self.session_id) {
            if res.generation != self.generation {
                return;
            }
            res.concurrent_actions = res.concurrent_actions.saturating_sub(1);
            res.last_activity_time = now_ms();
        }
    }
}

fn check_page(res: &SessionResources, limits: &ResourceLimits) -> LimitCheck {
    if res.page_count >= limits.max_pages {
        LimitCheck::deny(
            format!("Maximum pages per session ({}) reached", limits.max_pages),
            res.page_count as u64,
            limits.max_pages as u64,
        )
    } else {
        LimitCheck::allow()
    }
}

fn check_action(res: &SessionResources, limits: &ResourceLimits, now: i64) -> LimitCheck {
    let elapsed = now.saturating_sub(res.start_time).max(0) as u64;
    if elapsed >= limits.max_session_duration_ms {
        return LimitCheck::deny(
            "Session duration limit exceeded",
            elapsed,
            limits.max_session_duration_ms,
        );
    }
    if res.concurrent_actions >= limits.max_concurrent_actions {
        return LimitCheck::deny(
            format!(
                "Maximum concurrent actions ({}) reached",
                limits.max_concurrent_actions
            ),
            res.concurrent_actions as u64,
            limits.max_concurrent_actions as u64,
        );
    }
    LimitCheck::allow()
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
