//! relaybot-storage: JSON-file session store and the session resolver.
//!
//! The whole store is a single JSON object mapping session key to
//! [`SessionEntry`]. Every read-modify-write goes through
//! [`SessionResolver`], which holds an async mutex for the duration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persisted state of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    /// Unix millis of the last activity.
    pub updated_at: i64,
    #[serde(default)]
    pub system_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
}

pub type SessionMap = BTreeMap<String, SessionEntry>;

/// Last known outbound route of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastRoute {
    pub channel: Option<String>,
    pub to: Option<String>,
}

/// Outcome of resolving a session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub session_id: String,
    pub is_new_session: bool,
    pub system_sent: bool,
}

/// Whole-file JSON store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the store. A missing file is an empty store.
    pub async fn load(&self) -> Result<SessionMap> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SessionMap::new()),
                Err(e) => return Err(e.into()),
            };
            if content.trim().is_empty() {
                return Ok(SessionMap::new());
            }
            Ok(serde_json::from_str(&content)?)
        })
        .await?
    }

    /// Write the store to a sibling temp file, then rename it into place.
    pub async fn save(&self, sessions: &SessionMap) -> Result<()> {
        let path = self.path.clone();
        let content = serde_json::to_string_pretty(sessions)?;
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let mut tmp = path.clone().into_os_string();
            tmp.push(format!(".{}.tmp", std::process::id()));
            let tmp = PathBuf::from(tmp);
            std::fs::write(&tmp, content)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
        .await?
    }
}

/// Serializes every read-modify-write of the session store.
pub struct SessionResolver {
    store: SessionStore,
    idle_ms: i64,
    lock: Mutex<()>,
}

impl SessionResolver {
    pub fn new(store: SessionStore, idle_minutes: u64) -> Self {
        Self {
            store,
            idle_ms: (idle_minutes as i64).saturating_mul(60_000),
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn is_fresh(&self, entry: &SessionEntry, now_ms: i64) -> bool {
        now_ms - entry.updated_at <= self.idle_ms
    }

    /// Resolve `key` at `now_ms`, minting a new session id when the existing
    /// entry is missing or idle for longer than the configured window.
    ///
    /// The entry is persisted with `updated_at = now_ms`. Per-session agent
    /// settings and the last route survive a reset; `system_sent` does not.
    pub async fn resolve(&self, key: &str, now_ms: i64) -> Result<ResolvedSession> {
        self.resolve_inner(key, now_ms, false).await
    }

    /// Like [`resolve`](Self::resolve) but always mints a new session id.
    pub async fn reset(&self, key: &str, now_ms: i64) -> Result<ResolvedSession> {
        self.resolve_inner(key, now_ms, true).await
    }

    async fn resolve_inner(&self, key: &str, now_ms: i64, force_new: bool) -> Result<ResolvedSession> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.store.load().await?;

        let (entry, is_new_session) = match sessions.remove(key) {
            Some(existing) if !force_new && self.is_fresh(&existing, now_ms) => (
                SessionEntry {
                    updated_at: now_ms,
                    ..existing
                },
                false,
            ),
            Some(stale) => (
                SessionEntry {
                    session_id: uuid::Uuid::new_v4().to_string(),
                    updated_at: now_ms,
                    system_sent: false,
                    context_tokens: None,
                    ..stale
                },
                true,
            ),
            None => (
                SessionEntry {
                    session_id: uuid::Uuid::new_v4().to_string(),
                    updated_at: now_ms,
                    ..Default::default()
                },
                true,
            ),
        };

        if is_new_session {
            tracing::debug!(session_key = %key, session_id = %entry.session_id, "minted new session");
        }

        let resolved = ResolvedSession {
            session_id: entry.session_id.clone(),
            is_new_session,
            system_sent: entry.system_sent,
        };
        sessions.insert(key.to_string(), entry);
        self.store.save(&sessions).await?;
        Ok(resolved)
    }

    /// Apply `f` to an existing entry and persist. Returns false when `key` is unknown.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut SessionEntry),
    {
        let _guard = self.lock.lock().await;
        let mut sessions = self.store.load().await?;
        let Some(entry) = sessions.get_mut(key) else {
            return Ok(false);
        };
        f(entry);
        self.store.save(&sessions).await?;
        Ok(true)
    }

    pub async fn mark_system_sent(&self, key: &str) -> Result<bool> {
        self.update(key, |e| e.system_sent = true).await
    }

    /// Bump `updated_at` without changing the session id.
    pub async fn touch(&self, key: &str, now_ms: i64) -> Result<bool> {
        self.update(key, |e| e.updated_at = now_ms).await
    }

    /// Remember where the last reply for `key` went. Creates the entry if needed.
    pub async fn record_route(&self, key: &str, channel: &str, to: &str, now_ms: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.store.load().await?;
        let entry = sessions.entry(key.to_string()).or_insert_with(|| SessionEntry {
            session_id: uuid::Uuid::new_v4().to_string(),
            updated_at: now_ms,
            ..Default::default()
        });
        entry.last_channel = Some(channel.to_string());
        entry.last_to = Some(to.to_string());
        self.store.save(&sessions).await
    }

    pub async fn last_route(&self, key: &str) -> Result<Option<LastRoute>> {
        Ok(self.entry(key).await?.map(|e| LastRoute {
            channel: e.last_channel,
            to: e.last_to,
        }))
    }

    pub async fn entry(&self, key: &str) -> Result<Option<SessionEntry>> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.store.load().await?;
        Ok(sessions.remove(key))
    }

    pub async fn list(&self) -> Result<Vec<(String, SessionEntry)>> {
        let _guard = self.lock.lock().await;
        Ok(self.store.load().await?.into_iter().collect())
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut sessions = self.store.load().await?;
        let removed = sessions.remove(key).is_some();
        if removed {
            self.store.save(&sessions).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE_MINUTES: u64 = 10;
    const IDLE_MS: i64 = 10 * 60_000;

    fn resolver(dir: &tempfile::TempDir) -> SessionResolver {
        SessionResolver::new(SessionStore::new(dir.path().join("sessions.json")), IDLE_MINUTES)
    }

    #[tokio::test]
    async fn test_missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nested/sessions.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_creates_parent_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nested/sessions.json"));
        let mut map = SessionMap::new();
        map.insert(
            "main".into(),
            SessionEntry {
                session_id: "s1".into(),
                updated_at: 5,
                thinking_level: Some("high".into()),
                ..Default::default()
            },
        );
        store.save(&map).await.unwrap();
        assert_eq!(store.load().await.unwrap(), map);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"sessionId\""));
        assert!(raw.contains("\"thinkingLevel\""));
        assert!(!raw.contains("lastTo"));
        // no temp file left behind
        assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_resolve_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        let s = r.resolve("main", 1_000).await.unwrap();
        assert!(s.is_new_session);
        assert!(!s.system_sent);
        let entry = r.entry("main").await.unwrap().unwrap();
        assert_eq!(entry.session_id, s.session_id);
        assert_eq!(entry.updated_at, 1_000);
    }

    #[tokio::test]
    async fn test_fresh_just_inside_idle_window() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        let first = r.resolve("main", 0).await.unwrap();
        r.mark_system_sent("main").await.unwrap();

        let again = r.resolve("main", IDLE_MS - 1).await.unwrap();
        assert!(!again.is_new_session);
        assert_eq!(again.session_id, first.session_id);
        assert!(again.system_sent);
    }

    #[tokio::test]
    async fn test_stale_just_outside_idle_window() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        let first = r.resolve("main", 0).await.unwrap();
        r.mark_system_sent("main").await.unwrap();
        r.record_route("main", "whatsapp", "+15550001111", 0).await.unwrap();

        let again = r.resolve("main", IDLE_MS + 1).await.unwrap();
        assert!(again.is_new_session);
        assert_ne!(again.session_id, first.session_id);
        assert!(!again.system_sent);

        // the route survives a session reset
        let route = r.last_route("main").await.unwrap().unwrap();
        assert_eq!(route.channel.as_deref(), Some("whatsapp"));
        assert_eq!(route.to.as_deref(), Some("+15550001111"));
    }

    #[tokio::test]
    async fn test_reset_mints_new_id_and_keeps_route() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        let first = r.resolve("cron:job-1", 0).await.unwrap();
        r.record_route("cron:job-1", "telegram", "42", 0).await.unwrap();

        let again = r.reset("cron:job-1", 1).await.unwrap();
        assert!(again.is_new_session);
        assert_ne!(again.session_id, first.session_id);
        let route = r.last_route("cron:job-1").await.unwrap().unwrap();
        assert_eq!(route.to.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_touch_keeps_id() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        let first = r.resolve("k", 0).await.unwrap();
        assert!(r.touch("k", IDLE_MS).await.unwrap());
        let again = r.resolve("k", IDLE_MS * 2).await.unwrap();
        assert_eq!(again.session_id, first.session_id);
        assert!(!r.touch("unknown", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_route_creates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        assert!(r.last_route("cron:job-1").await.unwrap().is_none());
        r.record_route("cron:job-1", "telegram", "42", 7).await.unwrap();
        let entry = r.entry("cron:job-1").await.unwrap().unwrap();
        assert_eq!(entry.last_channel.as_deref(), Some("telegram"));
        assert_eq!(entry.updated_at, 7);
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        r.resolve("a", 0).await.unwrap();
        r.resolve("b", 0).await.unwrap();
        let keys: Vec<String> = r.list().await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(r.remove("a").await.unwrap());
        assert!(!r.remove("a").await.unwrap());
        assert_eq!(r.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let r = std::sync::Arc::new(resolver(&dir));
        r.resolve("main", 0).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let r = r.clone();
            handles.push(tokio::spawn(async move {
                r.update("main", |e| {
                    e.context_tokens = Some(e.context_tokens.unwrap_or(0) + i);
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        let entry = r.entry("main").await.unwrap().unwrap();
        assert_eq!(entry.context_tokens, Some((0..16).sum()));
    }
}
