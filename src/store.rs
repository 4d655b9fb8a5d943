use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::models::CandidateProfile;

/// The only persistence capability the pipeline requires. Backing technology
/// is unconstrained; everything above this trait is storage-agnostic.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

// --- SQLite backend ---

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "pursuit") {
            Ok(proj_dirs.data_dir().join("pursuit.db"))
        } else {
            Ok(PathBuf::from("pursuit.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='kv'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'pursuit init' first."));
        }
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let result = conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
            row.get::<_, String>(0)
        });
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt =
            conn.prepare("SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")?;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = stmt.query_map([pattern], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list keys")
    }
}

// --- In-memory backend (tests, dry runs) ---

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().expect("store lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.map
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .map
            .lock()
            .expect("store lock poisoned")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// --- Profile storage ---

/// Versioned candidate profiles. A profile is never overwritten; each confirm
/// writes the next version and moves the `current` pointer.
pub struct ProfileStore<'a> {
    store: &'a dyn KvStore,
}

impl<'a> ProfileStore<'a> {
    pub fn new(store: &'a dyn KvStore) -> Self {
        Self { store }
    }

    fn version_key(user_id: &str, version: u32) -> String {
        format!("profile/{user_id}/{version:06}")
    }

    fn current_key(user_id: &str) -> String {
        format!("profile/{user_id}/current")
    }

    /// Persists `profile` as the next version for its user and returns the
    /// stored copy (with the version stamped in).
    pub fn save_version(&self, mut profile: CandidateProfile) -> Result<CandidateProfile> {
        let next = self.current_version(&profile.user_id)?.unwrap_or(0) + 1;
        profile.version = next;
        let encoded = serde_json::to_string(&profile)?;
        self.store
            .put(&Self::version_key(&profile.user_id, next), &encoded)?;
        self.store
            .put(&Self::current_key(&profile.user_id), &next.to_string())?;
        tracing::info!(user = %profile.user_id, version = next, "stored profile version");
        Ok(profile)
    }

    pub fn current_version(&self, user_id: &str) -> Result<Option<u32>> {
        match self.store.get(&Self::current_key(user_id))? {
            Some(raw) => Ok(Some(raw.parse().context("Corrupt current-version pointer")?)),
            None => Ok(None),
        }
    }

    pub fn load_current(&self, user_id: &str) -> Result<Option<CandidateProfile>> {
        match self.current_version(user_id)? {
            Some(version) => self.load_version(user_id, version),
            None => Ok(None),
        }
    }

    pub fn load_version(&self, user_id: &str, version: u32) -> Result<Option<CandidateProfile>> {
        match self.store.get(&Self::version_key(user_id, version))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// All stored versions, oldest first.
    pub fn history(&self, user_id: &str) -> Result<Vec<CandidateProfile>> {
        let prefix = format!("profile/{user_id}/");
        let mut profiles = Vec::new();
        for key in self.store.list_keys(&prefix)? {
            if key.ends_with("/current") {
                continue;
            }
            if let Some(raw) = self.store.get(&key)? {
                profiles.push(serde_json::from_str(&raw)?);
            }
        }
        profiles.sort_by_key(|p: &CandidateProfile| p.version);
        Ok(profiles)
    }
}
