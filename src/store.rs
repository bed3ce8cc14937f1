//! Session entry stores.
//!
//! A store is an append-only log of entries keyed by session id. Appends
//! for one session are strictly ordered; entries are never rewritten.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use crate::core::history::SessionEntry;
use crate::error::{Error, Result};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns all entries for a session, in append order.
    async fn load(&self, session_id: &str) -> Result<Vec<SessionEntry>>;

    /// Appends one entry to a session's log.
    async fn append(&self, session_id: &str, entry: &SessionEntry) -> Result<()>;

    /// True iff the session has ever been appended to.
    async fn exists(&self, session_id: &str) -> Result<bool>;
}

/// Default store: entries held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Vec<SessionEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        let sessions = self.sessions.lock().expect("memory store lock poisoned");
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn append(&self, session_id: &str, entry: &SessionEntry) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("memory store lock poisoned");
        sessions
            .entry(session_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn exists(&self, session_id: &str) -> Result<bool> {
        let sessions = self.sessions.lock().expect("memory store lock poisoned");
        Ok(sessions.contains_key(session_id))
    }
}

/// Disk store: one `{session_id}.jsonl` file per session, one entry per
/// line in append order. Lines that fail to parse are skipped on load.
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }
}

#[async_trait]
impl SessionStore for JsonlStore {
    async fn load(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&path)
            .map_err(|e| Error::Store(format!("failed to open {}: {e}", path.display())))?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line =
                line.map_err(|e| Error::Store(format!("failed to read {}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    warn!(%error, session = session_id, "skipping malformed session line");
                }
            }
        }
        Ok(entries)
    }

    async fn append(&self, session_id: &str, entry: &SessionEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Store(format!("failed to create {}: {e}", self.dir.display())))?;

        let path = self.session_path(session_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Store(format!("failed to open {}: {e}", path.display())))?;

        let json = serde_json::to_string(entry)
            .map_err(|e| Error::Store(format!("failed to serialize entry: {e}")))?;
        writeln!(file, "{json}")
            .map_err(|e| Error::Store(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    async fn exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.session_path(session_id).exists())
    }
}
