use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use chrono::Utc;
use reqwest::Url;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::{
    types::{DownloadOutcome, DownloadStatus},
    utils::{collection_of, data_type_of},
};

/// Durable ledger of previously attempted downloads, keyed by URL.
///
/// A URL recorded as completed is never fetched again unless the caller
/// forces revalidation. Checksums recorded here back the duplicate-content
/// check.
pub trait TrackingStore: Send + Sync {
    /// URLs whose last recorded attempt completed. Read once per run to
    /// seed the in-memory skip set.
    fn completed_urls(&self) -> anyhow::Result<HashSet<String>>;

    /// URL that first produced this checksum, if any.
    fn checksum_owner(&self, checksum: &str) -> anyhow::Result<Option<String>>;

    fn record(&self, outcome: &DownloadOutcome) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    url: String,
    local_path: String,
    checksum: Option<String>,
    size: u64,
    status: DownloadStatus,
    error: Option<String>,
    timestamp: String,
    collection: String,
    data_type: String,
}

impl StoredEntry {
    fn from_outcome(outcome: &DownloadOutcome) -> StoredEntry {
        let collection = Url::parse(&outcome.url)
            .map(|u| collection_of(&u))
            .unwrap_or_else(|_| "unknown".into());

        StoredEntry {
            url: outcome.url.clone(),
            local_path: outcome.local_path.to_string_lossy().into_owned(),
            checksum: outcome.checksum.clone(),
            size: outcome.size_bytes,
            status: outcome.status,
            error: outcome.error.clone(),
            timestamp: Utc::now().to_rfc3339(),
            collection,
            data_type: data_type_of(&outcome.url).to_string(),
        }
    }
}

/// File-backed store: one JSON map, rewritten through a temp file on each
/// update so an interrupted run never leaves a torn ledger.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl JsonFileStore {
    pub fn open(path: &Path) -> anyhow::Result<JsonFileStore> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("could not create tracking dir {:?}", parent))?;
        }

        let entries = if path.exists() {
            let raw = fs::read_to_string(path)
                .context(format!("could not read tracking file {:?}", path))?;
            serde_json::from_str(&raw)
                .context(format!("tracking file {:?} is not valid JSON", path))?
        } else {
            HashMap::new()
        };

        Ok(JsonFileStore {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<String, StoredEntry>) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_string_pretty(entries)?;
        fs::write(&tmp, raw).context(format!("could not write tracking file {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .context(format!("could not move tracking file into {:?}", self.path))?;
        Ok(())
    }
}

impl TrackingStore for JsonFileStore {
    fn completed_urls(&self) -> anyhow::Result<HashSet<String>> {
        let entries = self.entries.lock().expect("tracking lock poisoned");
        Ok(entries
            .values()
            .filter(|e| e.status == DownloadStatus::Completed)
            .map(|e| e.url.clone())
            .collect())
    }

    fn checksum_owner(&self, checksum: &str) -> anyhow::Result<Option<String>> {
        let entries = self.entries.lock().expect("tracking lock poisoned");
        Ok(entries
            .values()
            .find(|e| e.checksum.as_deref() == Some(checksum))
            .map(|e| e.url.clone()))
    }

    fn record(&self, outcome: &DownloadOutcome) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().expect("tracking lock poisoned");
        entries.insert(outcome.url.clone(), StoredEntry::from_outcome(outcome));
        self.persist(&entries)
    }
}

/// SQLite-backed store for large multi-run ingests.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<SqliteStore> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("could not create tracking dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .context(format!("could not open tracking database {:?}", path))?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    fn in_memory() -> anyhow::Result<SqliteStore> {
        let store = SqliteStore {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("tracking lock poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                url TEXT PRIMARY KEY,
                local_path TEXT NOT NULL,
                checksum TEXT,
                size INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error TEXT,
                timestamp TEXT NOT NULL,
                collection TEXT NOT NULL,
                data_type TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_downloads_checksum ON downloads(checksum);
            CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
        "#,
        )
        .context("could not initialize tracking schema")?;
        Ok(())
    }
}

impl TrackingStore for SqliteStore {
    fn completed_urls(&self) -> anyhow::Result<HashSet<String>> {
        let conn = self.conn.lock().expect("tracking lock poisoned");
        let mut stmt = conn.prepare("SELECT url FROM downloads WHERE status = 'completed'")?;
        let urls = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(urls)
    }

    fn checksum_owner(&self, checksum: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().expect("tracking lock poisoned");
        let owner = conn
            .query_row(
                "SELECT url FROM downloads WHERE checksum = ?1 LIMIT 1",
                params![checksum],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(owner)
    }

    fn record(&self, outcome: &DownloadOutcome) -> anyhow::Result<()> {
        let entry = StoredEntry::from_outcome(outcome);
        let conn = self.conn.lock().expect("tracking lock poisoned");
        conn.execute(
            r#"
            INSERT OR REPLACE INTO downloads
                (url, local_path, checksum, size, status, error, timestamp, collection, data_type)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                entry.url,
                entry.local_path,
                entry.checksum,
                entry.size as i64,
                outcome.status.as_str(),
                entry.error,
                entry.timestamp,
                entry.collection,
                entry.data_type,
            ],
        )?;
        Ok(())
    }
}
