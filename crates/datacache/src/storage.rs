//! Embedded SQLite storage for cached entries and pending requests.
//!
//! Connection-per-call: each method opens a fresh `rusqlite::Connection`
//! with WAL mode and a 30-second busy timeout rather than holding one
//! connection behind a mutex. This lets concurrent readers proceed while a
//! writer is mid-transaction and tolerates another process sharing the same
//! database file.

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cached_data (
    url TEXT PRIMARY KEY,
    cache_key TEXT NOT NULL,
    identifier TEXT NOT NULL,
    data_type TEXT NOT NULL,
    provider TEXT NOT NULL,
    data_value BLOB NOT NULL,
    metadata TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed INTEGER,
    data_size INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cached_identifier_type ON cached_data(identifier, data_type);
CREATE INDEX IF NOT EXISTS idx_cached_cache_key ON cached_data(cache_key);
CREATE INDEX IF NOT EXISTS idx_cached_provider ON cached_data(provider);
CREATE INDEX IF NOT EXISTS idx_cached_expires ON cached_data(expires_at);
CREATE INDEX IF NOT EXISTS idx_cached_last_accessed ON cached_data(last_accessed);

CREATE TABLE IF NOT EXISTS pending_requests (
    request_id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    request_key TEXT NOT NULL,
    params TEXT NOT NULL,
    priority INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt INTEGER,
    status TEXT NOT NULL DEFAULT 'pending'
);
CREATE INDEX IF NOT EXISTS idx_pending_provider ON pending_requests(provider);
CREATE INDEX IF NOT EXISTS idx_pending_priority ON pending_requests(priority);
CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_requests(status);
CREATE INDEX IF NOT EXISTS idx_pending_created ON pending_requests(created_at);
"#;

/// Value shapes a caller may store; binary stays binary, text is UTF-8,
/// structured values become JSON.
#[derive(Debug, Clone)]
pub enum DataValue {
    Binary(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl DataValue {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            DataValue::Binary(b) => b,
            DataValue::Text(s) => s.into_bytes(),
            DataValue::Json(v) => v.to_string().into_bytes(),
        }
    }
}

/// What a retrieval returns: raw bytes, decoded to JSON when possible.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievedValue {
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

fn decode_retrieved(bytes: Vec<u8>) -> RetrievedValue {
    match std::str::from_utf8(&bytes) {
        Ok(text) => match serde_json::from_str(text) {
            Ok(json) => RetrievedValue::Json(json),
            Err(_) => RetrievedValue::Raw(bytes),
        },
        Err(_) => RetrievedValue::Raw(bytes),
    }
}

/// Status of a pending request, as stored in `pending_requests.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "processing" => RequestStatus::Processing,
            "completed" => RequestStatus::Completed,
            "failed" => RequestStatus::Failed,
            _ => RequestStatus::Pending,
        }
    }
}

/// A claimed or queued pending request row.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub provider: String,
    pub request_key: String,
    pub params: serde_json::Value,
    pub priority: i64,
    pub created_at: i64,
    pub attempts: i64,
    pub status: RequestStatus,
}

/// Derives the stable secondary cache key.
pub fn derive_cache_key(identifier: &str, data_type: &str, provider: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{identifier}_{data_type}_{provider}_{hex}")
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The cache's SQLite-backed storage layer.
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let storage = Storage { path };
        let conn = storage.conn()?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %storage.path.display(), "storage schema ready");
        Ok(storage)
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = 10000;
             PRAGMA busy_timeout = 30000;",
        )?;
        Ok(conn)
    }

    /// Inserts or replaces the entry for `url`.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        url: &str,
        identifier: &str,
        data_type: &str,
        provider: &str,
        value: DataValue,
        ttl_seconds: i64,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let cache_key = derive_cache_key(identifier, data_type, provider, url);
        let bytes = value.into_bytes();
        let created_at = now();
        let expires_at = created_at + ttl_seconds;
        let data_size = bytes.len() as i64;
        let metadata_text = metadata.map(|m| m.to_string());

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cached_data
                (url, cache_key, identifier, data_type, provider, data_value, metadata,
                 created_at, expires_at, access_count, last_accessed, data_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, ?10)
             ON CONFLICT(url) DO UPDATE SET
                cache_key = excluded.cache_key,
                identifier = excluded.identifier,
                data_type = excluded.data_type,
                provider = excluded.provider,
                data_value = excluded.data_value,
                metadata = excluded.metadata,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                access_count = 0,
                last_accessed = NULL,
                data_size = excluded.data_size",
            params![
                url,
                cache_key,
                identifier,
                data_type,
                provider,
                bytes,
                metadata_text,
                created_at,
                expires_at,
                data_size
            ],
        )?;
        Ok(())
    }

    /// Returns `(value, metadata)` for a non-expired `url`, bumping access
    /// counters on hit.
    pub fn retrieve_by_url(
        &self,
        url: &str,
    ) -> Result<Option<(RetrievedValue, Option<serde_json::Value>)>> {
        let conn = self.conn()?;
        let row: Option<(Vec<u8>, Option<String>, i64)> = conn
            .query_row(
                "SELECT data_value, metadata, expires_at FROM cached_data WHERE url = ?1",
                params![url],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((bytes, metadata_text, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at <= now() {
            return Ok(None);
        }

        conn.execute(
            "UPDATE cached_data SET access_count = access_count + 1, last_accessed = ?2 WHERE url = ?1",
            params![url, now()],
        )?;

        let metadata = metadata_text.and_then(|t| serde_json::from_str(&t).ok());
        Ok(Some((decode_retrieved(bytes), metadata)))
    }

    /// Returns non-expired matches for `(identifier, data_type, provider?)`.
    /// When `random` is true, returns exactly one row chosen uniformly.
    pub fn retrieve_by_identifier(
        &self,
        identifier: &str,
        data_type: &str,
        provider: Option<&str>,
        random: bool,
    ) -> Result<Vec<(RetrievedValue, Option<serde_json::Value>, String)>> {
        let conn = self.conn()?;
        let now_ts = now();

        let mut sql = String::from(
            "SELECT url, data_value, metadata FROM cached_data
             WHERE identifier = ?1 AND data_type = ?2 AND expires_at > ?3",
        );
        if provider.is_some() {
            sql.push_str(" AND provider = ?4");
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<(String, Vec<u8>, Option<String>)> = if let Some(p) = provider {
            stmt.query_map(params![identifier, data_type, now_ts, p], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?
        } else {
            stmt.query_map(params![identifier, data_type, now_ts], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?
        };
        drop(stmt);

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let chosen: Vec<&(String, Vec<u8>, Option<String>)> = if random {
            let idx = rand::random::<usize>() % rows.len();
            vec![&rows[idx]]
        } else {
            rows.iter().collect()
        };

        let mut out = Vec::with_capacity(chosen.len());
        for (url, bytes, metadata_text) in &chosen {
            conn.execute(
                "UPDATE cached_data SET access_count = access_count + 1, last_accessed = ?2 WHERE url = ?1",
                params![url, now_ts],
            )?;
            let metadata = metadata_text.clone().and_then(|t| serde_json::from_str(&t).ok());
            out.push((decode_retrieved(bytes.clone()), metadata, url.clone()));
        }
        Ok(out)
    }

    /// Returns all `cache_key` values recorded for an identifier, regardless
    /// of expiry -- used by consumers enumerating what was ever cached.
    pub fn get_cache_keys_for_identifier(&self, identifier: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT cache_key FROM cached_data WHERE identifier = ?1")?;
        let keys = stmt
            .query_map(params![identifier], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(keys)
    }

    /// Enqueues a pending request; `request_id` is a stable hash of
    /// provider+key+params so duplicate queueing is idempotent at the
    /// storage layer too.
    pub fn queue_request(
        &self,
        provider: &str,
        request_key: &str,
        params: &serde_json::Value,
        priority: i64,
    ) -> Result<String> {
        let request_id = derive_request_id(provider, request_key, params);
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO pending_requests
                (request_id, provider, request_key, params, priority, created_at, attempts, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'pending')",
            params![
                request_id,
                provider,
                request_key,
                params.to_string(),
                priority,
                now()
            ],
        )?;
        Ok(request_id)
    }

    /// Atomically claims the next pending request, ordered by
    /// `(priority ASC, created_at ASC)`, flipping it to `processing`.
    pub fn get_next_request(&self) -> Result<Option<PendingRequest>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let claimed: Option<(String, String, String, String, i64, i64, i64)> = tx
            .query_row(
                "SELECT request_id, provider, request_key, params, priority, created_at, attempts
                 FROM pending_requests
                 WHERE status = 'pending'
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((request_id, provider, request_key, params_text, priority, created_at, attempts)) =
            claimed
        else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE pending_requests SET status = 'processing', attempts = attempts + 1, last_attempt = ?2
             WHERE request_id = ?1",
            params![request_id, now()],
        )?;
        tx.commit()?;

        Ok(Some(PendingRequest {
            request_id,
            provider,
            request_key,
            params: serde_json::from_str(&params_text).unwrap_or(serde_json::Value::Null),
            priority,
            created_at,
            attempts: attempts + 1,
            status: RequestStatus::Processing,
        }))
    }

    /// Writes the terminal status for a claimed request.
    pub fn complete_request(&self, request_id: &str, status: RequestStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pending_requests SET status = ?2 WHERE request_id = ?1",
            params![request_id, status.as_str()],
        )?;
        Ok(())
    }

    /// Deletes expired cache rows, returning the count removed.
    pub fn cleanup_expired(&self) -> Result<u64> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM cached_data WHERE expires_at <= ?1",
            params![now()],
        )?;
        Ok(deleted as u64)
    }

    /// Runs `cleanup_expired` plus `VACUUM`.
    pub fn maintenance(&self) -> Result<u64> {
        let deleted = self.cleanup_expired()?;
        let conn = self.conn()?;
        if let Err(e) = conn.execute_batch("VACUUM;") {
            warn!(error = %e, "VACUUM failed, continuing");
        }
        Ok(deleted)
    }

    /// Flips every `processing` row to `failed`. Run on worker shutdown so a
    /// request claimed but not finished in time gets retried by a later run
    /// instead of sitting in `processing` forever.
    pub fn fail_processing_requests(&self) -> Result<u64> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE pending_requests SET status = 'failed' WHERE status = 'processing'",
            [],
        )?;
        Ok(updated as u64)
    }

    /// Deletes terminal `pending_requests` rows older than 24h. Intended to
    /// run once at process start.
    pub fn cleanup_stale_requests(&self) -> Result<u64> {
        let conn = self.conn()?;
        let cutoff = now() - 24 * 3600;
        let deleted = conn.execute(
            "DELETE FROM pending_requests
             WHERE status IN ('completed', 'failed') AND created_at <= ?1",
            params![cutoff],
        )?;
        Ok(deleted as u64)
    }
}

fn derive_request_id(provider: &str, request_key: &str, params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b"|");
    hasher.update(request_key.as_bytes());
    hasher.update(b"|");
    hasher.update(params.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_test_storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("datacache.sqlite")).unwrap();
        (dir, storage)
    }

    #[test]
    fn store_then_retrieve_round_trips() {
        let (_dir, storage) = open_test_storage();
        storage
            .store(
                "https://example.com/a.png",
                "artist-a",
                "thumbnail",
                "images",
                DataValue::Binary(vec![1, 2, 3]),
                3600,
                None,
            )
            .unwrap();

        let (value, _) = storage
            .retrieve_by_url("https://example.com/a.png")
            .unwrap()
            .unwrap();
        assert_eq!(value, RetrievedValue::Raw(vec![1, 2, 3]));
    }

    #[test]
    fn expired_entry_is_not_retrievable() {
        let (_dir, storage) = open_test_storage();
        storage
            .store(
                "https://example.com/b.png",
                "artist-b",
                "thumbnail",
                "images",
                DataValue::Text("gone soon".into()),
                -1,
                None,
            )
            .unwrap();
        assert!(storage
            .retrieve_by_url("https://example.com/b.png")
            .unwrap()
            .is_none());
    }

    #[test]
    fn store_twice_replaces_first_payload() {
        let (_dir, storage) = open_test_storage();
        let url = "https://example.com/c.json";
        storage
            .store(url, "id", "bio_en", "wikimedia", DataValue::Text("first".into()), 3600, None)
            .unwrap();
        storage
            .store(url, "id", "bio_en", "wikimedia", DataValue::Text("second".into()), 3600, None)
            .unwrap();

        let (value, _) = storage.retrieve_by_url(url).unwrap().unwrap();
        match value {
            RetrievedValue::Raw(bytes) => assert_eq!(bytes, b"second"),
            RetrievedValue::Json(_) => panic!("unexpected JSON decode of plain text"),
        }
    }

    #[test]
    fn retrieve_by_identifier_returns_all_non_random() {
        let (_dir, storage) = open_test_storage();
        for i in 0..3 {
            storage
                .store(
                    &format!("https://example.com/{i}.jpg"),
                    "artist-x",
                    "fanart",
                    "fanarttv",
                    DataValue::Binary(vec![i as u8]),
                    3600,
                    None,
                )
                .unwrap();
        }
        let all = storage
            .retrieve_by_identifier("artist-x", "fanart", None, false)
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn queue_and_claim_orders_by_priority_then_fifo() {
        let (_dir, storage) = open_test_storage();
        storage
            .queue_request("images", "fetch_url", &serde_json::json!({"url": "u1"}), 2)
            .unwrap();
        storage
            .queue_request("images", "fetch_url", &serde_json::json!({"url": "u2"}), 1)
            .unwrap();

        let claimed = storage.get_next_request().unwrap().unwrap();
        assert_eq!(claimed.params["url"], "u2");
        assert_eq!(claimed.status, RequestStatus::Processing);

        storage
            .complete_request(&claimed.request_id, RequestStatus::Completed)
            .unwrap();

        let next = storage.get_next_request().unwrap().unwrap();
        assert_eq!(next.params["url"], "u1");
    }

    #[test]
    fn cache_key_is_stable_and_scoped_to_its_inputs() {
        let a = derive_cache_key("artist", "thumbnail", "images", "https://x/1.png");
        let b = derive_cache_key("artist", "thumbnail", "images", "https://x/1.png");
        let c = derive_cache_key("artist", "thumbnail", "images", "https://x/2.png");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("artist_thumbnail_images_"));
    }
}
