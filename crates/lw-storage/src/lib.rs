//! Bucketed key/value storage engine over SQLite.
//!
//! # Model
//! A store holds named buckets; each bucket maps binary keys to an ordered
//! list of entries. `store` appends, `replace` swaps the whole list in one
//! transaction, `flush` drops a key and `reset` drops a bucket.
//!
//! Changes spanning several keys go through a [`Batch`]: its reads see its
//! own writes, and nothing it wrote survives unless it is committed.
//!
//! # Entry format
//! Entries are serde_json documents tagged with [`ENTRY_FORMAT_VERSION`].
//! Rows written with another version are rejected on read.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=FULL. `PRAGMA integrity_check` runs on
//! file-backed stores.

use std::path::Path;

use rusqlite::{Connection, Transaction, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub const ENTRY_FORMAT_VERSION: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("entry codec: {0}")]
    Codec(String),
    #[error("no entry for key in bucket {0}")]
    NotFound(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for lw_protocol::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) => lw_protocol::Error::not_found(e.to_string()),
            other => lw_protocol::Error::operational(other.to_string()),
        }
    }
}

pub struct KvStore {
    conn: Connection,
}

impl KvStore {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.apply_pragmas()?;
        store.integrity_check()?;
        store.apply_schema()?;
        debug!(path = %path.display(), "storage opened");
        Ok(store)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.apply_schema()?;
        Ok(store)
    }

    pub fn integrity_check(&self) -> StorageResult<()> {
        let r: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if r != "ok" {
            return Err(StorageError::IntegrityCheckFailed(r));
        }
        Ok(())
    }

    /// All entries under `key`, oldest first. `NotFound` when there are none.
    pub fn lookup<T: DeserializeOwned>(&self, bucket: &str, key: &[u8]) -> StorageResult<Vec<T>> {
        lookup_entries(&self.conn, bucket, key)
    }

    /// Appends `entries` under `key`.
    pub fn store<T: Serialize>(&mut self, bucket: &str, key: &[u8], entries: &[T]) -> StorageResult<()> {
        let mut batch = self.batch()?;
        batch.store(bucket, key, entries)?;
        batch.commit()
    }

    /// Atomically swaps the entries under `key` for `entries`.
    pub fn replace<T: Serialize>(
        &mut self,
        bucket: &str,
        key: &[u8],
        entries: &[T],
    ) -> StorageResult<()> {
        let mut batch = self.batch()?;
        batch.replace(bucket, key, entries)?;
        batch.commit()
    }

    pub fn flush(&mut self, bucket: &str, key: &[u8]) -> StorageResult<()> {
        delete_key(&self.conn, bucket, key)
    }

    pub fn reset(&mut self, bucket: &str) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM entries WHERE bucket = ?1", params![bucket])?;
        Ok(())
    }

    /// Distinct keys of a bucket.
    pub fn keys(&self, bucket: &str) -> StorageResult<Vec<Vec<u8>>> {
        bucket_keys(&self.conn, bucket)
    }

    /// Opens a transaction. Dropping the batch without
    /// [`commit`](Batch::commit) rolls every write back.
    pub fn batch(&mut self) -> StorageResult<Batch<'_>> {
        Ok(Batch {
            tx: self.conn.transaction()?,
        })
    }

    pub fn close(self) -> StorageResult<()> {
        self.conn.close().map_err(|(_, e)| StorageError::Sqlite(e))
    }

    fn apply_pragmas(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

/// Reads and writes sharing one SQLite transaction.
pub struct Batch<'a> {
    tx: Transaction<'a>,
}

impl Batch<'_> {
    pub fn lookup<T: DeserializeOwned>(&self, bucket: &str, key: &[u8]) -> StorageResult<Vec<T>> {
        lookup_entries(&self.tx, bucket, key)
    }

    pub fn keys(&self, bucket: &str) -> StorageResult<Vec<Vec<u8>>> {
        bucket_keys(&self.tx, bucket)
    }

    pub fn store<T: Serialize>(&mut self, bucket: &str, key: &[u8], entries: &[T]) -> StorageResult<()> {
        insert_entries(&self.tx, bucket, key, entries)
    }

    pub fn replace<T: Serialize>(
        &mut self,
        bucket: &str,
        key: &[u8],
        entries: &[T],
    ) -> StorageResult<()> {
        delete_key(&self.tx, bucket, key)?;
        insert_entries(&self.tx, bucket, key, entries)
    }

    pub fn flush(&mut self, bucket: &str, key: &[u8]) -> StorageResult<()> {
        delete_key(&self.tx, bucket, key)
    }

    pub fn commit(self) -> StorageResult<()> {
        self.tx.commit()?;
        Ok(())
    }
}

fn lookup_entries<T: DeserializeOwned>(
    conn: &Connection,
    bucket: &str,
    key: &[u8],
) -> StorageResult<Vec<T>> {
    let mut stmt = conn.prepare(
        "SELECT format_version, payload FROM entries
         WHERE bucket = ?1 AND key = ?2 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![bucket, key], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (version, payload) = row?;
        out.push(decode_entry(version, &payload)?);
    }
    if out.is_empty() {
        return Err(StorageError::NotFound(bucket.to_owned()));
    }
    Ok(out)
}

fn bucket_keys(conn: &Connection, bucket: &str) -> StorageResult<Vec<Vec<u8>>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT key FROM entries WHERE bucket = ?1 ORDER BY key")?;
    let rows = stmt.query_map(params![bucket], |r| r.get::<_, Vec<u8>>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn delete_key(conn: &Connection, bucket: &str, key: &[u8]) -> StorageResult<()> {
    conn.execute(
        "DELETE FROM entries WHERE bucket = ?1 AND key = ?2",
        params![bucket, key],
    )?;
    Ok(())
}

fn insert_entries<T: Serialize>(
    conn: &Connection,
    bucket: &str,
    key: &[u8],
    entries: &[T],
) -> StorageResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO entries (bucket, key, format_version, payload) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for entry in entries {
        let payload = serde_json::to_vec(entry).map_err(|e| StorageError::Codec(e.to_string()))?;
        stmt.execute(params![bucket, key, ENTRY_FORMAT_VERSION, payload])?;
    }
    Ok(())
}

fn decode_entry<T: DeserializeOwned>(version: i64, payload: &[u8]) -> StorageResult<T> {
    if version != ENTRY_FORMAT_VERSION {
        return Err(StorageError::Codec(format!(
            "unsupported entry format version {version}"
        )));
    }
    serde_json::from_slice(payload).map_err(|e| StorageError::Codec(e.to_string()))
}
