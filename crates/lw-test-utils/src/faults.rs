use std::path::PathBuf;

use lw_storage::KvStore;
use rusqlite::Connection;
use tempfile::TempDir;

/// A file-backed [`KvStore`] with a side connection that installs a trigger
/// aborting inserts, so tests can make a write fail halfway through.
pub struct FaultyStore {
    _dir: TempDir,
    path: PathBuf,
}

impl FaultyStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faulty.sqlite3");
        Self { _dir: dir, path }
    }

    /// A store over the shared file. Its schema is created on open.
    pub fn open(&self) -> KvStore {
        KvStore::open(&self.path).unwrap()
    }

    /// Makes every insert into `bucket` fail, or only those under `key`.
    pub fn fail_writes(&self, bucket: &str, key: Option<&[u8]>) {
        let key_filter = key
            .map(|k| format!(" AND NEW.key = X'{}'", hex::encode(k)))
            .unwrap_or_default();
        self.side().execute_batch(&format!(
            "DROP TRIGGER IF EXISTS fail_writes;
             CREATE TRIGGER fail_writes BEFORE INSERT ON entries
             WHEN NEW.bucket = '{bucket}'{key_filter}
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;"
        ))
        .unwrap();
    }

    pub fn heal(&self) {
        self.side()
            .execute_batch("DROP TRIGGER IF EXISTS fail_writes;")
            .unwrap();
    }

    fn side(&self) -> Connection {
        Connection::open(&self.path).unwrap()
    }
}

impl Default for FaultyStore {
    fn default() -> Self {
        Self::new()
    }
}
