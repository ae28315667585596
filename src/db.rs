//! Transactional row store backed by redb.
//!
//! Every local store keeps its rows as JSON bytes under a natural string
//! key in its own table:
//!
//! ```text
//! notifications:  notification_id        → Notification
//! playlists:      playlist_id            → UserPlaylist
//! likes:          "{type}:{content_id}"  → LikedItem
//! sync_meta:      "watermark:user"       → u64
//! pending_reads:  u64 (append order)     → QueueEntry<ReadAck>
//! ```
//!
//! redb admits a single write transaction at a time, so a read-modify-write
//! done inside one [`LocalDb::update`] call cannot interleave with another
//! writer touching the same row.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadTransaction, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Table of JSON rows keyed by a natural identifier.
pub type RowTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Append-only table of JSON rows keyed by an increasing `u64`.
pub type SeqTable = TableDefinition<'static, u64, &'static [u8]>;

pub struct LocalDb {
    db: Database,
}

impl LocalDb {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open local database at {}", path.display()))?;
        Ok(Self { db })
    }

    /// Volatile database, used by tests and by hosts that only want a
    /// per-process cache.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .context("Failed to create in-memory database")?;
        Ok(Self { db })
    }

    /// Default location: `<data_dir>/drift-sync/sync.redb`.
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::data_dir()
            .context("Failed to get data directory")?
            .join("drift-sync")
            .join("sync.redb"))
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Run `f` inside one write transaction and commit it. Nothing is
    /// committed if `f` fails.
    pub fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R>) -> Result<R> {
        let txn = self.db.begin_write()?;
        let out = f(&txn)?;
        txn.commit().context("Failed to commit write transaction")?;
        Ok(out)
    }

    // ── Row primitives ──────────────────────────────────────────────

    /// Replace every row of `table` in a single transaction.
    pub fn replace_all<T: Serialize>(
        &self,
        table: RowTable,
        rows: impl IntoIterator<Item = (String, T)>,
    ) -> Result<()> {
        self.write(|txn| {
            clear(txn, table)?;
            for (key, row) in rows {
                put(txn, table, &key, &row)?;
            }
            Ok(())
        })
    }

    pub fn upsert<T: Serialize>(&self, table: RowTable, key: &str, row: &T) -> Result<()> {
        self.write(|txn| put(txn, table, key, row))
    }

    /// Delete a row. Returns whether it existed.
    pub fn delete(&self, table: RowTable, key: &str) -> Result<bool> {
        self.write(|txn| remove(txn, table, key))
    }

    pub fn get<T: DeserializeOwned>(&self, table: RowTable, key: &str) -> Result<Option<T>> {
        let txn = self.db.begin_read()?;
        let t = match txn.open_table(table) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match t.get(key)? {
            Some(bytes) => Ok(Some(decode_row(bytes.value())?)),
            None => Ok(None),
        }
    }

    /// All rows of `table` in key order.
    pub fn scan<T: DeserializeOwned>(&self, table: RowTable) -> Result<Vec<(String, T)>> {
        let txn = self.db.begin_read()?;
        let t = match txn.open_table(table) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        for entry in t.iter()? {
            let (k, v) = entry?;
            rows.push((k.value().to_string(), decode_row(v.value())?));
        }
        Ok(rows)
    }

    /// Rows whose key starts with `prefix`, in key order.
    pub fn scan_prefix<T: DeserializeOwned>(&self, table: RowTable, prefix: &str) -> Result<Vec<(String, T)>> {
        let txn = self.db.begin_read()?;
        let t = match txn.open_table(table) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        for entry in t.range(prefix..)? {
            let (k, v) = entry?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_string(), decode_row(v.value())?));
        }
        Ok(rows)
    }

    /// All rows of a sequence table, oldest first.
    pub fn scan_seq<T: DeserializeOwned>(&self, table: SeqTable) -> Result<Vec<(u64, T)>> {
        let txn = self.db.begin_read()?;
        let t = match txn.open_table(table) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        for entry in t.iter()? {
            let (k, v) = entry?;
            rows.push((k.value(), decode_row(v.value())?));
        }
        Ok(rows)
    }

    /// Atomic read-modify-write of one row. `f` sees the current row (if
    /// any) and returns the new one; `None` deletes it. Returns what `f`
    /// returned.
    pub fn update<T, F>(&self, table: RowTable, key: &str, f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        self.write(|txn| {
            let current: Option<T> = fetch(txn, table, key)?;
            let next = f(current);
            match &next {
                Some(row) => put(txn, table, key, row)?,
                None => {
                    remove(txn, table, key)?;
                }
            }
            Ok(next)
        })
    }
}

// ── Helpers usable inside a caller-owned write transaction ─────────

pub fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(row).context("Failed to encode row")
}

pub fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).context("corrupt row in local database")
}

pub fn put<T: Serialize>(txn: &WriteTransaction, table: RowTable, key: &str, row: &T) -> Result<()> {
    let bytes = encode_row(row)?;
    let mut t = txn.open_table(table)?;
    t.insert(key, bytes.as_slice())?;
    Ok(())
}

pub fn remove(txn: &WriteTransaction, table: RowTable, key: &str) -> Result<bool> {
    let mut t = txn.open_table(table)?;
    let existed = t.remove(key)?.is_some();
    Ok(existed)
}

pub fn fetch<T: DeserializeOwned>(txn: &WriteTransaction, table: RowTable, key: &str) -> Result<Option<T>> {
    let t = txn.open_table(table)?;
    let bytes = t.get(key)?.map(|guard| guard.value().to_vec());
    bytes.map(|b| decode_row(&b)).transpose()
}

pub fn fetch_all<T: DeserializeOwned>(txn: &WriteTransaction, table: RowTable) -> Result<Vec<(String, T)>> {
    let t = txn.open_table(table)?;
    let mut rows = Vec::new();
    for entry in t.iter()? {
        let (k, v) = entry?;
        rows.push((k.value().to_string(), decode_row(v.value())?));
    }
    Ok(rows)
}

pub fn fetch_prefix<T: DeserializeOwned>(
    txn: &WriteTransaction,
    table: RowTable,
    prefix: &str,
) -> Result<Vec<(String, T)>> {
    let t = txn.open_table(table)?;
    let mut rows = Vec::new();
    for entry in t.range(prefix..)? {
        let (k, v) = entry?;
        let key = k.value();
        if !key.starts_with(prefix) {
            break;
        }
        rows.push((key.to_string(), decode_row(v.value())?));
    }
    Ok(rows)
}

/// Remove every row whose key starts with `prefix`. Returns how many went.
pub fn clear_prefix(txn: &WriteTransaction, table: RowTable, prefix: &str) -> Result<usize> {
    let mut t = txn.open_table(table)?;
    let mut keys = Vec::new();
    for entry in t.range(prefix..)? {
        let (k, _) = entry?;
        let key = k.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    for key in &keys {
        t.remove(key.as_str())?;
    }
    Ok(keys.len())
}

// ── Sequence tables ────────────────────────────────────────────────

/// Append a row under the next free key and return that key.
pub fn append<T: Serialize>(txn: &WriteTransaction, table: SeqTable, row: &T) -> Result<u64> {
    let bytes = encode_row(row)?;
    let mut t = txn.open_table(table)?;
    let next = match t.last()? {
        Some((k, _)) => k.value() + 1,
        None => 1,
    };
    t.insert(next, bytes.as_slice())?;
    Ok(next)
}

pub fn fetch_seq<T: DeserializeOwned>(txn: &WriteTransaction, table: SeqTable, key: u64) -> Result<Option<T>> {
    let t = txn.open_table(table)?;
    let bytes = t.get(key)?.map(|guard| guard.value().to_vec());
    bytes.map(|b| decode_row(&b)).transpose()
}

pub fn fetch_all_seq<T: DeserializeOwned>(txn: &WriteTransaction, table: SeqTable) -> Result<Vec<(u64, T)>> {
    let t = txn.open_table(table)?;
    let mut rows = Vec::new();
    for entry in t.iter()? {
        let (k, v) = entry?;
        rows.push((k.value(), decode_row(v.value())?));
    }
    Ok(rows)
}

pub fn put_seq<T: Serialize>(txn: &WriteTransaction, table: SeqTable, key: u64, row: &T) -> Result<()> {
    let bytes = encode_row(row)?;
    let mut t = txn.open_table(table)?;
    t.insert(key, bytes.as_slice())?;
    Ok(())
}

pub fn remove_seq(txn: &WriteTransaction, table: SeqTable, key: u64) -> Result<bool> {
    let mut t = txn.open_table(table)?;
    let existed = t.remove(key)?.is_some();
    Ok(existed)
}

/// Drop the oldest rows until at most `keep` remain. Returns how many went.
pub fn trim_oldest(txn: &WriteTransaction, table: SeqTable, keep: usize) -> Result<usize> {
    let mut t = txn.open_table(table)?;
    let len = t.len()? as usize;
    if len <= keep {
        return Ok(0);
    }
    let excess = len - keep;
    let keys: Vec<u64> = t
        .iter()?
        .take(excess)
        .map(|r| r.map(|(k, _)| k.value()))
        .collect::<std::result::Result<_, _>>()?;
    for key in &keys {
        t.remove(*key)?;
    }
    Ok(keys.len())
}

/// Remove every row of `table`.
pub fn clear(txn: &WriteTransaction, table: RowTable) -> Result<()> {
    let mut t = txn.open_table(table)?;
    let keys: Vec<String> = t
        .iter()?
        .map(|r| r.map(|(k, _)| k.value().to_string()))
        .collect::<std::result::Result<_, _>>()?;
    for key in keys {
        t.remove(key.as_str())?;
    }
    Ok(())
}

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
