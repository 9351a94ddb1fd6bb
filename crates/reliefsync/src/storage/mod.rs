//! Local store for reliefsync.
//!
//! This module provides the `SQLite`-backed store that keeps mirrored domain
//! records and the pending-mutation queue across sessions. It is organized
//! into three partitions (see [`Partition`]), each addressed by a primary
//! key.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, error, info, trace};

use crate::error::{Error, Result};
use crate::mutation::{Partition, RecordKey};
use crate::worker::{WorkerChannel, WorkerMessage};

/// Durable, partitioned key-value store.
///
/// The connection sits behind a mutex so one store can be shared between
/// tasks through an `Arc`. Every call runs in its own short transaction; no
/// lock is held across network I/O.
#[derive(Debug)]
pub struct LocalStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
    /// Background worker notified about record writes.
    worker: Option<WorkerChannel>,
    /// Number of reads that failed and were reported as empty.
    read_failures: AtomicU64,
}

impl LocalStore {
    /// Open or create a store at the given path.
    ///
    /// Creates the parent directories and the database file if they don't
    /// exist. The first open creates the partitions; later opens reuse them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] or [`Error::DirectoryCreate`] if
    /// the database cannot be created, or a migration error if its schema is
    /// unusable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening local store at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::StorageUnavailable {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|source| Error::StorageUnavailable {
                path: path.clone(),
                source,
            })?;

        migrations::initialize_schema(&conn)?;

        info!("Local store opened at {}", path.display());
        Ok(Self::from_connection(path, conn))
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|source| Error::StorageUnavailable {
            path: path.clone(),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self::from_connection(path, conn))
    }

    fn from_connection(path: PathBuf, conn: Connection) -> Self {
        Self {
            path,
            conn: Mutex::new(conn),
            worker: None,
            read_failures: AtomicU64::new(0),
        }
    }

    /// Notify the given background worker about every record write.
    #[must_use]
    pub fn with_worker_channel(mut self, channel: WorkerChannel) -> Self {
        self.worker = Some(channel);
        self
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of reads that failed internally and were reported as empty.
    #[must_use]
    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("local store connection lock poisoned"))
    }

    /// Upsert a record and return its key.
    ///
    /// Cache partitions take the key from the record's `id` field. The sync
    /// queue assigns a fresh sequence number unless the record already
    /// carries an integer `id`. Writes to [`Partition::Records`] are mirrored
    /// to the background worker, if one is attached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingKey`] for a cache record without an `id`, or an
    /// error if the database operation fails.
    pub fn put(&self, partition: Partition, record: &Value) -> Result<RecordKey> {
        let key = match partition {
            Partition::Records => self.put_record(record)?,
            Partition::Secondary => self.put_secondary(record)?,
            Partition::SyncQueue => self.put_queued(record)?,
        };
        trace!("Stored {} in {}", key, partition);

        if partition == Partition::Records {
            if let Some(worker) = &self.worker {
                worker.post(WorkerMessage::CacheRecord {
                    key: key.clone(),
                    record: record.clone(),
                });
            }
        }

        Ok(key)
    }

    fn put_record(&self, record: &Value) -> Result<RecordKey> {
        let key = RecordKey::from_record(record).ok_or(Error::MissingKey {
            partition: Partition::Records.table(),
        })?;

        self.conn()?.execute(
            r"
            INSERT INTO records (key, payload, created_at, status)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                status = excluded.status
            ",
            params![
                key.to_sql_value(),
                record.to_string(),
                index_text(record, "createdAt"),
                index_text(record, "status"),
            ],
        )?;
        Ok(key)
    }

    fn put_secondary(&self, record: &Value) -> Result<RecordKey> {
        let key = RecordKey::from_record(record).ok_or(Error::MissingKey {
            partition: Partition::Secondary.table(),
        })?;
        let claimed = record.get("claimed").and_then(Value::as_bool);

        self.conn()?.execute(
            r"
            INSERT INTO secondary_records (key, payload, parent_key, claimed)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                parent_key = excluded.parent_key,
                claimed = excluded.claimed
            ",
            params![
                key.to_sql_value(),
                record.to_string(),
                index_text(record, "parentId"),
                claimed,
            ],
        )?;
        Ok(key)
    }

    fn put_queued(&self, record: &Value) -> Result<RecordKey> {
        let timestamp = record
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        // The key lives in its own column; the payload never duplicates it.
        let mut payload = record.clone();
        let explicit_id = match payload.as_object_mut() {
            Some(map) => map.remove("id").and_then(|id| id.as_i64()),
            None => None,
        };

        let conn = self.conn()?;
        let id = if let Some(id) = explicit_id {
            conn.execute(
                r"
                INSERT INTO sync_queue (id, timestamp, payload) VALUES (?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    payload = excluded.payload
                ",
                params![id, timestamp, payload.to_string()],
            )?;
            id
        } else {
            conn.execute(
                "INSERT INTO sync_queue (timestamp, payload) VALUES (?1, ?2)",
                params![timestamp, payload.to_string()],
            )?;
            conn.last_insert_rowid()
        };
        Ok(RecordKey::Sequence(id))
    }

    /// Get a single record by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the stored payload
    /// is not valid JSON.
    pub fn get(&self, partition: Partition, key: &RecordKey) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let row: Option<(i64, String)> = if partition.auto_keyed() {
            let Some(id) = sequence_of(key) else {
                return Ok(None);
            };
            conn.query_row(
                "SELECT id, payload FROM sync_queue WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        } else {
            let sql = format!(
                "SELECT rowid, payload FROM {} WHERE key = ?1",
                partition.table()
            );
            conn.query_row(&sql, [key.to_sql_value()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?
        };

        row.map(|(id, payload)| decode_row(partition, id, &payload))
            .transpose()
    }

    /// Get every record of a partition in insertion order.
    ///
    /// Never fails the caller: an internal error is logged, counted in
    /// [`read_failures`](Self::read_failures) and reported as an empty
    /// partition. Callers that must tell "empty" from "unreadable" use
    /// [`try_get_all`](Self::try_get_all).
    #[must_use]
    pub fn get_all(&self, partition: Partition) -> Vec<Value> {
        match self.try_get_all(partition) {
            Ok(records) => records,
            Err(e) => {
                self.read_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to read partition {}: {}", partition, e);
                Vec::new()
            }
        }
    }

    /// Get every record of a partition in insertion order, propagating errors.
    ///
    /// Sync queue records carry their store-assigned `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or a stored payload is
    /// not valid JSON.
    pub fn try_get_all(&self, partition: Partition) -> Result<Vec<Value>> {
        let sql = if partition.auto_keyed() {
            "SELECT id, payload FROM sync_queue ORDER BY id ASC".to_string()
        } else {
            format!(
                "SELECT rowid, payload FROM {} ORDER BY rowid ASC",
                partition.table()
            )
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|(id, payload)| decode_row(partition, *id, payload))
            .collect()
    }

    /// Delete one record.
    ///
    /// Returns `true` if a record was deleted, `false` if it was absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn delete(&self, partition: Partition, key: &RecordKey) -> Result<bool> {
        let affected = if partition.auto_keyed() {
            let Some(id) = sequence_of(key) else {
                return Ok(false);
            };
            self.conn()?
                .execute("DELETE FROM sync_queue WHERE id = ?1", [id])?
        } else {
            let sql = format!("DELETE FROM {} WHERE key = ?1", partition.table());
            self.conn()?.execute(&sql, [key.to_sql_value()])?
        };

        debug!("Deleted {} from {} ({} row)", key, partition, affected);
        Ok(affected > 0)
    }

    /// Remove every record of a partition.
    ///
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear(&self, partition: Partition) -> Result<usize> {
        let sql = format!("DELETE FROM {}", partition.table());
        let affected = self.conn()?.execute(&sql, [])?;

        if affected > 0 {
            info!("Cleared {} records from {}", affected, partition);
        }
        Ok(affected)
    }

    /// Count the records of a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count(&self, partition: Partition) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", partition.table());
        let count: i64 = self.conn()?.query_row(&sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Get store statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StoreStats {
            records: self.count(Partition::Records)?,
            secondary: self.count(Partition::Secondary)?,
            pending: self.count(Partition::SyncQueue)?,
            read_failures: self.read_failures(),
            db_size_bytes,
        })
    }

    /// Read a value from the store's metadata table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()?
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write a value to the store's metadata table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or `key` is
    /// reserved for the schema version.
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        if key == migrations::VERSION_KEY {
            return Err(Error::internal(format!("metadata key '{key}' is reserved")));
        }
        self.conn()?.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            (key, value),
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }
}

/// Statistics about the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Cached domain records.
    pub records: usize,
    /// Cached secondary records.
    pub secondary: usize,
    /// Pending mutations.
    pub pending: usize,
    /// Reads reported as empty because of an internal error.
    pub read_failures: u64,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

/// Index column value for a record field; non-string scalars are stringified.
fn index_text(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn sequence_of(key: &RecordKey) -> Option<i64> {
    match key {
        RecordKey::Sequence(id) | RecordKey::Number(id) => Some(*id),
        RecordKey::Named(s) => s.parse().ok(),
    }
}

fn decode_row(partition: Partition, id: i64, payload: &str) -> Result<Value> {
    let mut value: Value = serde_json::from_str(payload)
        .map_err(|e| Error::corrupt_record(partition.table(), e.to_string()))?;

    if partition.auto_keyed() {
        if let Some(map) = value.as_object_mut() {
            map.insert("id".to_string(), Value::from(id));
        }
    }
    Ok(value)
}
