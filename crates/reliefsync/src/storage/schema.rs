//! `SQLite` schema definitions for the local store.
//!
//! Each partition of the store is one table. Cache partitions are keyed by the
//! server-assigned record id; the sync queue is keyed by an auto-increment
//! sequence so the store hands out monotonically increasing keys.
//!
//! Cache keys are declared without a type so no affinity applies: the
//! integer `42` and the text `'42'` are different keys.

/// Mirrored domain records. Insertion order is the implicit rowid.
pub const CREATE_RECORDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS records (
    key PRIMARY KEY NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT,
    status TEXT
)
";

/// Index on the record creation time, used for local listing.
pub const CREATE_RECORDS_CREATED_AT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_created_at ON records(created_at)
";

/// Index on the record status, used for local listing.
pub const CREATE_RECORDS_STATUS_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_status ON records(status)
";

/// Secondary records hanging off a domain record.
pub const CREATE_SECONDARY_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS secondary_records (
    key PRIMARY KEY NOT NULL,
    payload TEXT NOT NULL,
    parent_key TEXT,
    claimed INTEGER
)
";

/// Index on the parent record key.
pub const CREATE_SECONDARY_PARENT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_secondary_parent ON secondary_records(parent_key)
";

/// Index on the claimed flag.
pub const CREATE_SECONDARY_CLAIMED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_secondary_claimed ON secondary_records(claimed)
";

/// Pending mutations. `AUTOINCREMENT` keeps keys strictly increasing even
/// after the newest row is deleted.
pub const CREATE_SYNC_QUEUE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    payload TEXT NOT NULL
)
";

/// Index on enqueue time for FIFO drains.
pub const CREATE_SYNC_QUEUE_TIMESTAMP_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_sync_queue_timestamp ON sync_queue(timestamp)
";

/// Key-value pairs describing the store itself (schema version).
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_RECORDS_TABLE,
    CREATE_RECORDS_CREATED_AT_INDEX,
    CREATE_RECORDS_STATUS_INDEX,
    CREATE_SECONDARY_TABLE,
    CREATE_SECONDARY_PARENT_INDEX,
    CREATE_SECONDARY_CLAIMED_INDEX,
    CREATE_SYNC_QUEUE_TABLE,
    CREATE_SYNC_QUEUE_TIMESTAMP_INDEX,
    CREATE_METADATA_TABLE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_not_empty() {
        assert!(!SCHEMA_STATEMENTS.is_empty());
        for stmt in SCHEMA_STATEMENTS {
            assert!(!stmt.trim().is_empty());
        }
    }

    #[test]
    fn test_sync_queue_is_auto_keyed() {
        assert!(CREATE_SYNC_QUEUE_TABLE.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(CREATE_SYNC_QUEUE_TABLE.contains("timestamp INTEGER NOT NULL"));
    }

    #[test]
    fn test_cache_tables_keyed_by_record_id() {
        assert!(CREATE_RECORDS_TABLE.contains("key PRIMARY KEY"));
        assert!(CREATE_SECONDARY_TABLE.contains("key PRIMARY KEY"));
    }
}
