//! Schema versioning for the local store.
//!
//! The store is opened at a fixed schema version. The first open creates the
//! partitions; later opens find the version already recorded and reuse the
//! existing schema.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::schema::SCHEMA_STATEMENTS;

/// The schema version this build reads and writes.
pub const CURRENT_VERSION: i32 = 1;

/// Key used to store the schema version in the metadata table.
pub(crate) const VERSION_KEY: &str = "schema_version";

/// Initialize the database schema.
///
/// Creates all partitions if they don't exist, then upgrades older
/// databases. A database written by a newer schema version is refused.
///
/// # Errors
///
/// Returns an error if schema creation fails or the stored version is newer
/// than [`CURRENT_VERSION`].
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute(statement, [])?;
    }

    let version = get_schema_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(Error::DatabaseMigration {
            message: format!(
                "database schema version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        });
    }
    if version < CURRENT_VERSION {
        info!("Upgrading local store schema from v{version} to v{CURRENT_VERSION}");
        run_migrations(conn, version)?;
    } else {
        debug!("Local store schema already at v{version}");
    }

    Ok(())
}

/// Get the schema version recorded in the database.
///
/// Returns 0 if no version is set (fresh database).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result: std::result::Result<String, rusqlite::Error> = conn.query_row(
        "SELECT value FROM metadata WHERE key = ?1",
        [VERSION_KEY],
        |row| row.get(0),
    );

    match result {
        Ok(value) => value.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid schema version: {value}"),
        }),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        (VERSION_KEY, version.to_string()),
    )?;
    Ok(())
}

fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    let mut current = from_version;

    while current < CURRENT_VERSION {
        current += 1;
        run_migration(conn, current)?;
    }

    set_schema_version(conn, CURRENT_VERSION)?;
    Ok(())
}

fn run_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        // v1 is the base schema created by SCHEMA_STATEMENTS.
        1 => set_schema_version(conn, 1),
        _ => Err(Error::DatabaseMigration {
            message: format!("unknown migration version: {version}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_db() -> Connection {
        Connection::open_in_memory().expect("failed to create in-memory database")
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |row| row.get(0),
            )
            .unwrap();
        count == 1
    }

    #[test]
    fn test_initialize_schema_creates_partitions() {
        let conn = create_test_db();
        initialize_schema(&conn).expect("failed to initialize schema");

        assert!(table_exists(&conn, "records"));
        assert!(table_exists(&conn, "secondary_records"));
        assert!(table_exists(&conn, "sync_queue"));
        assert!(table_exists(&conn, "metadata"));
    }

    #[test]
    fn test_initialize_schema_sets_version() {
        let conn = create_test_db();
        initialize_schema(&conn).expect("failed to initialize schema");

        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_initialize_schema_idempotent() {
        let conn = create_test_db();

        initialize_schema(&conn).expect("first init failed");
        initialize_schema(&conn).expect("second init failed");

        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = create_test_db();
        initialize_schema(&conn).unwrap();
        set_schema_version(&conn, CURRENT_VERSION + 1).unwrap();

        let err = initialize_schema(&conn).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn test_get_schema_version_fresh_db() {
        let conn = create_test_db();
        conn.execute(
            "CREATE TABLE metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), 0);
    }

    #[test]
    fn test_invalid_schema_version() {
        let conn = create_test_db();
        initialize_schema(&conn).unwrap();
        conn.execute(
            "UPDATE metadata SET value = 'abc' WHERE key = ?1",
            [VERSION_KEY],
        )
        .unwrap();

        let err = get_schema_version(&conn).unwrap_err();
        assert!(err.to_string().contains("invalid schema version"));
    }

    #[test]
    fn test_run_migration_unknown_version() {
        let conn = create_test_db();
        initialize_schema(&conn).unwrap();

        let err = run_migration(&conn, 999).unwrap_err();
        assert!(err.to_string().contains("unknown migration version"));
    }

    #[test]
    fn test_indexes_created() {
        let conn = create_test_db();
        initialize_schema(&conn).unwrap();

        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(indexes.iter().any(|n| n == "idx_records_created_at"));
        assert!(indexes.iter().any(|n| n == "idx_records_status"));
        assert!(indexes.iter().any(|n| n == "idx_secondary_parent"));
        assert!(indexes.iter().any(|n| n == "idx_secondary_claimed"));
        assert!(indexes.iter().any(|n| n == "idx_sync_queue_timestamp"));
    }
}
