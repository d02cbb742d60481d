//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1.
static MIGRATIONS: &[(u32, &str, &str)] = &[(
    1,
    "initial schema",
    r#"
    CREATE TABLE IF NOT EXISTS conflicts (
        id              TEXT PRIMARY KEY,
        file_a          TEXT NOT NULL,
        file_b          TEXT NOT NULL,
        timestamp_a     TEXT NOT NULL,
        timestamp_b     TEXT NOT NULL,
        ir_version      INTEGER NOT NULL DEFAULT 0,
        detected_at     TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'unresolved'
                        CHECK (status IN ('unresolved', 'awaiting_merge', 'resolved')),
        resolution      TEXT,
        resolved_at     TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts (status);
    CREATE INDEX IF NOT EXISTS idx_conflicts_files ON conflicts (file_a, file_b);

    CREATE TABLE IF NOT EXISTS backups (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        original_file   TEXT NOT NULL,
        backup_file     TEXT NOT NULL,
        size            INTEGER NOT NULL DEFAULT 0,
        created_at      TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_backups_original ON backups (original_file);

    CREATE TABLE IF NOT EXISTS sync_log (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        path            TEXT NOT NULL,
        side            TEXT NOT NULL,
        action          TEXT NOT NULL,
        outcome         TEXT NOT NULL CHECK (outcome IN ('success', 'failure')),
        error           TEXT,
        duration_ms     INTEGER,
        created_at      TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sync_log_created_at ON sync_log (created_at);
    CREATE INDEX IF NOT EXISTS idx_sync_log_outcome ON sync_log (outcome);

    CREATE TABLE IF NOT EXISTS session_state (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );
    "#,
)];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        assert!(tables.contains(&"conflicts".to_string()));
        assert!(tables.contains(&"backups".to_string()));
        assert!(tables.contains(&"sync_log".to_string()));
        assert!(tables.contains(&"session_state".to_string()));
    }

    #[test]
    fn test_status_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO conflicts (id, file_a, file_b, timestamp_a, timestamp_b, detected_at, status)
             VALUES ('x', 'a', 'b', 't', 't', 't', 'bogus')",
            [],
        );
        assert!(result.is_err());
    }
}
