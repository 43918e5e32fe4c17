//! Versioned schema migrations.
//!
//! Applied versions are recorded in `schema_version`. Each pending migration
//! runs in its own IMMEDIATE transaction and re-reads the recorded version
//! first, so two handles racing on the same file apply it once.

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::{QueryContext, StorageError};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "projects, sessions, decisions, overrides, ai_attempts, notes",
        sql: include_str!("../migrations/0001_ledger_schema.sql"),
    },
    Migration {
        version: 2,
        description: "session lineage and ordering indexes",
        sql: include_str!("../migrations/0002_lineage_indexes.sql"),
    },
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Highest recorded version, 0 for a fresh store.
pub fn current_version(conn: &Connection) -> Result<u32, StorageError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .during("read schema version")?;
    Ok(version)
}

/// Brings the store up to [`latest_version`]; returns how many migrations ran.
pub fn run_migrations(conn: &mut Connection) -> Result<u32, StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT
        );",
    )
    .map_err(|err| StorageError::Migration {
        version: 0,
        message: format!("failed to create schema_version table: {err}"),
    })?;

    let found = current_version(conn)?;
    if found > latest_version() {
        return Err(StorageError::UnsupportedSchemaVersion {
            found,
            supported: latest_version(),
        });
    }

    let mut applied = 0;
    for migration in MIGRATIONS {
        if migration.version <= found {
            debug!(
                version = migration.version,
                "migration already applied, skipping"
            );
            continue;
        }
        if apply_migration(conn, migration)? {
            applied += 1;
        }
    }

    if applied > 0 {
        info!(applied, version = latest_version(), "ledger schema migrated");
    }
    Ok(applied)
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<bool, StorageError> {
    let failed = |message: String| StorageError::Migration {
        version: migration.version,
        message,
    };

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| failed(format!("failed to begin transaction: {err}")))?;

    if current_version(&tx)? >= migration.version {
        return Ok(false);
    }

    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );
    tx.execute_batch(migration.sql)
        .map_err(|err| failed(format!("{} failed: {err}", migration.description)))?;
    tx.execute(
        "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
        params![
            migration.version,
            ledger_core::timestamp::format_timestamp(ledger_core::timestamp::now_utc()),
            migration.description,
        ],
    )
    .map_err(|err| failed(format!("failed to record version: {err}")))?;
    tx.commit()
        .map_err(|err| failed(format!("failed to commit: {err}")))?;
    Ok(true)
}
