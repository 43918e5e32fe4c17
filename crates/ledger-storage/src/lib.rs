use chrono::{DateTime, Utc};
use ledger_core::timestamp::parse_timestamp;
use ledger_core::{project_slug, ParseEnumError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

mod attempts;
mod decisions;
pub mod manager;
mod notes;
mod overrides;
mod projects;
pub mod schema;
mod sessions;

pub use manager::LedgerManager;

pub const STORE_FILE_NAME: &str = "ledger.db";
pub const DEFAULT_DIR_NAME: &str = ".ledger";

pub type ConnectionPool = Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to {operation}: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open ledger store for {project_path}: {source}")]
    Open {
        project_path: String,
        #[source]
        source: Box<StorageError>,
    },
    #[error("ledger store is closed")]
    Closed,
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Tags a SQLite failure with the store operation it interrupted.
pub(crate) trait QueryContext<T> {
    fn during(self, operation: &'static str) -> Result<T, StorageError>;
}

impl<T> QueryContext<T> for rusqlite::Result<T> {
    fn during(self, operation: &'static str) -> Result<T, StorageError> {
        self.map_err(|source| StorageError::Query { operation, source })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub pool_size: u32,
    pub busy_timeout_ms: u32,
    pub connection_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 5_000,
            connection_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    pub project_path: PathBuf,
    /// Falls back to [`default_base_dir`] when unset.
    pub base_dir: Option<PathBuf>,
    pub pool: PoolConfig,
}

impl StoreConfig {
    pub fn new(project_path: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            base_dir: Some(base_dir.into()),
            pool: PoolConfig::default(),
        }
    }
}

/// `<home>/.ledger`
pub fn default_base_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_DIR_NAME))
        .ok_or_else(|| StorageError::Io {
            context: "failed to resolve home directory".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no home directory"),
        })
}

/// On-disk location of the store for `project_path`: `<base>/<slug>/ledger.db`.
pub fn store_path(base_dir: &Path, project_path: impl AsRef<Path>) -> PathBuf {
    base_dir
        .join(project_slug(project_path))
        .join(STORE_FILE_NAME)
}

#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};\
             PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
    }
}

fn build_pool(db_path: &Path, config: &PoolConfig) -> Result<ConnectionPool, StorageError> {
    let manager = SqliteConnectionManager::file(db_path);
    let pool = Pool::builder()
        .max_size(config.pool_size.max(1))
        .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(manager)?;
    Ok(pool)
}

/// One open ledger store bound to a single project.
///
/// Plain reads and writes go through the pool and rely on SQLite (WAL) for
/// isolation. [`LedgerStore::transaction`] calls are serialized against each
/// other by `tx_lock`.
pub struct LedgerStore {
    pool: ConnectionPool,
    project_id: String,
    project_slug: String,
    db_path: PathBuf,
    tx_lock: Mutex<()>,
    closed: AtomicBool,
}

impl LedgerStore {
    pub fn open(config: &StoreConfig) -> Result<Self, StorageError> {
        let base_dir = match &config.base_dir {
            Some(base_dir) => base_dir.clone(),
            None => default_base_dir()?,
        };
        let slug = project_slug(&config.project_path);
        let project_dir = base_dir.join(&slug);
        std::fs::create_dir_all(&project_dir).map_err(|source| StorageError::Io {
            context: format!("failed to create project directory {}", project_dir.display()),
            source,
        })?;

        let db_path = project_dir.join(STORE_FILE_NAME);
        let pool = build_pool(&db_path, &config.pool)?;

        let mut conn = pool.get()?;
        schema::run_migrations(&mut conn)?;
        let project_path = config.project_path.to_string_lossy();
        let project = projects::ensure_project_on(&conn, &slug, &project_path)?;
        drop(conn);

        debug!(
            project_id = %project.id,
            slug = %slug,
            db_path = %db_path.display(),
            "ledger store opened"
        );

        Ok(Self {
            pool,
            project_id: project.id,
            project_slug: slug,
            db_path,
            tx_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn project_slug(&self) -> &str {
        &self.project_slug
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn schema_version(&self) -> Result<u32, StorageError> {
        let conn = self.conn()?;
        schema::current_version(&conn)
    }

    /// Runs `f` inside one IMMEDIATE transaction. The transaction commits
    /// when `f` returns `Ok` and rolls back otherwise.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StorageError>,
    {
        let _guard = self
            .tx_lock
            .lock()
            .map_err(|_| StorageError::Internal("transaction lock poisoned".to_string()))?;
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .during("begin transaction")?;
        let value = f(&tx)?;
        tx.commit().during("commit transaction")?;
        Ok(value)
    }

    /// Refuses further work, then checkpoints the WAL. The handle stays
    /// closed even when the checkpoint fails. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(project_id = %self.project_id, "ledger store closed");
        let conn = self.pool.get()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .during("checkpoint wal")?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(self.pool.get()?)
    }

    pub(crate) fn scope_project<'a>(&'a self, project_id: Option<&'a str>) -> &'a str {
        project_id.unwrap_or(&self.project_id)
    }
}

// Newest first; rowid breaks ties between rows created in the same microsecond.
pub(crate) const NEWEST_FIRST: &str = "ORDER BY created_at DESC, rowid DESC";

/// `"id, name"` with alias `d` becomes `"d.id, d.name"`.
pub(crate) fn qualified_columns(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

pub(crate) fn enum_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

/// Case-insensitive substring match of any token against `text`.
///
/// Folding happens here with full Unicode lowercasing; SQLite `LOWER` and
/// `LIKE` only fold ASCII. Tokens are expected lowercase already.
pub(crate) fn mentions_any<S: AsRef<str>>(text: &str, tokens: &[S]) -> bool {
    let folded = text.to_lowercase();
    tokens
        .iter()
        .any(|token| folded.contains(token.as_ref()))
}

/// `%term%` with LIKE wildcards escaped; pair with `ESCAPE '\'`.
pub(crate) fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

pub(crate) fn rows_affected_or_not_found(
    changes: usize,
    entity: &'static str,
    id: &str,
) -> Result<(), StorageError> {
    if changes == 0 {
        return Err(StorageError::not_found(entity, id));
    }
    Ok(())
}
