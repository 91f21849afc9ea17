//! The completion cache: a durable, single-writer key-value store keyed by
//! spool path.
//!
//! The store is backed by `sqlx`'s SQLite driver, matching the reference
//! codebase's own database layer. Because the control loop in this crate is
//! specified as synchronous and cooperative (see the design doc's
//! concurrency section), the cache owns a small dedicated single-threaded
//! `tokio` runtime and drives every query to completion with `block_on`
//! before returning - callers never see an async API, and there is never
//! more than one cache operation in flight.

use std::path::Path;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use thiserror::Error;
use tokio::runtime::Builder;
use tokio::runtime::Runtime;

/// Errors raised by the completion cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A database error.
    #[error("cache database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A migration error.
    #[error("cache migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An I/O error, e.g. failing to create the cache file's parent
    /// directory.
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// The tri-state completeness value from the design doc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteState {
    /// All outputs for the unit are valid.
    Complete,
    /// Incomplete or partial.
    Incomplete,
    /// Retry cap exceeded; terminal.
    Abandoned,
}

impl CompleteState {
    /// The on-disk integer representation.
    fn as_i64(self) -> i64 {
        match self {
            CompleteState::Abandoned => -1,
            CompleteState::Incomplete => 0,
            CompleteState::Complete => 1,
        }
    }

    /// Parses the on-disk integer representation.
    fn from_i64(value: i64) -> Option<Self> {
        match value {
            -1 => Some(CompleteState::Abandoned),
            0 => Some(CompleteState::Incomplete),
            1 => Some(CompleteState::Complete),
            _ => None,
        }
    }
}

/// One cache record, as described in the data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord {
    /// The absolute path to the unit (also the cache key).
    pub spoolname: String,
    /// The tri-state completeness, or `None` if not yet inspected.
    pub complete: Option<CompleteState>,
    /// The timestamp of the last decision pass, or `None` if never stamped.
    pub time: Option<DateTime<Utc>>,
    /// The number of submissions performed for this unit.
    pub count: i64,
    /// Comma-joined base names of currently-incomplete inputs.
    pub files: String,
}

/// The completion cache contract.
pub trait Cache: Send + Sync + std::fmt::Debug {
    /// Opens or creates the cache. Idempotent.
    fn prep(&self) -> Result<()>;

    /// Fetches the full record for `key`, if one exists.
    fn fetch(&self, key: &str) -> Result<Option<UnitRecord>>;

    /// Fetches every key whose `complete` field equals `state`.
    fn fetch_complete(&self, state: CompleteState) -> Result<Vec<String>>;

    /// Upserts the `time` field for `key`.
    fn set_time(&self, key: &str, time: DateTime<Utc>) -> Result<()>;

    /// Upserts the `complete` field for `key`.
    fn set_complete(&self, key: &str, state: CompleteState) -> Result<()>;

    /// Upserts the `files` field for `key`.
    fn set_files(&self, key: &str, files: &str) -> Result<()>;

    /// Atomically increments `count` for `key` (initializing to 1 if
    /// absent) and returns the new value.
    fn increment_count(&self, key: &str) -> Result<i64>;
}

/// The SQLite-backed implementation of [`Cache`].
pub struct SqliteCache {
    /// A dedicated single-threaded runtime used to drive `sqlx` queries.
    runtime: Runtime,
    /// The underlying connection pool.
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCache").finish_non_exhaustive()
    }
}

impl SqliteCache {
    /// Opens (creating if necessary) a SQLite-backed cache at `path`,
    /// running embedded migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build cache runtime");

        let database_url = format!("sqlite://{}", path.display());
        let pool = runtime.block_on(async {
            let options = SqliteConnectOptions::from_str(&database_url)?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            let pool = SqlitePool::connect_with(options).await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            Ok::<_, CacheError>(pool)
        })?;

        Ok(Self { runtime, pool })
    }
}

impl Cache for SqliteCache {
    fn prep(&self) -> Result<()> {
        self.runtime.block_on(async {
            sqlx::query("select 1").execute(&self.pool).await?;
            Ok(())
        })
    }

    fn fetch(&self, key: &str) -> Result<Option<UnitRecord>> {
        self.runtime.block_on(async {
            let row = sqlx::query(
                "select spoolname, complete, time, count, files from units where spoolname = ?",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(|row| UnitRecord {
                spoolname: row.get("spoolname"),
                complete: row
                    .get::<Option<i64>, _>("complete")
                    .and_then(CompleteState::from_i64),
                time: row
                    .get::<Option<i64>, _>("time")
                    .and_then(|secs| DateTime::from_timestamp(secs, 0)),
                count: row.get("count"),
                files: row.get("files"),
            }))
        })
    }

    fn fetch_complete(&self, state: CompleteState) -> Result<Vec<String>> {
        self.runtime.block_on(async {
            let rows = sqlx::query("select spoolname from units where complete = ?")
                .bind(state.as_i64())
                .fetch_all(&self.pool)
                .await?;

            Ok(rows.into_iter().map(|row| row.get("spoolname")).collect())
        })
    }

    fn set_time(&self, key: &str, time: DateTime<Utc>) -> Result<()> {
        self.runtime.block_on(async {
            sqlx::query(
                "insert into units (spoolname, time) values (?, ?) \
                 on conflict(spoolname) do update set time = excluded.time",
            )
            .bind(key)
            .bind(time.timestamp())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn set_complete(&self, key: &str, state: CompleteState) -> Result<()> {
        self.runtime.block_on(async {
            sqlx::query(
                "insert into units (spoolname, complete) values (?, ?) \
                 on conflict(spoolname) do update set complete = excluded.complete",
            )
            .bind(key)
            .bind(state.as_i64())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn set_files(&self, key: &str, files: &str) -> Result<()> {
        self.runtime.block_on(async {
            sqlx::query(
                "insert into units (spoolname, files) values (?, ?) \
                 on conflict(spoolname) do update set files = excluded.files",
            )
            .bind(key)
            .bind(files)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn increment_count(&self, key: &str) -> Result<i64> {
        self.runtime.block_on(async {
            let row = sqlx::query(
                "insert into units (spoolname, count) values (?, 1) \
                 on conflict(spoolname) do update set count = count + 1 \
                 returning count",
            )
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
            Ok(row.get("count"))
        })
    }
}
