//! PostgreSQL connection pool, migrations and maintenance.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};

use tributary_core::error::{StorageError, StorageResult};

const DEFAULT_URL: &str = "postgres://localhost/tributary";
const APPLICATION_NAME: &str = "tributary";

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Connection acquisition timeout.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// Server-side bound on a single statement. A block commit is one
    /// transaction of many statements, so this is per statement, not per block.
    pub statement_timeout: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            statement_timeout: None,
        }
    }
}

impl DatabaseConfig {
    /// Read `DATABASE_URL` and `DATABASE_MAX_CONNECTIONS`, keeping defaults
    /// for anything missing or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("DATABASE_URL").unwrap_or(defaults.url),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            ..defaults
        }
    }

    /// Pool preset for the import coordinator.
    ///
    /// Blocks are committed one at a time, so a handful of connections is
    /// enough; the rest serve cursor and capability lookups.
    pub fn for_indexer(url: &str) -> Self {
        Self {
            url: url.to_string(),
            max_connections: 4,
            min_connections: 1,
            statement_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        }
    }

    fn connect_options(&self) -> StorageResult<PgConnectOptions> {
        let options = PgConnectOptions::from_str(&self.url)
            .map_err(|e| StorageError::ConnectionError(format!("invalid database URL: {e}")))?
            .application_name(APPLICATION_NAME);

        Ok(match self.statement_timeout {
            Some(timeout) => {
                options.options([("statement_timeout", format!("{}ms", timeout.as_millis()))])
            }
            None => options,
        })
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database with the given configuration.
    #[instrument(skip_all)]
    pub async fn connect(config: &DatabaseConfig) -> StorageResult<Self> {
        debug!(
            max_conn = config.max_connections,
            statement_timeout = ?config.statement_timeout,
            "Creating connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations from `crates/storage/migrations`.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::MigrationError(e.to_string()))?;

        debug!("Schema up to date");
        Ok(())
    }

    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Remove every indexed row and reset the import queue and cursor.
    ///
    /// Counting and truncation happen in one transaction, so the returned
    /// figures are exactly what was removed. The schema and the migration
    /// history are kept; the next run starts again from its start block.
    #[instrument(skip(self))]
    pub async fn purge(&self) -> StorageResult<PurgeStats> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        let (blocks, transactions, deltas): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM blocks),
                (SELECT COUNT(*) FROM transactions),
                (SELECT COUNT(*) FROM balance_deltas)
            "#,
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        // Foreign keys carry the truncation from blocks, accounts and
        // contracts down to every derived table.
        sqlx::query(
            "TRUNCATE blocks, accounts, contracts, import_queue, indexer_cursor CASCADE",
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        let stats = PurgeStats {
            blocks_removed: blocks.max(0) as u64,
            transactions_removed: transactions.max(0) as u64,
            deltas_removed: deltas.max(0) as u64,
        };
        info!(
            blocks = stats.blocks_removed,
            transactions = stats.transactions_removed,
            "Store purged"
        );
        Ok(stats)
    }
}

/// Statistics from a database purge operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    /// Number of blocks removed, non-canonical ones included.
    pub blocks_removed: u64,
    pub transactions_removed: u64,
    pub deltas_removed: u64,
}
