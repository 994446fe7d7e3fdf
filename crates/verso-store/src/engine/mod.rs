//! The columnar engine backing the dataset store.
//!
//! Tables are append-only lists of Arrow record batches. Every statement runs
//! on a leased [`Connection`]; write statements stamp their rows with the
//! shared [`ServerClock`]. `insert_select` computes the rows it appends from the
//! table's current contents while holding the table's write lock, which makes
//! a single-row merge-upsert atomic without any application-level locking.

mod clock;
mod pool;
mod statement;
mod table;

pub use clock::ServerClock;
pub use pool::{ConnectionPool, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_POOL_SIZE};
pub use statement::{Op, Params, Predicate, Statement, TableName, Value};
pub use table::ColumnTable;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use arrow::array::Array as _;
use arrow::record_batch::RecordBatch;
use tokio::sync::{OwnedSemaphorePermit, RwLock};

use crate::codec;
use crate::error::{Result, StoreError};

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Number of pooled connections.
    pub pool_size: usize,
    /// Maximum wait for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// Fault injection hooks used by tests to exercise failure paths.
#[derive(Debug, Default)]
struct Failpoints {
    connect_failures: AtomicU32,
    query_failures: AtomicU32,
    query_delay_micros: AtomicU64,
}

impl Failpoints {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// The in-process columnar database.
#[derive(Debug)]
pub struct ColumnarDatabase {
    dataset_items: RwLock<ColumnTable>,
    experiment_items: RwLock<ColumnTable>,
    traces: RwLock<ColumnTable>,
    feedback_scores: RwLock<ColumnTable>,
    clock: ServerClock,
    pool: ConnectionPool,
    failpoints: Failpoints,
}

impl ColumnarDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new(config: DatabaseConfig) -> Arc<Self> {
        let table = |name| RwLock::new(ColumnTable::new(name, codec::schema_for(name)));
        Arc::new(Self {
            dataset_items: table(TableName::DatasetItems),
            experiment_items: table(TableName::ExperimentItems),
            traces: table(TableName::Traces),
            feedback_scores: table(TableName::FeedbackScores),
            clock: ServerClock::new(),
            pool: ConnectionPool::new(config.pool_size, config.acquire_timeout),
            failpoints: Failpoints::default(),
        })
    }

    /// Creates an empty database with default settings.
    #[must_use]
    pub fn in_memory() -> Arc<Self> {
        Self::new(DatabaseConfig::default())
    }

    /// Leases a connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connectivity`] if the pool is exhausted past its
    /// acquire timeout or a connection failure was injected.
    pub async fn connect(self: &Arc<Self>) -> Result<Connection> {
        if Failpoints::take(&self.failpoints.connect_failures) {
            return Err(StoreError::Connectivity {
                message: "connection refused".to_string(),
            });
        }
        let permit = self.pool.lease().await?;
        Ok(Connection {
            db: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Returns the connection pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Returns the number of physical rows in a table.
    pub async fn row_count(&self, table: TableName) -> usize {
        self.table(table).read().await.num_rows()
    }

    /// Makes the next `n` connection attempts fail with a connectivity error.
    pub fn inject_connectivity_failures(&self, n: u32) {
        self.failpoints.connect_failures.store(n, Ordering::Release);
    }

    /// Makes the next `n` queries fail with a non-transient query error.
    pub fn inject_query_failures(&self, n: u32) {
        self.failpoints.query_failures.store(n, Ordering::Release);
    }

    /// Delays every subsequent read statement by `delay`.
    pub fn set_query_delay(&self, delay: Duration) {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.failpoints
            .query_delay_micros
            .store(micros, Ordering::Release);
    }

    fn table(&self, name: TableName) -> &RwLock<ColumnTable> {
        match name {
            TableName::DatasetItems => &self.dataset_items,
            TableName::ExperimentItems => &self.experiment_items,
            TableName::Traces => &self.traces,
            TableName::FeedbackScores => &self.feedback_scores,
        }
    }

    async fn before_query(&self, statement: &Statement) -> Result<()> {
        let delay = self.failpoints.query_delay_micros.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(Duration::from_micros(delay)).await;
        }
        if Failpoints::take(&self.failpoints.query_failures) {
            return Err(StoreError::Query {
                message: format!("statement '{}' failed", statement.name),
            });
        }
        Ok(())
    }
}

/// Read access to a table inside an `insert_select` statement.
#[derive(Debug)]
pub struct TableView<'a> {
    table: &'a ColumnTable,
}

impl TableView<'_> {
    /// Runs a read statement against the locked table.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement targets another table or fails to evaluate.
    pub fn select(&self, statement: &Statement, params: &Params) -> Result<Vec<RecordBatch>> {
        if statement.table != self.table.name() {
            return Err(StoreError::invariant(format!(
                "statement '{}' targets '{}' inside a statement on '{}'",
                statement.name,
                statement.table.as_str(),
                self.table.name().as_str()
            )));
        }
        self.table.select(statement.predicates, params)
    }
}

/// A leased connection. Dropping it returns the lease to the pool.
#[derive(Debug)]
pub struct Connection {
    db: Arc<ColumnarDatabase>,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    /// Executes a read statement.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter is unbound or the statement fails.
    pub async fn query(&self, statement: &Statement, params: &Params) -> Result<Vec<RecordBatch>> {
        self.db.before_query(statement).await?;
        let table = self.db.table(statement.table).read().await;
        table.select(statement.predicates, params)
    }

    /// Counts distinct values of `column` among the rows a statement matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails or `column` is not a text column.
    pub async fn count_distinct(
        &self,
        statement: &Statement,
        params: &Params,
        column: &str,
    ) -> Result<u64> {
        let batches = self.query(statement, params).await?;
        let mut seen = HashSet::new();
        for batch in &batches {
            let values = codec::col_string(batch, column)?;
            for row in 0..values.len() {
                seen.insert(values.value(row).to_string());
            }
        }
        Ok(seen.len() as u64)
    }

    /// Executes one atomic insert-select statement on `table`.
    ///
    /// `build` receives a read view of the table and the statement's server
    /// timestamp, and returns the batch to append. The table's write lock is
    /// held for the whole statement.
    ///
    /// # Errors
    ///
    /// Returns any error produced by `build` or by the append.
    pub async fn insert_select<F>(&self, table: TableName, build: F) -> Result<usize>
    where
        F: FnOnce(&TableView<'_>, i64) -> Result<RecordBatch>,
    {
        let mut guard = self.db.table(table).write().await;
        let now = self.db.clock.tick();
        let batch = build(&TableView { table: &guard }, now)?;
        guard.append(batch)
    }

    /// Appends rows built from the statement's server timestamp.
    ///
    /// # Errors
    ///
    /// Returns any error produced by `build` or by the append.
    pub async fn insert<F>(&self, table: TableName, build: F) -> Result<usize>
    where
        F: FnOnce(i64) -> Result<RecordBatch>,
    {
        self.insert_select(table, |_, now| build(now)).await
    }

    /// Removes every row the statement matches.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter is unbound or the statement fails.
    pub async fn delete(&self, statement: &Statement, params: &Params) -> Result<usize> {
        let mut table = self.db.table(statement.table).write().await;
        table.delete(statement.predicates, params)
    }
}
