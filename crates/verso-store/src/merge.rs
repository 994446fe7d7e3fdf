//! Conflict-tolerant merge-upsert for dataset items.
//!
//! Each item is written by one atomic `insert_select` statement that reads the
//! latest prior version of the identifier (in any workspace) and appends a new
//! version whose columns are resolved field by field:
//!
//! | column | rule |
//! |--------|------|
//! | `dataset_id`, `workspace_id` | sticky: a differing non-empty prior value becomes a conflict |
//! | `created_at` | prior value unless unset, else the statement's server time |
//! | `created_by` | prior value if non-empty, else the writer |
//! | everything else | the incoming write |
//!
//! No row is ever updated in place.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::Instrument;
use verso_core::observability::store_span;
use verso_core::{DatasetId, RetryPolicy, WorkspaceScope};

use crate::codec::{self, DatasetItemRow, UNSET_TIMESTAMP};
use crate::engine::{ColumnarDatabase, Params, Predicate, Statement, TableName};
use crate::error::{Result, StoreError};
use crate::metrics;
use crate::record::{DatasetItemWrite, MAX_BATCH_SIZE};
use crate::view::materialize_current_view;

/// All versions of one identifier, regardless of workspace.
const SELECT_PRIOR_VERSIONS: Statement = Statement {
    name: "select_prior_versions",
    table: TableName::DatasetItems,
    predicates: &[Predicate::eq("id", "id")],
};

/// Resolves the columns of a new version from the prior latest version.
///
/// `now` is the statement's server time and becomes `last_updated_at`.
pub(crate) fn merge_row(prior: Option<&DatasetItemRow>, incoming: DatasetItemRow, now: i64) -> DatasetItemRow {
    let dataset_id = codec::merge_sticky(prior.map(|p| p.dataset_id.as_str()), &incoming.dataset_id);
    let workspace_id = codec::merge_sticky(
        prior.map(|p| p.audit.workspace_id.as_str()),
        &incoming.audit.workspace_id,
    );
    let created_at = match prior {
        Some(p) if p.audit.created_at != UNSET_TIMESTAMP => p.audit.created_at,
        _ => now,
    };
    let created_by = match prior {
        Some(p) if !p.audit.created_by.is_empty() => p.audit.created_by.clone(),
        _ => incoming.audit.created_by,
    };

    DatasetItemRow {
        dataset_id,
        audit: codec::Audit {
            created_at,
            last_updated_at: now,
            created_by,
            last_updated_by: incoming.audit.last_updated_by,
            workspace_id,
        },
        ..incoming
    }
}

/// Writes dataset items as new versions.
#[derive(Debug, Clone)]
pub struct MergeUpsertEngine {
    db: Arc<ColumnarDatabase>,
    retry: RetryPolicy,
}

impl MergeUpsertEngine {
    /// Creates an engine writing to `db`, retrying transient failures per `retry`.
    #[must_use]
    pub fn new(db: Arc<ColumnarDatabase>, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    /// Appends one new version per item to `dataset_id`, in the given order.
    ///
    /// An empty batch is a successful no-op. Every item is validated before any
    /// of them is written. Each item is merged and appended by its own atomic
    /// statement; transient connectivity failures retry that statement.
    ///
    /// Returns the number of rows appended.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for rejected input, or the last error
    /// once retries are exhausted or a non-transient failure occurs.
    pub async fn save(
        &self,
        scope: &WorkspaceScope,
        dataset_id: DatasetId,
        items: &[DatasetItemWrite],
    ) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        if items.len() > MAX_BATCH_SIZE {
            return Err(StoreError::validation(format!(
                "batch of {} items exceeds the maximum of {MAX_BATCH_SIZE}",
                items.len()
            )));
        }
        for item in items {
            item.validate()?;
        }

        let span = store_span("save_dataset_items", scope.workspace_id().as_str());
        async {
            let mut written = 0;
            for item in items {
                let incoming = DatasetItemRow::incoming(scope, dataset_id, item)?;
                written += self.upsert_with_retry(incoming).await?;
            }
            metrics::record_rows_written(TableName::DatasetItems, written);
            tracing::debug!(dataset_id = %dataset_id, written, "saved dataset items");
            Ok::<_, StoreError>(written)
        }
        .instrument(span)
        .await
    }

    async fn upsert_with_retry(&self, incoming: DatasetItemRow) -> Result<usize> {
        let attempts = AtomicU32::new(0);
        let result = self
            .retry
            .run("save_dataset_item", || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.upsert(incoming.clone())
            })
            .await;

        let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
        if retries > 0 {
            metrics::record_write_retries(TableName::DatasetItems, retries);
        }
        result
    }

    async fn upsert(&self, incoming: DatasetItemRow) -> Result<usize> {
        let conn = self.db.connect().await?;
        conn.insert_select(TableName::DatasetItems, |table, now| {
            let params = Params::new().bind("id", &incoming.id);
            let prior_rows = codec::decode_dataset_items(&table.select(&SELECT_PRIOR_VERSIONS, &params)?)?;
            let prior = materialize_current_view(prior_rows).into_iter().next();
            let row = merge_row(prior.as_ref(), incoming, now);
            codec::encode_dataset_items(std::slice::from_ref(&row))
        })
        .await
    }
}
