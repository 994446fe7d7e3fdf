//! Ingestion of experiment links, traces and feedback scores.
//!
//! These rows feed the joined tiers of [`JoinAggregator`](crate::JoinAggregator).
//! They are plain appends stamped with server time; a newer version of a row
//! supersedes older ones only through the read-side current view.

use std::sync::Arc;

use verso_core::{RetryPolicy, WorkspaceScope};

use crate::codec::{self, Audit, ExperimentItemRow, FeedbackScoreRow, TraceRow};
use crate::engine::{ColumnarDatabase, TableName};
use crate::error::{Result, StoreError};
use crate::metrics;
use crate::record::{ExperimentItemWrite, FeedbackScoreWrite, MAX_BATCH_SIZE, TraceWrite};

/// Appends experiment links and the trace data they point at.
#[derive(Debug, Clone)]
pub struct ExperimentLinkWriter {
    db: Arc<ColumnarDatabase>,
    retry: RetryPolicy,
}

impl ExperimentLinkWriter {
    /// Creates a writer appending to `db`.
    #[must_use]
    pub fn new(db: Arc<ColumnarDatabase>, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    /// Appends experiment items linking dataset items to traces.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an oversized batch, or the write error.
    pub async fn insert_experiment_items(
        &self,
        scope: &WorkspaceScope,
        items: &[ExperimentItemWrite],
    ) -> Result<usize> {
        check_batch(items.len())?;
        self.append(TableName::ExperimentItems, |now| {
            let rows: Vec<_> = items
                .iter()
                .map(|item| ExperimentItemRow {
                    id: item.id.to_string(),
                    experiment_id: item.experiment_id.to_string(),
                    dataset_item_id: item.dataset_item_id.to_string(),
                    trace_id: item.trace_id.to_string(),
                    audit: Audit::stamped(scope, now),
                })
                .collect();
            codec::encode_experiment_items(&rows)
        })
        .await
    }

    /// Appends trace documents.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an oversized batch, or the write error.
    pub async fn insert_traces(&self, scope: &WorkspaceScope, traces: &[TraceWrite]) -> Result<usize> {
        check_batch(traces.len())?;
        self.append(TableName::Traces, |now| {
            let rows = traces
                .iter()
                .map(|trace| {
                    Ok(TraceRow {
                        id: trace.id.to_string(),
                        input: codec::encode_document(trace.input.as_ref())?,
                        output: codec::encode_document(trace.output.as_ref())?,
                        audit: Audit::stamped(scope, now),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            codec::encode_traces(&rows)
        })
        .await
    }

    /// Appends feedback scores for traces or spans.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a blank name, a non-finite value or an
    /// oversized batch, or the write error.
    pub async fn insert_feedback_scores(
        &self,
        scope: &WorkspaceScope,
        scores: &[FeedbackScoreWrite],
    ) -> Result<usize> {
        check_batch(scores.len())?;
        for score in scores {
            score.validate()?;
        }
        self.append(TableName::FeedbackScores, |now| {
            let rows: Vec<_> = scores
                .iter()
                .map(|score| FeedbackScoreRow {
                    entity_id: score.entity_id.to_string(),
                    entity_type: score.entity_type.as_str().to_string(),
                    name: score.name.clone(),
                    category_name: score.category_name.clone().unwrap_or_default(),
                    value: score.value,
                    reason: score.reason.clone().unwrap_or_default(),
                    source: score.source.as_str().to_string(),
                    audit: Audit::stamped(scope, now),
                })
                .collect();
            codec::encode_feedback_scores(&rows)
        })
        .await
    }

    async fn append<F>(&self, table: TableName, build: F) -> Result<usize>
    where
        F: Fn(i64) -> Result<arrow::record_batch::RecordBatch>,
    {
        let written = self
            .retry
            .run(table.as_str(), || async {
                let conn = self.db.connect().await?;
                conn.insert(table, &build).await
            })
            .await?;
        metrics::record_rows_written(table, written);
        Ok(written)
    }
}

fn check_batch(len: usize) -> Result<()> {
    if len > MAX_BATCH_SIZE {
        return Err(StoreError::validation(format!(
            "batch of {len} rows exceeds the maximum of {MAX_BATCH_SIZE}"
        )));
    }
    Ok(())
}
