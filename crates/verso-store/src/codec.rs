//! Arrow schemas and row codecs for the store's tables.
//!
//! Physical layout conventions:
//! - identifiers and JSON documents are `Utf8`;
//! - absent optional text is stored as the empty string;
//! - timestamps are `Int64` microseconds since the epoch, and `0` marks an
//!   unset `created_at`;
//! - a sticky column whose writers disagreed holds a reserved conflict marker,
//!   which never leaves this module: readers see [`Sticky::Conflict`].

use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{Array as _, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde_json::Value;
use verso_core::{DatasetId, WorkspaceScope};

use crate::engine::TableName;
use crate::error::{Result, StoreError};
use crate::record::{DatasetItem, DatasetItemWrite, Sticky};
use crate::view::Versioned;

/// Stored in a sticky column when writers disagree on its value.
const CONFLICT_MARKER: &str = "****************************************";

/// `created_at` value of a row that has never been stamped.
pub(crate) const UNSET_TIMESTAMP: i64 = 0;

/// Resolves a sticky column for a new version.
///
/// A non-empty prior value that differs from the incoming one becomes the
/// conflict marker; a prior conflict stays a conflict.
pub(crate) fn merge_sticky(existing: Option<&str>, incoming: &str) -> String {
    match existing {
        Some(prior) if !prior.is_empty() && prior != incoming => CONFLICT_MARKER.to_string(),
        Some(prior) if !prior.is_empty() => prior.to_string(),
        _ => incoming.to_string(),
    }
}

fn decode_sticky<T>(raw: &str, parse: impl FnOnce(&str) -> Result<T>) -> Result<Sticky<T>> {
    if raw == CONFLICT_MARKER {
        Ok(Sticky::Conflict)
    } else {
        parse(raw).map(Sticky::Value)
    }
}

// ============================================================================
// Schemas
// ============================================================================

fn utf8(name: &str) -> Field {
    Field::new(name, DataType::Utf8, false)
}

fn int64(name: &str) -> Field {
    Field::new(name, DataType::Int64, false)
}

fn audit_fields() -> [Field; 5] {
    [
        int64("created_at"),
        int64("last_updated_at"),
        utf8("created_by"),
        utf8("last_updated_by"),
        utf8("workspace_id"),
    ]
}

fn dataset_items_schema() -> SchemaRef {
    let mut fields = vec![
        utf8("id"),
        utf8("dataset_id"),
        utf8("source"),
        utf8("trace_id"),
        utf8("span_id"),
        utf8("input"),
        utf8("expected_output"),
        utf8("metadata"),
    ];
    fields.extend(audit_fields());
    Arc::new(Schema::new(fields))
}

fn experiment_items_schema() -> SchemaRef {
    let mut fields = vec![
        utf8("id"),
        utf8("experiment_id"),
        utf8("dataset_item_id"),
        utf8("trace_id"),
    ];
    fields.extend(audit_fields());
    Arc::new(Schema::new(fields))
}

fn traces_schema() -> SchemaRef {
    let mut fields = vec![utf8("id"), utf8("input"), utf8("output")];
    fields.extend(audit_fields());
    Arc::new(Schema::new(fields))
}

fn feedback_scores_schema() -> SchemaRef {
    let mut fields = vec![
        utf8("entity_id"),
        utf8("entity_type"),
        utf8("name"),
        utf8("category_name"),
        Field::new("value", DataType::Float64, false),
        utf8("reason"),
        utf8("source"),
    ];
    fields.extend(audit_fields());
    Arc::new(Schema::new(fields))
}

/// Returns the schema of a table.
#[must_use]
pub fn schema_for(table: TableName) -> SchemaRef {
    match table {
        TableName::DatasetItems => dataset_items_schema(),
        TableName::ExperimentItems => experiment_items_schema(),
        TableName::Traces => traces_schema(),
        TableName::FeedbackScores => feedback_scores_schema(),
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Bookkeeping columns shared by every table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Audit {
    pub(crate) created_at: i64,
    pub(crate) last_updated_at: i64,
    pub(crate) created_by: String,
    pub(crate) last_updated_by: String,
    pub(crate) workspace_id: String,
}

impl Audit {
    /// Audit columns for a plain append by `scope` at server time `now`.
    pub(crate) fn stamped(scope: &WorkspaceScope, now: i64) -> Self {
        Self {
            created_at: now,
            last_updated_at: now,
            created_by: scope.user_name().to_string(),
            last_updated_by: scope.user_name().to_string(),
            workspace_id: scope.workspace_id().to_string(),
        }
    }
}

/// One physical version of a dataset item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DatasetItemRow {
    pub(crate) id: String,
    pub(crate) dataset_id: String,
    pub(crate) source: String,
    pub(crate) trace_id: String,
    pub(crate) span_id: String,
    pub(crate) input: String,
    pub(crate) expected_output: String,
    pub(crate) metadata: String,
    pub(crate) audit: Audit,
}

/// One physical version of an experiment link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExperimentItemRow {
    pub(crate) id: String,
    pub(crate) experiment_id: String,
    pub(crate) dataset_item_id: String,
    pub(crate) trace_id: String,
    pub(crate) audit: Audit,
}

/// One physical version of a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TraceRow {
    pub(crate) id: String,
    pub(crate) input: String,
    pub(crate) output: String,
    pub(crate) audit: Audit,
}

/// One physical version of a feedback score.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FeedbackScoreRow {
    pub(crate) entity_id: String,
    pub(crate) entity_type: String,
    pub(crate) name: String,
    pub(crate) category_name: String,
    pub(crate) value: f64,
    pub(crate) reason: String,
    pub(crate) source: String,
    pub(crate) audit: Audit,
}

impl Versioned for DatasetItemRow {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn last_updated_at(&self) -> i64 {
        self.audit.last_updated_at
    }
}

impl Versioned for ExperimentItemRow {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn last_updated_at(&self) -> i64 {
        self.audit.last_updated_at
    }
}

impl Versioned for TraceRow {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn last_updated_at(&self) -> i64 {
        self.audit.last_updated_at
    }
}

impl Versioned for FeedbackScoreRow {
    type Key = (String, String);

    fn key(&self) -> (String, String) {
        (self.entity_id.clone(), self.name.clone())
    }

    fn last_updated_at(&self) -> i64 {
        self.audit.last_updated_at
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn text_array<R>(rows: &[R], f: impl Fn(&R) -> &str) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
}

fn int_array<R>(rows: &[R], f: impl Fn(&R) -> i64) -> ArrayRef {
    Arc::new(Int64Array::from(rows.iter().map(f).collect::<Vec<_>>()))
}

fn audit_arrays<R>(rows: &[R], audit: impl Fn(&R) -> &Audit) -> [ArrayRef; 5] {
    [
        int_array(rows, |r| audit(r).created_at),
        int_array(rows, |r| audit(r).last_updated_at),
        text_array(rows, |r| audit(r).created_by.as_str()),
        text_array(rows, |r| audit(r).last_updated_by.as_str()),
        text_array(rows, |r| audit(r).workspace_id.as_str()),
    ]
}

fn build_batch(table: TableName, mut columns: Vec<ArrayRef>, audit: [ArrayRef; 5]) -> Result<RecordBatch> {
    columns.extend(audit);
    RecordBatch::try_new(schema_for(table), columns).map_err(|e| StoreError::Arrow {
        message: format!("record batch build failed for '{}': {e}", table.as_str()),
    })
}

pub(crate) fn encode_dataset_items(rows: &[DatasetItemRow]) -> Result<RecordBatch> {
    build_batch(
        TableName::DatasetItems,
        vec![
            text_array(rows, |r| r.id.as_str()),
            text_array(rows, |r| r.dataset_id.as_str()),
            text_array(rows, |r| r.source.as_str()),
            text_array(rows, |r| r.trace_id.as_str()),
            text_array(rows, |r| r.span_id.as_str()),
            text_array(rows, |r| r.input.as_str()),
            text_array(rows, |r| r.expected_output.as_str()),
            text_array(rows, |r| r.metadata.as_str()),
        ],
        audit_arrays(rows, |r| &r.audit),
    )
}

pub(crate) fn encode_experiment_items(rows: &[ExperimentItemRow]) -> Result<RecordBatch> {
    build_batch(
        TableName::ExperimentItems,
        vec![
            text_array(rows, |r| r.id.as_str()),
            text_array(rows, |r| r.experiment_id.as_str()),
            text_array(rows, |r| r.dataset_item_id.as_str()),
            text_array(rows, |r| r.trace_id.as_str()),
        ],
        audit_arrays(rows, |r| &r.audit),
    )
}

pub(crate) fn encode_traces(rows: &[TraceRow]) -> Result<RecordBatch> {
    build_batch(
        TableName::Traces,
        vec![
            text_array(rows, |r| r.id.as_str()),
            text_array(rows, |r| r.input.as_str()),
            text_array(rows, |r| r.output.as_str()),
        ],
        audit_arrays(rows, |r| &r.audit),
    )
}

pub(crate) fn encode_feedback_scores(rows: &[FeedbackScoreRow]) -> Result<RecordBatch> {
    build_batch(
        TableName::FeedbackScores,
        vec![
            text_array(rows, |r| r.entity_id.as_str()),
            text_array(rows, |r| r.entity_type.as_str()),
            text_array(rows, |r| r.name.as_str()),
            text_array(rows, |r| r.category_name.as_str()),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.value).collect::<Vec<_>>())),
            text_array(rows, |r| r.reason.as_str()),
            text_array(rows, |r| r.source.as_str()),
        ],
        audit_arrays(rows, |r| &r.audit),
    )
}

// ============================================================================
// Decoding
// ============================================================================

pub(crate) fn col_string<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| StoreError::invariant(format!("missing column '{name}': {e}")))?;

    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| StoreError::invariant(format!("column '{name}' is not StringArray")))
}

fn col_i64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| StoreError::invariant(format!("missing column '{name}': {e}")))?;

    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| StoreError::invariant(format!("column '{name}' is not Int64Array")))
}

fn col_f64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| StoreError::invariant(format!("missing column '{name}': {e}")))?;

    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| StoreError::invariant(format!("column '{name}' is not Float64Array")))
}

struct AuditColumns<'a> {
    created_at: &'a Int64Array,
    last_updated_at: &'a Int64Array,
    created_by: &'a StringArray,
    last_updated_by: &'a StringArray,
    workspace_id: &'a StringArray,
}

impl<'a> AuditColumns<'a> {
    fn of(batch: &'a RecordBatch) -> Result<Self> {
        Ok(Self {
            created_at: col_i64(batch, "created_at")?,
            last_updated_at: col_i64(batch, "last_updated_at")?,
            created_by: col_string(batch, "created_by")?,
            last_updated_by: col_string(batch, "last_updated_by")?,
            workspace_id: col_string(batch, "workspace_id")?,
        })
    }

    fn row(&self, row: usize) -> Audit {
        Audit {
            created_at: self.created_at.value(row),
            last_updated_at: self.last_updated_at.value(row),
            created_by: self.created_by.value(row).to_string(),
            last_updated_by: self.last_updated_by.value(row).to_string(),
            workspace_id: self.workspace_id.value(row).to_string(),
        }
    }
}

pub(crate) fn decode_dataset_items(batches: &[RecordBatch]) -> Result<Vec<DatasetItemRow>> {
    let mut out = Vec::new();
    for batch in batches {
        let id = col_string(batch, "id")?;
        let dataset_id = col_string(batch, "dataset_id")?;
        let source = col_string(batch, "source")?;
        let trace_id = col_string(batch, "trace_id")?;
        let span_id = col_string(batch, "span_id")?;
        let input = col_string(batch, "input")?;
        let expected_output = col_string(batch, "expected_output")?;
        let metadata = col_string(batch, "metadata")?;
        let audit = AuditColumns::of(batch)?;

        for row in 0..batch.num_rows() {
            out.push(DatasetItemRow {
                id: id.value(row).to_string(),
                dataset_id: dataset_id.value(row).to_string(),
                source: source.value(row).to_string(),
                trace_id: trace_id.value(row).to_string(),
                span_id: span_id.value(row).to_string(),
                input: input.value(row).to_string(),
                expected_output: expected_output.value(row).to_string(),
                metadata: metadata.value(row).to_string(),
                audit: audit.row(row),
            });
        }
    }
    Ok(out)
}

pub(crate) fn decode_experiment_items(batches: &[RecordBatch]) -> Result<Vec<ExperimentItemRow>> {
    let mut out = Vec::new();
    for batch in batches {
        let id = col_string(batch, "id")?;
        let experiment_id = col_string(batch, "experiment_id")?;
        let dataset_item_id = col_string(batch, "dataset_item_id")?;
        let trace_id = col_string(batch, "trace_id")?;
        let audit = AuditColumns::of(batch)?;

        for row in 0..batch.num_rows() {
            out.push(ExperimentItemRow {
                id: id.value(row).to_string(),
                experiment_id: experiment_id.value(row).to_string(),
                dataset_item_id: dataset_item_id.value(row).to_string(),
                trace_id: trace_id.value(row).to_string(),
                audit: audit.row(row),
            });
        }
    }
    Ok(out)
}

pub(crate) fn decode_traces(batches: &[RecordBatch]) -> Result<Vec<TraceRow>> {
    let mut out = Vec::new();
    for batch in batches {
        let id = col_string(batch, "id")?;
        let input = col_string(batch, "input")?;
        let output = col_string(batch, "output")?;
        let audit = AuditColumns::of(batch)?;

        for row in 0..batch.num_rows() {
            out.push(TraceRow {
                id: id.value(row).to_string(),
                input: input.value(row).to_string(),
                output: output.value(row).to_string(),
                audit: audit.row(row),
            });
        }
    }
    Ok(out)
}

pub(crate) fn decode_feedback_scores(batches: &[RecordBatch]) -> Result<Vec<FeedbackScoreRow>> {
    let mut out = Vec::new();
    for batch in batches {
        let entity_id = col_string(batch, "entity_id")?;
        let entity_type = col_string(batch, "entity_type")?;
        let name = col_string(batch, "name")?;
        let category_name = col_string(batch, "category_name")?;
        let value = col_f64(batch, "value")?;
        let reason = col_string(batch, "reason")?;
        let source = col_string(batch, "source")?;
        let audit = AuditColumns::of(batch)?;

        for row in 0..batch.num_rows() {
            out.push(FeedbackScoreRow {
                entity_id: entity_id.value(row).to_string(),
                entity_type: entity_type.value(row).to_string(),
                name: name.value(row).to_string(),
                category_name: category_name.value(row).to_string(),
                value: value.value(row),
                reason: reason.value(row).to_string(),
                source: source.value(row).to_string(),
                audit: audit.row(row),
            });
        }
    }
    Ok(out)
}

// ============================================================================
// Field conversions
// ============================================================================

/// Serializes an optional document; absent documents are stored as "".
pub(crate) fn encode_document(value: Option<&Value>) -> Result<String> {
    match value {
        Some(value) => Ok(serde_json::to_string(value)?),
        None => Ok(String::new()),
    }
}

pub(crate) fn decode_document(raw: &str) -> Result<Option<Value>> {
    if raw.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::from_str(raw)?))
    }
}

pub(crate) fn optional_text(raw: &str) -> Option<String> {
    (!raw.is_empty()).then(|| raw.to_string())
}

pub(crate) fn parse_id<T>(raw: &str) -> Result<T>
where
    T: FromStr<Err = verso_core::Error>,
{
    Ok(raw.parse()?)
}

pub(crate) fn parse_optional_id<T>(raw: &str) -> Result<Option<T>>
where
    T: FromStr<Err = verso_core::Error>,
{
    if raw.is_empty() {
        Ok(None)
    } else {
        parse_id(raw).map(Some)
    }
}

pub(crate) fn timestamp(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::invariant(format!("timestamp {micros} is out of range")))
}

impl DatasetItemRow {
    /// The unstamped row a write would append before merging with prior versions.
    pub(crate) fn incoming(
        scope: &WorkspaceScope,
        dataset_id: DatasetId,
        item: &DatasetItemWrite,
    ) -> Result<Self> {
        Ok(Self {
            id: item.id.to_string(),
            dataset_id: dataset_id.to_string(),
            source: item.source.as_str().to_string(),
            trace_id: item.trace_id.map(|id| id.to_string()).unwrap_or_default(),
            span_id: item.span_id.map(|id| id.to_string()).unwrap_or_default(),
            input: encode_document(item.input.as_ref())?,
            expected_output: encode_document(item.expected_output.as_ref())?,
            metadata: encode_document(item.metadata.as_ref())?,
            audit: Audit {
                created_at: UNSET_TIMESTAMP,
                last_updated_at: UNSET_TIMESTAMP,
                created_by: scope.user_name().to_string(),
                last_updated_by: scope.user_name().to_string(),
                workspace_id: scope.workspace_id().to_string(),
            },
        })
    }

    /// Decodes the workspace column.
    pub(crate) fn workspace(&self) -> Result<Sticky<verso_core::WorkspaceId>> {
        decode_sticky(&self.audit.workspace_id, |raw| {
            Ok(verso_core::WorkspaceId::new_unchecked(raw))
        })
    }

    /// Converts the row into its domain form.
    pub(crate) fn into_item(self) -> Result<DatasetItem> {
        let workspace_id = self.workspace()?;
        Ok(DatasetItem {
            id: parse_id(&self.id)?,
            dataset_id: decode_sticky(&self.dataset_id, parse_id)?,
            source: self.source.parse()?,
            trace_id: parse_optional_id(&self.trace_id)?,
            span_id: parse_optional_id(&self.span_id)?,
            input: decode_document(&self.input)?,
            expected_output: decode_document(&self.expected_output)?,
            metadata: decode_document(&self.metadata)?,
            created_at: timestamp(self.audit.created_at)?,
            last_updated_at: timestamp(self.audit.last_updated_at)?,
            created_by: self.audit.created_by,
            last_updated_by: self.audit.last_updated_by,
            workspace_id,
            experiment_items: None,
        })
    }
}
