//! Dataset item API routes.
//!
//! ## Routes
//!
//! - `PUT  /items` - Merge-upsert a batch of items
//! - `GET  /items/:item_id` - Get one item
//! - `POST /items/delete` - Delete every version of the given items
//! - `POST /items/stream` - Export items as delimited JSON frames
//! - `GET  /:dataset_id/items` - Page through a dataset
//! - `GET  /:dataset_id/items/experiments/items` - Page with experiment results joined in

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use verso_core::{
    DatasetId, DatasetItemId, ExperimentId, IdGenerator, SpanId, TraceId, WorkspaceScope,
};
use verso_store::{
    DatasetItem, DatasetItemPage, DatasetItemSource, DatasetItemWrite, EntityType,
    MAX_BATCH_SIZE, SearchCriteria, StoreError,
};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::server::AppState;
use crate::stream::ExportRequest;

/// Content type of the export body.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Default number of records per export call.
pub const DEFAULT_STREAM_LIMIT: u32 = 500;

/// Largest number of records one export call may request.
pub const MAX_STREAM_LIMIT: u32 = 2000;

const DEFAULT_PAGE: u32 = 1;
const DEFAULT_PAGE_SIZE: u32 = 10;

/// Creates dataset item routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/items", put(put_items))
        .route("/items/delete", post(delete_items))
        .route("/items/stream", post(stream_items))
        .route("/items/:item_id", get(get_item))
        .route("/:dataset_id/items", get(list_items))
        .route(
            "/:dataset_id/items/experiments/items",
            get(list_items_with_experiments),
        )
}

// ============================================================================
// Request types
// ============================================================================

/// One item of a write batch. Items without an `id` get one assigned before
/// the write is attempted.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetItemInput {
    /// Item identifier; generated when absent.
    #[serde(default)]
    pub id: Option<DatasetItemId>,
    /// Provenance of the item.
    pub source: DatasetItemSource,
    /// Referenced trace.
    #[serde(default)]
    pub trace_id: Option<TraceId>,
    /// Referenced span.
    #[serde(default)]
    pub span_id: Option<SpanId>,
    /// Input document.
    #[serde(default)]
    pub input: Option<Value>,
    /// Expected output document.
    #[serde(default)]
    pub expected_output: Option<Value>,
    /// Free-form metadata document.
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl DatasetItemInput {
    fn into_write(self, ids: &dyn IdGenerator) -> DatasetItemWrite {
        DatasetItemWrite {
            id: self
                .id
                .unwrap_or_else(|| DatasetItemId::from_uuid(ids.generate_id())),
            source: self.source,
            trace_id: self.trace_id,
            span_id: self.span_id,
            input: self.input,
            expected_output: self.expected_output,
            metadata: self.metadata,
        }
    }
}

/// Write batch for `PUT /items`. Exactly one target is used: `dataset_id`
/// when present, otherwise `dataset_name`.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetItemBatch {
    /// Name of the target dataset; created when missing.
    #[serde(default)]
    pub dataset_name: Option<String>,
    /// Identifier of an existing target dataset.
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
    /// Items to write, applied in order.
    pub items: Vec<DatasetItemInput>,
}

/// Body of `POST /items/delete`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteItemsRequest {
    /// Items whose versions are removed.
    pub item_ids: Vec<DatasetItemId>,
}

/// Body of `POST /items/stream`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamItemsRequest {
    /// Dataset to export.
    #[serde(alias = "datasetName")]
    pub dataset_name: String,
    /// Last identifier the client received; the export resumes below it.
    #[serde(default, alias = "lastRetrievedId")]
    pub last_retrieved_id: Option<DatasetItemId>,
    /// Maximum number of records (1..=2000, default 500).
    #[serde(default, alias = "steamLimit")]
    pub limit: Option<u32>,
}

/// Offset paging parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageParams {
    /// 1-based page number.
    #[serde(default = "default_page")]
    pub page: u32,
    /// Page size.
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page() -> u32 {
    DEFAULT_PAGE
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// Query of the joined page: paging plus a JSON array of experiment identifiers.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentItemsParams {
    /// 1-based page number.
    #[serde(default = "default_page")]
    pub page: u32,
    /// Page size.
    #[serde(default = "default_page_size")]
    pub size: u32,
    /// JSON array of experiment UUIDs, e.g. `["0190...", "0191..."]`.
    pub experiment_ids: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Merge-upserts a batch of dataset items.
pub(crate) async fn put_items(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Json(batch): Json<DatasetItemBatch>,
) -> Result<StatusCode, ApiError> {
    if batch.items.is_empty() {
        return Ok(StatusCode::NO_CONTENT);
    }
    if batch.items.len() > MAX_BATCH_SIZE {
        return Err(ctx.error(StoreError::validation(format!(
            "batch of {} items exceeds the maximum of {MAX_BATCH_SIZE}",
            batch.items.len()
        ))));
    }

    let scope = ctx.scope();
    let writes: Vec<DatasetItemWrite> = batch
        .items
        .into_iter()
        .map(|item| item.into_write(state.ids.as_ref()))
        .collect();
    for write in &writes {
        write.validate().map_err(|e| ctx.error(e))?;
    }

    let dataset_id = resolve_target(
        &state,
        &scope,
        batch.dataset_id,
        batch.dataset_name.as_deref(),
    )
    .await
    .map_err(|e| ctx.error(e))?;

    let written = state
        .writer
        .save(&scope, dataset_id, &writes)
        .await
        .map_err(|e| ctx.error(e))?;

    tracing::info!(
        workspace = %ctx.workspace_id,
        dataset_id = %dataset_id,
        written,
        "Saved dataset items"
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn resolve_target(
    state: &AppState,
    scope: &WorkspaceScope,
    dataset_id: Option<DatasetId>,
    dataset_name: Option<&str>,
) -> Result<DatasetId, ApiError> {
    match (dataset_id, dataset_name) {
        (Some(id), _) => {
            if state.datasets.exists(scope, id).await? {
                Ok(id)
            } else {
                Err(ApiError::not_found(format!("dataset '{id}'")))
            }
        }
        (None, Some(name)) => Ok(state.datasets.get_or_create(scope, name).await?),
        (None, None) => Err(ApiError::bad_request(
            "either dataset_id or dataset_name must be provided",
        )),
    }
}

/// Returns the current value of one item.
pub(crate) async fn get_item(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<Json<DatasetItem>, ApiError> {
    let id: DatasetItemId = item_id.parse().map_err(|e| ctx.error(e))?;
    state
        .store
        .get(&ctx.scope(), id)
        .await
        .map_err(|e| ctx.error(e))?
        .map(Json)
        .ok_or_else(|| ctx.error(ApiError::not_found(format!("dataset item '{id}'"))))
}

/// Deletes every version of the given items.
pub(crate) async fn delete_items(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteItemsRequest>,
) -> Result<StatusCode, ApiError> {
    if req.item_ids.len() > MAX_BATCH_SIZE {
        return Err(ctx.error(StoreError::validation(format!(
            "cannot delete more than {MAX_BATCH_SIZE} items at once"
        ))));
    }
    let removed = state
        .store
        .delete(&ctx.scope(), &req.item_ids)
        .await
        .map_err(|e| ctx.error(e))?;

    tracing::info!(
        workspace = %ctx.workspace_id,
        items = req.item_ids.len(),
        removed,
        "Deleted dataset items"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// Starts a cursor export. The response head is sent at once; frames follow
/// as the export produces them.
pub(crate) async fn stream_items(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamItemsRequest>,
) -> Result<Response, ApiError> {
    let limit = req.limit.unwrap_or(DEFAULT_STREAM_LIMIT);
    if !(1..=MAX_STREAM_LIMIT).contains(&limit) {
        return Err(ctx.error(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_STREAM_LIMIT}"
        ))));
    }
    if req.dataset_name.trim().is_empty() {
        return Err(ctx.error(ApiError::bad_request("dataset_name must not be blank")));
    }

    tracing::info!(
        workspace = %ctx.workspace_id,
        dataset = %req.dataset_name,
        limit,
        cursor = ?req.last_retrieved_id,
        "Streaming dataset items"
    );

    let frames = state.dispatcher.dispatch(
        ctx.scope(),
        ExportRequest {
            dataset_name: req.dataset_name,
            cursor: req.last_retrieved_id,
            limit: limit as usize,
        },
    );

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(ReceiverStream::new(frames)),
    )
        .into_response())
}

/// Returns one page of a dataset's items.
pub(crate) async fn list_items(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(dataset_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<DatasetItemPage>, ApiError> {
    let dataset_id: DatasetId = dataset_id.parse().map_err(|e| ctx.error(e))?;
    let page = state
        .store
        .get_page(&ctx.scope(), dataset_id, params.page, params.size)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(page))
}

/// Returns one page of a dataset's items with the given experiments' results
/// nested inside each item.
pub(crate) async fn list_items_with_experiments(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(dataset_id): Path<String>,
    Query(params): Query<ExperimentItemsParams>,
) -> Result<Json<DatasetItemPage>, ApiError> {
    let dataset_id: DatasetId = dataset_id.parse().map_err(|e| ctx.error(e))?;
    let raw = params.experiment_ids.as_deref().unwrap_or_default();
    let experiment_ids = parse_experiment_ids(raw).map_err(|e| ctx.error(e))?;

    let criteria = SearchCriteria {
        dataset_id,
        experiment_ids,
        entity_type: EntityType::Trace,
    };
    let page = state
        .joins
        .get_items(&ctx.scope(), &criteria, params.page, params.size)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(page))
}

/// Parses the `experiment_ids` query parameter, a JSON array of UUIDs.
pub(crate) fn parse_experiment_ids(raw: &str) -> Result<Vec<ExperimentId>, ApiError> {
    serde_json::from_str::<Vec<Uuid>>(raw)
        .map(|ids| ids.into_iter().map(ExperimentId::from_uuid).collect())
        .map_err(|_| ApiError::bad_request(format!("Invalid query param experiment ids '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experiment_ids_parse_from_json_array() {
        let ids = parse_experiment_ids(
            r#"["0190f5b4-7d3e-7c1a-9a51-3f1c2f6a9b10","0190f5b4-7d3e-7c1a-9a51-3f1c2f6a9b11"]"#,
        )
        .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(parse_experiment_ids("[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_experiment_ids_are_bad_requests() {
        for raw in ["", "not-json", "[\"nope\"]", "{\"a\":1}"] {
            let err = parse_experiment_ids(raw).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
            assert!(err.message().contains("Invalid query param experiment ids"));
        }
    }

    #[test]
    fn stream_request_accepts_camel_case_aliases() {
        let req: StreamItemsRequest = serde_json::from_value(serde_json::json!({
            "datasetName": "golden",
            "lastRetrievedId": "0190f5b4-7d3e-7c1a-9a51-3f1c2f6a9b10",
        }))
        .unwrap();
        assert_eq!(req.dataset_name, "golden");
        assert!(req.last_retrieved_id.is_some());
        assert_eq!(req.limit, None);
    }

    #[test]
    fn missing_item_ids_are_generated() {
        let input: DatasetItemInput = serde_json::from_value(serde_json::json!({
            "source": "manual",
            "input": {"q": 1},
        }))
        .unwrap();
        let write = input.into_write(&verso_core::TimeOrderedIdGenerator);
        assert_eq!(write.id.as_uuid().get_version_num(), 7);
        assert!(write.validate().is_ok());
    }
}
