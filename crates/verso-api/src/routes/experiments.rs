//! Experiment result ingestion routes.
//!
//! These append the rows the joined dataset page reads: experiment items
//! linking a dataset item to a trace, the trace documents, and feedback scores.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use serde::Deserialize;

use verso_core::{DatasetItemId, ExperimentId, ExperimentItemId, IdGenerator, TraceId};
use verso_store::{ExperimentItemWrite, FeedbackScoreWrite, TraceWrite};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::server::AppState;

/// Creates experiment ingestion routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/experiments/items", post(create_experiment_items))
        .route("/traces", post(create_traces))
        .route("/feedback-scores", post(create_feedback_scores))
}

/// One experiment item; the identifier is generated when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentItemInput {
    /// Link identifier.
    #[serde(default)]
    pub id: Option<ExperimentItemId>,
    /// Experiment the link belongs to.
    pub experiment_id: ExperimentId,
    /// Linked dataset item.
    pub dataset_item_id: DatasetItemId,
    /// Trace produced by the experiment run.
    pub trace_id: TraceId,
}

impl ExperimentItemInput {
    fn into_write(self, ids: &dyn IdGenerator) -> ExperimentItemWrite {
        ExperimentItemWrite {
            id: self
                .id
                .unwrap_or_else(|| ExperimentItemId::from_uuid(ids.generate_id())),
            experiment_id: self.experiment_id,
            dataset_item_id: self.dataset_item_id,
            trace_id: self.trace_id,
        }
    }
}

/// Body of `POST /experiments/items`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentItemsBatch {
    /// Links to append.
    pub experiment_items: Vec<ExperimentItemInput>,
}

/// Body of `POST /traces`.
#[derive(Debug, Clone, Deserialize)]
pub struct TracesBatch {
    /// Trace documents to append.
    pub traces: Vec<TraceWrite>,
}

/// Body of `POST /feedback-scores`.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackScoresBatch {
    /// Scores to append.
    pub scores: Vec<FeedbackScoreWrite>,
}

pub(crate) async fn create_experiment_items(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Json(batch): Json<ExperimentItemsBatch>,
) -> Result<StatusCode, ApiError> {
    let writes: Vec<_> = batch
        .experiment_items
        .into_iter()
        .map(|item| item.into_write(state.ids.as_ref()))
        .collect();
    let written = state
        .links
        .insert_experiment_items(&ctx.scope(), &writes)
        .await
        .map_err(|e| ctx.error(e))?;
    tracing::info!(workspace = %ctx.workspace_id, written, "Saved experiment items");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn create_traces(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Json(batch): Json<TracesBatch>,
) -> Result<StatusCode, ApiError> {
    let written = state
        .links
        .insert_traces(&ctx.scope(), &batch.traces)
        .await
        .map_err(|e| ctx.error(e))?;
    tracing::info!(workspace = %ctx.workspace_id, written, "Saved traces");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn create_feedback_scores(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Json(batch): Json<FeedbackScoresBatch>,
) -> Result<StatusCode, ApiError> {
    let written = state
        .links
        .insert_feedback_scores(&ctx.scope(), &batch.scores)
        .await
        .map_err(|e| ctx.error(e))?;
    tracing::info!(workspace = %ctx.workspace_id, written, "Saved feedback scores");
    Ok(StatusCode::NO_CONTENT)
}
