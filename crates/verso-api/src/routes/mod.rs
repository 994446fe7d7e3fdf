//! HTTP route handlers.

pub mod experiments;
pub mod items;

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

/// Path prefix of every dataset route.
pub const DATASETS_PREFIX: &str = "/v1/private/datasets";

/// `/v1/private/datasets` routes (authenticated).
pub fn datasets_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(items::routes())
        .merge(experiments::routes())
}
