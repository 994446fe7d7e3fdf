//! API server implementation.
//!
//! Provides health, ready, metrics, and dataset item endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use verso_core::{Error, IdGenerator, Result, TimeOrderedIdGenerator};
use verso_store::{
    ColumnarDatabase, ExperimentLinkWriter, JoinAggregator, MergeUpsertEngine,
    VersionedRecordStore,
};

use crate::config::Config;
use crate::datasets::{DatasetResolver, MemoryDatasetCatalog};
use crate::routes::DATASETS_PREFIX;
use crate::stream::StreamingDispatcher;

// ============================================================================
// Health and Ready Responses
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all request handlers.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    pub(crate) db: Arc<ColumnarDatabase>,
    pub(crate) datasets: Arc<dyn DatasetResolver>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) store: VersionedRecordStore,
    pub(crate) writer: MergeUpsertEngine,
    pub(crate) joins: JoinAggregator,
    pub(crate) links: ExperimentLinkWriter,
    pub(crate) dispatcher: StreamingDispatcher,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("pool_size", &self.db.pool().size())
            .field("datasets", &"<DatasetResolver>")
            .field("ids", &"<IdGenerator>")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wires the store components over one database.
    #[must_use]
    pub fn new(
        config: Config,
        db: Arc<ColumnarDatabase>,
        datasets: Arc<dyn DatasetResolver>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let retry = config.retry.policy();
        let store = VersionedRecordStore::new(Arc::clone(&db));
        let dispatcher =
            StreamingDispatcher::new(store.clone(), Arc::clone(&datasets), config.stream);
        Self {
            writer: MergeUpsertEngine::new(Arc::clone(&db), retry),
            joins: JoinAggregator::new(Arc::clone(&db)),
            links: ExperimentLinkWriter::new(Arc::clone(&db), retry),
            store,
            dispatcher,
            config,
            db,
            datasets,
            ids,
        }
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// Returns 200 OK if the service is alive. This is a shallow check
/// that doesn't verify dependencies.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Returns 200 OK once a pooled connection can be leased.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.pool().lease().await {
        Ok(_lease) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("database check failed: {e}")),
            }),
        ),
    }
}

// ============================================================================
// Server
// ============================================================================

/// The Verso API server.
pub struct Server {
    config: Config,
    db: Arc<ColumnarDatabase>,
    datasets: Arc<dyn DatasetResolver>,
    ids: Arc<dyn IdGenerator>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a new server over a fresh in-memory database.
    #[must_use]
    pub fn new(config: Config) -> Self {
        ServerBuilder::new().config(config).build()
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the router with all routes and middleware.
    fn create_router(&self) -> Router {
        let state = Arc::new(AppState::new(
            self.config.clone(),
            Arc::clone(&self.db),
            Arc::clone(&self.datasets),
            Arc::clone(&self.ids),
        ));

        Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .nest(DATASETS_PREFIX, crate::routes::datasets_routes())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(middleware::from_fn(crate::metrics::metrics_middleware)),
            )
            .with_state(state)
    }

    /// Starts the server and blocks until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the server cannot
    /// bind to the port.
    pub async fn serve(&self) -> Result<()> {
        self.config.validate()?;

        crate::metrics::init_metrics();
        verso_store::metrics::register_metrics();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.create_router();

        tracing::info!(
            http_port = self.config.http_port,
            debug = self.config.debug,
            pool_size = self.config.pool.size,
            stream_workers = self.config.stream.worker_pool_size,
            "Starting Verso API server"
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal {
                message: format!("failed to bind to {addr}: {e}"),
            })?;

        axum::serve(listener, router)
            .await
            .map_err(|e| Error::Internal {
                message: format!("server error: {e}"),
            })?;

        Ok(())
    }

    /// Creates a router without binding a port.
    ///
    /// Intended for integration tests.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }
}

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    db: Option<Arc<ColumnarDatabase>>,
    datasets: Arc<dyn DatasetResolver>,
    ids: Arc<dyn IdGenerator>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("db", &self.db.is_some())
            .field("datasets", &"<DatasetResolver>")
            .field("ids", &"<IdGenerator>")
            .finish()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            db: None,
            datasets: Arc::new(MemoryDatasetCatalog::new()),
            ids: Arc::new(TimeOrderedIdGenerator),
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode.
    ///
    /// See `Config::debug` for behavior changes (header-based identity vs Authorization).
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the JWT HS256 secret used for bearer token verification.
    ///
    /// Required when `debug` is false.
    #[must_use]
    pub fn jwt_hs256_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt.hs256_secret = Some(secret.into());
        self
    }

    /// Sets the per-pull deadline of export streams.
    #[must_use]
    pub fn stream_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.stream.timeout_ms = timeout_ms;
        self
    }

    /// Uses an existing database instead of a fresh one built from the pool settings.
    #[must_use]
    pub fn database(mut self, db: Arc<ColumnarDatabase>) -> Self {
        self.db = Some(db);
        self
    }

    /// Sets the dataset resolver.
    #[must_use]
    pub fn datasets(mut self, datasets: Arc<dyn DatasetResolver>) -> Self {
        self.datasets = datasets;
        self
    }

    /// Sets the identifier generator for incoming records without an id.
    #[must_use]
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        let db = self
            .db
            .unwrap_or_else(|| ColumnarDatabase::new(self.config.pool.database_config()));
        Server {
            config: self.config,
            db,
            datasets: self.datasets,
            ids: self.ids,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
