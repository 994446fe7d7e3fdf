//! # verso-api
//!
//! HTTP surface for the Verso dataset item store.
//!
//! This crate wires the `verso-store` components behind an axum router:
//!
//! - **Identity**: Workspace and user resolved per request (headers in debug
//!   mode, a verified JWT otherwise)
//! - **Routing**: Dataset item reads, writes, deletes and experiment ingestion
//! - **Streaming**: Cursor exports pushed as delimited JSON frames from a
//!   bounded worker pool
//! - **Observability**: Request tracing, Prometheus metrics, health checks
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health                                              - Health check
//! GET  /ready                                               - Readiness check
//! GET  /metrics                                             - Prometheus metrics
//! PUT  /v1/private/datasets/items                           - Upsert items
//! GET  /v1/private/datasets/items/{item_id}                 - Get item
//! POST /v1/private/datasets/items/delete                    - Delete items
//! POST /v1/private/datasets/items/stream                    - Export items
//! GET  /v1/private/datasets/{dataset_id}/items              - Page items
//! GET  /v1/private/datasets/{dataset_id}/items/experiments/items - Page joined items
//! POST /v1/private/datasets/experiments/items               - Ingest experiment items
//! POST /v1/private/datasets/traces                          - Ingest traces
//! POST /v1/private/datasets/feedback-scores                 - Ingest feedback scores
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use verso_api::server::Server;
//!
//! let server = Server::builder()
//!     .http_port(8080)
//!     .debug(true)
//!     .build();
//!
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod context;
pub mod datasets;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod stream;
