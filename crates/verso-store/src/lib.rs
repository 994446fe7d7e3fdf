//! # verso-store
//!
//! A versioned, append-only record store for dataset items.
//!
//! Items are never updated in place. Every write appends a new physical
//! version row, and every read computes the logical current value of an item
//! as its version with the greatest server write time.
//!
//! ## Components
//!
//! - **[`MergeUpsertEngine`]**: merges a write with the latest prior version in
//!   one atomic statement (sticky `dataset_id`/`workspace_id`, first-write-wins
//!   creation fields)
//! - **[`VersionedRecordStore`]**: point reads, offset pages, cursor export and
//!   deletes under latest-version semantics
//! - **[`JoinAggregator`]**: dataset items nested with experiment links, trace
//!   documents and feedback scores, each tier de-duplicated before joining
//! - **[`ExperimentLinkWriter`]**: appends the rows the join reads
//!
//! All components share a [`ColumnarDatabase`]: Arrow record batch tables,
//! a connection pool and a monotonic server clock.
//!
//! ## Example
//!
//! ```rust
//! # #[tokio::main]
//! # async fn main() {
//! use serde_json::json;
//! use verso_core::prelude::*;
//! use verso_store::{ColumnarDatabase, DatasetItemWrite, MergeUpsertEngine, VersionedRecordStore};
//!
//! let db = ColumnarDatabase::in_memory();
//! let scope = WorkspaceScope::new(WorkspaceId::new("acme-research").unwrap(), "alice");
//! let dataset = DatasetId::generate();
//! let item = DatasetItemWrite::manual(DatasetItemId::generate(), json!({"q": "2+2"}));
//!
//! MergeUpsertEngine::new(db.clone(), RetryPolicy::default())
//!     .save(&scope, dataset, &[item.clone()])
//!     .await
//!     .unwrap();
//!
//! let stored = VersionedRecordStore::new(db).get(&scope, item.id).await.unwrap();
//! assert_eq!(stored.unwrap().created_by, "alice");
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub(crate) mod codec;
pub mod engine;
pub mod error;
pub mod items;
pub mod join;
pub mod links;
pub mod merge;
pub mod metrics;
pub mod record;
pub mod view;

pub use engine::{ColumnarDatabase, DatabaseConfig};
pub use error::{Result, StoreError};
pub use items::{ItemStream, VersionedRecordStore};
pub use join::JoinAggregator;
pub use links::ExperimentLinkWriter;
pub use merge::MergeUpsertEngine;
pub use record::{
    DatasetItem, DatasetItemPage, DatasetItemSource, DatasetItemWrite, EntityType, ExperimentItem,
    ExperimentItemWrite, FeedbackScore, FeedbackScoreWrite, ItemWorkspace, MAX_BATCH_SIZE,
    ScoreSource, SearchCriteria, Sticky, TraceWrite,
};
pub use view::{Versioned, materialize_current_view};
