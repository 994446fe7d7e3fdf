//! # verso-core
//!
//! Core abstractions for the Verso versioned dataset store.
//!
//! This crate provides the foundational types used across all Verso components:
//!
//! - **Workspace Scope**: The workspace/identity pair every operation runs under
//! - **Identifiers**: Strongly-typed, time-ordered IDs for items, datasets and links
//! - **Retry Policy**: Bounded exponential backoff for transient failures
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use verso_core::prelude::*;
//!
//! let workspace = WorkspaceId::new("acme-research").unwrap();
//! let scope = WorkspaceScope::new(workspace, "alice");
//!
//! let item_id = DatasetItemId::generate();
//! assert_eq!(scope.user_name(), "alice");
//! # let _ = item_id;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod error;
pub mod id;
pub mod observability;
pub mod retry;
pub mod workspace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{
        DatasetId, DatasetItemId, ExperimentId, ExperimentItemId, IdGenerator, SpanId, TraceId,
        TimeOrderedIdGenerator,
    };
    pub use crate::retry::{RetryPolicy, Transient};
    pub use crate::workspace::{WorkspaceId, WorkspaceScope};
}

pub use error::{Error, Result};
pub use id::{
    DatasetId, DatasetItemId, ExperimentId, ExperimentItemId, IdGenerator, SpanId,
    TimeOrderedIdGenerator, TraceId,
};
pub use observability::{LogFormat, init_logging};
pub use retry::{RetryPolicy, Transient};
pub use workspace::{WorkspaceId, WorkspaceScope};
