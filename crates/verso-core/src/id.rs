//! Strongly-typed identifiers for Verso entities.
//!
//! All identifiers in Verso are:
//! - **Strongly typed**: Prevents mixing up a dataset item with its dataset at compile time
//! - **Time ordered**: UUID v7 values sort by creation time, both as bytes and as
//!   their canonical lowercase string form
//! - **Globally unique**: No coordination required for generation
//!
//! Ordering matters: cursor pagination walks identifiers in descending order,
//! so the `Ord` implementation of every ID type is the byte order of the UUID.
//!
//! # Example
//!
//! ```rust
//! use verso_core::id::{DatasetId, DatasetItemId};
//!
//! let first = DatasetItemId::generate();
//! let dataset = DatasetId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: DatasetItemId = dataset;
//! # let _ = (first, dataset);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new time-ordered identifier (UUID v7).
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid {} '{s}': {e}", $label),
                })
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// A unique identifier for a dataset item.
    ///
    /// This is the stable identity of an item: every physical version row of
    /// the item carries the same `DatasetItemId`.
    DatasetItemId,
    "dataset item ID"
);

uuid_id!(
    /// A unique identifier for a dataset.
    DatasetId,
    "dataset ID"
);

uuid_id!(
    /// A unique identifier for an experiment.
    ExperimentId,
    "experiment ID"
);

uuid_id!(
    /// A unique identifier for an experiment item (a dataset item linked to a trace).
    ExperimentItemId,
    "experiment item ID"
);

uuid_id!(
    /// A unique identifier for a trace.
    TraceId,
    "trace ID"
);

uuid_id!(
    /// A unique identifier for a span within a trace.
    SpanId,
    "span ID"
);

/// Assigns identifiers to incoming entities that arrive without one.
///
/// Identifiers must be assigned *before* a write enters a retryable
/// operation, so that every retry attempt writes the same identity.
pub trait IdGenerator: Send + Sync + 'static {
    /// Returns a fresh identifier.
    fn generate_id(&self) -> Uuid;
}

/// Default generator producing UUID v7 values.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeOrderedIdGenerator;

impl IdGenerator for TimeOrderedIdGenerator {
    fn generate_id(&self) -> Uuid {
        Uuid::now_v7()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_item_id_roundtrip() {
        let id = DatasetItemId::generate();
        let parsed: DatasetItemId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(DatasetItemId::generate(), DatasetItemId::generate());
    }

    #[test]
    fn string_order_matches_id_order() {
        let ids: Vec<DatasetItemId> = (0..32).map(|_| DatasetItemId::generate()).collect();
        for pair in ids.windows(2) {
            assert_eq!(
                pair[0].cmp(&pair[1]),
                pair[0].to_string().cmp(&pair[1].to_string())
            );
        }
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<DatasetId> = "not-a-uuid".parse();
        assert!(matches!(result, Err(Error::InvalidId { .. })));
    }

    #[test]
    fn generator_produces_distinct_ids() {
        let generator = TimeOrderedIdGenerator;
        assert_ne!(generator.generate_id(), generator.generate_id());
    }
}
