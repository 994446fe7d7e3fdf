//! Domain records exchanged with callers of the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use verso_core::{
    DatasetId, DatasetItemId, ExperimentId, ExperimentItemId, SpanId, TraceId, WorkspaceId,
};

use crate::error::{Result, StoreError};

/// Maximum number of items in one write batch.
pub const MAX_BATCH_SIZE: usize = 1000;

/// A field that keeps its first non-empty value.
///
/// When a later write carries a different non-empty value, the field turns into
/// [`Sticky::Conflict`] instead of being overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Sticky<T> {
    /// A single agreed value.
    Value(T),
    /// Writers disagreed on the value.
    Conflict,
}

impl<T> Sticky<T> {
    /// Returns the value, or `None` on conflict.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Conflict => None,
        }
    }

    /// Returns true when writers disagreed on the value.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Returns the stored text form.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StoreError::invariant(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

text_enum!(
    /// Provenance of a dataset item.
    DatasetItemSource {
        /// Entered by hand.
        Manual => "manual",
        /// Captured from a trace.
        Trace => "trace",
        /// Captured from a span.
        Span => "span",
        /// Uploaded through an SDK.
        Sdk => "sdk",
    }
);

text_enum!(
    /// Origin of a feedback score.
    ScoreSource {
        /// Set from the UI.
        Ui => "ui",
        /// Set from an SDK.
        Sdk => "sdk",
    }
);

text_enum!(
    /// Kind of entity a feedback score is attached to.
    EntityType {
        /// A trace.
        Trace => "trace",
        /// A span.
        Span => "span",
    }
);

/// The logical current value of a dataset item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetItem {
    /// Stable identifier.
    pub id: DatasetItemId,
    /// Owning dataset.
    pub dataset_id: Sticky<DatasetId>,
    /// Provenance of the item.
    pub source: DatasetItemSource,
    /// Referenced trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Referenced span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<SpanId>,
    /// Input document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Expected output document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Value>,
    /// Free-form metadata document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// First write time.
    pub created_at: DateTime<Utc>,
    /// Server time of the newest write.
    pub last_updated_at: DateTime<Utc>,
    /// Identity of the first writer.
    pub created_by: String,
    /// Identity of the newest writer.
    pub last_updated_by: String,
    /// Owning workspace.
    pub workspace_id: Sticky<WorkspaceId>,
    /// Linked experiment items; only populated by joined reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_items: Option<Vec<ExperimentItem>>,
}

/// A write for one dataset item. The identifier is assigned before the write
/// reaches the store so every retry carries the same identity.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetItemWrite {
    /// Identifier assigned before the write.
    pub id: DatasetItemId,
    /// Provenance of the item.
    pub source: DatasetItemSource,
    /// Referenced trace.
    pub trace_id: Option<TraceId>,
    /// Referenced span.
    pub span_id: Option<SpanId>,
    /// Input document.
    pub input: Option<Value>,
    /// Expected output document.
    pub expected_output: Option<Value>,
    /// Free-form metadata document.
    pub metadata: Option<Value>,
}

impl DatasetItemWrite {
    /// Creates a manual item write with the given input document.
    #[must_use]
    pub fn manual(id: DatasetItemId, input: Value) -> Self {
        Self {
            id,
            source: DatasetItemSource::Manual,
            trace_id: None,
            span_id: None,
            input: Some(input),
            expected_output: None,
            metadata: None,
        }
    }

    /// Checks the input document and the source/reference combination.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] describing the first broken rule.
    pub fn validate(&self) -> Result<()> {
        if self.input.as_ref().map_or(true, Value::is_null) {
            return Err(StoreError::validation(format!(
                "item '{}': input is required",
                self.id
            )));
        }

        let rule = match (self.source, self.trace_id.is_some(), self.span_id.is_some()) {
            (DatasetItemSource::Trace, true, false)
            | (DatasetItemSource::Span, true, true)
            | (DatasetItemSource::Manual | DatasetItemSource::Sdk, false, false) => return Ok(()),
            (DatasetItemSource::Trace, _, _) => "trace_id is required and span_id must be absent",
            (DatasetItemSource::Span, _, _) => "trace_id and span_id are required",
            (DatasetItemSource::Manual | DatasetItemSource::Sdk, _, _) => {
                "trace_id and span_id must be absent"
            }
        };
        Err(StoreError::validation(format!(
            "item '{}': source '{}' {rule}",
            self.id, self.source
        )))
    }
}

/// A page of dataset items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetItemPage {
    /// Items on this page.
    pub content: Vec<DatasetItem>,
    /// 1-based page number.
    pub page: u32,
    /// Number of items on this page.
    pub size: usize,
    /// Number of distinct items visible in the dataset.
    pub total: u64,
}

/// Which joined reads to perform for a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Dataset to read.
    pub dataset_id: DatasetId,
    /// Experiments whose links are joined in.
    pub experiment_ids: Vec<ExperimentId>,
    /// Entity type of the joined feedback scores.
    pub entity_type: EntityType,
}

/// The latest owning workspace of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemWorkspace {
    /// Stable identifier.
    pub id: DatasetItemId,
    /// Workspace of the latest version.
    pub workspace_id: Sticky<WorkspaceId>,
}

/// A dataset item's link to an experiment run, enriched with the trace documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentItem {
    /// Link identifier.
    pub id: ExperimentItemId,
    /// Experiment the link belongs to.
    pub experiment_id: ExperimentId,
    /// Linked dataset item.
    pub dataset_item_id: DatasetItemId,
    /// Trace produced by the experiment run.
    pub trace_id: TraceId,
    /// Input document of the trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Output document of the trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Latest score per name for the trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_scores: Option<Vec<FeedbackScore>>,
    /// First write time.
    pub created_at: DateTime<Utc>,
    /// Server time of the newest write.
    pub last_updated_at: DateTime<Utc>,
    /// Identity of the first writer.
    pub created_by: String,
    /// Identity of the newest writer.
    pub last_updated_by: String,
}

/// A named score attached to a trace or span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackScore {
    /// Score name.
    pub name: String,
    /// Optional category label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    /// Numeric score.
    pub value: f64,
    /// Optional explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Where the score was set.
    pub source: ScoreSource,
}

/// Links a dataset item to an experiment through a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentItemWrite {
    /// Link identifier.
    pub id: ExperimentItemId,
    /// Experiment the link belongs to.
    pub experiment_id: ExperimentId,
    /// Linked dataset item.
    pub dataset_item_id: DatasetItemId,
    /// Trace produced by the experiment run.
    pub trace_id: TraceId,
}

/// The documents of a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceWrite {
    /// Trace identifier.
    pub id: TraceId,
    /// Input document.
    #[serde(default)]
    pub input: Option<Value>,
    /// Output document of the trace.
    #[serde(default)]
    pub output: Option<Value>,
}

/// A feedback score for a trace or span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackScoreWrite {
    /// Trace or span the score is attached to.
    pub entity_id: Uuid,
    /// Entity type of the joined feedback scores.
    pub entity_type: EntityType,
    /// Score name.
    pub name: String,
    /// Optional category label.
    #[serde(default)]
    pub category_name: Option<String>,
    /// Numeric score.
    pub value: f64,
    /// Optional explanation.
    #[serde(default)]
    pub reason: Option<String>,
    /// Where the score was set.
    pub source: ScoreSource,
}

impl FeedbackScoreWrite {
    /// Checks the score name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] when the name is blank.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StoreError::validation(format!(
                "feedback score for '{}': name is required",
                self.entity_id
            )));
        }
        if !self.value.is_finite() {
            return Err(StoreError::validation(format!(
                "feedback score '{}': value must be finite",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(source: DatasetItemSource, trace: bool, span: bool) -> DatasetItemWrite {
        DatasetItemWrite {
            source,
            trace_id: trace.then(TraceId::generate),
            span_id: span.then(SpanId::generate),
            ..DatasetItemWrite::manual(DatasetItemId::generate(), json!({"q": 1}))
        }
    }

    #[test]
    fn source_reference_rules() {
        assert!(write(DatasetItemSource::Manual, false, false).validate().is_ok());
        assert!(write(DatasetItemSource::Sdk, false, false).validate().is_ok());
        assert!(write(DatasetItemSource::Trace, true, false).validate().is_ok());
        assert!(write(DatasetItemSource::Span, true, true).validate().is_ok());

        assert!(write(DatasetItemSource::Manual, true, false).validate().is_err());
        assert!(write(DatasetItemSource::Trace, false, false).validate().is_err());
        assert!(write(DatasetItemSource::Trace, true, true).validate().is_err());
        assert!(write(DatasetItemSource::Span, true, false).validate().is_err());
    }

    #[test]
    fn input_is_required() {
        let mut item = write(DatasetItemSource::Manual, false, false);
        item.input = None;
        assert!(matches!(item.validate(), Err(StoreError::Validation { .. })));
    }

    #[test]
    fn sticky_json_form() {
        let value: Sticky<String> = Sticky::Value("ws".into());
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"state": "value", "value": "ws"})
        );
        assert_eq!(
            serde_json::to_value(Sticky::<String>::Conflict).unwrap(),
            json!({"state": "conflict"})
        );
    }

    #[test]
    fn text_enums_parse_their_stored_form() {
        assert_eq!("sdk".parse::<DatasetItemSource>().unwrap(), DatasetItemSource::Sdk);
        assert_eq!(ScoreSource::Ui.as_str(), "ui");
        assert!("table".parse::<EntityType>().is_err());
    }
}
