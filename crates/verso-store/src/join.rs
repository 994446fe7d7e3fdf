//! Dataset items joined with their experiment links, traces and feedback scores.
//!
//! Each tier is read through its own statement and reduced to its current view
//! *before* joining, so that multiple versions of a link, trace or score never
//! fan out into duplicate nested records. Tiers are then left-joined: a parent
//! without a match carries a `None` child, which is dropped when the joined
//! rows are grouped and decoded.

use std::collections::HashMap;
use std::sync::Arc;

use verso_core::WorkspaceScope;

use crate::codec::{
    self, DatasetItemRow, ExperimentItemRow, FeedbackScoreRow, TraceRow, optional_text,
};
use crate::engine::{ColumnarDatabase, Connection, Params, Predicate, Statement, TableName};
use crate::error::Result;
use crate::items::{SELECT_DATASET_ITEMS, current_rows, dataset_params, page_offset};
use crate::record::{DatasetItemPage, ExperimentItem, FeedbackScore, SearchCriteria};
use crate::view::materialize_current_view;

const SELECT_EXPERIMENT_ITEMS: Statement = Statement {
    name: "select_experiment_items",
    table: TableName::ExperimentItems,
    predicates: &[
        Predicate::is_in("experiment_id", "experiment_ids"),
        Predicate::eq("workspace_id", "workspace_id"),
    ],
};

const SELECT_TRACES: Statement = Statement {
    name: "select_traces",
    table: TableName::Traces,
    predicates: &[
        Predicate::is_in("id", "trace_ids"),
        Predicate::eq("workspace_id", "workspace_id"),
    ],
};

const SELECT_FEEDBACK_SCORES: Statement = Statement {
    name: "select_feedback_scores",
    table: TableName::FeedbackScores,
    predicates: &[
        Predicate::eq("entity_type", "entity_type"),
        Predicate::eq("workspace_id", "workspace_id"),
        Predicate::is_in("entity_id", "trace_ids"),
    ],
};

/// Reads dataset item pages enriched with experiment results.
#[derive(Debug, Clone)]
pub struct JoinAggregator {
    db: Arc<ColumnarDatabase>,
}

impl JoinAggregator {
    /// Creates an aggregator reading from `db`.
    #[must_use]
    pub fn new(db: Arc<ColumnarDatabase>) -> Self {
        Self { db }
    }

    /// Returns one page of a dataset's items, each with the experiment items of
    /// the requested experiments nested inside.
    ///
    /// Items are ordered by identifier descending. `experiment_items` is `None`
    /// for an item without links, and `feedback_scores` is `None` for a link
    /// without scores. The order of nested records is unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`](crate::StoreError::Validation) if
    /// `page` or `size` is zero, or an error if a query fails.
    #[tracing::instrument(skip(self, scope, criteria), fields(workspace = %scope.workspace_id(), dataset_id = %criteria.dataset_id))]
    pub async fn get_items(
        &self,
        scope: &WorkspaceScope,
        criteria: &SearchCriteria,
        page: u32,
        size: u32,
    ) -> Result<DatasetItemPage> {
        let offset = page_offset(page, size)?;
        let conn = self.db.connect().await?;
        let item_params = dataset_params(scope, criteria.dataset_id);

        let total = conn
            .count_distinct(&SELECT_DATASET_ITEMS, &item_params, "id")
            .await?;
        let items: Vec<DatasetItemRow> = current_rows(&conn, &SELECT_DATASET_ITEMS, &item_params)
            .await?
            .into_iter()
            .skip(offset)
            .take(size as usize)
            .collect();

        let tiers = Tiers::load(&conn, scope, criteria).await?;
        let content = tiers.join(&items)?;

        Ok(DatasetItemPage {
            size: content.len(),
            content,
            page,
            total,
        })
    }
}

/// The current view of every joined tier.
struct Tiers {
    links: Vec<ExperimentItemRow>,
    traces: Vec<TraceRow>,
    scores: Vec<FeedbackScoreRow>,
}

impl Tiers {
    async fn load(conn: &Connection, scope: &WorkspaceScope, criteria: &SearchCriteria) -> Result<Self> {
        let links = materialize_current_view(codec::decode_experiment_items(
            &conn
                .query(
                    &SELECT_EXPERIMENT_ITEMS,
                    &Params::new()
                        .bind_list("experiment_ids", &criteria.experiment_ids)
                        .bind("workspace_id", scope.workspace_id()),
                )
                .await?,
        )?);

        let trace_params = Params::new()
            .bind_list("trace_ids", links.iter().map(|l| l.trace_id.as_str()))
            .bind("workspace_id", scope.workspace_id());
        let traces = materialize_current_view(codec::decode_traces(
            &conn.query(&SELECT_TRACES, &trace_params).await?,
        )?);

        let scores = materialize_current_view(codec::decode_feedback_scores(
            &conn
                .query(
                    &SELECT_FEEDBACK_SCORES,
                    &trace_params.bind("entity_type", criteria.entity_type.as_str()),
                )
                .await?,
        )?);

        Ok(Self {
            links,
            traces,
            scores,
        })
    }

    fn join(&self, items: &[DatasetItemRow]) -> Result<Vec<crate::record::DatasetItem>> {
        let links_by_item = index_by(&self.links, |l| l.dataset_item_id.as_str());
        let trace_by_id: HashMap<&str, &TraceRow> =
            self.traces.iter().map(|t| (t.id.as_str(), t)).collect();
        let scores_by_trace = index_by(&self.scores, |s| s.entity_id.as_str());

        let item_links = group(left_join(items, &links_by_item, |i| i.id.as_str()));

        item_links
            .into_iter()
            .map(|(item, links)| {
                let experiment_items = links
                    .into_iter()
                    .map(|link| {
                        let trace = trace_by_id.get(link.trace_id.as_str()).copied();
                        let scores = trace
                            .map(|t| group(left_join([t], &scores_by_trace, |t| t.id.as_str())))
                            .and_then(|grouped| grouped.into_iter().next())
                            .map(|(_, scores)| scores)
                            .unwrap_or_default();
                        decode_experiment_item(link, trace, &scores)
                    })
                    .collect::<Result<Vec<_>>>()?;

                let mut decoded = item.clone().into_item()?;
                decoded.experiment_items = (!experiment_items.is_empty()).then_some(experiment_items);
                Ok(decoded)
            })
            .collect()
    }
}

fn index_by<'a, C>(rows: &'a [C], key: impl Fn(&'a C) -> &'a str) -> HashMap<&'a str, Vec<&'a C>> {
    let mut index: HashMap<&str, Vec<&C>> = HashMap::new();
    for row in rows {
        index.entry(key(row)).or_default().push(row);
    }
    index
}

/// Left-joins indexed children onto parents. A parent without children yields
/// a single row with a `None` child.
fn left_join<'a, P: 'a, C>(
    parents: impl IntoIterator<Item = &'a P>,
    children: &HashMap<&str, Vec<&'a C>>,
    key: impl Fn(&'a P) -> &'a str,
) -> Vec<(&'a P, Option<&'a C>)> {
    let mut rows = Vec::new();
    for parent in parents {
        match children.get(key(parent)) {
            Some(matched) if !matched.is_empty() => {
                rows.extend(matched.iter().map(|child| (parent, Some(*child))));
            }
            _ => rows.push((parent, None)),
        }
    }
    rows
}

/// Groups consecutive joined rows by parent, dropping unmatched children.
fn group<'a, P, C>(rows: Vec<(&'a P, Option<&'a C>)>) -> Vec<(&'a P, Vec<&'a C>)> {
    let mut grouped: Vec<(&P, Vec<&C>)> = Vec::new();
    for (parent, child) in rows {
        match grouped.last_mut() {
            Some((last, children)) if std::ptr::eq(*last, parent) => children.extend(child),
            _ => grouped.push((parent, child.into_iter().collect())),
        }
    }
    grouped
}

fn decode_experiment_item(
    link: &ExperimentItemRow,
    trace: Option<&TraceRow>,
    scores: &[&FeedbackScoreRow],
) -> Result<ExperimentItem> {
    let feedback_scores = scores
        .iter()
        .map(|score| {
            Ok(FeedbackScore {
                name: score.name.clone(),
                category_name: optional_text(&score.category_name),
                value: score.value,
                reason: optional_text(&score.reason),
                source: score.source.parse()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ExperimentItem {
        id: codec::parse_id(&link.id)?,
        experiment_id: codec::parse_id(&link.experiment_id)?,
        dataset_item_id: codec::parse_id(&link.dataset_item_id)?,
        trace_id: codec::parse_id(&link.trace_id)?,
        input: trace.map(|t| codec::decode_document(&t.input)).transpose()?.flatten(),
        output: trace.map(|t| codec::decode_document(&t.output)).transpose()?.flatten(),
        feedback_scores: (!feedback_scores.is_empty()).then_some(feedback_scores),
        created_at: codec::timestamp(link.audit.created_at)?,
        last_updated_at: codec::timestamp(link.audit.last_updated_at)?,
        created_by: link.audit.created_by.clone(),
        last_updated_by: link.audit.last_updated_by.clone(),
    })
}
