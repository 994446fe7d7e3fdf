//! Latest-version reads, cursor export and deletes for dataset items.

use std::sync::Arc;

use futures::{StreamExt as _, TryStreamExt as _};
use futures::stream::{self, BoxStream};
use verso_core::{DatasetId, DatasetItemId, WorkspaceScope};

use crate::codec::{self, DatasetItemRow};
use crate::engine::{ColumnarDatabase, Connection, Params, Predicate, Statement, TableName};
use crate::error::{Result, StoreError};
use crate::metrics;
use crate::record::{DatasetItem, DatasetItemPage, ItemWorkspace};
use crate::view::materialize_current_view;

const SELECT_ITEM: Statement = Statement {
    name: "select_item",
    table: TableName::DatasetItems,
    predicates: &[
        Predicate::eq("id", "id"),
        Predicate::eq("workspace_id", "workspace_id"),
    ],
};

pub(crate) const SELECT_DATASET_ITEMS: Statement = Statement {
    name: "select_dataset_items",
    table: TableName::DatasetItems,
    predicates: &[
        Predicate::eq("dataset_id", "dataset_id"),
        Predicate::eq("workspace_id", "workspace_id"),
    ],
};

const SELECT_DATASET_ITEMS_BEFORE_CURSOR: Statement = Statement {
    name: "select_dataset_items_before_cursor",
    table: TableName::DatasetItems,
    predicates: &[
        Predicate::eq("dataset_id", "dataset_id"),
        Predicate::eq("workspace_id", "workspace_id"),
        Predicate::lt("id", "last_retrieved_id"),
    ],
};

const DELETE_ITEMS: Statement = Statement {
    name: "delete_items",
    table: TableName::DatasetItems,
    predicates: &[
        Predicate::is_in("id", "ids"),
        Predicate::eq("workspace_id", "workspace_id"),
    ],
};

const SELECT_ITEM_WORKSPACES: Statement = Statement {
    name: "select_item_workspaces",
    table: TableName::DatasetItems,
    predicates: &[Predicate::is_in("id", "ids")],
};

/// A cursor export query: one of exactly two precompiled statements.
#[derive(Debug, Clone)]
struct ExportQuery {
    statement: &'static Statement,
    params: Params,
}

impl ExportQuery {
    fn new(scope: &WorkspaceScope, dataset_id: DatasetId, cursor: Option<DatasetItemId>) -> Self {
        let params = dataset_params(scope, dataset_id);
        match cursor {
            Some(cursor) => Self {
                statement: &SELECT_DATASET_ITEMS_BEFORE_CURSOR,
                params: params.bind("last_retrieved_id", cursor),
            },
            None => Self {
                statement: &SELECT_DATASET_ITEMS,
                params,
            },
        }
    }
}

pub(crate) fn dataset_params(scope: &WorkspaceScope, dataset_id: DatasetId) -> Params {
    Params::new()
        .bind("dataset_id", dataset_id)
        .bind("workspace_id", scope.workspace_id())
}

/// Runs a dataset item statement and materializes the current view of its rows.
pub(crate) async fn current_rows(
    conn: &Connection,
    statement: &Statement,
    params: &Params,
) -> Result<Vec<DatasetItemRow>> {
    let batches = conn.query(statement, params).await?;
    Ok(materialize_current_view(codec::decode_dataset_items(&batches)?))
}

/// A stream of dataset items in descending identifier order.
pub type ItemStream = BoxStream<'static, Result<DatasetItem>>;

enum ExportState {
    Pending {
        db: Arc<ColumnarDatabase>,
        query: ExportQuery,
        limit: usize,
    },
    Emitting {
        conn: Connection,
        rows: std::vec::IntoIter<DatasetItemRow>,
    },
    Done,
}

impl ExportState {
    fn emit(conn: Connection, mut rows: std::vec::IntoIter<DatasetItemRow>) -> Option<(Result<DatasetItem>, Self)> {
        let row = rows.next()?;
        let item = row.into_item();
        let next = if item.is_ok() {
            Self::Emitting { conn, rows }
        } else {
            Self::Done
        };
        Some((item, next))
    }
}

/// Reads and deletes dataset items under latest-version semantics.
///
/// Every read filters by the caller's workspace before selecting the latest
/// version per identifier, so items owned by another workspace are
/// indistinguishable from absent ones.
#[derive(Debug, Clone)]
pub struct VersionedRecordStore {
    db: Arc<ColumnarDatabase>,
}

impl VersionedRecordStore {
    /// Creates a store reading from `db`.
    #[must_use]
    pub fn new(db: Arc<ColumnarDatabase>) -> Self {
        Self { db }
    }

    /// Returns the logical current value of an item, or `None` when it does not
    /// exist in the caller's workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or stored data cannot be decoded.
    #[tracing::instrument(skip(self, scope), fields(workspace = %scope.workspace_id()))]
    pub async fn get(&self, scope: &WorkspaceScope, id: DatasetItemId) -> Result<Option<DatasetItem>> {
        let conn = self.db.connect().await?;
        let params = Params::new()
            .bind("id", id)
            .bind("workspace_id", scope.workspace_id());
        current_rows(&conn, &SELECT_ITEM, &params)
            .await?
            .into_iter()
            .next()
            .map(DatasetItemRow::into_item)
            .transpose()
    }

    /// Returns one offset page of a dataset's items, ordered by identifier
    /// descending, together with the number of distinct items in the dataset.
    ///
    /// The count and the page are two sequential statements on one connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if `page` or `size` is zero, or an
    /// error if a query fails.
    #[tracing::instrument(skip(self, scope), fields(workspace = %scope.workspace_id()))]
    pub async fn get_page(
        &self,
        scope: &WorkspaceScope,
        dataset_id: DatasetId,
        page: u32,
        size: u32,
    ) -> Result<DatasetItemPage> {
        let offset = page_offset(page, size)?;
        let conn = self.db.connect().await?;
        let params = dataset_params(scope, dataset_id);

        let total = conn
            .count_distinct(&SELECT_DATASET_ITEMS, &params, "id")
            .await?;
        let content = current_rows(&conn, &SELECT_DATASET_ITEMS, &params)
            .await?
            .into_iter()
            .skip(offset)
            .take(size as usize)
            .map(DatasetItemRow::into_item)
            .collect::<Result<Vec<_>>>()?;

        Ok(DatasetItemPage {
            size: content.len(),
            content,
            page,
            total,
        })
    }

    /// Returns up to `limit` items with identifiers strictly below `cursor`
    /// (or from the top when `cursor` is `None`), identifier descending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or stored data cannot be decoded.
    pub async fn get_items_after(
        &self,
        scope: &WorkspaceScope,
        dataset_id: DatasetId,
        limit: usize,
        cursor: Option<DatasetItemId>,
    ) -> Result<Vec<DatasetItem>> {
        self.stream_items(scope, dataset_id, limit, cursor)
            .try_collect()
            .await
    }

    /// Streams the same records as [`get_items_after`](Self::get_items_after).
    ///
    /// The query runs when the stream is first polled. The stream holds its
    /// connection lease until it is exhausted or dropped; dropping it early
    /// disposes the query and releases the lease. A decode failure ends the
    /// stream after yielding the error.
    #[must_use]
    pub fn stream_items(
        &self,
        scope: &WorkspaceScope,
        dataset_id: DatasetId,
        limit: usize,
        cursor: Option<DatasetItemId>,
    ) -> ItemStream {
        let state = ExportState::Pending {
            db: Arc::clone(&self.db),
            query: ExportQuery::new(scope, dataset_id, cursor),
            limit,
        };

        stream::unfold(state, |state| async move {
            match state {
                ExportState::Pending { db, query, limit } => {
                    let opened = async {
                        let conn = db.connect().await?;
                        let mut rows = current_rows(&conn, query.statement, &query.params).await?;
                        rows.truncate(limit);
                        Ok::<_, StoreError>((conn, rows))
                    }
                    .await;
                    match opened {
                        Ok((conn, rows)) => ExportState::emit(conn, rows.into_iter()),
                        Err(err) => Some((Err(err), ExportState::Done)),
                    }
                }
                ExportState::Emitting { conn, rows } => ExportState::emit(conn, rows),
                ExportState::Done => None,
            }
        })
        .boxed()
    }

    /// Removes every version of the given items in the caller's workspace.
    /// Returns the number of physical rows removed; an empty list is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    #[tracing::instrument(skip(self, scope, ids), fields(workspace = %scope.workspace_id(), count = ids.len()))]
    pub async fn delete(&self, scope: &WorkspaceScope, ids: &[DatasetItemId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.db.connect().await?;
        let params = Params::new()
            .bind_list("ids", ids)
            .bind("workspace_id", scope.workspace_id());
        let removed = conn.delete(&DELETE_ITEMS, &params).await?;
        metrics::record_rows_deleted(TableName::DatasetItems, removed);
        tracing::debug!(removed, "deleted dataset item versions");
        Ok(removed)
    }

    /// Returns the workspace of the latest version of each known identifier,
    /// across all workspaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn workspaces_of(&self, ids: &[DatasetItemId]) -> Result<Vec<ItemWorkspace>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.db.connect().await?;
        let params = Params::new().bind_list("ids", ids);
        current_rows(&conn, &SELECT_ITEM_WORKSPACES, &params)
            .await?
            .into_iter()
            .map(|row| {
                Ok(ItemWorkspace {
                    id: codec::parse_id(&row.id)?,
                    workspace_id: row.workspace()?,
                })
            })
            .collect()
    }
}

/// Validates 1-based paging input and returns the row offset.
pub(crate) fn page_offset(page: u32, size: u32) -> Result<usize> {
    if page == 0 {
        return Err(StoreError::validation("page must be at least 1"));
    }
    if size == 0 {
        return Err(StoreError::validation("size must be at least 1"));
    }
    Ok((page as usize - 1).saturating_mul(size as usize))
}
