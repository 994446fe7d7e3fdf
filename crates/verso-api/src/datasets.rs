//! Dataset metadata lookups.
//!
//! Dataset CRUD lives outside this service. Handlers reach it through
//! [`DatasetResolver`]; [`MemoryDatasetCatalog`] is the in-process
//! implementation used in debug deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use verso_core::{DatasetId, WorkspaceId, WorkspaceScope};
use verso_store::{Result, StoreError};

/// Maps human-given dataset names to identifiers within a workspace.
#[async_trait]
pub trait DatasetResolver: Send + Sync + 'static {
    /// Returns the identifier of the named dataset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the workspace has no such dataset.
    async fn resolve(&self, scope: &WorkspaceScope, name: &str) -> Result<DatasetId>;

    /// Returns the identifier of the named dataset, creating it if missing.
    async fn get_or_create(&self, scope: &WorkspaceScope, name: &str) -> Result<DatasetId>;

    /// Returns true when the identifier names a dataset in the caller's workspace.
    async fn exists(&self, scope: &WorkspaceScope, id: DatasetId) -> Result<bool>;
}

/// In-memory dataset catalog keyed by workspace and name.
#[derive(Debug, Default)]
pub struct MemoryDatasetCatalog {
    datasets: RwLock<HashMap<(WorkspaceId, String), DatasetId>>,
}

impl MemoryDatasetCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::validation("dataset name must not be blank"));
    }
    Ok(name)
}

#[async_trait]
impl DatasetResolver for MemoryDatasetCatalog {
    async fn resolve(&self, scope: &WorkspaceScope, name: &str) -> Result<DatasetId> {
        let name = check_name(name)?;
        let key = (scope.workspace_id().clone(), name.to_string());
        self.datasets
            .read()
            .await
            .get(&key)
            .copied()
            .ok_or_else(|| StoreError::NotFound {
                message: format!("dataset '{name}'"),
            })
    }

    async fn get_or_create(&self, scope: &WorkspaceScope, name: &str) -> Result<DatasetId> {
        let name = check_name(name)?;
        let key = (scope.workspace_id().clone(), name.to_string());
        let mut datasets = self.datasets.write().await;
        let id = *datasets.entry(key).or_insert_with(|| {
            let id = DatasetId::generate();
            tracing::info!(
                workspace = %scope.workspace_id(),
                dataset = name,
                dataset_id = %id,
                "created dataset"
            );
            id
        });
        Ok(id)
    }

    async fn exists(&self, scope: &WorkspaceScope, id: DatasetId) -> Result<bool> {
        Ok(self
            .datasets
            .read()
            .await
            .iter()
            .any(|((workspace, _), known)| workspace == scope.workspace_id() && *known == id))
    }
}
