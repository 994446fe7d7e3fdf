//! Streaming export of dataset items.
//!
//! [`StreamingDispatcher::dispatch`] hands back the receiving half of a bounded
//! channel at once and produces frames on a spawned task. Production waits for
//! a slot in a fixed-size worker pool before it opens the upstream query, so
//! the number of export queries in flight never exceeds the pool size.
//!
//! Every exit path drops the sender exactly once:
//! - exhaustion: all records sent, channel closes;
//! - timeout: one `{"code":500,"message":...}` frame, then the channel closes;
//! - any other failure: an `Err` item, which aborts the HTTP body mid-stream;
//! - client disconnect: the producer future is dropped, which disposes the
//!   upstream query and returns its connection lease.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tracing::Instrument;

use verso_core::observability::stream_span;
use verso_core::{DatasetItemId, WorkspaceScope};
use verso_store::{DatasetItem, StoreError, VersionedRecordStore};

use crate::config::StreamConfig;
use crate::datasets::DatasetResolver;
use crate::metrics::record_stream_aborted;

/// Separator written after every frame.
pub const FRAME_DELIMITER: &[u8] = b"\r\n";

/// Message of the frame written when the upstream query misses its deadline.
pub const TIMEOUT_MESSAGE: &str = "Streaming operation timed out";

/// One chunk of the export body.
pub type Frame = Result<Bytes, StoreError>;

/// Terminal error document written into the stream on timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Numeric status code.
    pub code: u16,
    /// Human-readable message.
    pub message: String,
}

impl ErrorFrame {
    /// The frame sent when the export times out.
    #[must_use]
    pub fn timed_out() -> Self {
        Self {
            code: 500,
            message: TIMEOUT_MESSAGE.to_string(),
        }
    }
}

/// What to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    /// Dataset name, resolved in the caller's workspace.
    pub dataset_name: String,
    /// Only items with identifiers strictly below this one are exported.
    pub cursor: Option<DatasetItemId>,
    /// Maximum number of records.
    pub limit: usize,
}

/// Runs cursor exports on a bounded worker pool.
#[derive(Clone)]
pub struct StreamingDispatcher {
    store: VersionedRecordStore,
    datasets: Arc<dyn DatasetResolver>,
    workers: Arc<Semaphore>,
    worker_pool_size: usize,
    timeout: Duration,
    channel_capacity: usize,
}

impl std::fmt::Debug for StreamingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingDispatcher")
            .field("worker_pool_size", &self.worker_pool_size)
            .field("idle_workers", &self.workers.available_permits())
            .field("timeout", &self.timeout)
            .field("channel_capacity", &self.channel_capacity)
            .field("datasets", &"<DatasetResolver>")
            .finish_non_exhaustive()
    }
}

impl StreamingDispatcher {
    /// Creates a dispatcher over the given store and dataset resolver.
    #[must_use]
    pub fn new(
        store: VersionedRecordStore,
        datasets: Arc<dyn DatasetResolver>,
        config: StreamConfig,
    ) -> Self {
        let worker_pool_size = config.worker_pool_size.max(1);
        Self {
            store,
            datasets,
            workers: Arc::new(Semaphore::new(worker_pool_size)),
            worker_pool_size,
            timeout: config.timeout(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }

    /// Number of worker slots currently free.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Starts an export and returns the channel its frames arrive on.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn dispatch(&self, scope: WorkspaceScope, request: ExportRequest) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let span = stream_span(&request.dataset_name, scope.workspace_id().as_str());
        let export = Export {
            store: self.store.clone(),
            datasets: Arc::clone(&self.datasets),
            workers: Arc::clone(&self.workers),
            timeout: self.timeout,
            scope,
            request,
        };

        tokio::spawn(
            async move {
                tokio::select! {
                    () = tx.closed() => {
                        record_stream_aborted("cancelled");
                        tracing::debug!("client disconnected; export cancelled");
                    }
                    () = export.run(&tx) => {}
                }
            }
            .instrument(span),
        );

        rx
    }
}

struct Export {
    store: VersionedRecordStore,
    datasets: Arc<dyn DatasetResolver>,
    workers: Arc<Semaphore>,
    timeout: Duration,
    scope: WorkspaceScope,
    request: ExportRequest,
}

impl Export {
    async fn run(self, tx: &mpsc::Sender<Frame>) {
        let Ok(_permit) = self.workers.acquire_owned().await else {
            return;
        };

        let dataset_id = match self
            .datasets
            .resolve(&self.scope, &self.request.dataset_name)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(error = %err, "failed to resolve dataset for export");
                record_stream_aborted("resolve");
                let _ = tx.send(Err(err)).await;
                return;
            }
        };

        let mut items = self.store.stream_items(
            &self.scope,
            dataset_id,
            self.request.limit,
            self.request.cursor,
        );
        let mut exported = 0_u64;

        loop {
            match tokio::time::timeout(self.timeout, items.next()).await {
                Ok(Some(Ok(item))) => {
                    let frame = encode_frame(&item);
                    let failed = frame.is_err();
                    if tx.send(frame).await.is_err() || failed {
                        break;
                    }
                    exported += 1;
                }
                Ok(Some(Err(err))) => {
                    tracing::error!(error = %err, exported, "export failed");
                    record_stream_aborted("upstream");
                    let _ = tx.send(Err(err)).await;
                    break;
                }
                Ok(None) => {
                    tracing::debug!(exported, "export complete");
                    break;
                }
                Err(elapsed) => {
                    tracing::warn!(
                        error = %elapsed,
                        exported,
                        timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                        "export timed out"
                    );
                    verso_store::metrics::record_stream_timeout();
                    let _ = tx.send(timeout_frame()).await;
                    break;
                }
            }
        }

        verso_store::metrics::record_exported(exported);
    }
}

/// Encodes an item as one delimited JSON frame.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if the item cannot be serialized.
pub fn encode_frame(item: &DatasetItem) -> Frame {
    let mut buf = serde_json::to_vec(item)?;
    buf.extend_from_slice(FRAME_DELIMITER);
    Ok(Bytes::from(buf))
}

fn timeout_frame() -> Frame {
    let mut buf = serde_json::to_vec(&ErrorFrame::timed_out())?;
    buf.extend_from_slice(FRAME_DELIMITER);
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use verso_core::{DatasetId, RetryPolicy, WorkspaceId};
    use verso_store::{ColumnarDatabase, DatasetItemWrite, MergeUpsertEngine};

    use crate::datasets::MemoryDatasetCatalog;

    fn scope() -> WorkspaceScope {
        WorkspaceScope::new(WorkspaceId::new("ws").unwrap(), "alice")
    }

    async fn seeded(n: usize) -> (Arc<ColumnarDatabase>, Arc<MemoryDatasetCatalog>) {
        let db = ColumnarDatabase::in_memory();
        let catalog = Arc::new(MemoryDatasetCatalog::new());
        let dataset: DatasetId = catalog.get_or_create(&scope(), "golden").await.unwrap();
        let writes: Vec<_> = (0..n)
            .map(|i| DatasetItemWrite::manual(DatasetItemId::generate(), json!({"i": i})))
            .collect();
        MergeUpsertEngine::new(db.clone(), RetryPolicy::no_retry())
            .save(&scope(), dataset, &writes)
            .await
            .unwrap();
        (db, catalog)
    }

    fn dispatcher(db: Arc<ColumnarDatabase>, catalog: Arc<MemoryDatasetCatalog>) -> StreamingDispatcher {
        StreamingDispatcher::new(VersionedRecordStore::new(db), catalog, StreamConfig::default())
    }

    async fn drain(mut rx: mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn timeout_frame_has_wire_shape() {
        let bytes = timeout_frame().unwrap();
        assert_eq!(
            &bytes[..],
            b"{\"code\":500,\"message\":\"Streaming operation timed out\"}\r\n"
        );
    }

    #[tokio::test]
    async fn frames_are_delimited_and_bounded_by_limit() {
        let (db, catalog) = seeded(3).await;
        let rx = dispatcher(db, catalog).dispatch(
            scope(),
            ExportRequest {
                dataset_name: "golden".to_string(),
                cursor: None,
                limit: 2,
            },
        );

        let frames = drain(rx).await;
        assert_eq!(frames.len(), 2);
        for frame in frames {
            let bytes = frame.unwrap();
            assert!(bytes.ends_with(FRAME_DELIMITER));
            let item: DatasetItem = serde_json::from_slice(&bytes[..bytes.len() - 2]).unwrap();
            assert_eq!(item.created_by, "alice");
        }
    }

    #[tokio::test]
    async fn unknown_dataset_ends_with_error_item() {
        let (db, catalog) = seeded(1).await;
        let rx = dispatcher(db, catalog).dispatch(
            scope(),
            ExportRequest {
                dataset_name: "missing".to_string(),
                cursor: None,
                limit: 10,
            },
        );

        let frames = drain(rx).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn worker_slot_is_returned_after_export() {
        let (db, catalog) = seeded(2).await;
        let dispatcher = dispatcher(db, catalog);
        let idle = dispatcher.idle_workers();

        let rx = dispatcher.dispatch(
            scope(),
            ExportRequest {
                dataset_name: "golden".to_string(),
                cursor: None,
                limit: 10,
            },
        );
        assert_eq!(drain(rx).await.len(), 2);
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.idle_workers(), idle);
    }

    fn export_all() -> ExportRequest {
        ExportRequest {
            dataset_name: "golden".to_string(),
            cursor: None,
            limit: 100,
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn worker_pool_caps_concurrent_exports() {
        let (db, catalog) = seeded(4).await;
        db.set_query_delay(Duration::from_millis(300));
        let dispatcher = StreamingDispatcher::new(
            VersionedRecordStore::new(db.clone()),
            catalog,
            StreamConfig {
                worker_pool_size: 1,
                ..StreamConfig::default()
            },
        );

        let receivers: Vec<_> = (0..3)
            .map(|_| dispatcher.dispatch(scope(), export_all()))
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let leased = db.pool().size() - db.pool().available();
        assert_eq!(leased, 1);
        assert_eq!(dispatcher.idle_workers(), 0);

        let drained = futures::future::join_all(receivers.into_iter().map(drain)).await;
        for frames in drained {
            assert_eq!(frames.len(), 4);
            assert!(frames.iter().all(Result::is_ok));
        }
    }

    #[tokio::test]
    async fn cancel_while_blocked_on_send_releases_lease() {
        let (db, catalog) = seeded(10).await;
        let dispatcher = StreamingDispatcher::new(
            VersionedRecordStore::new(db.clone()),
            catalog,
            StreamConfig {
                channel_capacity: 1,
                ..StreamConfig::default()
            },
        );
        let pool_size = db.pool().size();
        let idle = dispatcher.idle_workers();

        let mut rx = dispatcher.dispatch(scope(), export_all());
        assert!(rx.recv().await.is_some_and(|frame| frame.is_ok()));

        // The producer now has one frame buffered and is parked on the next send.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(db.pool().available(), pool_size - 1);
        assert_eq!(dispatcher.idle_workers(), idle - 1);

        drop(rx);
        assert!(wait_until(|| db.pool().available() == pool_size).await);
        assert!(wait_until(|| dispatcher.idle_workers() == idle).await);
    }
}
