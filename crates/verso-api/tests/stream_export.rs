//! Streaming export tests.
//!
//! Drives `POST /v1/private/datasets/items/stream` end to end and reads the
//! delimited frames off the response body.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use verso_api::server::ServerBuilder;
use verso_core::DatasetItemId;
use verso_store::{ColumnarDatabase, DatasetItem};

const WORKSPACE: &str = "stream-workspace";
const STREAM_URI: &str = "/v1/private/datasets/items/stream";

struct Fixture {
    router: axum::Router,
    db: Arc<ColumnarDatabase>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_timeout_ms(5_000)
    }

    fn with_timeout_ms(timeout_ms: u64) -> Self {
        let db = ColumnarDatabase::in_memory();
        let router = ServerBuilder::new()
            .debug(true)
            .database(Arc::clone(&db))
            .stream_timeout_ms(timeout_ms)
            .build()
            .test_router();
        Self { router, db }
    }

    fn router(&self) -> axum::Router {
        self.router.clone()
    }

    async fn seed(&self, name: &str, n: usize) -> Result<Vec<DatasetItemId>> {
        let ids: Vec<_> = (0..n).map(|_| DatasetItemId::generate()).collect();
        let items: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| json!({"id": id, "source": "manual", "input": {"i": i}}))
            .collect();
        let request = make_request(
            Method::PUT,
            "/v1/private/datasets/items",
            &json!({"dataset_name": name, "items": items}),
        )?;
        let response = self
            .router()
            .oneshot(request)
            .await
            .map_err(|err| -> anyhow::Error { match err {} })?;
        anyhow::ensure!(
            response.status() == StatusCode::NO_CONTENT,
            "seed failed with {}",
            response.status()
        );
        Ok(ids)
    }
}

fn make_request(method: Method, uri: &str, body: &Value) -> Result<Request<Body>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Workspace-Id", WORKSPACE)
        .header("X-User-Name", "exporter")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::to_vec(body).context("serialize request body")?,
        ))
        .context("build request")
}

/// Splits a response body into its non-empty frames.
fn frames(body: &[u8]) -> Result<Vec<Value>> {
    std::str::from_utf8(body)
        .context("body is utf-8")?
        .split("\r\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| serde_json::from_str(frame).context("parse frame"))
        .collect()
}

async fn export(
    router: axum::Router,
    body: &Value,
) -> Result<(StatusCode, Option<String>, axum::body::Bytes)> {
    let response = router
        .oneshot(make_request(Method::POST, STREAM_URI, body)?)
        .await
        .map_err(|err| -> anyhow::Error { match err {} })?;
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .context("read stream body")?;
    Ok((status, content_type, bytes))
}

#[tokio::test]
async fn test_export_is_ndjson() -> Result<()> {
    let fixture = Fixture::new();
    fixture.seed("golden", 1).await?;

    let (status, content_type, body) =
        export(fixture.router(), &json!({"dataset_name": "golden"})).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/x-ndjson"));
    assert!(body.ends_with(b"\r\n"));
    Ok(())
}

#[tokio::test]
async fn test_cursor_pagination_walks_whole_dataset() -> Result<()> {
    let fixture = Fixture::new();
    let mut expected = fixture.seed("golden", 5).await?;
    expected.sort();
    expected.reverse();

    let mut seen = Vec::new();
    let mut sizes = Vec::new();
    let mut cursor: Option<DatasetItemId> = None;
    loop {
        let mut request = json!({"dataset_name": "golden", "limit": 2});
        if let Some(last) = cursor {
            request["last_retrieved_id"] = json!(last);
        }
        let (status, _, body) = export(fixture.router(), &request).await?;
        assert_eq!(status, StatusCode::OK);

        let batch: Vec<DatasetItem> = frames(&body)?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;
        sizes.push(batch.len());
        let Some(last) = batch.last() else { break };
        cursor = Some(last.id);
        seen.extend(batch.iter().map(|item| item.id));
    }

    assert_eq!(sizes, vec![2, 2, 1, 0]);
    assert_eq!(seen, expected);
    Ok(())
}

#[tokio::test]
async fn test_camel_case_request_fields_are_accepted() -> Result<()> {
    let fixture = Fixture::new();
    fixture.seed("golden", 3).await?;

    let (status, _, body) = export(
        fixture.router(),
        &json!({"datasetName": "golden", "steamLimit": 1}),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(frames(&body)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_export_is_workspace_scoped() -> Result<()> {
    let fixture = Fixture::new();
    fixture.seed("golden", 2).await?;

    let request = Request::builder()
        .method(Method::POST)
        .uri(STREAM_URI)
        .header("X-Workspace-Id", "someone-else")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(
            &json!({"dataset_name": "golden"}),
        )?))
        .context("build request")?;
    let response = fixture
        .router()
        .oneshot(request)
        .await
        .map_err(|err| -> anyhow::Error { match err {} })?;

    // The dataset name does not exist in the other workspace.
    assert!(axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn test_limit_out_of_range_is_bad_request() -> Result<()> {
    let fixture = Fixture::new();
    for limit in [0, 2001] {
        let (status, _, _) = export(
            fixture.router(),
            &json!({"dataset_name": "golden", "limit": limit}),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST, "limit {limit}");
    }
    Ok(())
}

#[tokio::test]
async fn test_blank_dataset_name_is_bad_request() -> Result<()> {
    let fixture = Fixture::new();
    let (status, _, _) = export(fixture.router(), &json!({"dataset_name": "   "})).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_unknown_dataset_aborts_body() -> Result<()> {
    let fixture = Fixture::new();
    let response = fixture
        .router()
        .oneshot(make_request(
            Method::POST,
            STREAM_URI,
            &json!({"dataset_name": "missing"}),
        )?)
        .await
        .map_err(|err| -> anyhow::Error { match err {} })?;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn test_slow_storage_ends_with_timeout_frame() -> Result<()> {
    let fixture = Fixture::with_timeout_ms(50);
    fixture.seed("golden", 3).await?;
    fixture.db.set_query_delay(Duration::from_millis(500));

    let (status, _, body) = export(fixture.router(), &json!({"dataset_name": "golden"})).await?;
    assert_eq!(status, StatusCode::OK);

    let frames = frames(&body)?;
    assert_eq!(
        frames,
        vec![json!({"code": 500, "message": "Streaming operation timed out"})]
    );
    Ok(())
}

#[tokio::test]
async fn test_dropped_body_releases_connection() -> Result<()> {
    let fixture = Fixture::new();
    fixture.seed("golden", 3).await?;
    let pool_size = fixture.db.pool().size();
    fixture.db.set_query_delay(Duration::from_millis(200));

    let response = fixture
        .router()
        .oneshot(make_request(
            Method::POST,
            STREAM_URI,
            &json!({"dataset_name": "golden"}),
        )?)
        .await
        .map_err(|err| -> anyhow::Error { match err {} })?;
    assert_eq!(response.status(), StatusCode::OK);

    // Give the export time to lease a connection, then hang up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(response);

    let released = tokio::time::timeout(Duration::from_secs(2), async {
        while fixture.db.pool().available() < pool_size {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "pool lease was not returned");
    Ok(())
}
