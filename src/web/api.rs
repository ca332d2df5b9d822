use crate::pipeline::{MetricsRegistry, MetricsSnapshot};
use crate::storage::{CheckpointStore, CheckpointSummary};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<MetricsRegistry>,
    pub store: Arc<dyn CheckpointStore>,
}

#[derive(Debug, Serialize)]
pub struct StreamStatus {
    pub stream: String,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/streams", get(list_streams))
        .route("/api/streams/:stream/checkpoints", get(list_checkpoints))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamStatus>> {
    Json(
        state
            .metrics
            .iter()
            .map(|(stream, metrics)| StreamStatus {
                stream: stream.clone(),
                metrics: metrics.snapshot(),
            })
            .collect(),
    )
}

async fn list_checkpoints(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    if !state.metrics.contains_key(&stream) {
        return (StatusCode::NOT_FOUND, format!("unknown stream '{}'", stream)).into_response();
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.store.checkpoint_history(&stream, limit).await {
        Ok(records) => {
            let summaries: Vec<CheckpointSummary> = records.iter().map(CheckpointSummary::from).collect();
            Json(summaries).into_response()
        }
        Err(e) => {
            tracing::error!(stream = %stream, error = %e, "Failed to read checkpoint history");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StreamMetrics;
    use crate::storage::checkpoint::{BatchStats, CheckpointRecord, CURRENT_VERSION};
    use crate::storage::DuckDbCheckpointStore;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let store = DuckDbCheckpointStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        for batch_id in 1..=3 {
            store
                .append_checkpoint(&CheckpointRecord {
                    version: CURRENT_VERSION,
                    stream_id: "clicks".to_string(),
                    batch_id,
                    offsets: BTreeMap::from([(0, batch_id * 2)]),
                    watermark: Default::default(),
                    dedup: Default::default(),
                    windows: Default::default(),
                    data_loss: Vec::new(),
                    stats: BatchStats::default(),
                    outputs: Vec::new(),
                    config_fingerprint: String::new(),
                    committed_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let metrics = Arc::new(StreamMetrics::new());
        metrics.record_commit(3, &BatchStats { events_processed: 6, ..Default::default() }, None);
        let registry: MetricsRegistry = BTreeMap::from([("clicks".to_string(), metrics)]);

        create_router(AppState {
            metrics: Arc::new(registry),
            store: Arc::new(store),
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, _) = get_json(test_app().await, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_streams() {
        let (status, body) = get_json(test_app().await, "/api/streams").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["stream"], "clicks");
        assert_eq!(body[0]["events_processed"], 6);
        assert_eq!(body[0]["last_batch_id"], 3);
    }

    #[tokio::test]
    async fn test_checkpoint_history() {
        let (status, body) = get_json(test_app().await, "/api/streams/clicks/checkpoints?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<u64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["batch_id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_unknown_stream() {
        let (status, _) = get_json(test_app().await, "/api/streams/nope/checkpoints").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
