use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use graphrag_common::{IndexingProgressEvent, SearchMode};
use graphrag_core::{IndexingCoordinator, ProgressSink};
use serde::Deserialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

const DEFAULT_SEARCH_K: usize = 10;

pub struct AppState {
    pub coordinator: IndexingCoordinator,
    /// Last progress event per store, for status polling while a build runs.
    progress: Arc<DashMap<String, IndexingProgressEvent>>,
    start_time: std::time::Instant,
}

impl AppState {
    pub fn new(coordinator: IndexingCoordinator) -> Self {
        Self {
            coordinator,
            progress: Arc::new(DashMap::new()),
            start_time: std::time::Instant::now(),
        }
    }

    fn progress_sink(&self) -> ProgressSink {
        let progress = self.progress.clone();
        Arc::new(move |event: IndexingProgressEvent| {
            progress.insert(event.name.clone(), event);
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stores", get(list_stores))
        .route("/stores/:name", get(get_store))
        .route("/stores/:name/index", post(index_store))
        .route("/stores/:name/refresh", post(refresh_store))
        .route("/stores/:name/search", post(search_store))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn not_found(name: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("Unknown knowledge store: {}", name))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "stores": state.coordinator.list().await.len(),
    }))
}

async fn list_stores(State(state): State<Arc<AppState>>) -> Response {
    Json(state.coordinator.list().await).into_response()
}

async fn get_store(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let Some(metadata) = state.coordinator.status(&name).await else {
        return not_found(&name);
    };
    let progress = state.progress.get(&name).map(|e| e.value().clone());
    Json(serde_json::json!({
        "metadata": metadata,
        "progress": progress,
    }))
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct IndexRequest {
    #[serde(default)]
    force: bool,
}

async fn index_store(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Option<Json<IndexRequest>>,
) -> Response {
    if state.coordinator.status(&name).await.is_none() {
        return not_found(&name);
    }
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let sink = Some(state.progress_sink());
    let result = if request.force {
        state.coordinator.rebuild(&name, sink).await
    } else {
        state.coordinator.initialize(&name, sink).await
    };
    match result {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            tracing::error!("Indexing {} failed: {:?}", name, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

async fn refresh_store(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    if state.coordinator.status(&name).await.is_none() {
        return not_found(&name);
    }
    match state.coordinator.refresh(&name, Some(state.progress_sink())).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            tracing::error!("Refreshing {} failed: {:?}", name, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    mode: SearchMode,
}

async fn search_store(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<SearchRequest>,
) -> Response {
    let Some(metadata) = state.coordinator.status(&name).await else {
        return not_found(&name);
    };
    if !state.coordinator.is_ready(&name) {
        return error_response(
            StatusCode::CONFLICT,
            format!("Knowledge store {} is not ready for search ({:?})", name, metadata.status),
        );
    }
    if payload.query.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "query must not be empty");
    }

    let k = payload.k.unwrap_or(DEFAULT_SEARCH_K);
    match state.coordinator.search(&name, &payload.query, k, payload.mode).await {
        Ok(results) => Json(serde_json::json!({ "results": results })).into_response(),
        Err(e) => {
            tracing::error!("Search on {} failed: {:?}", name, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use graphrag_common::config::{GraphBackendConfig, IndexingConfig, KnowledgeStoreConfig, SourceConfig};
    use graphrag_common::{StoreKind, TokenUsage};
    use graphrag_core::llm::{ChatMessage, EmbeddingClient, LLMClient, LLMResponse};
    use graphrag_core::InMemoryGraphStore;
    use tower::ServiceExt;

    struct FixedLLM;

    #[async_trait]
    impl LLMClient for FixedLLM {
        async fn invoke(&self, _messages: Vec<ChatMessage>) -> anyhow::Result<LLMResponse<String>> {
            let data = r#"{"entities":[{"name":"Acme","type":"Org","description":"Rocket maker"}],"relationships":[]}"#;
            Ok(LLMResponse { data: data.to_string(), usage: TokenUsage::default() })
        }
    }

    struct FixedEmbeddings;

    #[async_trait]
    impl EmbeddingClient for FixedEmbeddings {
        async fn embed_query(&self, _text: &str) -> anyhow::Result<LLMResponse<Vec<f32>>> {
            Ok(LLMResponse { data: vec![1.0, 0.0], usage: TokenUsage::default() })
        }
    }

    fn app(dir: &std::path::Path) -> Router {
        std::fs::write(dir.join("a.txt"), "Acme builds rockets.").unwrap();
        let coordinator = IndexingCoordinator::new(
            IndexingConfig::default(),
            dir.join("stores"),
            Arc::new(FixedLLM),
            Arc::new(FixedEmbeddings),
        );
        let store = KnowledgeStoreConfig {
            name: "kb1".into(),
            kind: StoreKind::Graph,
            sources: vec![SourceConfig::new(dir.join("a.txt").display().to_string())],
            graph: GraphBackendConfig::Memory,
        };
        coordinator.register(store, Arc::new(InMemoryGraphStore::new())).unwrap();
        router(Arc::new(AppState::new(coordinator)))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(json) => request.body(Body::from(json.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stores"], 1);

        let (status, body) = call(&app, "GET", "/stores", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "kb1");
        assert_eq!(body[0]["status"], "not_indexed");
    }

    #[tokio::test]
    async fn test_unknown_store_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, _) = call(&app, "GET", "/stores/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "POST", "/stores/nope/index", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_search_before_index_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, _) = call(&app, "POST", "/stores/kb1/search", Some(serde_json::json!({ "query": "rockets" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_search_on_failed_store_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        std::fs::remove_file(dir.path().join("a.txt")).unwrap();

        let (status, body) = call(&app, "POST", "/stores/kb1/index", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("not found"));

        let (_, body) = call(&app, "GET", "/stores/kb1", None).await;
        assert_eq!(body["metadata"]["status"], "error");

        let (status, body) = call(&app, "POST", "/stores/kb1/search", Some(serde_json::json!({ "query": "rockets" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("not ready"));
    }

    #[tokio::test]
    async fn test_index_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let (status, body) = call(&app, "POST", "/stores/kb1/index", Some(serde_json::json!({ "force": false }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "indexed");
        assert_eq!(body["entityCount"], 1);

        let (_, body) = call(&app, "GET", "/stores/kb1", None).await;
        assert_eq!(body["progress"]["phase"], "done");

        let (status, body) = call(
            &app,
            "POST",
            "/stores/kb1/search",
            Some(serde_json::json!({ "query": "Who builds rockets?", "k": 1, "mode": "local" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"].as_array().unwrap().len(), 1);
        assert!(body["results"][0]["content"].as_str().unwrap().contains("Acme"));

        let (status, body) = call(&app, "POST", "/stores/kb1/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changedSources"], 0);
    }
}
