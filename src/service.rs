//! HTTP prediction service
//!
//! The model is resolved through the registry once at startup; the process
//! refuses to start without one. Handlers read it through a [`ModelHandle`],
//! which `/admin/reload` can swap without a restart.

use crate::error::{ChurnError, Result};
use crate::pipeline::ChurnPipeline;
use crate::registry::{
    ModelRegistry, ModelUri, ModelVersion, Stage, VersionSelector, DEFAULT_MODEL_NAME,
};
use crate::schema::{FeatureFrame, FeatureSchema};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Service settings
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub bind: String,
    pub model_uri: ModelUri,
}

impl ServeConfig {
    pub fn new<S: Into<String>>(bind: S, model_uri: ModelUri) -> Self {
        Self {
            bind: bind.into(),
            model_uri,
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            model_uri: ModelUri::new(
                DEFAULT_MODEL_NAME,
                VersionSelector::Stage(Stage::Production),
            ),
        }
    }
}

/// A resolved pipeline with the registry entry it came from
#[derive(Debug)]
pub struct LoadedModel {
    pub version: ModelVersion,
    pub pipeline: ChurnPipeline,
}

/// Shared, swappable reference to the serving model
///
/// The lock is only held to clone or replace the inner `Arc`; requests keep
/// using the model they started with while a reload swaps it.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    inner: Arc<RwLock<Arc<LoadedModel>>>,
}

impl ModelHandle {
    pub fn new(model: LoadedModel) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(model))),
        }
    }

    pub fn current(&self) -> Arc<LoadedModel> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new model, returning the one it replaced
    pub fn replace(&self, model: LoadedModel) -> Arc<LoadedModel> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(model))
    }
}

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub model: ModelHandle,
    pub registry: Arc<dyn ModelRegistry>,
    pub model_uri: ModelUri,
}

impl AppState {
    /// Resolve the model URI and build the handler state
    ///
    /// # Errors
    /// Whatever the registry reports when the URI resolves to nothing loadable.
    pub fn load(registry: Arc<dyn ModelRegistry>, model_uri: ModelUri) -> Result<Self> {
        let model = load_model(registry.as_ref(), &model_uri)?;
        Ok(Self {
            model: ModelHandle::new(model),
            registry,
            model_uri,
        })
    }
}

fn load_model(registry: &dyn ModelRegistry, uri: &ModelUri) -> Result<LoadedModel> {
    let (version, pipeline) = registry.resolve(uri)?;
    info!(
        "Loaded {} version {} ({}) from {}",
        version.name, version.version, version.stage, uri
    );
    Ok(LoadedModel { version, pipeline })
}

/// Error body returned by every route: `{"error": ..., "status": ...}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unprocessable(String),
    Unavailable(String),
    Internal(String),
}

impl From<ChurnError> for ApiError {
    fn from(err: ChurnError) -> Self {
        match err {
            ChurnError::InvalidRecord { .. } | ChurnError::SchemaMismatch { .. } => {
                ApiError::Unprocessable(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status.is_server_error() {
            error!("Request failed: {}", message);
        }

        let body = Json(serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub records: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelRef {
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub model: ModelRef,
    pub predictions: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probabilities: Option<Vec<f64>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: u32,
    pub stage: String,
    pub run_id: Option<String>,
    pub uri: String,
    pub trained_at: DateTime<Utc>,
    pub schema: FeatureSchema,
}

/// Build the router with all endpoints
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/v1/predict", post(predict))
        .route("/model", get(model_info))
        .route("/admin/reload", post(reload))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn predict(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> std::result::Result<Json<PredictResponse>, ApiError> {
    if request.records.is_empty() {
        return Err(ApiError::BadRequest("records must not be empty".to_string()));
    }

    let model = state.model.current();
    let scoring = Arc::clone(&model);
    let records = request.records;
    let (predictions, probabilities) = tokio::task::spawn_blocking(move || {
        let frame = FeatureFrame::from_records(scoring.pipeline.schema(), &records)?;
        let predictions = scoring.pipeline.predict(&frame)?;
        let probabilities = scoring.pipeline.predict_proba(&frame)?;
        Ok::<_, ChurnError>((predictions, probabilities))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("prediction task failed: {}", e)))??;

    Ok(Json(PredictResponse {
        model: ModelRef {
            name: model.version.name.clone(),
            version: model.version.version,
        },
        predictions,
        probabilities,
    }))
}

async fn model_info(State(state): State<AppState>) -> Json<ModelInfo> {
    let model = state.model.current();
    Json(describe(&model, &state.model_uri))
}

async fn reload(State(state): State<AppState>) -> std::result::Result<Json<ModelInfo>, ApiError> {
    let registry = Arc::clone(&state.registry);
    let uri = state.model_uri.clone();
    let loaded = tokio::task::spawn_blocking(move || load_model(registry.as_ref(), &uri))
        .await
        .map_err(|e| ApiError::Internal(format!("reload task failed: {}", e)))?
        .map_err(|e| {
            warn!("Reload of {} failed: {}", state.model_uri, e);
            ApiError::Unavailable(e.to_string())
        })?;

    let previous = state.model.replace(loaded);
    let current = state.model.current();
    info!(
        "Swapped {} version {} for version {}",
        current.version.name, previous.version.version, current.version.version
    );
    Ok(Json(describe(&current, &state.model_uri)))
}

fn describe(model: &LoadedModel, uri: &ModelUri) -> ModelInfo {
    ModelInfo {
        name: model.version.name.clone(),
        version: model.version.version,
        stage: model.version.stage.to_string(),
        run_id: model.version.run_id.clone(),
        uri: uri.to_string(),
        trained_at: model.pipeline.trained_at(),
        schema: model.pipeline.schema().clone(),
    }
}

/// Resolve the model, bind, and serve until Ctrl-C
pub async fn serve(config: ServeConfig, registry: Arc<dyn ModelRegistry>) -> Result<()> {
    let state = AppState::load(registry, config.model_uri.clone())?;
    let app = router(state);

    let listener = TcpListener::bind(&config.bind).await?;
    info!("Serving {} on {}", config.model_uri, config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::ForestParams;
    use crate::registry::{FileRegistry, DEFAULT_MODEL_URI};
    use crate::schema::{ColumnData, ColumnKind, ColumnSpec};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn fitted_pipeline() -> (ChurnPipeline, FeatureFrame) {
        let schema = FeatureSchema::new(vec![
            ColumnSpec {
                name: "tenure".to_string(),
                kind: ColumnKind::Numeric,
            },
            ColumnSpec {
                name: "Contract".to_string(),
                kind: ColumnKind::Categorical,
            },
        ]);
        let frame = FeatureFrame::new(
            schema,
            vec![
                ColumnData::Numeric(
                    [1.0, 2.0, 3.0, 40.0, 50.0, 60.0].into_iter().map(Some).collect(),
                ),
                ColumnData::Categorical(
                    ["Month", "Month", "Month", "Year", "Year", "Year"]
                        .iter()
                        .map(|c| Some(c.to_string()))
                        .collect(),
                ),
            ],
        )
        .unwrap();
        let pipeline =
            ChurnPipeline::fit(&frame, &[1, 1, 1, 0, 0, 0], ForestParams::new().n_trees(10))
                .unwrap();
        (pipeline, frame)
    }

    fn production_state() -> (TempDir, AppState, ChurnPipeline, FeatureFrame) {
        let dir = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::new(dir.path()));
        let (pipeline, frame) = fitted_pipeline();
        registry.publish("telco-churn", &pipeline, None).unwrap();
        registry.transition("telco-churn", 1, Stage::Production).unwrap();

        let state = AppState::load(registry, DEFAULT_MODEL_URI.parse().unwrap()).unwrap();
        (dir, state, pipeline, frame)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_constant() {
        let (_dir, state, _, _) = production_state();
        let response = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({"status": "ok"}));
    }

    #[test]
    fn test_startup_fails_without_model() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(FileRegistry::new(dir.path()));
        let result = AppState::load(registry, DEFAULT_MODEL_URI.parse().unwrap());
        assert!(matches!(result, Err(ChurnError::ModelNotFound { .. })));
    }

    #[tokio::test]
    async fn test_predict_matches_pipeline() {
        let (_dir, state, pipeline, frame) = production_state();
        let expected = pipeline.predict(&frame.take(&[0, 5])).unwrap();

        let request = post_json(
            "/v1/predict",
            serde_json::json!({"records": [
                {"tenure": 1.0, "Contract": "Month"},
                {"tenure": 60, "Contract": "Year"}
            ]}),
        );
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: PredictResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(body.predictions, expected);
        assert_eq!(body.model.name, "telco-churn");
        assert_eq!(body.model.version, 1);
        assert_eq!(body.probabilities.map(|p| p.len()), Some(2));
    }

    #[tokio::test]
    async fn test_predict_error_statuses() {
        let (_dir, state, _, _) = production_state();
        let app = router(state);

        let empty = app
            .clone()
            .oneshot(post_json("/predict", serde_json::json!({"records": []})))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
        let body = body_json(empty).await;
        assert_eq!(body["status"], 400);

        let bad_value = app
            .clone()
            .oneshot(post_json(
                "/predict",
                serde_json::json!({"records": [{"tenure": "long", "Contract": "Month"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(bad_value.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let malformed = app
            .oneshot(post_json("/predict", serde_json::json!({"features": [[1.0]]})))
            .await
            .unwrap();
        assert!(malformed.status().is_client_error());
    }

    #[tokio::test]
    async fn test_reload_swaps_to_new_production_version() {
        let (_dir, state, pipeline, _) = production_state();
        state.registry.publish("telco-churn", &pipeline, None).unwrap();
        state
            .registry
            .transition("telco-churn", 2, Stage::Production)
            .unwrap();

        let app = router(state.clone());
        let response = app
            .clone()
            .oneshot(post_json("/admin/reload", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.model.current().version.version, 2);

        let info = app
            .oneshot(Request::builder().uri("/model").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let info: ModelInfo = serde_json::from_value(body_json(info).await).unwrap();
        assert_eq!(info.version, 2);
        assert_eq!(info.stage, "Production");
        assert_eq!(info.schema.len(), 2);
    }
}
