//! HTTP API
//!
//! - `POST /predict`        multipart の `file` を分類し、履歴に記録
//! - `GET /history`         履歴一覧（新しい順）
//! - `DELETE /history`      履歴を全削除
//! - `DELETE /history/{id}` 履歴を1件削除
//! - `GET /health`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use burn::tensor::backend::Backend;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::{ErrorKind, FreshError};
use crate::history::{record_prediction, HistoryRecord, HistoryStore};
use crate::ml::inference::{InferenceService, Prediction};

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// API のエラー応答 `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!("Bad request: {}", message);
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("Internal error: {}", message);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<FreshError> for ApiError {
    fn from(err: FreshError) -> Self {
        match err.kind() {
            ErrorKind::Client => ApiError::bad_request(err.to_string()),
            ErrorKind::Service | ErrorKind::Degraded => {
                tracing::error!("Service unavailable: {}", err);
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            ErrorKind::Fatal => ApiError::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// ハンドラ間で共有する状態
pub struct ApiState<B: Backend> {
    pub inference: InferenceService<B>,
    pub history: Arc<dyn HistoryStore>,
}

impl<B: Backend> ApiState<B> {
    pub fn new(inference: InferenceService<B>, history: Arc<dyn HistoryStore>) -> Self {
        Self { inference, history }
    }
}

/// ルーターを構築
pub fn router<B: Backend>(state: ApiState<B>) -> Router {
    Router::new()
        .route("/predict", post(predict::<B>))
        .route("/history", get(list_history::<B>).delete(clear_history::<B>))
        .route("/history/{id}", delete(delete_history_item::<B>))
        .route("/health", get(health::<B>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// サーバを起動（終了まで戻らない）
pub async fn serve(app: Router, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn predict<B: Backend>(
    State(state): State<Arc<ApiState<B>>>,
    mut multipart: Multipart,
) -> Result<Json<Prediction>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        upload = Some((filename, bytes));
        break;
    }

    let (filename, bytes) = upload.ok_or_else(|| ApiError::bad_request("No file part"))?;
    if filename.is_empty() {
        return Err(ApiError::bad_request("No selected file"));
    }

    let prediction = run_blocking(move || {
        let prediction = state.inference.predict(&bytes)?;
        record_prediction(state.history.as_ref(), &filename, &prediction);
        Ok(prediction)
    })
    .await?;

    Ok(Json(prediction))
}

/// 推論や履歴ファイルの読み書きはブロッキングスレッドで実行
async fn run_blocking<T, F>(task: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, FreshError> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(result?)
}

async fn list_history<B: Backend>(
    State(state): State<Arc<ApiState<B>>>,
) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    let records = run_blocking(move || state.history.list()).await?;
    Ok(Json(records))
}

async fn clear_history<B: Backend>(
    State(state): State<Arc<ApiState<B>>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = run_blocking(move || state.history.delete_all()).await?;
    Ok(Json(json!({ "message": format!("Deleted {} records", count) })))
}

async fn delete_history_item<B: Backend>(
    State(state): State<Arc<ApiState<B>>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if run_blocking(move || state.history.delete(&id)).await? {
        Ok(Json(json!({ "message": "Deleted successfully" })))
    } else {
        Err(ApiError::not_found("Item not found"))
    }
}

async fn health<B: Backend>(State(state): State<Arc<ApiState<B>>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "model": state.inference.model_name(),
        "model_loaded": state.inference.is_ready(),
    }))
}
