//! Key management routes
//!
//! `POST /keys`, `GET /keys` and `DELETE /keys/{id}`. When an admin key is configured,
//! every route requires it as a bearer token.

use crate::auth::{IssuedKey, KeyError, KeySummary};
use crate::server::websocket::AppState;

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

impl From<KeyError> for ApiError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::InvalidId(id) => ApiError::BadRequest(format!("invalid key id '{}'", id)),
            KeyError::NotFound => ApiError::NotFound("key".to_string()),
            other => {
                error!(error = %other, "Key operation failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateKeyRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ListKeysResponse {
    pub keys: Vec<KeySummary>,
}

/// Admin routes, to be merged into the main router
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/keys", get(list_keys).post(generate_key))
        .route("/keys/{id}", delete(delete_key))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(admin_key) = &state.admin_key else {
        return Ok(());
    };

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if admin_key.matches(token) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

async fn generate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GenerateKeyRequest>,
) -> Result<Json<IssuedKey>, ApiError> {
    authorize(&state, &headers)?;

    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    Ok(Json(state.store.issue(name).await?))
}

async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ListKeysResponse>, ApiError> {
    authorize(&state, &headers)?;

    let keys = state.store.list().await?;
    Ok(Json(ListKeysResponse { keys }))
}

async fn delete_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<KeySummary>, ApiError> {
    authorize(&state, &headers)?;

    Ok(Json(state.store.revoke(&id).await?))
}
