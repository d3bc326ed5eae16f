//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints.

use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Json},
    Extension,
};
use interview_core::domain::UserId;
use interview_core::ports::PortError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

pub const INTERVIEW_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-interview-token");

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    status: &'static str,
    broker: String,
}

#[derive(Deserialize, Debug)]
pub struct SetUpRequest {
    pub question: String,
}

/// Maps a port failure onto the HTTP status a client should see.
pub fn port_error_response(err: PortError) -> (StatusCode, String) {
    let status = match &err {
        PortError::NotFound(_) => StatusCode::NOT_FOUND,
        PortError::Unauthorized => StatusCode::UNAUTHORIZED,
        PortError::BadRequest(_) => StatusCode::BAD_REQUEST,
        PortError::Unavailable(_) | PortError::Timeout(_) | PortError::Shutdown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PortError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
        (status, "internal server error".to_string())
    } else {
        warn!(error = %err, "request rejected");
        (status, err.to_string())
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

pub async fn health_handler(State(app_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", broker: app_state.broker.state().to_string() })
}

/// Sets up a new interview, or a resumption of the caller's paused one.
///
/// The join token comes back in the `X-Interview-Token` header.
pub async fn set_up_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    Json(payload): Json<SetUpRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let token = app_state
        .interviews
        .set_up(user_id, &payload.question)
        .await
        .map_err(port_error_response)?;
    Ok((StatusCode::OK, [(INTERVIEW_TOKEN_HEADER, token)]))
}

pub async fn abandon_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    app_state
        .interviews
        .abandon_unfinished(user_id)
        .await
        .map_err(port_error_response)?;
    Ok(StatusCode::OK)
}

/// Serves a stored interviewer audio clip.
pub async fn audio_handler(
    State(app_state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let audio = app_state
        .audio
        .fetch(&key)
        .await
        .map_err(port_error_response)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no audio named '{}'", key)))?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], audio))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_not_leaked() {
        let (status, body) = port_error_response(PortError::Unexpected("db password wrong".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "internal server error");

        let (status, body) = port_error_response(PortError::BadRequest("question must not be empty".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("question must not be empty"));
    }
}
