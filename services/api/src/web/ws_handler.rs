//! services/api/src/web/ws_handler.rs
//!
//! Entry point for a live interview connection. The join token is verified
//! before the upgrade, so an invalid token never gets a WebSocket.

use crate::web::protocol::MAX_FRAME_BYTES;
use crate::web::rest::port_error_response;
use crate::web::state::AppState;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Deserialize, Debug)]
pub struct JoinParams {
    pub token: String,
}

pub async fn join_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<JoinParams>,
) -> Result<Response, (StatusCode, String)> {
    let session = app_state
        .interviews
        .join(&params.token)
        .await
        .map_err(port_error_response)?;

    let failed_state = app_state.clone();
    let failed_session = session.clone();
    let response = ws
        .max_message_size(MAX_FRAME_BYTES)
        .on_failed_upgrade(move |err| {
            error!(interview_id = failed_session.interview_id, error = %err, "websocket upgrade failed");
            // Leave the interview resumable.
            tokio::spawn(async move {
                if let Err(err) = failed_state.interviews.pause_ongoing_session(&failed_session).await {
                    error!(interview_id = failed_session.interview_id, error = %err, "failed to pause the interview");
                }
            });
        })
        .on_upgrade(move |socket| async move {
            info!(interview_id = session.interview_id, "websocket connection established");
            let (sink, stream) = socket.split();
            app_state
                .gateway
                .run(session, sink, stream, app_state.shutdown.clone())
                .await;
        });
    Ok(response)
}
