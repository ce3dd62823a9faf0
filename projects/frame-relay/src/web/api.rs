use crate::error::RelayError;
use crate::relay::types::{RelayStatus, SubmitReceipt};
use crate::web::gateway::validate_tokens;
use crate::web::AppState;
use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

fn status_code(error: &RelayError) -> StatusCode {
    match error {
        RelayError::BadFrame(_) => StatusCode::BAD_REQUEST,
        RelayError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
        RelayError::DispatcherClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RelayStatus>, StatusCode> {
    let dispatch = state
        .dispatch
        .status()
        .await
        .map_err(|e| status_code(&e))?;

    Ok(Json(RelayStatus {
        dispatch,
        connected_clients: state.detections.receiver_count(),
        started_at: state.started_at,
    }))
}

/// Same as a `frame` event over the socket; the result is still broadcast.
pub async fn submit_frame_handler(
    State(state): State<Arc<AppState>>,
    Json(tokens): Json<Vec<String>>,
) -> Result<Json<SubmitReceipt>, (StatusCode, String)> {
    let submitted = match validate_tokens(&tokens) {
        Ok(()) => state.dispatch.submit(tokens).await,
        Err(e) => Err(e),
    };

    match submitted {
        Ok(receipt) => Ok(Json(receipt)),
        Err(e) => {
            tracing::warn!("Frame rejected over HTTP: {}", e);
            Err((status_code(&e), e.to_string()))
        }
    }
}
