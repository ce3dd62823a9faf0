pub mod api;
pub mod gateway;
pub mod server;

use crate::relay::service::DispatchHandle;
use crate::relay::types::Detection;
use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicU64;
use tokio::sync::broadcast;

/// Shared by every HTTP and WebSocket handler.
pub struct AppState {
    pub dispatch: DispatchHandle,
    /// Each connected client holds one receiver.
    pub detections: broadcast::Sender<Detection>,
    pub next_client_id: AtomicU64,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(dispatch: DispatchHandle, detections: broadcast::Sender<Detection>) -> Self {
        Self {
            dispatch,
            detections,
            next_client_id: AtomicU64::new(1),
            started_at: Utc::now(),
        }
    }
}
