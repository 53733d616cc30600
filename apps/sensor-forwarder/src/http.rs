use crate::delivery::DeliveryStatus;
use crate::spool;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::watch;

#[derive(Clone)]
pub struct HttpState {
    pub status: watch::Receiver<DeliveryStatus>,
    pub spool_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    delivery: DeliveryStatus,
    spool_free_bytes: Option<u64>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    let delivery = state.status.borrow().clone();
    let spool_free_bytes = match spool::free_bytes(&state.spool_dir) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::debug!(error=%err, "statvfs failed for spool dir");
            None
        }
    };
    Json(StatusResponse {
        delivery,
        spool_free_bytes,
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(state)
}
