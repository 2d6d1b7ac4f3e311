use axum::extract::State;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::admission::AdmissionController;
use crate::settings::{APP_NAME, APP_VERSION};

pub async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize, Deserialize)]
pub struct AboutResponse {
    name: String,
    version: String,
    worker_id: u32,
    tracked_clients: usize,
}

#[instrument(skip(state))]
pub async fn about(State(state): State<AdmissionController>) -> axum::Json<AboutResponse> {
    axum::Json(AboutResponse {
        name: APP_NAME.to_string(),
        version: APP_VERSION.to_string(),
        worker_id: state.worker_id().value(),
        tracked_clients: state.store().len(),
    })
}
