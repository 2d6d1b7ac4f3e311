use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use tracing::{event, instrument, Level};

use crate::admission::AdmissionController;

/// Fallback handler: every request that reaches it is admitted or rejected
#[instrument(skip_all, level = "debug")]
pub async fn admit(
    State(controller): State<AdmissionController>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let admission = controller.admit(&headers, peer);
    event!(
        Level::DEBUG,
        message = "Admission decided",
        client = admission.id.as_deref().unwrap_or("-"),
        count = admission.count,
        accepted = admission.is_accepted()
    );
    controller.respond(&admission).into_response()
}
