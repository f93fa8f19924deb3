//! HTTP signaling endpoint.
//!
//! - `POST /connect_peer`: answer an offer, the remote end of the HTTP initiator
//! - `GET /peer_info`: identity of this node and the nodes it is connected to

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::PeerError;
use crate::initiators::ConnectPeerRequest;
use crate::manager::PeersManager;
use mesh_core::protocol::PROTOCOL_VERSION;

/// Error body returned by the signaling endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfoResponse {
    pub uuid: String,
    pub name: String,
    pub instance_uuid: String,
    pub version: u32,
    pub connected_peers: Vec<String>,
}

pub fn router(manager: Arc<PeersManager>) -> Router {
    Router::new()
        .route("/connect_peer", post(connect_peer))
        .route("/peer_info", get(peer_info))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn connect_peer(
    State(manager): State<Arc<PeersManager>>,
    Json(request): Json<ConnectPeerRequest>,
) -> impl IntoResponse {
    let from = request.peer_uuid.as_deref().unwrap_or("unknown node");
    info!("Received offer from {}", from);

    match manager.accept_offer(&request.description).await {
        Ok(answer) => (StatusCode::OK, Json(answer)).into_response(),
        Err(e) => {
            warn!("Could not answer offer from {}: {}", from, e);
            let status = match e {
                PeerError::ConnectionFailure(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

async fn peer_info(State(manager): State<Arc<PeersManager>>) -> Json<PeerInfoResponse> {
    let local = manager.local();
    Json(PeerInfoResponse {
        uuid: local.uuid.clone(),
        name: local.name.clone(),
        instance_uuid: local.instance_uuid.clone(),
        version: PROTOCOL_VERSION,
        connected_peers: manager
            .connected_peers()
            .iter()
            .map(|peer| peer.uuid())
            .collect(),
    })
}

/// Bind `addr` and serve the signaling endpoint until `shutdown` resolves.
///
/// Returns the bound address and the server task.
pub async fn serve(
    manager: Arc<PeersManager>,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Signaling endpoint listening on http://{}", local_addr);

    let app = router(manager);
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    });
    Ok((local_addr, task))
}
