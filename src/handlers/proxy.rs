use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use tracing::instrument;

use crate::middleware::{TrustedHop, resolve_client_ip};
use crate::state::AppState;

/// Catch-all handler: everything that is not a gateway-owned endpoint goes
/// through the pipeline.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn proxy(State(state): State<AppState>, mut request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = resolve_client_ip(request.headers(), peer, &state.trusted_proxies);
    if let Some(hop) = TrustedHop::from_peer(peer, &state.trusted_proxies) {
        request.extensions_mut().insert(hop);
    }

    state.gateway.dispatch(request, &client_ip).await
}
