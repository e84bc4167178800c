//! Relay server (manager role)
//!
//! An axum router on the relay port. Routes:
//! - `/relay/{name}`: WebSocket, attached to the hub as a follower
//!   (or as a viewer with `?role=viewer`)
//! - `/` and `/{name}`: the viewer page
//! - anything else: 404
//!
//! Path parameters arrive percent-decoded, so they are compared with the
//! session name as is.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::endpoint::{serve_endpoint, EndpointKind};
use super::hub::RelayHub;
use super::socket::{relay_path, SocketEndpoint};
use super::viewer::render_page;

/// Shared state handed to every handler
#[derive(Clone)]
struct RelayState {
    hub: Arc<RelayHub>,
}

impl RelayState {
    fn is_session(&self, name: &str) -> bool {
        self.hub.session().as_str() == name
    }
}

#[derive(Debug, Default, Deserialize)]
struct RelayQuery {
    role: Option<String>,
}

impl RelayQuery {
    fn kind(&self) -> EndpointKind {
        match self.role.as_deref() {
            Some("viewer") => EndpointKind::Viewer,
            _ => EndpointKind::Follower,
        }
    }
}

/// HTTP/WebSocket front of a manager's hub
pub struct RelayServer {
    listener: TcpListener,
    hub: Arc<RelayHub>,
}

impl RelayServer {
    /// Bind the relay listener
    pub async fn bind(addr: SocketAddr, hub: Arc<RelayHub>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::BindFailed { addr, source })?;
        info!(
            addr = %listener.local_addr()?,
            route = %relay_path(hub.session())?,
            "Relay server listening"
        );
        Ok(Self { listener, hub })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve on its own task
    ///
    /// Aborting the returned handle closes the listener. Relay connections
    /// already attached stay up until the hub drops them.
    pub fn spawn(self) -> JoinHandle<()> {
        let app = build_router(self.hub).into_make_service_with_connect_info::<SocketAddr>();
        let listener = self.listener;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Relay server stopped");
            }
        })
    }
}

/// Build the router for one session's hub
fn build_router(hub: Arc<RelayHub>) -> Router {
    Router::new()
        .route("/", get(root_page))
        .route("/{name}", get(named_page))
        .route("/relay/{name}", get(relay_socket))
        .fallback(not_found)
        .with_state(RelayState { hub })
}

// ─────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────

async fn relay_socket(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    Query(query): Query<RelayQuery>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    if !state.is_session(&name) {
        warn!(peer_addr = %peer_addr, session = %name, "Relay request for another session");
        return StatusCode::NOT_FOUND.into_response();
    }

    let kind = query.kind();
    ws.on_upgrade(move |socket| attach_socket(socket, kind, peer_addr, state))
}

async fn attach_socket(socket: WebSocket, kind: EndpointKind, peer_addr: SocketAddr, state: RelayState) {
    let endpoint = SocketEndpoint::new(socket, kind, peer_addr.to_string());
    info!(peer_addr = %peer_addr, kind = %kind, "Relay connection accepted");
    if let Err(e) = serve_endpoint(state.hub, endpoint).await {
        debug!(peer_addr = %peer_addr, error = %e, "Relay connection ended with error");
    }
}

async fn root_page(State(state): State<RelayState>) -> Response {
    page(&state.hub)
}

async fn named_page(Path(name): Path<String>, State(state): State<RelayState>) -> Response {
    if state.is_session(&name) {
        page(&state.hub)
    } else {
        debug!(session = %name, "Page requested for another session");
        StatusCode::NOT_FOUND.into_response()
    }
}

fn page(hub: &RelayHub) -> Response {
    match render_page(hub.session()) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!(error = %e, "Could not render viewer page");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    debug!(path = %uri.path(), "Unknown route");
    (StatusCode::NOT_FOUND, "not found\n")
}
