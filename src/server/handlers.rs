use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::header::{SET_COOKIE, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{AppendHeaders, IntoResponse, Response};
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::{PollOutcome, RelayState, Session};
use crate::protocol::{
    connection_established, EmbeddedRequest, SessionId, PROTOCOL_COOKIE, SESSION_COOKIE,
};

/// `?id=<token>`; older clients send `?token=<token>`
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(alias = "token")]
    id: Option<String>,
}

impl SessionQuery {
    fn session_id(self) -> Option<SessionId> {
        self.id.filter(|id| !id.is_empty()).map(SessionId::from)
    }
}

fn cookie(name: &str, value: &str) -> String {
    format!("{}={}; Path=/", name, value)
}

pub async fn require_auth(
    State(state): State<Arc<RelayState>>,
    request: Request,
    next: Next,
) -> Response {
    match &state.settings.auth {
        Some(credentials) if !credentials.verify(request.headers()) => {
            warn!("Rejecting unauthenticated {} {}", request.method(), request.uri());
            (
                StatusCode::UNAUTHORIZED,
                [(WWW_AUTHENTICATE, "Basic realm=\"sluice\"")],
            )
                .into_response()
        }
        _ => next.run(request).await,
    }
}

/// `POST /connect`: body is the local application's raw HTTP request
pub async fn connect(State(state): State<Arc<RelayState>>, body: Bytes) -> Response {
    let request = match EmbeddedRequest::decode(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting connect request: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if request.is_tunnel() {
        open_tunnel(&state, &request).await
    } else {
        forward(&state, &request).await
    }
}

async fn open_tunnel(state: &RelayState, request: &EmbeddedRequest) -> Response {
    let Some(host) = request.authority() else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let timeout = state.settings.request_timeout;
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&host)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Failed to connect to {}: {}", host, e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        Err(_) => {
            warn!("Timed out connecting to {} after {:?}", host, timeout);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let id = SessionId::generate();
    let session = Session::spawn(
        id.clone(),
        host.clone(),
        stream,
        state.settings.buffer_size,
        state.settings.poll,
    );
    if let Err(e) = state.pool.add(session).await {
        error!("Failed to register session for {}: {}", host, e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    info!(
        "Session {} opened to {} ({} active)",
        id,
        host,
        state.pool.len().await
    );

    (
        StatusCode::OK,
        AppendHeaders([
            (SET_COOKIE, cookie(SESSION_COOKIE, id.as_str())),
            (SET_COOKIE, cookie(PROTOCOL_COOKIE, "https")),
        ]),
        connection_established(&state.settings.proxy_agent),
    )
        .into_response()
}

async fn forward(state: &RelayState, request: &EmbeddedRequest) -> Response {
    match state.transport.send(request).await {
        Ok(response) => {
            info!("{} {} -> {}", request.method, request.uri, response.status);
            (
                StatusCode::OK,
                AppendHeaders([(SET_COOKIE, cookie(PROTOCOL_COOKIE, "http"))]),
                response.encode(),
            )
                .into_response()
        }
        Err(e) => {
            warn!("{} {} failed: {}", request.method, request.uri, e);
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

/// `POST /poll?id=<token>`: push the body (if any), then wait for remote bytes.
///
/// Assumes one transfer loop per session on the client; a concurrent second
/// poll waits for the first to finish.
pub async fn poll(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Response {
    let Some(id) = query.session_id() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let Some(session) = state.pool.get(&id).await else {
        debug!("Poll for unknown session {}", id);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    if !body.is_empty() {
        if let Err(e) = session.push(&body).await {
            warn!("Session {} write to {} failed: {}", id, session.host(), e);
            state.pool.remove(&id).await;
            return StatusCode::GONE.into_response();
        }
        debug!("Session {} push {} bytes", id, body.len());
    }

    match session.poll().await {
        PollOutcome::Data(data) => {
            debug!("Session {} poll {} bytes", id, data.len());
            (StatusCode::OK, data).into_response()
        }
        PollOutcome::Idle => {
            debug!("Session {} idle, next wait {:?}", id, session.poll_timeout().await);
            StatusCode::OK.into_response()
        }
        PollOutcome::Closed => {
            info!("Session {} to {} closed by remote", id, session.host());
            state.pool.remove(&id).await;
            StatusCode::GONE.into_response()
        }
    }
}

/// `POST /disconnect?id=<token>`: always succeeds
pub async fn disconnect(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<SessionQuery>,
) -> StatusCode {
    if let Some(id) = query.session_id() {
        if state.pool.remove(&id).await.is_some() {
            info!("Session {} disconnected by client", id);
        }
    }
    StatusCode::OK
}
