//! Relay server implementation.
//!
//! This module provides the server half of the tunnel:
//! - [`SessionPool`] - registry of live tunneled TCP connections
//! - [`Session`] - one remote connection with its reader task and poll backoff
//! - the `/connect`, `/poll` and `/disconnect` HTTP endpoints

mod handlers;
mod pool;
mod session;

pub use pool::SessionPool;
pub use session::{PollOutcome, PollSettings, Session};

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::{middleware, Router};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::auth::Credentials;
use crate::error::Result;
use crate::protocol::{
    CONNECT_PATH, DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT, DEFAULT_PROXY_AGENT,
    DEFAULT_REQUEST_TIMEOUT, DISCONNECT_PATH, MAX_REQUEST_BYTES, POLL_PATH,
};
use crate::transport::RelayTransport;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Read size for remote sockets
    pub buffer_size: usize,
    pub poll: PollSettings,
    /// Advertised in the connection-established line
    pub proxy_agent: String,
    /// Bound on dialing targets and on passthrough requests
    pub request_timeout: Duration,
    /// Sessions the client stops polling are dropped after this long
    pub idle_timeout: Duration,
    pub auth: Option<Credentials>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll: PollSettings::default(),
            proxy_agent: DEFAULT_PROXY_AGENT.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            auth: None,
        }
    }
}

/// Shared state for the relay handlers
pub struct RelayState {
    pub pool: SessionPool,
    pub transport: RelayTransport,
    pub settings: ServerSettings,
}

impl RelayState {
    pub fn new(transport: RelayTransport, settings: ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            pool: SessionPool::new(),
            transport,
            settings,
        })
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route(CONNECT_PATH, post(handlers::connect))
        .route(POLL_PATH, post(handlers::poll))
        .route(DISCONNECT_PATH, post(handlers::disconnect))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_auth,
        ))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(state)
}

/// Serve the relay endpoints until the listener fails
pub async fn serve(listener: TcpListener, state: Arc<RelayState>) -> Result<()> {
    info!(
        "Relay listening on {} (forward proxy: {})",
        listener.local_addr()?,
        state.transport.forward_proxy().unwrap_or("none")
    );
    let sweep = tokio::spawn(sweep_idle(state.clone()));
    let served = axum::serve(listener, router(state)).await;
    sweep.abort();
    served?;
    Ok(())
}

/// Periodically drop sessions whose client went away without disconnecting
pub async fn sweep_idle(state: Arc<RelayState>) {
    let max_idle = state.settings.idle_timeout;
    let period = (max_idle / 4).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let removed = state.pool.remove_idle(max_idle).await;
        for id in &removed {
            info!("Session {} dropped after {:?} without a poll", id, max_idle);
        }
        if !removed.is_empty() {
            debug!("{} sessions still active", state.pool.len().await);
        }
    }
}
