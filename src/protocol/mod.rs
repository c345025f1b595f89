//! Wire protocol shared by the client and server endpoints.
//!
//! The tunnel speaks plain HTTP/1.1 between the two halves:
//! - [`EmbeddedRequest`] - an HTTP request carried as the body of a `POST /connect`
//! - [`RawResponse`] - an HTTP response read back from a byte stream
//! - [`SessionId`] - the bearer token naming one tunneled TCP connection

mod chunked;
mod embedded;
mod ids;
mod response;

pub use embedded::*;
pub use ids::*;
pub use response::*;

use std::time::Duration;

pub const CONNECT_PATH: &str = "/connect";
pub const POLL_PATH: &str = "/poll";
pub const DISCONNECT_PATH: &str = "/disconnect";

/// Cookie carrying the session id on a successful `CONNECT`.
pub const SESSION_COOKIE: &str = "token";
/// Cookie naming the kind of exchange (`https` tunnel or `http` passthrough).
pub const PROTOCOL_COOKIE: &str = "prot";

/// Default `Proxy-agent` advertised in the connection-established line.
pub const DEFAULT_PROXY_AGENT: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_POLL_MIN: Duration = Duration::from_millis(100);
pub const DEFAULT_POLL_MAX: Duration = Duration::from_millis(3000);
/// Client-side wait between empty polls while the local side is quiet.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Sessions with no push or poll for this long are dropped by the relay.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest request head or body we are willing to buffer from a local client.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Body returned for a tunnel-establishing `CONNECT`.
///
/// This is forwarded verbatim to the local application, which takes it as the
/// acknowledgement of its own `CONNECT`.
pub fn connection_established(proxy_agent: &str) -> String {
    format!(
        "HTTP/1.0 200 Connection established\r\nProxy-agent: {}\r\n\r\n",
        proxy_agent
    )
}
