use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::AUTHORIZATION;
use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::transfer;
use crate::auth::Credentials;
use crate::error::{Result, TunnelError};
use crate::protocol::{
    EmbeddedRequest, RawResponse, SessionId, CONNECT_PATH, DEFAULT_BUFFER_SIZE,
    DEFAULT_POLL_INTERVAL, DISCONNECT_PATH, MAX_REQUEST_BYTES, POLL_PATH, SESSION_COOKIE,
};
use crate::transport::{expect_ok, RelayTransport};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Read size for local sockets
    pub buffer_size: usize,
    pub poll_interval: Duration,
    pub auth: Option<Credentials>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            auth: None,
        }
    }
}

/// One complete request read from a local application
struct LocalRequest {
    /// Exactly the bytes the application sent, forwarded as-is
    raw: Bytes,
    request: EmbeddedRequest,
    /// Bytes that arrived after the request, pushed first in relay mode
    leftover: Bytes,
}

pub struct TunnelClient {
    server: Url,
    transport: RelayTransport,
    settings: ClientSettings,
}

impl TunnelClient {
    pub fn new(server: &str, transport: RelayTransport, settings: ClientSettings) -> Result<Self> {
        Ok(Self {
            server: Url::parse(server)?,
            transport,
            settings,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Accept local connections until the listener is dropped
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            "Proxy listening on {} -> {} (forward proxy: {})",
            listener.local_addr()?,
            self.server,
            self.transport.forward_proxy().unwrap_or("none")
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let client = self.clone();
            tokio::spawn(async move {
                debug!("Accepted connection from {}", peer);
                match client.handle_connection(stream).await {
                    Ok(()) => debug!("Connection from {} finished", peer),
                    Err(e) if e.is_transport() => warn!("Connection from {}: {}", peer, e),
                    Err(e) => error!("Connection from {}: {}", peer, e),
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let Some(local) = read_request(&mut stream, self.settings.buffer_size).await? else {
            return Ok(());
        };
        let tunnel = local.request.is_tunnel();
        info!("{} {}", local.request.method, local.request.uri);

        let response = match self.call(CONNECT_PATH, None, local.raw).await {
            Ok(response) => response,
            Err(e) => {
                if !tunnel {
                    write_status(&mut stream, StatusCode::BAD_GATEWAY).await;
                }
                return Err(e);
            }
        };

        if response.status != StatusCode::OK {
            warn!(
                "Relay refused {} {}: {}",
                local.request.method, local.request.uri, response.status
            );
            if !tunnel {
                write_status(&mut stream, response.status).await;
            }
            return Ok(());
        }

        stream.write_all(&response.body).await?;

        match response.cookie(SESSION_COOKIE) {
            Some(token) => {
                let id = SessionId::from(token);
                info!("Tunnel {} open to {}", id, local.request.uri);
                transfer::relay(self, stream, id, local.leftover).await;
                Ok(())
            }
            None => {
                stream.shutdown().await?;
                Ok(())
            }
        }
    }

    /// Push `data` (possibly empty) and return whatever the relay had buffered
    pub(super) async fn poll(&self, id: &SessionId, data: Bytes) -> Result<Bytes> {
        expect_ok(self.call(POLL_PATH, Some(id), data).await?)
    }

    /// Best-effort teardown of the relay-side session
    pub(super) async fn disconnect(&self, id: &SessionId) {
        match self.call(DISCONNECT_PATH, Some(id), Bytes::new()).await {
            Ok(_) => debug!("Tunnel {} disconnected", id),
            Err(e) => debug!("Disconnect for {} failed: {}", id, e),
        }
    }

    async fn call(&self, path: &str, id: Option<&SessionId>, body: Bytes) -> Result<RawResponse> {
        let mut request = EmbeddedRequest::new(Method::POST, self.endpoint(path, id)?).with_body(body);
        if let Some(credentials) = &self.settings.auth {
            request = request.with_header(AUTHORIZATION, credentials.header_value()?);
        }
        self.transport.send(&request).await
    }

    fn endpoint(&self, path: &str, id: Option<&SessionId>) -> Result<Uri> {
        let mut url = self.server.join(path.trim_start_matches('/'))?;
        if let Some(id) = id {
            url.query_pairs_mut().append_pair("id", id.as_str());
        }
        url.as_str()
            .parse()
            .map_err(|e: http::uri::InvalidUri| TunnelError::Malformed(e.to_string()))
    }
}

/// Read one framed request. `None` when the peer closed before sending anything.
async fn read_request<R>(reader: &mut R, buffer_size: usize) -> Result<Option<LocalRequest>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        if let Some(len) = EmbeddedRequest::framed_len(&buf)? {
            let raw = buf.split_to(len).freeze();
            let request = EmbeddedRequest::decode(&raw)?;
            return Ok(Some(LocalRequest {
                raw,
                request,
                leftover: buf.freeze(),
            }));
        }
        if buf.len() >= MAX_REQUEST_BYTES {
            return Err(TunnelError::Malformed(format!(
                "request exceeds {} bytes",
                MAX_REQUEST_BYTES
            )));
        }

        buf.reserve(buffer_size.max(1));
        if reader.read_buf(&mut buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(TunnelError::Incomplete)
            };
        }
    }
}

async fn write_status(stream: &mut TcpStream, status: StatusCode) {
    let response = format!(
        "HTTP/1.1 {} {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("Failed to report {} to local client: {}", status, e);
    }
    let _ = stream.shutdown().await;
}
