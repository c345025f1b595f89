//! Outbound HTTP for both endpoints.
//!
//! [`RelayTransport`] sends an [`EmbeddedRequest`] either straight to its
//! destination or through an upstream forward proxy that only speaks framed
//! HTTP. In the latter case the request is written in absolute-URI form on a
//! fresh connection and the raw response is read until the proxy closes it.

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::protocol::{EmbeddedRequest, RawResponse};

pub struct RelayTransport {
    forward_proxy: Option<String>,
    client: Client,
    timeout: Duration,
}

impl RelayTransport {
    pub fn new(forward_proxy: Option<String>, timeout: Duration) -> Result<Self> {
        // Environment proxies are ignored: routing is decided by `forward_proxy` only.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .no_proxy()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            forward_proxy: forward_proxy.filter(|p| !p.is_empty()),
            client,
            timeout,
        })
    }

    pub fn forward_proxy(&self) -> Option<&str> {
        self.forward_proxy.as_deref()
    }

    /// Send `request` and wait for the complete response
    pub async fn send(&self, request: &EmbeddedRequest) -> Result<RawResponse> {
        match &self.forward_proxy {
            Some(proxy) => {
                tokio::time::timeout(self.timeout, self.send_via_proxy(proxy, request))
                    .await
                    .map_err(|_| TunnelError::Timeout(self.timeout))?
            }
            None => self.send_direct(request).await,
        }
    }

    async fn send_direct(&self, request: &EmbeddedRequest) -> Result<RawResponse> {
        let url = request.uri.to_string();
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(end_to_end_headers(&request.headers));

        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = end_to_end_headers(response.headers());
        let body = response.bytes().await?;

        debug!("{} {} -> {} ({} bytes)", request.method, url, status, body.len());

        let mut raw = RawResponse::new(status);
        raw.headers = headers;
        raw.body = body;
        Ok(raw)
    }

    async fn send_via_proxy(&self, proxy: &str, request: &EmbeddedRequest) -> Result<RawResponse> {
        let mut stream = TcpStream::connect(proxy)
            .await
            .map_err(|source| TunnelError::Dial {
                addr: proxy.to_string(),
                source,
            })?;

        let mut framed = request.clone();
        framed
            .headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
        framed.headers.insert(
            HeaderName::from_static("proxy-connection"),
            HeaderValue::from_static("close"),
        );
        stream.write_all(&framed.encode()).await?;
        stream.flush().await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;

        let response = RawResponse::decode(&raw, &request.method)?;
        debug!(
            "{} {} via {} -> {} ({} bytes)",
            request.method,
            request.uri,
            proxy,
            response.status,
            response.body.len()
        );
        Ok(response)
    }
}

/// Copy of `headers` without hop-by-hop fields and framing the client recomputes
fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let skip = matches!(
            name.as_str(),
            "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "proxy-connection"
                | "te"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
                | "content-length"
        ) || name == HOST;
        if !skip {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Body of a response, or a transport error when the status is not `200 OK`
pub fn expect_ok(response: RawResponse) -> Result<Bytes> {
    if response.status == http::StatusCode::OK {
        Ok(response.body)
    } else {
        Err(TunnelError::Status(response.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode, Uri};
    use tokio::net::TcpListener;

    fn transport(proxy: Option<String>) -> RelayTransport {
        RelayTransport::new(proxy, Duration::from_secs(5)).unwrap()
    }

    /// One-shot HTTP server that answers every connection with `response`
    /// after reading the request head.
    async fn spawn_fixed_server(response: &'static [u8]) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                if n == 0 || EmbeddedRequest::framed_len(&received).unwrap().is_some() {
                    break;
                }
            }
            stream.write_all(response).await.unwrap();
            stream.shutdown().await.unwrap();
            received
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_send_direct() {
        let (addr, server) =
            spawn_fixed_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Origin: yes\r\n\r\nhi")
                .await;

        let uri: Uri = format!("http://{}/hello", addr).parse().unwrap();
        let request = EmbeddedRequest::new(Method::GET, uri);
        let response = transport(None).send(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"hi");
        assert_eq!(response.headers.get("x-origin").unwrap(), "yes");

        let received = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(received.starts_with("GET /hello HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_send_via_proxy_uses_absolute_form() {
        let (proxy, server) = spawn_fixed_server(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        )
        .await;

        let uri = Uri::from_static("http://relay.invalid:8080/poll?id=xyz");
        let request = EmbeddedRequest::new(Method::POST, uri).with_body(&b"push"[..]);
        let transport = transport(Some(proxy));
        assert!(transport.forward_proxy().is_some());

        let response = transport.send(&request).await.unwrap();
        assert_eq!(&response.body[..], b"abc");

        let received = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(received.starts_with("POST http://relay.invalid:8080/poll?id=xyz HTTP/1.1\r\n"));
        assert!(received.contains("connection: close\r\n"));
        assert!(received.ends_with("\r\n\r\npush"));
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let request =
            EmbeddedRequest::new(Method::GET, Uri::from_static("http://example.invalid/"));
        let err = transport(Some(addr)).send(&request).await.unwrap_err();
        assert!(matches!(err, TunnelError::Dial { .. }));
        assert!(err.is_transport());
    }

    #[test]
    fn test_end_to_end_headers_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));

        let filtered = end_to_end_headers(&headers);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn test_expect_ok() {
        let mut response = RawResponse::new(StatusCode::OK);
        response.body = Bytes::from_static(b"x");
        assert_eq!(&expect_ok(response).unwrap()[..], b"x");

        let gone = RawResponse::new(StatusCode::GONE);
        assert!(matches!(
            expect_ok(gone),
            Err(TunnelError::Status(StatusCode::GONE))
        ));
    }
}
