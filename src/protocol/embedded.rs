//! HTTP-in-HTTP framing.
//!
//! The client forwards the local application's request, unmodified, as the
//! body of `POST /connect`. The server decodes it back into an
//! [`EmbeddedRequest`] to decide between opening a tunnel and forwarding a
//! plain request.

use std::str::FromStr;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};

use super::chunked;
use super::MAX_REQUEST_BYTES;
use crate::error::{Result, TunnelError};

pub(super) const MAX_HEADERS: usize = 64;

/// A parsed HTTP/1.x request whose target is always resolvable to a host
#[derive(Debug, Clone)]
pub struct EmbeddedRequest {
    pub method: Method,
    /// Authority-form for `CONNECT`, absolute-form otherwise.
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct Head {
    method: Method,
    target: String,
    headers: HeaderMap,
    len: usize,
}

pub(super) enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
}

impl EmbeddedRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_tunnel(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// `host:port` to dial for this request, inferring the port from the scheme.
    pub fn authority(&self) -> Option<String> {
        let host = self.uri.host()?;
        let port = match self.uri.port_u16() {
            Some(port) => port,
            None if self.uri.scheme_str() == Some("https") => 443,
            None if self.uri.scheme_str() == Some("http") => 80,
            None => return None,
        };
        Some(format!("{}:{}", host, port))
    }

    /// Length of the complete request at the front of `buf`, or `None` if more
    /// bytes are needed.
    pub fn framed_len(buf: &[u8]) -> Result<Option<usize>> {
        let Some(head) = parse_head(buf)? else {
            return Ok(None);
        };
        let rest = &buf[head.len..];
        let len = match body_framing(&head.headers)? {
            BodyFraming::Empty => Some(head.len),
            BodyFraming::Length(n) => (rest.len() >= n).then_some(head.len + n),
            BodyFraming::Chunked => {
                chunked::decode(rest, MAX_REQUEST_BYTES)?.map(|(_, used)| head.len + used)
            }
        };
        Ok(len)
    }

    /// Decode one complete request from `buf`. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let head = parse_head(buf)?.ok_or(TunnelError::Incomplete)?;
        let rest = &buf[head.len..];
        let body = match body_framing(&head.headers)? {
            BodyFraming::Empty => Bytes::new(),
            BodyFraming::Length(n) if rest.len() >= n => Bytes::copy_from_slice(&rest[..n]),
            BodyFraming::Length(_) => return Err(TunnelError::Incomplete),
            BodyFraming::Chunked => chunked::decode(rest, MAX_REQUEST_BYTES)?
                .map(|(body, _)| Bytes::from(body))
                .ok_or(TunnelError::Incomplete)?,
        };
        let uri = resolve_target(&head.method, &head.target, &head.headers)?;

        Ok(Self {
            method: head.method,
            uri,
            headers: head.headers,
            body,
        })
    }

    /// Encode in proxy-relative form: absolute-URI request line, `Host` filled
    /// in when missing and the body framed by `Content-Length`.
    pub fn encode(&self) -> Vec<u8> {
        let target = if self.is_tunnel() {
            self.uri
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_default()
        } else {
            self.uri.to_string()
        };

        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, target).as_bytes());

        if !self.headers.contains_key(HOST) {
            if let Some(authority) = self.uri.authority() {
                out.extend_from_slice(format!("host: {}\r\n", authority).as_bytes());
            }
        }

        for (name, value) in &self.headers {
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        let carries_body = matches!(self.method, Method::POST | Method::PUT | Method::PATCH);
        if carries_body || !self.body.is_empty() {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf)? {
        httparse::Status::Partial => {
            if buf.len() > MAX_REQUEST_BYTES {
                return Err(TunnelError::Malformed("request head too large".to_string()));
            }
            return Ok(None);
        }
        httparse::Status::Complete(len) => len,
    };

    let method = req
        .method
        .ok_or_else(|| TunnelError::Malformed("missing method".to_string()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| TunnelError::Malformed(e.to_string()))?;
    let target = req
        .path
        .ok_or_else(|| TunnelError::Malformed("missing request target".to_string()))?
        .to_string();

    Ok(Some(Head {
        method,
        target,
        headers: header_map(req.headers),
        len,
    }))
}

pub(super) fn header_map(headers: &[httparse::Header<'_>]) -> HeaderMap {
    headers
        .iter()
        .filter_map(|h| {
            let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            let value = HeaderValue::from_bytes(h.value).ok()?;
            Some((name, value))
        })
        .collect()
}

pub(super) fn body_framing(headers: &HeaderMap) -> Result<BodyFraming> {
    let chunked = headers.get_all(TRANSFER_ENCODING).iter().any(|value| {
        value
            .to_str()
            .map(|v| {
                v.rsplit(',')
                    .next()
                    .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    });
    if chunked {
        return Ok(BodyFraming::Chunked);
    }

    match headers.get(CONTENT_LENGTH) {
        None => Ok(BodyFraming::Empty),
        Some(value) => {
            let len = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| TunnelError::Malformed("invalid content-length".to_string()))?;
            if len > MAX_REQUEST_BYTES {
                return Err(TunnelError::Malformed("body too large".to_string()));
            }
            Ok(BodyFraming::Length(len))
        }
    }
}

fn resolve_target(method: &Method, target: &str, headers: &HeaderMap) -> Result<Uri> {
    let malformed = |what: &str| TunnelError::Malformed(format!("{}: {}", what, target));

    if *method == Method::CONNECT {
        let uri = Uri::from_str(target).map_err(|_| malformed("invalid CONNECT target"))?;
        if uri.scheme().is_some() || uri.host().is_none() || uri.port_u16().is_none() {
            return Err(malformed("CONNECT target must be host:port"));
        }
        return Ok(uri);
    }

    if target.starts_with('/') {
        // Origin-form: the Host header names the destination.
        let host = headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| malformed("origin-form request without Host"))?;
        return Uri::builder()
            .scheme("http")
            .authority(host)
            .path_and_query(target)
            .build()
            .map_err(|_| malformed("invalid Host for origin-form request"));
    }

    let uri = Uri::from_str(target).map_err(|_| malformed("invalid request target"))?;
    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(malformed("request target must be absolute"));
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_connect() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let req = EmbeddedRequest::decode(raw).unwrap();
        assert!(req.is_tunnel());
        assert_eq!(req.authority().as_deref(), Some("example.com:443"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_decode_connect_requires_port() {
        let raw = b"CONNECT example.com HTTP/1.1\r\n\r\n";
        assert!(matches!(
            EmbeddedRequest::decode(raw),
            Err(TunnelError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_absolute_get_infers_port() {
        let raw = b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let req = EmbeddedRequest::decode(raw).unwrap();
        assert!(!req.is_tunnel());
        assert_eq!(req.uri.path(), "/index.html");
        assert_eq!(req.authority().as_deref(), Some("example.com:80"));
    }

    #[test]
    fn test_decode_origin_form_uses_host_header() {
        let raw = b"GET /status?x=1 HTTP/1.1\r\nHost: 127.0.0.1:9000\r\n\r\n";
        let req = EmbeddedRequest::decode(raw).unwrap();
        assert_eq!(req.uri.to_string(), "http://127.0.0.1:9000/status?x=1");

        let raw = b"GET /status HTTP/1.1\r\n\r\n";
        assert!(EmbeddedRequest::decode(raw).is_err());
    }

    #[test]
    fn test_decode_body_by_content_length() {
        let raw = b"POST http://example.com/ HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloEXTRA";
        let req = EmbeddedRequest::decode(raw).unwrap();
        assert_eq!(&req.body[..], b"hello");

        let short = b"POST http://example.com/ HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel";
        assert!(matches!(
            EmbeddedRequest::decode(short),
            Err(TunnelError::Incomplete)
        ));
    }

    #[test]
    fn test_decode_chunked_body() {
        let raw = b"POST http://example.com/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n0\r\n\r\n";
        let req = EmbeddedRequest::decode(raw).unwrap();
        assert_eq!(&req.body[..], b"wiki");
    }

    #[test]
    fn test_oversized_chunk_is_malformed() {
        let raw = b"POST http://x/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\nzz";
        assert!(matches!(
            EmbeddedRequest::framed_len(raw),
            Err(TunnelError::Malformed(_))
        ));
        assert!(matches!(
            EmbeddedRequest::decode(raw),
            Err(TunnelError::Malformed(_))
        ));
    }

    #[test]
    fn test_framed_len() {
        let head = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n";
        assert_eq!(EmbeddedRequest::framed_len(head).unwrap(), None);

        let full = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n\x16\x03";
        assert_eq!(
            EmbeddedRequest::framed_len(full).unwrap(),
            Some(full.len() - 2)
        );

        let post = b"POST http://example.com/ HTTP/1.1\r\nContent-Length: 4\r\n\r\nab";
        assert_eq!(EmbeddedRequest::framed_len(post).unwrap(), None);
        let post = b"POST http://example.com/ HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd";
        assert_eq!(EmbeddedRequest::framed_len(post).unwrap(), Some(post.len()));
    }

    #[test]
    fn test_encode_is_absolute_form() {
        let req = EmbeddedRequest::new(Method::POST, Uri::from_static("http://relay:8080/poll?id=abc"))
            .with_body(&b"data"[..]);
        let encoded = String::from_utf8(req.encode()).unwrap();
        assert!(encoded.starts_with("POST http://relay:8080/poll?id=abc HTTP/1.1\r\n"));
        assert!(encoded.contains("host: relay:8080\r\n"));
        assert!(encoded.contains("content-length: 4\r\n"));
        assert!(encoded.ends_with("\r\n\r\ndata"));
    }

    #[test]
    fn test_encode_then_decode_keeps_request() {
        let raw = b"PUT http://example.com/upload HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\nX-Trace: 7\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let req = EmbeddedRequest::decode(raw).unwrap();
        let again = EmbeddedRequest::decode(&req.encode()).unwrap();
        assert_eq!(again.method, Method::PUT);
        assert_eq!(again.uri, req.uri);
        assert_eq!(&again.body[..], b"abc");
        assert_eq!(again.headers.get("x-trace").unwrap(), "7");
        assert!(again.headers.get(TRANSFER_ENCODING).is_none());
    }
}
