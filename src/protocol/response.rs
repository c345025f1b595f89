use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, SET_COOKIE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, Method, StatusCode};

use super::chunked;
use super::embedded::{body_framing, header_map, BodyFraming, MAX_HEADERS};
use crate::error::{Result, TunnelError};

/// An HTTP response with its body fully read and de-chunked
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    /// Reason phrase if one was received.
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Headers describing the hop a response arrived on rather than the message.
const CONNECTION_HEADERS: [HeaderName; 4] = [
    CONNECTION,
    CONTENT_LENGTH,
    TRANSFER_ENCODING,
    HeaderName::from_static("keep-alive"),
];

impl RawResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Decode a complete response as read from a connection that was closed
    /// by the peer.
    ///
    /// `request_method` decides whether a body may follow (responses to
    /// `HEAD` never carry one). Interim `1xx` responses are skipped.
    pub fn decode(buf: &[u8], request_method: &Method) -> Result<Self> {
        let mut rest = buf;
        loop {
            let (head_len, response) = parse_head(rest)?.ok_or(TunnelError::Incomplete)?;
            rest = &rest[head_len..];
            if response.status.is_informational()
                && response.status != StatusCode::SWITCHING_PROTOCOLS
            {
                continue;
            }
            return response.with_body_from(rest, request_method);
        }
    }

    fn with_body_from(mut self, rest: &[u8], request_method: &Method) -> Result<Self> {
        let bodiless = *request_method == Method::HEAD
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED;
        if bodiless {
            return Ok(self);
        }

        self.body = match body_framing(&self.headers)? {
            BodyFraming::Chunked => chunked::decode(rest, usize::MAX)?
                .map(|(body, _)| Bytes::from(body))
                .ok_or(TunnelError::Incomplete)?,
            BodyFraming::Length(n) if rest.len() >= n => Bytes::copy_from_slice(&rest[..n]),
            BodyFraming::Length(_) => return Err(TunnelError::Incomplete),
            // No framing: the body runs until the connection closed.
            BodyFraming::Empty => Bytes::copy_from_slice(rest),
        };
        Ok(self)
    }

    /// Serialize as an HTTP/1.1 response framed by `Content-Length`, to be
    /// written to a connection that is closed afterwards.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.status_line().as_bytes());

        for (name, value) in &self.headers {
            if CONNECTION_HEADERS.contains(name) {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        // A bodiless reply (e.g. to HEAD) keeps the length it advertised.
        match self.headers.get(CONTENT_LENGTH) {
            Some(length) if self.body.is_empty() => {
                out.extend_from_slice(b"content-length: ");
                out.extend_from_slice(length.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            _ => {
                out.extend_from_slice(
                    format!("content-length: {}\r\n", self.body.len()).as_bytes(),
                );
            }
        }
        out.extend_from_slice(b"connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason())
    }

    /// Value of the first `Set-Cookie` entry named `name`.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|value| {
                let pair = value.split(';').next()?;
                let (key, val) = pair.split_once('=')?;
                (key.trim() == name).then(|| val.trim().to_string())
            })
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(usize, RawResponse)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let len = match res.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };
    let code = res
        .code
        .ok_or_else(|| TunnelError::Malformed("missing status code".to_string()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| TunnelError::Malformed(format!("invalid status code {}", code)))?;

    Ok(Some((
        len,
        RawResponse {
            status,
            reason: res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned),
            headers: header_map(res.headers),
            body: Bytes::new(),
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello";
        let res = RawResponse::decode(raw, &Method::GET).unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.reason(), "OK");
        assert_eq!(&res.body[..], b"hello");
        assert_eq!(res.headers.get("x-a").unwrap(), "b");
    }

    #[test]
    fn test_decode_truncated_body_is_incomplete() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello";
        assert!(matches!(
            RawResponse::decode(raw, &Method::GET),
            Err(TunnelError::Incomplete)
        ));
    }

    #[test]
    fn test_decode_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n";
        let res = RawResponse::decode(raw, &Method::GET).unwrap();
        assert_eq!(&res.body[..], b"hi");
    }

    #[test]
    fn test_decode_oversized_chunk_is_malformed() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc";
        assert!(matches!(
            RawResponse::decode(raw, &Method::GET),
            Err(TunnelError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_until_close() {
        let raw = b"HTTP/1.0 200 OK\r\nServer: old\r\n\r\neverything else";
        let res = RawResponse::decode(raw, &Method::GET).unwrap();
        assert_eq!(&res.body[..], b"everything else");
    }

    #[test]
    fn test_decode_bodiless_responses() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n";
        let res = RawResponse::decode(raw, &Method::HEAD).unwrap();
        assert!(res.body.is_empty());

        let raw = b"HTTP/1.1 304 Not Modified\r\n\r\n";
        let res = RawResponse::decode(raw, &Method::GET).unwrap();
        assert_eq!(res.status, StatusCode::NOT_MODIFIED);
        assert!(res.body.is_empty());
    }

    #[test]
    fn test_decode_skips_interim_responses() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
        let res = RawResponse::decode(raw, &Method::POST).unwrap();
        assert_eq!(res.status, StatusCode::CREATED);
        assert_eq!(&res.body[..], b"ok");
    }

    #[test]
    fn test_encode_reframes_body() {
        let raw = b"HTTP/1.1 404 Not Found\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\nX-Id: 9\r\n\r\n4\r\nnope\r\n0\r\n\r\n";
        let res = RawResponse::decode(raw, &Method::GET).unwrap();
        let encoded = String::from_utf8(res.encode()).unwrap();
        assert!(encoded.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(encoded.contains("x-id: 9\r\n"));
        assert!(encoded.contains("content-length: 4\r\n"));
        assert!(encoded.contains("connection: close\r\n"));
        assert!(!encoded.contains("transfer-encoding"));
        assert!(encoded.ends_with("\r\n\r\nnope"));
    }

    #[test]
    fn test_cookie_lookup() {
        let raw = b"HTTP/1.1 200 OK\r\nSet-Cookie: prot=https\r\nSet-Cookie: token=abc-123; Path=/\r\nContent-Length: 0\r\n\r\n";
        let res = RawResponse::decode(raw, &Method::POST).unwrap();
        assert_eq!(res.cookie("token").as_deref(), Some("abc-123"));
        assert_eq!(res.cookie("prot").as_deref(), Some("https"));
        assert_eq!(res.cookie("missing"), None);
    }
}
