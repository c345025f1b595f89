//! HTTP Basic credentials shared by the client and the relay.

use base64::Engine;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue};

use crate::error::{Result, TunnelError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic <base64(user:pass)>`
    pub fn authorization(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    pub fn header_value(&self) -> Result<HeaderValue> {
        HeaderValue::from_str(&self.authorization())
            .map_err(|e| TunnelError::Malformed(format!("invalid credentials: {}", e)))
    }

    /// Check the `Authorization` header of an incoming request
    pub fn verify(&self, headers: &HeaderMap) -> bool {
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == self.authorization())
    }
}
