//! Wire types shared by the emulator and the worker runtime.
//!
//! Requests and responses are HTTP-shaped. Bodies travel as strings; a body
//! that is not valid UTF-8 is base64-encoded and flagged.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An inbound request handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// HTTP method.
    pub method: String,

    /// Path and query string.
    pub url: String,

    /// Request headers (repeated headers joined with `, `).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Request body.
    #[serde(default)]
    pub body: String,

    /// Whether `body` is base64-encoded.
    #[serde(default)]
    pub is_base64_encoded: bool,
}

impl Invocation {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: String::new(),
            is_base64_encoded: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the body from raw bytes.
    pub fn with_body_bytes(mut self, bytes: &[u8]) -> Self {
        (self.body, self.is_base64_encoded) = encode_body(bytes);
        self
    }

    /// Raw body bytes.
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        decode_body(&self.body, self.is_base64_encoded)
    }
}

/// A worker's answer to an [`Invocation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    /// HTTP status code.
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Response body.
    #[serde(default)]
    pub body: String,

    /// Whether `body` is base64-encoded.
    #[serde(default)]
    pub is_base64_encoded: bool,
}

fn default_status() -> u16 {
    200
}

impl InvocationResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: String::new(),
            is_base64_encoded: false,
        }
    }

    /// Plain-text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self.is_base64_encoded = false;
        self
    }

    pub fn with_body_bytes(mut self, bytes: &[u8]) -> Self {
        (self.body, self.is_base64_encoded) = encode_body(bytes);
        self
    }

    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        decode_body(&self.body, self.is_base64_encoded)
    }
}

/// What a worker's poll resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A request to execute.
    Work(Invocation),
    /// Nothing arrived before the poll timeout; poll again.
    NoWork,
    /// The worker runs stale code and must stop.
    VersionMismatch,
    /// The pool no longer knows this worker (evicted or removed); stop.
    Retired,
    /// A newer poll from the same worker replaced this one.
    Superseded,
}

/// What happened to a pushed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The result resolved the worker's bound request.
    Completed,
    /// Nothing was bound to the worker; the push was dropped.
    Ignored,
}

fn encode_body(bytes: &[u8]) -> (String, bool) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), false),
        Err(_) => (STANDARD.encode(bytes), true),
    }
}

fn decode_body(body: &str, is_base64_encoded: bool) -> Result<Vec<u8>, base64::DecodeError> {
    if is_base64_encoded {
        STANDARD.decode(body)
    } else {
        Ok(body.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_body_is_base64_encoded() {
        let bytes = [0xff_u8, 0x00, 0x10];
        let invocation = Invocation::new("POST", "/upload").with_body_bytes(&bytes);
        assert!(invocation.is_base64_encoded);
        assert_eq!(invocation.body_bytes().unwrap(), bytes);

        let invocation = Invocation::new("POST", "/echo").with_body_bytes(b"hello");
        assert!(!invocation.is_base64_encoded);
        assert_eq!(invocation.body, "hello");
    }

    #[test]
    fn test_invocation_wire_format() {
        let invocation = Invocation::new("GET", "/items?page=2").with_header("accept", "*/*");
        let json = serde_json::to_value(&invocation).unwrap();
        assert_eq!(json["method"], "GET");
        assert_eq!(json["url"], "/items?page=2");
        assert_eq!(json["headers"]["accept"], "*/*");
        assert_eq!(json["isBase64Encoded"], false);
    }

    #[test]
    fn test_response_defaults() {
        let response: InvocationResponse = serde_json::from_str(r#"{"body": "ok"}"#).unwrap();
        assert_eq!(response.status, 200);
        assert!(response.headers.is_empty());
        assert_eq!(response.body, "ok");
    }
}
