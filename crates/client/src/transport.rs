//! Request/response seam between the table client and the service.
//!
//! Transports map failures onto the shared taxonomy:
//! - missing table/schema/blob → [`KtableError::NotFound`]
//! - connection failures and 5xx → [`KtableError::Transport`]
//! - any other rejection → [`KtableError::Server`]

use std::fmt;

use ktable_common::{KtableError, Result};
use serde_json::Value;

/// Logical service operations, all POSTed under `/api/table/v2/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Create,
    Schema,
    DeleteSchema,
    Drop,
    Select,
    Insert,
    Replace,
    Begin,
    Commit,
    Rollback,
    BigUpload,
    BigDownload,
}

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Endpoint::Create => "create",
            Endpoint::Schema => "schema",
            Endpoint::DeleteSchema => "delete_schema",
            Endpoint::Drop => "drop",
            Endpoint::Select => "select",
            Endpoint::Insert => "insert",
            Endpoint::Replace => "replace",
            Endpoint::Begin => "begin",
            Endpoint::Commit => "commit",
            Endpoint::Rollback => "rollback",
            Endpoint::BigUpload => "big_upload",
            Endpoint::BigDownload => "big_download",
        }
    }

    pub fn path(self) -> String {
        format!("/api/table/v2/{}", self.name())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(Value),
    /// Raw bytes: a framed batch stream or blob content.
    Bytes(Vec<u8>),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Json(v) => v.to_string().len(),
            Body::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub endpoint: Endpoint,
    pub params: Vec<(String, String)>,
    pub body: Body,
}

impl Request {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            params: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn bytes(mut self, bytes: Vec<u8>) -> Self {
        self.body = Body::Bytes(bytes);
        self
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Lazily produced response body chunks.
pub type ByteChunks = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

pub trait Transport: Send + Sync {
    /// Sends `req` and buffers the whole response body.
    fn call(&self, req: &Request) -> Result<Vec<u8>>;

    /// Sends `req` and returns the response body as it arrives.
    fn stream(&self, req: &Request) -> Result<ByteChunks> {
        let bytes = self.call(req)?;
        Ok(Box::new(std::iter::once(Ok(bytes))))
    }
}

/// Decodes a JSON response body, treating an empty body as `null`.
pub fn json_response(endpoint: Endpoint, bytes: &[u8]) -> Result<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| {
        KtableError::Server(format!("invalid JSON response from {endpoint}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{json_response, Body, Endpoint, Request};

    #[test]
    fn endpoint_paths() {
        assert_eq!(Endpoint::BigDownload.path(), "/api/table/v2/big_download");
        assert_eq!(Endpoint::DeleteSchema.to_string(), "delete_schema");
    }

    #[test]
    fn request_builder_and_lookup() {
        let req = Request::new(Endpoint::Select)
            .param("table_id", "t1")
            .param("tx_id", "x")
            .json(json!({"query": null}));
        assert_eq!(req.param_value("table_id"), Some("t1"));
        assert_eq!(req.param_value("big_id"), None);
        assert!(matches!(req.body, Body::Json(_)));
    }

    #[test]
    fn empty_json_body_is_null() {
        assert_eq!(json_response(Endpoint::Commit, b"").expect("empty"), json!(null));
        assert_eq!(
            json_response(Endpoint::Begin, br#"{"tx_id":"a"}"#).expect("json"),
            json!({"tx_id": "a"})
        );
        assert!(json_response(Endpoint::Begin, b"<html>").is_err());
    }
}
