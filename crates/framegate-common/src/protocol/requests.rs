//! Framegate Request Payload
//!
//! The request side of the worker wire protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An HTTP request as handed to an interpreter worker.
///
/// # Request Flow
///
/// 1. The HTTP front builds a `RequestPayload` from the incoming request
/// 2. The payload is serialized to JSON and framed onto the worker's stdin
/// 3. The worker answers with a response frame (or stream frames) on stdout
///
/// # Fields
///
/// - `id`: opaque identifier, unique per request
/// - `method`: HTTP method verbatim
/// - `path`: request URI including the query string
/// - `headers`: single-valued header map (first value wins upstream)
/// - `body`: request body bytes carried as text
///
/// # Example
///
/// ```
/// use framegate_common::RequestPayload;
///
/// let request = RequestPayload::new("POST", "/orders?draft=1")
///     .with_header("Content-Type", "application/json")
///     .with_body(r#"{"qty": 3}"#);
/// assert_eq!(request.method, "POST");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestPayload {
    /// Opaque request identifier
    pub id: String,
    /// HTTP method
    pub method: String,
    /// Request URI including query
    pub path: String,
    /// Single-valued header map
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Body bytes as text
    #[serde(default)]
    pub body: String,
}

impl RequestPayload {
    /// Creates a payload with a fresh UUID request id and empty headers/body.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        RequestPayload {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    /// Adds a single header value.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the request body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}
