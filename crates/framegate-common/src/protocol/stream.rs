//! Framegate Stream Frames
//!
//! Frames a worker emits when it streams a response instead of answering
//! with a single `ResponsePayload`. The sequence is `headers` at most once,
//! any number of `chunk`s, then exactly one terminal `end` or `error`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One frame of a streamed worker response.
///
/// The wire representation is a JSON object tagged by its `type` field:
///
/// ```json
/// {"type": "headers", "status": 201, "headers": {"X-Tag": ["a", "b"]}}
/// {"type": "chunk", "data": "partial body"}
/// {"type": "end"}
/// {"type": "error", "error": "template blew up"}
/// ```
///
/// A frame with an unrecognized `type` fails to deserialize; the worker
/// surfaces that as a protocol error and is marked dead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame {
    /// Response status and multi-valued headers, with optional initial body
    /// bytes. Valid at most once per stream.
    Headers {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, Vec<String>>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// Body bytes.
    Chunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// Normal end of stream.
    End,
    /// Terminal error with a message.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}
