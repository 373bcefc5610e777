//! Sink seam for streamed worker responses.
//!
//! The worker's stream relay does not know about HTTP; it pushes the decoded
//! frames into a [`StreamSink`]. The HTTP front implements the trait over a
//! channel feeding the response body; tests use [`BufferSink`].

use framegate_common::Result;

/// Receives a streamed worker response.
///
/// `send_headers` is called exactly once, before any `send_data`. The header
/// list is already in emit order: Set-Cookie values arrive as separate
/// entries, every other multi-valued header is pre-joined with `", "`.
pub trait StreamSink: Send {
    /// Emits the status line and response headers.
    fn send_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> Result<()>;

    /// Writes body bytes through to the client and flushes.
    fn send_data(&mut self, data: &[u8]) -> Result<()>;
}

/// A sink that buffers everything in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values recorded for a header name, case-insensitive.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

impl StreamSink for BufferSink {
    fn send_headers(&mut self, status: u16, headers: Vec<(String, String)>) -> Result<()> {
        self.status = Some(status);
        self.headers = headers;
        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.body.extend_from_slice(data);
        Ok(())
    }
}
