//! Framegate Common Types and Framing
//!
//! This crate provides the worker wire protocol and frame codec shared by
//! all framegate components.
//!
//! # Overview
//!
//! Framegate is an application server that fronts pools of long-lived
//! interpreter subprocesses (workers) and dispatches HTTP request payloads
//! to them over the workers' stdin/stdout. This crate contains the pieces
//! both sides of that boundary agree on:
//!
//! - **Protocol Layer**: request/response payloads, streaming frames, and
//!   the shared error type
//! - **Framing Layer**: the length-prefixed wire format used on the worker
//!   pipes
//!
//! # Wire Format
//!
//! Every message on a worker's stdin or stdout is a frame:
//!
//! ```text
//! [4-byte length prefix as u32 big-endian] + [JSON data]
//! ```
//!
//! # Example
//!
//! ```
//! use framegate_common::{RequestPayload, ResponsePayload};
//!
//! let request = RequestPayload::new("GET", "/orders/42")
//!     .with_header("Accept", "application/json");
//!
//! let response = ResponsePayload::default();
//! assert_eq!(response.status_or_default(), 200);
//! ```

pub mod framing;
pub mod protocol;

pub use protocol::*;
