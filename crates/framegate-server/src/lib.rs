//! Framegate Server Core
//!
//! This crate implements the framegate application server: pools of
//! long-lived interpreter subprocesses (*workers*) that receive HTTP request
//! payloads over length-prefixed JSON frames on stdin/stdout and answer with
//! a unary response or a stream of frames.
//!
//! # Components
//!
//! - [`worker`] - one child process: spawning, admission, request I/O,
//!   timeouts, lazy restart
//! - [`pool`] - round-robin worker selection, drain and live rescaling
//! - [`dispatcher`] - the fast/slow multi-pool front with an injected
//!   request classifier
//! - [`hub`] - channel-keyed pub/sub fan-out with slow-subscriber drop
//! - [`http`] - the axum HTTP front: worker dispatch, static files, SSE
//! - [`sink`] - the sink seam streamed worker responses are relayed into
//!
//! # Control Flow
//!
//! ```text
//! HTTP request -> dispatcher (classify) -> pool (select) -> worker (frame,
//! write, await response or relay stream) -> HTTP response
//! ```
//!
//! The [`hub`] is independent of the dispatch path and is driven directly by
//! producers and subscribers.

pub mod dispatcher;
pub mod hub;
pub mod http;
pub mod pool;
pub mod sink;
pub mod worker;

pub use dispatcher::{is_slow_request, Dispatcher, DispatcherStats};
pub use hub::{EventHub, HubEvent, Subscription};
pub use http::{HttpConfig, HttpServer, StaticRule};
pub use pool::{PoolStats, WorkerPool};
pub use sink::{BufferSink, StreamSink};
pub use worker::{Worker, WorkerConfig, WorkerState};
