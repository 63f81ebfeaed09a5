//! HTTP+SSE server transport on axum.
//!
//! `GET <sse_path>` opens a stream whose first event names the endpoint for
//! this session; `POST <post_path>?sessionId=<id>` delivers one JSON-RPC
//! message (or batch) and carries the answer in its own response.

mod axum_impl;
pub mod common;
pub mod gate;

pub use axum_impl::SseServer;
pub use common::{DEFAULT_AUTO_PING_INTERVAL, SessionId, SseServerConfig, session_id};
pub use gate::{BearerGate, BearerSource, require_bearer};
