//! The session-scoped SSE transport.
//!
//! A client opens a long-lived `text/event-stream` response; the server
//! announces a per-session endpoint on it and the client then delivers
//! JSON-RPC messages to that endpoint with ordinary short-lived POST requests.
//!
//! | piece | role |
//! |---|---|
//! | [`SessionRegistry`] | session id to live [`TransportSession`] |
//! | [`EventSink`] | write/close primitives over the streaming response body |
//! | [`TransportSession`] | per-connection state machine and dispatch |
//! | [`sse_server::SseServer`] | the axum routes tying the pieces together |

mod registry;
mod session;
mod sink;
pub mod sse_server;

pub use registry::{LocalSessionRegistry, RegistryError, SessionRegistry};
pub use session::{Delivery, DeliveryBody, Peer, SessionState, TransportSession};
pub use sink::{ChannelSink, EventSink, EventStream};
pub use sse_server::{SessionId, SseServer, SseServerConfig, session_id};

#[cfg(test)]
pub(crate) use session::tests as test_support;
