use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use super::gate::BearerGate;

pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

#[derive(Clone)]
pub struct SseServerConfig {
    pub bind: SocketAddr,
    pub sse_path: String,
    pub post_path: String,
    pub ct: CancellationToken,
    pub sse_keep_alive: Option<Duration>,
    /// Bearer check applied to every transport route.
    pub gate: BearerGate,
}

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3100)),
            sse_path: "/sse".to_string(),
            post_path: "/message".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: None,
            gate: BearerGate::Open,
        }
    }
}

impl std::fmt::Debug for SseServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseServerConfig")
            .field("bind", &self.bind)
            .field("sse_path", &self.sse_path)
            .field("post_path", &self.post_path)
            .field("sse_keep_alive", &self.sse_keep_alive)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

pub const DEFAULT_AUTO_PING_INTERVAL: Duration = Duration::from_secs(15);
