use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    auth::AuthenticatedClient,
    model::{ErrorData, JsonRpcNotification, JsonRpcRequest},
    transport::{Peer, SessionId},
};

/// Everything a request handler may need besides the request itself.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub credentials: Arc<AuthenticatedClient>,
    /// Pushes server-initiated notifications onto the caller's stream.
    pub peer: Peer,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Executes decoded JSON-RPC traffic for one server.
///
/// A returned `Err` becomes a JSON-RPC error envelope on the delivery call; a
/// panic is caught by the session and reported as an internal error.
#[async_trait]
pub trait ToolDispatcher: Send + Sync + 'static {
    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        context: ToolContext,
    ) -> Result<Value, ErrorData>;

    async fn handle_notification(&self, notification: JsonRpcNotification, context: ToolContext) {
        tracing::debug!(
            session_id = %context.session_id,
            method = %notification.method,
            "notification ignored"
        );
    }
}
