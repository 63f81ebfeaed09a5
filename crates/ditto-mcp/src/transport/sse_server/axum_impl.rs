use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{NestedPath, Query, State},
    http::{HeaderName, StatusCode, Uri, header},
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::common::{DEFAULT_AUTO_PING_INTERVAL, SseServerConfig, session_id};
use crate::{
    BridgeError,
    auth::{CredentialCache, CredentialError},
    handler::ToolDispatcher,
    transport::{ChannelSink, Delivery, LocalSessionRegistry, SessionRegistry, TransportSession},
};

const SINK_BUFFER: usize = 64;

#[derive(Clone)]
struct App {
    registry: Arc<dyn SessionRegistry>,
    credentials: Arc<CredentialCache>,
    dispatcher: Arc<dyn ToolDispatcher>,
    post_path: Arc<str>,
    sse_ping_interval: Duration,
    ct: CancellationToken,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEventQuery {
    pub session_id: Option<String>,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

impl IntoResponse for Delivery {
    fn into_response(self) -> Response {
        match self.body {
            Some(body) => (self.status, Json(body)).into_response(),
            None if self.status == StatusCode::NOT_FOUND => {
                json_error(StatusCode::NOT_FOUND, "Session not found")
            }
            None => self.status.into_response(),
        }
    }
}

async fn post_event_handler(
    State(app): State<App>,
    Query(query): Query<PostEventQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "Missing sessionId");
    };
    let session = match app.registry.resolve(&session_id).await {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(session_id, error = %e, "delivery to unknown session");
            return json_error(StatusCode::NOT_FOUND, "Session not found");
        }
    };
    let delivery = session.deliver(&body).await;
    tracing::debug!(session_id, status = %delivery.status, "message delivered");
    delivery.into_response()
}

async fn sse_handler(
    State(app): State<App>,
    nested_path: Option<Extension<NestedPath>>,
    uri: Uri,
) -> Response {
    let credentials = match app.credentials.get_client().await {
        Ok(credentials) => credentials,
        Err(e @ CredentialError::NotConfigured(_)) => {
            tracing::warn!(error = %e, "sse connection rejected");
            return json_error(StatusCode::UNAUTHORIZED, e.to_string());
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to build the authenticated client");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let session = session_id();
    tracing::info!(%session, %uri, "sse connection");
    let (sink, stream) = ChannelSink::channel(SINK_BUFFER);
    let session = TransportSession::new(
        session,
        sink,
        app.registry.clone(),
        app.dispatcher.clone(),
        credentials,
    );
    let nested_path = nested_path.as_deref().map(NestedPath::as_str).unwrap_or("");
    let endpoint = format!("{nested_path}{}", app.post_path);
    if let Err(e) = session.launch(endpoint, app.ct.child_token()).await {
        tracing::error!(error = %e, "failed to open session");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let keep_alive = KeepAlive::new()
        .interval(app.sse_ping_interval)
        .text("ping");
    (
        [
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream).keep_alive(keep_alive),
    )
        .into_response()
}

async fn close_all(registry: &dyn SessionRegistry) -> usize {
    let sessions = registry.drain().await;
    let closed = sessions.len();
    for session in sessions {
        session.close().await;
    }
    closed
}

pub struct SseServer {
    registry: Arc<dyn SessionRegistry>,
    pub config: SseServerConfig,
}

impl SseServer {
    pub async fn serve(
        bind: SocketAddr,
        credentials: Arc<CredentialCache>,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> Result<Self, BridgeError> {
        Self::serve_with_config(
            SseServerConfig {
                bind,
                ..Default::default()
            },
            credentials,
            dispatcher,
        )
        .await
    }

    pub async fn serve_with_config(
        mut config: SseServerConfig,
        credentials: Arc<CredentialCache>,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> Result<Self, BridgeError> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        // Update config with actual bound address (important when port is 0)
        config.bind = listener.local_addr()?;
        let (sse_server, router) = Self::new(config, credentials, dispatcher);
        let server = sse_server.run(listener, router);
        tokio::spawn(
            async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "sse server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("sse-server", bind_address = %sse_server.config.bind)),
        );
        Ok(sse_server)
    }

    pub fn new(
        config: SseServerConfig,
        credentials: Arc<CredentialCache>,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> (SseServer, Router) {
        Self::with_registry(
            config,
            Arc::new(LocalSessionRegistry::new()),
            credentials,
            dispatcher,
        )
    }

    pub fn with_registry(
        config: SseServerConfig,
        registry: Arc<dyn SessionRegistry>,
        credentials: Arc<CredentialCache>,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> (SseServer, Router) {
        let app = App {
            registry: registry.clone(),
            credentials,
            dispatcher,
            post_path: config.post_path.as_str().into(),
            sse_ping_interval: config.sse_keep_alive.unwrap_or(DEFAULT_AUTO_PING_INTERVAL),
            ct: config.ct.clone(),
        };
        let router = Router::new()
            .route(&config.sse_path, get(sse_handler))
            .route(&config.post_path, post(post_event_handler))
            .with_state(app);
        let router = config.gate.clone().protect(router);
        (SseServer { registry, config }, router)
    }

    /// Serve `router` (usually the one from [`SseServer::new`], possibly with
    /// extra routes merged in) on `config.bind` until the server is cancelled.
    pub async fn serve_router(&self, router: Router) -> Result<(), BridgeError> {
        let listener = tokio::net::TcpListener::bind(self.config.bind).await?;
        tracing::info!(bind_address = %listener.local_addr()?, "sse server listening");
        self.run(listener, router)
            .instrument(tracing::info_span!("sse-server", bind_address = %self.config.bind))
            .await?;
        Ok(())
    }

    fn run(
        &self,
        listener: tokio::net::TcpListener,
        router: Router,
    ) -> impl Future<Output = std::io::Result<()>> + Send + 'static {
        let ct = self.config.ct.child_token();
        let registry = self.registry.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                ct.cancelled().await;
                let closed = close_all(registry.as_ref()).await;
                tracing::info!(closed, "sse server cancelled");
            })
            .into_future()
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    pub fn cancel(&self) {
        self.config.ct.cancel();
    }

    /// Close every live session without stopping the listener.
    pub async fn close_all(&self) -> usize {
        close_all(self.registry.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use futures::StreamExt;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        auth::test_support::{MemoryStore, test_client, valid_credential},
        transport::test_support::EchoDispatcher,
    };

    fn configured_app() -> (SseServer, Router) {
        let cache = CredentialCache::with_client(
            Arc::new(MemoryStore::default()),
            test_client(valid_credential()),
        );
        SseServer::new(
            SseServerConfig::default(),
            Arc::new(cache),
            Arc::new(EchoDispatcher),
        )
    }

    fn post_message(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_sse_server_creation() {
        let (sse_server, _router) = configured_app();
        assert_eq!(sse_server.config.sse_path, "/sse");
        assert_eq!(sse_server.config.post_path, "/message");
    }

    #[tokio::test]
    async fn test_post_without_session_id() {
        let (_server, router) = configured_app();
        let response = router
            .oneshot(post_message("/message", r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({"error": "Missing sessionId"}));
    }

    #[tokio::test]
    async fn test_post_event_handler_session_not_found() {
        let (_server, router) = configured_app();
        let response = router
            .oneshot(post_message(
                "/message?sessionId=non-existent",
                r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sse_rejected_when_not_configured() {
        let cache = CredentialCache::new(Arc::new(MemoryStore::default()));
        let (server, router) = SseServer::new(
            SseServerConfig::default(),
            Arc::new(cache),
            Arc::new(EchoDispatcher),
        );
        let response = router
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_json(response).await["error"].is_string());
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_open_then_deliver() {
        let (server, router) = configured_app();
        let response = router
            .clone()
            .oneshot(Request::builder().uri("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()["x-accel-buffering"], "no");
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, no-transform"
        );

        let mut body = response.into_body().into_data_stream();
        let frame = body.next().await.unwrap().unwrap();
        let frame = std::str::from_utf8(&frame).unwrap();
        let endpoint = frame
            .strip_prefix("event: endpoint\ndata: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap()
            .to_string();
        assert!(endpoint.starts_with("/message?sessionId="));
        assert_eq!(server.registry().len().await, 1);

        let response = router
            .clone()
            .oneshot(post_message(
                &endpoint,
                r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"jsonrpc": "2.0", "id": 1, "result": {}})
        );

        let response = router
            .oneshot(post_message(
                &endpoint,
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        assert_eq!(server.close_all().await, 1);
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_is_an_io_error() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = SseServerConfig {
            bind: taken.local_addr().unwrap(),
            ..Default::default()
        };
        let cache = CredentialCache::new(Arc::new(MemoryStore::default()));
        let err = SseServer::serve_with_config(config, Arc::new(cache), Arc::new(EchoDispatcher))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(!err.is_not_configured());
    }
}
