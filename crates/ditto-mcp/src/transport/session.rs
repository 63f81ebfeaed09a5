use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Instant,
};

use axum::response::sse::Event;
use futures::FutureExt;
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EventSink, RegistryError, SessionId, SessionRegistry};
use crate::{
    BridgeError,
    auth::AuthenticatedClient,
    handler::{ToolContext, ToolDispatcher},
    model::{
        ErrorData, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcReply,
        JsonRpcRequest, JsonRpcResponse, Rejection,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Opening = 0,
    Streaming = 1,
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Opening,
            1 => SessionState::Streaming,
            _ => SessionState::Closed,
        }
    }
}

/// JSON body of a delivery response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DeliveryBody {
    Single(JsonRpcReply),
    Batch(Vec<JsonRpcReply>),
}

/// Outcome of [`TransportSession::deliver`], mapped 1:1 onto the HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub status: StatusCode,
    pub body: Option<DeliveryBody>,
}

impl Delivery {
    pub fn reply(reply: JsonRpcReply) -> Self {
        Self {
            status: StatusCode::OK,
            body: Some(DeliveryBody::Single(reply)),
        }
    }

    pub fn batch(replies: Vec<JsonRpcReply>) -> Self {
        Self {
            status: StatusCode::OK,
            body: Some(DeliveryBody::Batch(replies)),
        }
    }

    /// The message was taken but produced nothing to answer.
    pub fn accepted() -> Self {
        Self {
            status: StatusCode::ACCEPTED,
            body: None,
        }
    }

    /// The session ended before the message could be handled.
    pub fn gone() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: None,
        }
    }
}

/// One client connection: the registry entry, the stream it writes to and the
/// dispatcher its messages go to.
///
/// Lifecycle is `Opening -> Streaming -> Closed`. Entering `Closed` unregisters
/// the session and closes the sink exactly once, however many times and from
/// however many tasks [`TransportSession::close`] is called.
pub struct TransportSession {
    id: SessionId,
    created_at: Instant,
    sink: Box<dyn EventSink>,
    registry: Arc<dyn SessionRegistry>,
    dispatcher: Arc<dyn ToolDispatcher>,
    credentials: Arc<AuthenticatedClient>,
    state: AtomicU8,
    ended: AtomicBool,
}

impl TransportSession {
    pub fn new(
        id: SessionId,
        sink: impl EventSink,
        registry: Arc<dyn SessionRegistry>,
        dispatcher: Arc<dyn ToolDispatcher>,
        credentials: Arc<AuthenticatedClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            created_at: Instant::now(),
            sink: Box::new(sink),
            registry,
            dispatcher,
            credentials,
            state: AtomicU8::new(SessionState::Opening as u8),
            ended: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_alive(&self) -> bool {
        self.state() != SessionState::Closed
    }

    /// Register the session and announce `<endpoint>?sessionId=<id>` on the stream.
    pub async fn open(self: &Arc<Self>, endpoint: &str) -> Result<(), RegistryError> {
        self.registry.register(self.clone()).await?;
        self.sink.open();
        let announce = format!("{endpoint}?sessionId={}", self.id);
        let endpoint = Event::default().event("endpoint").data(announce);
        if !self.sink.write(endpoint).await {
            warn!(session_id = %self.id, "stream gone before the endpoint was announced");
            self.close().await;
            return Ok(());
        }
        // a concurrent close may already have won
        let _ = self.state.compare_exchange(
            SessionState::Opening as u8,
            SessionState::Streaming as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(session_id = %self.id, "session opened");
        Ok(())
    }

    /// [`TransportSession::open`] followed by [`TransportSession::run_until_closed`],
    /// both on a spawned task.
    ///
    /// Dropping the returned future never leaves a registered session unwatched.
    pub async fn launch(
        self: &Arc<Self>,
        endpoint: String,
        ct: CancellationToken,
    ) -> Result<(), BridgeError> {
        let session = self.clone();
        let opened = tokio::spawn(async move {
            session.open(&endpoint).await?;
            tokio::spawn(session.run_until_closed(ct));
            Ok::<_, RegistryError>(())
        });
        opened.await??;
        Ok(())
    }

    /// Decode and handle one delivered body: a single message or a batch.
    pub async fn deliver(self: &Arc<Self>, body: &[u8]) -> Delivery {
        if !self.is_alive() {
            return Delivery::gone();
        }
        let value = match serde_json::from_slice::<Value>(body) {
            Ok(value) => value,
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "undecodable delivery");
                return Delivery::reply(
                    Rejection {
                        id: None,
                        error: ErrorData::parse_error(e.to_string()),
                    }
                    .into(),
                );
            }
        };
        match value {
            Value::Array(items) if items.is_empty() => Delivery::reply(
                Rejection {
                    id: None,
                    error: ErrorData::invalid_request("empty batch"),
                }
                .into(),
            ),
            Value::Array(items) => {
                let replies: Vec<_> =
                    futures::future::join_all(items.into_iter().map(|item| self.handle(item)))
                        .await
                        .into_iter()
                        .flatten()
                        .collect();
                if replies.is_empty() {
                    Delivery::accepted()
                } else {
                    Delivery::batch(replies)
                }
            }
            value => match self.handle(value).await {
                Some(reply) => Delivery::reply(reply),
                None => Delivery::accepted(),
            },
        }
    }

    /// Push a server-initiated notification onto the stream.
    ///
    /// Returns `false` once the session is closed; a failed write closes it.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> bool {
        if self.state() != SessionState::Streaming {
            return false;
        }
        let notification = JsonRpcNotification::new(method, params);
        let json = match serde_json::to_string(&notification) {
            Ok(json) => json,
            Err(e) => {
                error!(session_id = %self.id, error = %e, "unserializable notification");
                return false;
            }
        };
        if self.sink.write(Event::default().event("message").data(json)).await {
            true
        } else {
            debug!(session_id = %self.id, "stream gone while notifying");
            self.close().await;
            false
        }
    }

    /// Enter `Closed`. Only the first call has any effect.
    pub async fn close(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
        self.registry.unregister(&self.id).await;
        self.sink.close();
        info!(
            session_id = %self.id,
            lifetime_ms = self.created_at.elapsed().as_millis() as u64,
            "session closed"
        );
    }

    /// Wait for the peer to go away or for `ct`, then close.
    pub async fn run_until_closed(self: Arc<Self>, ct: CancellationToken) {
        tokio::select! {
            _ = self.sink.closed() => {
                debug!(session_id = %self.id, "stream closed");
            }
            _ = ct.cancelled() => {
                debug!(session_id = %self.id, "session cancelled");
            }
        }
        self.close().await;
    }

    pub fn peer(self: &Arc<Self>) -> Peer {
        Peer {
            session: Arc::downgrade(self),
        }
    }

    fn context(self: &Arc<Self>) -> ToolContext {
        ToolContext {
            session_id: self.id.clone(),
            credentials: self.credentials.clone(),
            peer: self.peer(),
        }
    }

    async fn handle(self: &Arc<Self>, value: Value) -> Option<JsonRpcReply> {
        match JsonRpcMessage::from_value(value) {
            Err(rejection) => Some(rejection.into()),
            Ok(JsonRpcMessage::Request(request)) => Some(self.dispatch(request).await),
            Ok(JsonRpcMessage::Notification(notification)) => {
                let method = notification.method.clone();
                let handled = AssertUnwindSafe(
                    self.dispatcher
                        .handle_notification(notification, self.context()),
                )
                .catch_unwind()
                .await;
                if handled.is_err() {
                    error!(session_id = %self.id, %method, "notification handler panicked");
                }
                None
            }
            Ok(JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_)) => {
                debug!(session_id = %self.id, "client response ignored");
                None
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, request: JsonRpcRequest) -> JsonRpcReply {
        let id = request.id.clone();
        let method = request.method.clone();
        debug!(session_id = %self.id, %id, %method, "dispatching request");
        let outcome = AssertUnwindSafe(self.dispatcher.handle_request(request, self.context()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(result)) => JsonRpcReply::Response(JsonRpcResponse::new(id, result)),
            Ok(Err(error)) => {
                debug!(session_id = %self.id, %id, %method, %error, "request failed");
                JsonRpcReply::Error(JsonRpcError::new(Some(id), error))
            }
            Err(_) => {
                error!(session_id = %self.id, %id, %method, "request handler panicked");
                JsonRpcReply::Error(JsonRpcError::new(
                    Some(id),
                    ErrorData::internal_error("request handler panicked"),
                ))
            }
        }
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle through which tool code talks back to its own session.
///
/// Holds no strong reference, so an outstanding peer never keeps a closed
/// session alive.
#[derive(Clone, Debug)]
pub struct Peer {
    session: Weak<TransportSession>,
}

impl Peer {
    pub async fn notify(&self, method: &str, params: Option<Value>) -> bool {
        match self.session.upgrade() {
            Some(session) => session.notify(method, params).await,
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.session
            .upgrade()
            .is_none_or(|session| !session.is_alive())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::{
        body::{BodyDataStream, Bytes},
        response::{IntoResponse, sse::Sse},
    };
    use futures::StreamExt;
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        auth::test_support::{test_client, valid_credential},
        model::{ErrorCode, NumberOrString},
        transport::{ChannelSink, EventStream, LocalSessionRegistry, session_id},
    };

    /// Answers `ping`, panics on `explode`, and sends a notification on
    /// `notify_me` (after a pause on `slow_notify`).
    pub(crate) struct EchoDispatcher;

    #[async_trait]
    impl ToolDispatcher for EchoDispatcher {
        async fn handle_request(
            &self,
            request: JsonRpcRequest,
            context: ToolContext,
        ) -> Result<Value, ErrorData> {
            match request.method.as_str() {
                "ping" => Ok(json!({})),
                "explode" => panic!("boom"),
                "notify_me" | "slow_notify" => {
                    if request.method == "slow_notify" {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    let sent = context
                        .peer
                        .notify("notifications/message", Some(json!({"level": "info"})))
                        .await;
                    Ok(json!({"sent": sent}))
                }
                method => Err(ErrorData::method_not_found(method)),
            }
        }
    }

    /// Counts unregister calls on top of a real registry.
    #[derive(Default)]
    pub(crate) struct CountingRegistry {
        inner: LocalSessionRegistry,
        pub(crate) unregistered: AtomicUsize,
    }

    #[async_trait]
    impl SessionRegistry for CountingRegistry {
        async fn register(&self, session: Arc<TransportSession>) -> Result<(), RegistryError> {
            self.inner.register(session).await
        }
        async fn resolve(&self, id: &str) -> Result<Arc<TransportSession>, RegistryError> {
            self.inner.resolve(id).await
        }
        async fn unregister(&self, id: &str) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            self.inner.unregister(id).await
        }
        async fn len(&self) -> usize {
            self.inner.len().await
        }
        async fn drain(&self) -> Vec<Arc<TransportSession>> {
            self.inner.drain().await
        }
    }

    /// A session that was never opened, for registry tests.
    pub(crate) fn detached_session(
        registry: Arc<dyn SessionRegistry>,
        id: &str,
    ) -> Arc<TransportSession> {
        let (sink, _stream) = ChannelSink::channel(8);
        TransportSession::new(
            id.into(),
            sink,
            registry,
            Arc::new(EchoDispatcher),
            test_client(valid_credential()),
        )
    }

    pub(crate) async fn open_session(
        registry: Arc<dyn SessionRegistry>,
    ) -> (Arc<TransportSession>, EventStream) {
        let (sink, stream) = ChannelSink::channel(8);
        let session = TransportSession::new(
            session_id(),
            sink,
            registry,
            Arc::new(EchoDispatcher),
            test_client(valid_credential()),
        );
        session.open("/message").await.unwrap();
        (session, stream)
    }

    pub(crate) fn test_context() -> ToolContext {
        let session = detached_session(Arc::new(LocalSessionRegistry::new()), "test");
        ToolContext {
            session_id: session.id().clone(),
            credentials: test_client(valid_credential()),
            peer: session.peer(),
        }
    }

    /// The bytes an SSE response would put on the wire for `stream`.
    fn frames(stream: EventStream) -> BodyDataStream {
        Sse::new(stream).into_response().into_body().into_data_stream()
    }

    async fn next_frame(stream: &mut BodyDataStream) -> Option<Bytes> {
        timeout(Duration::from_millis(200), stream.next())
            .await
            .ok()
            .flatten()
            .map(|frame| frame.unwrap())
    }

    #[tokio::test]
    async fn test_open_announces_endpoint() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let (session, stream) = open_session(registry.clone()).await;
        let mut stream = frames(stream);
        assert_eq!(session.state(), SessionState::Streaming);
        let frame = next_frame(&mut stream).await.unwrap();
        let expected = format!(
            "event: endpoint\ndata: /message?sessionId={}\n\n",
            session.id()
        );
        assert_eq!(&frame[..], expected.as_bytes());
        assert!(registry.resolve(session.id()).await.is_ok());
    }

    #[tokio::test]
    async fn test_ping_is_answered_on_the_delivery_only() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let (session, stream) = open_session(registry).await;
        let mut stream = frames(stream);
        next_frame(&mut stream).await.unwrap();

        let delivery = session
            .deliver(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await;
        assert_eq!(delivery.status, StatusCode::OK);
        assert_eq!(
            serde_json::to_value(delivery.body.unwrap()).unwrap(),
            json!({"jsonrpc": "2.0", "id": 1, "result": {}})
        );
        assert!(next_frame(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_parse_error_keeps_stream_open() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let (session, _stream) = open_session(registry).await;
        let delivery = session.deliver(b"{not json").await;
        assert_eq!(delivery.status, StatusCode::OK);
        let Some(DeliveryBody::Single(JsonRpcReply::Error(error))) = delivery.body else {
            panic!("expected an error envelope");
        };
        assert_eq!(error.id, None);
        assert_eq!(error.error.code, ErrorCode::PARSE_ERROR);
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_notifications_and_client_responses_are_accepted() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let (session, _stream) = open_session(registry).await;
        let delivery = session
            .deliver(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert_eq!(delivery, Delivery::accepted());
        let delivery = session
            .deliver(br#"{"jsonrpc":"2.0","id":"x","result":{}}"#)
            .await;
        assert_eq!(delivery, Delivery::accepted());
    }

    #[tokio::test]
    async fn test_batch_collects_replies() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let (session, _stream) = open_session(registry).await;
        let delivery = session
            .deliver(
                br#"[
                    {"jsonrpc":"2.0","id":1,"method":"ping"},
                    {"jsonrpc":"2.0","method":"notifications/initialized"},
                    {"jsonrpc":"2.0","id":2,"method":"unknown"}
                ]"#,
            )
            .await;
        let Some(DeliveryBody::Batch(replies)) = delivery.body else {
            panic!("expected a batch");
        };
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id(), Some(&NumberOrString::Number(1)));
        assert!(matches!(&replies[1], JsonRpcReply::Error(e) if e.error.code == ErrorCode::METHOD_NOT_FOUND));

        let delivery = session.deliver(b"[]").await;
        let Some(DeliveryBody::Single(JsonRpcReply::Error(error))) = delivery.body else {
            panic!("expected an error envelope");
        };
        assert_eq!(error.error.code, ErrorCode::INVALID_REQUEST);

        let delivery = session
            .deliver(br#"[{"jsonrpc":"2.0","method":"notifications/initialized"}]"#)
            .await;
        assert_eq!(delivery, Delivery::accepted());
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_internal_error() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let (session, _stream) = open_session(registry).await;
        let delivery = session
            .deliver(br#"{"jsonrpc":"2.0","id":9,"method":"explode"}"#)
            .await;
        let Some(DeliveryBody::Single(JsonRpcReply::Error(error))) = delivery.body else {
            panic!("expected an error envelope");
        };
        assert_eq!(error.id, Some(NumberOrString::Number(9)));
        assert_eq!(error.error.code, ErrorCode::INTERNAL_ERROR);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_tool_notification_goes_to_the_stream() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let (session, stream) = open_session(registry).await;
        let mut stream = frames(stream);
        next_frame(&mut stream).await.unwrap();
        let delivery = session
            .deliver(br#"{"jsonrpc":"2.0","id":3,"method":"notify_me"}"#)
            .await;
        assert_eq!(
            serde_json::to_value(delivery.body.unwrap()).unwrap()["result"]["sent"],
            true
        );
        let frame = next_frame(&mut stream).await.unwrap();
        let frame = std::str::from_utf8(&frame).unwrap();
        assert!(frame.starts_with("event: message\ndata: "));
        assert!(frame.contains("notifications/message"));
    }

    #[tokio::test]
    async fn test_peer_disconnect_tears_down_exactly_once() {
        let registry = Arc::new(CountingRegistry::default());
        let (session, stream) = open_session(registry.clone()).await;
        let id = session.id().clone();
        let task = tokio::spawn(session.clone().run_until_closed(CancellationToken::new()));

        drop(stream);
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        session.close().await;
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.unregistered.load(Ordering::SeqCst), 1);
        assert!(registry.resolve(&id).await.is_err());
        assert!(!session.notify("notifications/message", None).await);
        assert_eq!(
            session
                .deliver(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
                .await,
            Delivery::gone()
        );
    }

    #[tokio::test]
    async fn test_cancellation_closes_the_session() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let (session, stream) = open_session(registry.clone()).await;
        let mut stream = frames(stream);
        let ct = CancellationToken::new();
        let task = tokio::spawn(session.clone().run_until_closed(ct.child_token()));
        next_frame(&mut stream).await.unwrap();

        ct.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(registry.is_empty().await);
        assert!(stream.next().await.is_none());
        assert!(session.peer().is_closed());
    }

    #[tokio::test]
    async fn test_sessions_get_unique_ids() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let mut ids = std::collections::HashSet::new();
        let mut streams = Vec::new();
        for _ in 0..16 {
            let (session, stream) = open_session(registry.clone()).await;
            assert!(ids.insert(session.id().clone()));
            streams.push(stream);
        }
        assert_eq!(registry.len().await, 16);
    }

    #[tokio::test]
    async fn test_disconnect_during_delivery_lets_it_finish() {
        let registry = Arc::new(CountingRegistry::default());
        let (session, stream) = open_session(registry.clone()).await;
        let id = session.id().clone();
        let watcher = tokio::spawn(session.clone().run_until_closed(CancellationToken::new()));

        let in_flight = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .deliver(br#"{"jsonrpc":"2.0","id":1,"method":"slow_notify"}"#)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(stream);
        timeout(Duration::from_secs(1), watcher).await.unwrap().unwrap();
        assert!(registry.resolve(&id).await.is_err());

        let delivery = timeout(Duration::from_secs(1), in_flight)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.status, StatusCode::OK);
        assert_eq!(
            serde_json::to_value(delivery.body.unwrap()).unwrap(),
            json!({"jsonrpc": "2.0", "id": 1, "result": {"sent": false}})
        );
        assert_eq!(registry.unregistered.load(Ordering::SeqCst), 1);
    }

    /// Registers, then stalls before returning.
    #[derive(Default)]
    struct StallingRegistry {
        inner: LocalSessionRegistry,
    }

    #[async_trait]
    impl SessionRegistry for StallingRegistry {
        async fn register(&self, session: Arc<TransportSession>) -> Result<(), RegistryError> {
            self.inner.register(session).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
        async fn resolve(&self, id: &str) -> Result<Arc<TransportSession>, RegistryError> {
            self.inner.resolve(id).await
        }
        async fn unregister(&self, id: &str) {
            self.inner.unregister(id).await
        }
        async fn len(&self) -> usize {
            self.inner.len().await
        }
        async fn drain(&self) -> Vec<Arc<TransportSession>> {
            self.inner.drain().await
        }
    }

    #[tokio::test]
    async fn test_abandoned_launch_is_still_torn_down() {
        let registry = Arc::new(StallingRegistry::default());
        let (sink, stream) = ChannelSink::channel(8);
        let session = TransportSession::new(
            session_id(),
            sink,
            registry.clone(),
            Arc::new(EchoDispatcher),
            test_client(valid_credential()),
        );

        let launch = session.launch("/message".into(), CancellationToken::new());
        assert!(timeout(Duration::from_millis(20), launch).await.is_err());
        assert_eq!(registry.len().await, 1);

        drop(stream);
        timeout(Duration::from_secs(1), async {
            while !registry.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_launch_opens_and_watches() {
        let registry = Arc::new(LocalSessionRegistry::new());
        let (sink, stream) = ChannelSink::channel(8);
        let session = TransportSession::new(
            session_id(),
            sink,
            registry.clone(),
            Arc::new(EchoDispatcher),
            test_client(valid_credential()),
        );
        let ct = CancellationToken::new();
        session
            .launch("/message".into(), ct.child_token())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        let mut stream = frames(stream);
        assert!(next_frame(&mut stream).await.is_some());

        ct.cancel();
        assert!(timeout(Duration::from_secs(1), stream.next()).await.unwrap().is_none());
        assert!(registry.is_empty().await);
    }
}
