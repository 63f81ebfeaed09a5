#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ditto_mcp::{
    AuthenticatedClient, CredentialCache, ToolContext,
    auth::{Credential, CredentialError, PersistOnRefresh, TokenRefresher},
    handler::{ToolError, ToolRouter, Toolset},
    model::{Content, Implementation, Tool},
    store::{CredentialStore, OAuthClientConfig, StoreError},
    transport::sse_server::{BearerGate, SseServer, SseServerConfig},
};
use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub async fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Returns `fresh-<n>` with a one hour expiry and never rotates the refresh token.
#[derive(Default)]
pub struct FakeRefresher {
    pub calls: AtomicUsize,
    pub expiry_date: Option<i64>,
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<Credential, CredentialError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential {
            access_token: Some(format!("fresh-{n}")),
            expiry_date: Some(
                self.expiry_date
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() + 3_600_000),
            ),
            ..Default::default()
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub client_config: Option<OAuthClientConfig>,
    pub credential: Mutex<Option<Credential>>,
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load_client_config(&self) -> Result<Option<OAuthClientConfig>, StoreError> {
        Ok(self.client_config.clone())
    }
    async fn load_credential(&self) -> Result<Option<Credential>, StoreError> {
        Ok(self.credential.lock().await.clone())
    }
    async fn save_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        *self.credential.lock().await = Some(credential.clone());
        Ok(())
    }
}

pub fn seeded_credential() -> Credential {
    Credential {
        access_token: Some("A".into()),
        refresh_token: Some("R".into()),
        token_type: Some("Bearer".into()),
        expiry_date: Some(chrono::Utc::now().timestamp_millis() + 3_600_000),
        ..Default::default()
    }
}

pub fn configured_cache() -> Arc<CredentialCache> {
    let store = Arc::new(MemoryStore::default());
    let credential = seeded_credential();
    let client = AuthenticatedClient::new(
        credential.clone(),
        Arc::new(FakeRefresher::default()),
        Arc::new(PersistOnRefresh::new(store.clone(), credential)),
    );
    Arc::new(CredentialCache::with_client(store, Arc::new(client)))
}

pub fn unconfigured_cache() -> Arc<CredentialCache> {
    Arc::new(CredentialCache::new(Arc::new(MemoryStore::default())))
}

pub fn test_router() -> ToolRouter {
    let toolset = Toolset::builder()
        .add_tool(
            Tool::without_arguments("whoami", "Return the access token in use"),
            |_, context: ToolContext| async move {
                let token = context.credentials.access_token().await?;
                Ok(vec![Content::text(token)])
            },
        )
        .add_tool(
            Tool::without_arguments("progress", "Push a notification onto the stream"),
            |_, context: ToolContext| async move {
                let sent = context
                    .peer
                    .notify(
                        "notifications/message",
                        Some(serde_json::json!({"level": "info", "data": "halfway"})),
                    )
                    .await;
                if sent {
                    Ok(vec![Content::text("done")])
                } else {
                    Err(ToolError::ExecutionError("stream gone".into()))
                }
            },
        )
        .build();
    ToolRouter::new(Implementation::new("test-server", "1.0.0"), toolset)
}

pub struct TestServer {
    pub server: SseServer,
    pub addr: SocketAddr,
    pub ct: CancellationToken,
}

pub async fn start_server(
    credentials: Arc<CredentialCache>,
    bearer_token: Option<String>,
    sse_keep_alive: Option<Duration>,
) -> anyhow::Result<TestServer> {
    let config = SseServerConfig {
        bind: "127.0.0.1:0".parse()?,
        sse_keep_alive,
        gate: BearerGate::new(bearer_token),
        ..Default::default()
    };
    let ct = config.ct.clone();
    let server =
        SseServer::serve_with_config(config, credentials, Arc::new(test_router())).await?;
    let addr = server.config.bind;
    Ok(TestServer { server, addr, ct })
}

/// Splits a response body into SSE frames, skipping keep-alive comments.
pub struct SseReader<S> {
    body: S,
    buffer: BytesMut,
}

impl<S> SseReader<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    pub fn new(body: S) -> Self {
        Self {
            body,
            buffer: BytesMut::new(),
        }
    }

    /// Next `(event, data)` pair, or `None` once the stream ended.
    pub async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            if let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
                let frame = self.buffer.split_to(end + 2);
                let frame = String::from_utf8_lossy(&frame).into_owned();
                if frame.starts_with(':') {
                    continue;
                }
                let mut event = String::new();
                let mut data = Vec::new();
                for line in frame.lines() {
                    if let Some(value) = line.strip_prefix("event: ") {
                        event = value.to_string();
                    } else if let Some(value) = line.strip_prefix("data: ") {
                        data.push(value);
                    }
                }
                return Some((event, data.join("\n")));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                _ => return None,
            }
        }
    }
}

/// Open `/sse` and return the reader plus the announced endpoint path.
pub async fn open_stream(
    client: &reqwest::Client,
    addr: SocketAddr,
) -> anyhow::Result<(
    SseReader<impl Stream<Item = reqwest::Result<Bytes>> + Unpin>,
    String,
)> {
    let response = client
        .get(format!("http://{addr}/sse"))
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    anyhow::ensure!(
        response.status() == reqwest::StatusCode::OK,
        "unexpected status {}",
        response.status()
    );
    let mut reader = SseReader::new(Box::pin(response.bytes_stream()));
    let (event, endpoint) = reader
        .next_event()
        .await
        .ok_or_else(|| anyhow::anyhow!("stream ended before the endpoint event"))?;
    anyhow::ensure!(event == "endpoint", "first event was {event}");
    Ok((reader, endpoint))
}
