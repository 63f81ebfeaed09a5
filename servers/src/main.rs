use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use ditto_mcp::{
    ToolContext,
    auth::{AUTH_PATH, CALLBACK_PATH, ConsentState, CredentialCache, consent_router},
    handler::{ToolError, ToolRouter, Toolset},
    model::{Content, Implementation, JsonObject, Tool},
    status::{self, StatusState},
    store::{AUTH_FILE, CONFIG_FILE, ConfigStore, ServerConfigDocument},
    transport::sse_server::{BearerGate, SseServer, SseServerConfig},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PORT: u16 = 3100;

/// MCP tool server speaking the HTTP+SSE transport.
#[derive(Debug, Parser)]
#[command(name = "ditto-mcp-server", version, about)]
struct Args {
    /// Address to listen on; defaults to 127.0.0.1 and the port from config.json.
    #[arg(long, env = "DITTO_MCP_BIND")]
    bind: Option<SocketAddr>,
    /// Logical server name, selects the document directory.
    #[arg(long, env = "DITTO_MCP_SERVER_NAME", default_value = "google-workspace")]
    server_name: String,
    /// Base directory instead of ~/.ditto-mcp-servers.
    #[arg(long, env = "DITTO_MCP_STORE_DIR")]
    store_dir: Option<PathBuf>,
    #[arg(long, default_value = "/sse")]
    sse_path: String,
    #[arg(long, default_value = "/message")]
    post_path: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ditto_mcp=debug".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let store = match &args.store_dir {
        Some(dir) => ConfigStore::with_base_dir(dir, &args.server_name),
        None => ConfigStore::new(&args.server_name)?,
    };
    let document = store
        .load::<ServerConfigDocument>(CONFIG_FILE)
        .await?
        .unwrap_or_default();
    let bind = args.bind.unwrap_or_else(|| {
        let port = document
            .server
            .and_then(|server| server.port)
            .unwrap_or(DEFAULT_PORT);
        SocketAddr::from(([127, 0, 0, 1], port))
    });
    store.get_or_create_bearer_token().await?;
    tracing::info!(
        auth = %store.dir().join(AUTH_FILE).display(),
        "bearer token required on transport and status routes"
    );
    // re-read per request, so editing auth.json rotates the token without a restart
    let gate = BearerGate::reloading(Arc::new(store.clone()));

    let credentials = Arc::new(CredentialCache::new(Arc::new(store.clone())));
    let toolset = Toolset::builder()
        .add_tool(
            Tool::without_arguments(
                "auth_status",
                "Report whether the OAuth credential is usable and when it expires",
            ),
            auth_status,
        )
        .build();
    let dispatcher = Arc::new(ToolRouter::new(
        Implementation::new(args.server_name.clone(), env!("CARGO_PKG_VERSION")),
        toolset,
    ));

    let config = SseServerConfig {
        bind,
        sse_path: args.sse_path,
        post_path: args.post_path,
        ct: CancellationToken::new(),
        sse_keep_alive: None,
        gate: gate.clone(),
    };
    let ct_signal = config.ct.clone();
    let (sse_server, router) = SseServer::new(config, credentials.clone(), dispatcher);
    let status_routes = status::router(StatusState::new(
        sse_server.registry().clone(),
        credentials.clone(),
    ));
    // the consent routes are opened from a browser, which cannot send the bearer token
    let consent_routes = consent_router(ConsentState::new(
        store,
        credentials,
        format!("http://localhost:{}{CALLBACK_PATH}", bind.port()),
    ));
    let router = router
        .merge(gate.protect(status_routes))
        .merge(consent_routes);

    tracing::info!(
        sse = %format!("http://{}{}", sse_server.config.bind, sse_server.config.sse_path),
        message = %format!("http://{}{}", sse_server.config.bind, sse_server.config.post_path),
        "starting sse server"
    );
    tracing::info!(
        url = %format!("http://localhost:{}{}", bind.port(), AUTH_PATH),
        "open in a browser to grant access"
    );

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        tracing::info!("shutting down");
        ct_signal.cancel();
    });

    sse_server.serve_router(router).await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn auth_status(_arguments: JsonObject, context: ToolContext) -> Result<Vec<Content>, ToolError> {
    context.credentials.access_token().await?;
    let credential = context.credentials.credential().await;
    let report = serde_json::json!({
        "authenticated": credential.refresh_token.is_some(),
        "scope": credential.scope,
        "tokenType": credential.token_type,
        "expiryDate": credential.expiry_date.unwrap_or(0),
    });
    Content::json(&report)
        .map(|content| vec![content])
        .map_err(|e| ToolError::ExecutionError(e.to_string()))
}
