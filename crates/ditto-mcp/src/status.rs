//! `GET /status`: live session count, uptime and whether OAuth is set up.

use std::{sync::Arc, time::Instant};

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::{auth::CredentialCache, transport::SessionRegistry};

pub const STATUS_PATH: &str = "/status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub sessions: usize,
    /// Milliseconds since the server started.
    pub uptime: u64,
    pub google: GoogleStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleStatus {
    /// A refresh token is on hand, so access can be renewed without consent.
    pub authenticated: bool,
    /// Access token expiry in epoch milliseconds, `0` when unknown.
    pub expiry_date: i64,
}

pub struct StatusState {
    registry: Arc<dyn SessionRegistry>,
    credentials: Arc<CredentialCache>,
    started: Instant,
}

impl StatusState {
    pub fn new(registry: Arc<dyn SessionRegistry>, credentials: Arc<CredentialCache>) -> Self {
        Self {
            registry,
            credentials,
            started: Instant::now(),
        }
    }

    pub async fn snapshot(&self) -> ServerStatus {
        let credential = self.credentials.snapshot().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "credential unavailable for status");
            None
        });
        ServerStatus {
            sessions: self.registry.len().await,
            uptime: self.started.elapsed().as_millis() as u64,
            google: GoogleStatus {
                authenticated: credential
                    .as_ref()
                    .is_some_and(|credential| credential.refresh_token.is_some()),
                expiry_date: credential
                    .and_then(|credential| credential.expiry_date)
                    .unwrap_or(0),
            },
        }
    }
}

async fn status_handler(State(state): State<Arc<StatusState>>) -> Json<ServerStatus> {
    Json(state.snapshot().await)
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status_handler))
        .with_state(Arc::new(state))
}
