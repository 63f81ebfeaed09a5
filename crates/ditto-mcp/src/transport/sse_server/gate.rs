use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};

use crate::store::{ConfigStore, StoreError};

/// Where the expected bearer token comes from when it may change at runtime.
#[async_trait]
pub trait BearerSource: Send + Sync + 'static {
    /// The token currently required, `None` when the gate is open.
    async fn bearer_token(&self) -> Result<Option<String>, StoreError>;
}

/// Re-reads `auth.json` on every call, so rotating the token needs no restart.
#[async_trait]
impl BearerSource for ConfigStore {
    async fn bearer_token(&self) -> Result<Option<String>, StoreError> {
        Ok(self.load_auth_config().await?.bearer_token)
    }
}

/// Optional shared-secret check in front of the transport routes.
///
/// Without a token every request passes; with one, only requests carrying
/// exactly `Authorization: Bearer <token>` do.
#[derive(Clone, Default)]
pub enum BearerGate {
    #[default]
    Open,
    Fixed(Arc<str>),
    /// Token looked up per request; an unreadable source rejects the request.
    Reloading(Arc<dyn BearerSource>),
}

impl BearerGate {
    pub fn new(token: Option<String>) -> Self {
        match token.filter(|token| !token.is_empty()) {
            Some(token) => BearerGate::Fixed(token.into()),
            None => BearerGate::Open,
        }
    }

    pub fn reloading(source: Arc<dyn BearerSource>) -> Self {
        BearerGate::Reloading(source)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, BearerGate::Open)
    }

    pub async fn allows(&self, headers: &HeaderMap) -> Result<bool, StoreError> {
        let expected: Arc<str> = match self {
            BearerGate::Open => return Ok(true),
            BearerGate::Fixed(token) => token.clone(),
            BearerGate::Reloading(source) => {
                match source.bearer_token().await?.filter(|token| !token.is_empty()) {
                    Some(token) => token.into(),
                    None => return Ok(true),
                }
            }
        };
        Ok(headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| token == &*expected))
    }

    /// Put every route of `router` behind the gate.
    pub fn protect<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        if self.is_open() {
            return router;
        }
        router.layer(middleware::from_fn_with_state(self, require_bearer))
    }
}

impl std::fmt::Debug for BearerGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BearerGate::Open => f.write_str("BearerGate::Open"),
            BearerGate::Fixed(_) => f.write_str("BearerGate::Fixed([REDACTED])"),
            BearerGate::Reloading(_) => f.write_str("BearerGate::Reloading"),
        }
    }
}

pub async fn require_bearer(
    State(gate): State<BearerGate>,
    request: Request,
    next: Next,
) -> Response {
    match gate.allows(request.headers()).await {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            tracing::warn!(method = %request.method(), uri = %request.uri(), "unauthorized request");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Unauthorized"})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "bearer token could not be loaded");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Bearer token unavailable"})),
            )
                .into_response()
        }
    }
}
