//! Authorization-code bootstrap.
//!
//! `GET /api/google/auth` sends the browser to the provider's consent screen
//! asking for the scopes of every enabled service. The provider redirects back
//! to `GET /api/google/callback` with a code, which is exchanged for tokens
//! that are persisted and handed to the [`CredentialCache`].

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, Scope, TokenUrl, basic::BasicClient,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::{Credential, CredentialCache, CredentialError, client::credential_from_token};
use crate::store::{CONFIG_FILE, ConfigStore, OAuthClientConfig, ServerConfigDocument};

pub const AUTH_PATH: &str = "/api/google/auth";
pub const CALLBACK_PATH: &str = "/api/google/callback";

/// Consent redirects still waiting for their callback.
const MAX_PENDING: usize = 16;

type ConsentClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// One OAuth client registration able to start the consent flow and redeem its code.
pub struct ConsentFlow {
    client: ConsentClient,
    http: reqwest::Client,
}

impl ConsentFlow {
    pub fn new(config: &OAuthClientConfig, redirect_uri: &str) -> Result<Self, CredentialError> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(config.auth_url().to_string())?)
            .set_token_uri(TokenUrl::new(config.token_url().to_string())?)
            .set_redirect_uri(RedirectUrl::new(redirect_uri.to_string())?);
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, http })
    }

    /// Consent screen URL for `scopes`, asking for offline access so the
    /// response carries a refresh token, plus the `state` to expect back.
    pub fn authorize_url(&self, scopes: &[&str]) -> (url::Url, CsrfToken) {
        self.client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(scopes.iter().map(|scope| Scope::new(scope.to_string())))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url()
    }

    pub async fn exchange_code(&self, code: &str) -> Result<Credential, CredentialError> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| CredentialError::CodeExchange(e.to_string()))?;
        Ok(credential_from_token(&token))
    }
}

pub struct ConsentState {
    store: ConfigStore,
    credentials: Arc<CredentialCache>,
    redirect_uri: String,
    pending: Mutex<VecDeque<String>>,
}

impl ConsentState {
    /// `redirect_uri` must be the externally visible URL of [`CALLBACK_PATH`].
    pub fn new(
        store: ConfigStore,
        credentials: Arc<CredentialCache>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            store,
            credentials,
            redirect_uri: redirect_uri.into(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    fn remember(&self, state: String) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.len() == MAX_PENDING {
            pending.pop_front();
        }
        pending.push_back(state);
    }

    fn redeem(&self, state: &str) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.iter().position(|pending| pending == state) {
            Some(index) => pending.remove(index).is_some(),
            None => false,
        }
    }

    /// The current `config.json`; re-read per request so setup changes apply at once.
    async fn load_config(&self) -> Result<Option<ServerConfigDocument>, CredentialError> {
        Ok(self.store.load::<ServerConfigDocument>(CONFIG_FILE).await?)
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

async fn auth_handler(State(state): State<Arc<ConsentState>>) -> Response {
    let document = match state.load_config().await {
        Ok(Some(document)) => document,
        Ok(None) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "Configuration not found. Complete the setup first.",
            );
        }
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let Some(config) = document.google.filter(|config| config.is_complete()) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Google OAuth credentials not configured.",
        );
    };
    let scopes = document.services.unwrap_or_default().scopes();
    if scopes.is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "No services enabled. Enable at least one Google service.",
        );
    }
    let flow = match ConsentFlow::new(&config, &state.redirect_uri) {
        Ok(flow) => flow,
        Err(e) => {
            warn!(error = %e, "consent flow could not be started");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    let (url, csrf) = flow.authorize_url(&scopes);
    state.remember(csrf.secret().clone());
    info!(scopes = scopes.len(), "redirecting to the consent screen");
    Redirect::temporary(url.as_str()).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

async fn callback_handler(
    State(state): State<Arc<ConsentState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        warn!(%error, "provider refused consent");
        return json_error(StatusCode::BAD_REQUEST, error);
    }
    let Some(code) = query.code.filter(|code| !code.is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "missing_code");
    };
    if !query.state.is_some_and(|csrf| state.redeem(&csrf)) {
        warn!("consent callback with unknown state");
        return json_error(StatusCode::BAD_REQUEST, "invalid_state");
    }
    let config = match state.load_config().await {
        Ok(document) => document.and_then(|document| document.google),
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let Some(config) = config.filter(|config| config.is_complete()) else {
        return json_error(StatusCode::BAD_REQUEST, "missing_config");
    };
    let credential = match ConsentFlow::new(&config, &state.redirect_uri) {
        Ok(flow) => flow.exchange_code(&code).await,
        Err(e) => Err(e),
    };
    let credential = match credential {
        Ok(credential) => credential,
        Err(e) => {
            warn!(error = %e, "authorization code was not redeemed");
            return json_error(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };
    if let Err(e) = state.credentials.install(credential).await {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    info!("consent completed, credential installed");
    Html("<h1>Authentication successful!</h1><p>You can close this window.</p>").into_response()
}

pub fn router(state: ConsentState) -> Router {
    Router::new()
        .route(AUTH_PATH, get(auth_handler))
        .route(CALLBACK_PATH, get(callback_handler))
        .with_state(Arc::new(state))
}
