use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use oauth2::{
    ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken, TokenResponse, TokenUrl,
    basic::{BasicClient, BasicTokenResponse},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{Credential, CredentialError, merge_credential};
use crate::store::{CredentialStore, OAuthClientConfig};

/// Refresh this long before the recorded expiry.
pub const EAGER_REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Exchanges a refresh token for a fresh (possibly partial) credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, CredentialError>;
}

/// Receives every credential the client obtained by refreshing.
#[async_trait]
pub trait RefreshHandler: Send + Sync + 'static {
    async fn on_refresh(&self, refreshed: &Credential);

    /// The client's credential was replaced wholesale, e.g. after a new consent.
    async fn on_replace(&self, _credential: &Credential) {}
}

type RefreshClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// The OAuth 2.0 refresh-token grant against the configured token endpoint.
pub struct OAuth2Refresher {
    client: RefreshClient,
    http: reqwest::Client,
}

impl OAuth2Refresher {
    pub fn new(config: &OAuthClientConfig) -> Result<Self, CredentialError> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_token_uri(TokenUrl::new(config.token_url().to_string())?);
        // token endpoints must not be followed through redirects
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, http })
    }
}

#[async_trait]
impl TokenRefresher for OAuth2Refresher {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, CredentialError> {
        let refresh_token = RefreshToken::new(refresh_token.to_string());
        let token = self
            .client
            .exchange_refresh_token(&refresh_token)
            .request_async(&self.http)
            .await
            .map_err(|e| CredentialError::Refresh(e.to_string()))?;
        Ok(credential_from_token(&token))
    }
}

/// A token endpoint response as a (possibly partial) [`Credential`], with the
/// relative `expires_in` turned into an absolute expiry.
pub(crate) fn credential_from_token(token: &BasicTokenResponse) -> Credential {
    let expiry_date = token
        .expires_in()
        .and_then(|ttl| chrono::TimeDelta::from_std(ttl).ok())
        .map(|ttl| (chrono::Utc::now() + ttl).timestamp_millis());
    Credential {
        access_token: Some(token.access_token().secret().clone()),
        refresh_token: token.refresh_token().map(|t| t.secret().clone()),
        scope: token.scopes().map(|scopes| {
            scopes
                .iter()
                .map(|scope| scope.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        }),
        token_type: Some(AsRef::<str>::as_ref(token.token_type()).to_string()),
        expiry_date,
    }
}

/// Merges every refresh over the last persisted credential and writes it back.
pub struct PersistOnRefresh {
    store: Arc<dyn CredentialStore>,
    last_known: Mutex<Credential>,
}

impl PersistOnRefresh {
    pub fn new(store: Arc<dyn CredentialStore>, persisted: Credential) -> Self {
        Self {
            store,
            last_known: Mutex::new(persisted),
        }
    }
}

#[async_trait]
impl RefreshHandler for PersistOnRefresh {
    async fn on_refresh(&self, refreshed: &Credential) {
        // held across the write so the file always ends with the newest merge
        let mut last_known = self.last_known.lock().await;
        let merged = merge_credential(&last_known, refreshed);
        if let Err(e) = self.store.save_credential(&merged).await {
            warn!(error = %e, "refreshed credential was not persisted");
        }
        *last_known = merged;
    }

    async fn on_replace(&self, credential: &Credential) {
        *self.last_known.lock().await = credential.clone();
    }
}

/// The process-wide authenticated client handed to every tool call.
pub struct AuthenticatedClient {
    credential: RwLock<Credential>,
    refresher: Arc<dyn TokenRefresher>,
    on_refresh: Arc<dyn RefreshHandler>,
    refresh_lock: Mutex<()>,
}

impl AuthenticatedClient {
    pub fn new(
        credential: Credential,
        refresher: Arc<dyn TokenRefresher>,
        on_refresh: Arc<dyn RefreshHandler>,
    ) -> Self {
        Self {
            credential: RwLock::new(credential),
            refresher,
            on_refresh,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Snapshot of the in-memory credential.
    pub async fn credential(&self) -> Credential {
        self.credential.read().await.clone()
    }

    /// A usable access token, refreshing first when it is missing or about to expire.
    /// Concurrent callers share one refresh.
    pub async fn access_token(&self) -> Result<String, CredentialError> {
        if let Some(token) = self.fresh_access_token().await {
            return Ok(token);
        }
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.fresh_access_token().await {
            debug!("access token refreshed by a concurrent caller");
            return Ok(token);
        }
        self.refresh_locked().await
    }

    /// Swap in a credential obtained outside the refresh path.
    pub async fn replace_credential(&self, credential: Credential) {
        let _guard = self.refresh_lock.lock().await;
        *self.credential.write().await = credential.clone();
        self.on_refresh.on_replace(&credential).await;
        info!(expiry_date = ?credential.expiry_date, "credential replaced");
    }

    /// Refresh regardless of the recorded expiry, e.g. after a 401 from an API.
    pub async fn force_refresh(&self) -> Result<String, CredentialError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// `Authorization` header value for outbound API calls.
    pub async fn authorization_header(&self) -> Result<String, CredentialError> {
        Ok(format!("Bearer {}", self.access_token().await?))
    }

    async fn fresh_access_token(&self) -> Option<String> {
        let credential = self.credential.read().await;
        let threshold = EAGER_REFRESH_THRESHOLD.as_millis() as i64;
        if credential.needs_refresh(chrono::Utc::now().timestamp_millis(), threshold) {
            None
        } else {
            credential.access_token.clone()
        }
    }

    async fn refresh_locked(&self) -> Result<String, CredentialError> {
        let refresh_token = self
            .credential
            .read()
            .await
            .refresh_token
            .clone()
            .ok_or(CredentialError::MissingRefreshToken)?;
        let refreshed = self.refresher.refresh(&refresh_token).await?;
        let merged = {
            let mut credential = self.credential.write().await;
            *credential = merge_credential(&credential, &refreshed);
            credential.clone()
        };
        info!(expiry_date = ?merged.expiry_date, "access token refreshed");
        self.on_refresh.on_refresh(&refreshed).await;
        merged.access_token.ok_or(CredentialError::MissingAccessToken)
    }
}
