use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use super::{AuthenticatedClient, Credential, CredentialError, OAuth2Refresher, PersistOnRefresh};
use crate::store::CredentialStore;

/// Lazily builds and then hands out the single [`AuthenticatedClient`] of the process.
pub struct CredentialCache {
    store: Arc<dyn CredentialStore>,
    client: OnceCell<Arc<AuthenticatedClient>>,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            client: OnceCell::new(),
        }
    }

    /// A cache that is already holding `client`.
    pub fn with_client(store: Arc<dyn CredentialStore>, client: Arc<AuthenticatedClient>) -> Self {
        Self {
            store,
            client: OnceCell::new_with(Some(client)),
        }
    }

    /// The cached client, building it on first use.
    ///
    /// Fails with [`CredentialError::NotConfigured`] while the OAuth client or the
    /// stored credential is missing. Failures are not cached, so the next call
    /// retries once the setup has been completed.
    pub async fn get_client(&self) -> Result<Arc<AuthenticatedClient>, CredentialError> {
        self.client
            .get_or_try_init(|| self.build_client())
            .await
            .cloned()
    }

    /// The in-memory credential when a client was already built, else the stored one.
    pub async fn snapshot(&self) -> Result<Option<Credential>, CredentialError> {
        match self.client.get() {
            Some(client) => Ok(Some(client.credential().await)),
            None => Ok(self.store.load_credential().await?),
        }
    }

    /// Persist a freshly obtained credential and hand it to the live client, if any.
    ///
    /// Without a live client the next [`CredentialCache::get_client`] builds one
    /// from what was just saved.
    pub async fn install(&self, credential: Credential) -> Result<(), CredentialError> {
        self.store.save_credential(&credential).await?;
        if let Some(client) = self.client.get() {
            client.replace_credential(credential).await;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.client.initialized()
    }

    async fn build_client(&self) -> Result<Arc<AuthenticatedClient>, CredentialError> {
        let config = self
            .store
            .load_client_config()
            .await?
            .filter(|config| config.is_complete())
            .ok_or(CredentialError::NotConfigured("missing OAuth client id or secret"))?;
        let credential = self
            .store
            .load_credential()
            .await?
            .filter(|credential| {
                credential.access_token.is_some() || credential.refresh_token.is_some()
            })
            .ok_or(CredentialError::NotConfigured("no stored credential"))?;
        let refresher = OAuth2Refresher::new(&config)?;
        let on_refresh = PersistOnRefresh::new(self.store.clone(), credential.clone());
        info!(client_id = %config.client_id, "authenticated client created");
        Ok(Arc::new(AuthenticatedClient::new(
            credential,
            Arc::new(refresher),
            Arc::new(on_refresh),
        )))
    }
}
