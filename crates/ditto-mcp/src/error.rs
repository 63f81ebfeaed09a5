use crate::{auth::CredentialError, store::StoreError, transport::RegistryError};

/// This is an unified error type for the errors the bridge can return.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Session registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::task::JoinError),
}

impl BridgeError {
    /// True for errors fixed by completing the OAuth setup, not by retrying.
    pub fn is_not_configured(&self) -> bool {
        matches!(
            self,
            BridgeError::Credential(CredentialError::NotConfigured(_))
        )
    }
}
