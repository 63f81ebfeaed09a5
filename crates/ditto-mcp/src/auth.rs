//! OAuth credential lifecycle.
//!
//! One [`AuthenticatedClient`] per process, built lazily by the
//! [`CredentialCache`] from the stored client configuration and credential.
//! The client refreshes its access token on demand and reports every refresh to
//! a [`RefreshHandler`]; the default handler, [`PersistOnRefresh`], merges the
//! new fields over the last persisted credential and writes the result back.
//!
//! The first credential comes from the authorization-code flow served by
//! [`consent_router`]: the consent redirect and the callback that exchanges
//! the code and installs the result in the cache.

mod cache;
mod client;
mod consent;
mod credential;

pub use cache::CredentialCache;
pub use client::{
    AuthenticatedClient, EAGER_REFRESH_THRESHOLD, OAuth2Refresher, PersistOnRefresh,
    RefreshHandler, TokenRefresher,
};
pub use consent::{AUTH_PATH, CALLBACK_PATH, ConsentFlow, ConsentState, router as consent_router};
pub use credential::{Credential, merge_credential};
#[cfg(test)]
pub(crate) use client::tests as test_support;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credentials are not configured: {0}")]
    NotConfigured(&'static str),
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("token endpoint returned no access token")]
    MissingAccessToken,
    #[error("invalid OAuth endpoint url: {0}")]
    InvalidEndpointUrl(#[from] url::ParseError),
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("authorization code exchange failed: {0}")]
    CodeExchange(String),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}
