//! Per-server JSON document store.
//!
//! Every logical server instance owns one directory under
//! `~/.ditto-mcp-servers/<server-name>/`, holding small JSON documents: the
//! OAuth client configuration, the current credential and the optional bearer
//! token for the transport gate. Directories are created `0700`, files `0600`.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::auth::Credential;

pub const BASE_DIR_NAME: &str = ".ditto-mcp-servers";
pub const CONFIG_FILE: &str = "config.json";
pub const TOKENS_FILE: &str = "tokens.json";
pub const AUTH_FILE: &str = "auth.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not resolve the home directory")]
    NoHomeDir,
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed document {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// OAuth client registration, the `google` section of `config.json`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Token endpoint; Google's when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    /// Consent screen; Google's when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
}

impl OAuthClientConfig {
    pub const GOOGLE_TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";
    pub const GOOGLE_AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";

    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub fn token_url(&self) -> &str {
        self.token_url.as_deref().unwrap_or(Self::GOOGLE_TOKEN_URL)
    }

    pub fn auth_url(&self) -> &str {
        self.auth_url.as_deref().unwrap_or(Self::GOOGLE_AUTH_URL)
    }
}

impl fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_url", &self.token_url)
            .field("auth_url", &self.auth_url)
            .finish()
    }
}

/// The subset of `config.json` this crate reads; the setup UI owns the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google: Option<OAuthClientConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<ServicesSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerSection>,
}

/// Which Google APIs the consent screen asks access for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesSection {
    pub gmail: bool,
    pub calendar: bool,
    pub docs: bool,
    pub sheets: bool,
    pub drive: bool,
}

impl ServicesSection {
    pub const GMAIL_SCOPE: &'static str = "https://www.googleapis.com/auth/gmail.modify";
    pub const CALENDAR_SCOPE: &'static str = "https://www.googleapis.com/auth/calendar";
    pub const DOCS_SCOPE: &'static str = "https://www.googleapis.com/auth/documents";
    pub const SHEETS_SCOPE: &'static str = "https://www.googleapis.com/auth/spreadsheets";
    pub const DRIVE_SCOPE: &'static str = "https://www.googleapis.com/auth/drive";

    /// OAuth scopes of the enabled services, in a fixed order.
    pub fn scopes(&self) -> Vec<&'static str> {
        [
            (self.gmail, Self::GMAIL_SCOPE),
            (self.calendar, Self::CALENDAR_SCOPE),
            (self.docs, Self::DOCS_SCOPE),
            (self.sheets, Self::SHEETS_SCOPE),
            (self.drive, Self::DRIVE_SCOPE),
        ]
        .into_iter()
        .filter_map(|(enabled, scope)| enabled.then_some(scope))
        .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// `auth.json`: when `bearer_token` is set every transport route requires it.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Store for `server_name` under the current user's home directory.
    pub fn new(server_name: &str) -> Result<Self, StoreError> {
        let base = directories::BaseDirs::new().ok_or(StoreError::NoHomeDir)?;
        Ok(Self::with_base_dir(
            base.home_dir().join(BASE_DIR_NAME),
            server_name,
        ))
    }

    pub fn with_base_dir(base: impl Into<PathBuf>, server_name: &str) -> Self {
        Self {
            dir: base.into().join(server_name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| self.io_error(&self.dir, source))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|source| self.io_error(&self.dir, source))?;
        }
        Ok(())
    }

    /// Load a document; `Ok(None)` when it does not exist.
    pub async fn load<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>, StoreError> {
        let path = self.dir.join(file);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "document not found");
                return Ok(None);
            }
            Err(source) => return Err(self.io_error(&path, source)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| StoreError::Json { path, source })
    }

    /// Write a document through a temporary file so readers never see a torn write.
    pub async fn save<T: Serialize>(&self, file: &str, document: &T) -> Result<(), StoreError> {
        self.ensure_dir().await?;
        let path = self.dir.join(file);
        let data = serde_json::to_vec_pretty(document).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        let staging = self.dir.join(format!(".{file}.tmp"));
        write_private(&staging, &data)
            .await
            .map_err(|source| self.io_error(&staging, source))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|source| self.io_error(&path, source))?;
        debug!(path = %path.display(), "document saved");
        Ok(())
    }

    pub async fn exists(&self, file: &str) -> bool {
        tokio::fs::try_exists(self.dir.join(file))
            .await
            .unwrap_or(false)
    }

    /// Remove a document; a missing file is not an error.
    pub async fn delete(&self, file: &str) -> Result<(), StoreError> {
        let path = self.dir.join(file);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(&path, source)),
        }
    }

    pub async fn load_auth_config(&self) -> Result<AuthConfig, StoreError> {
        Ok(self.load::<AuthConfig>(AUTH_FILE).await?.unwrap_or_default())
    }

    /// The bearer token from `auth.json`, generating and saving a random one
    /// (32 bytes, hex) when none is set.
    pub async fn get_or_create_bearer_token(&self) -> Result<String, StoreError> {
        let mut auth = self.load_auth_config().await?;
        if let Some(token) = auth.bearer_token.as_ref().filter(|token| !token.is_empty()) {
            return Ok(token.clone());
        }
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
        let token: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
        auth.bearer_token = Some(token.clone());
        self.save(AUTH_FILE, &auth).await?;
        info!(dir = %self.dir.display(), "generated bearer token");
        Ok(token)
    }

    fn io_error(&self, path: &Path, source: io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `data` to a file that is `0600` from the moment it exists.
async fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    // a stale file from an interrupted save keeps its old mode
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }
    file.write_all(data).await?;
    file.sync_all().await
}

/// Durable home of the credential and the OAuth client it belongs to.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn load_client_config(&self) -> Result<Option<OAuthClientConfig>, StoreError>;
    async fn load_credential(&self) -> Result<Option<Credential>, StoreError>;
    async fn save_credential(&self, credential: &Credential) -> Result<(), StoreError>;
}

#[async_trait]
impl CredentialStore for ConfigStore {
    async fn load_client_config(&self) -> Result<Option<OAuthClientConfig>, StoreError> {
        let document = self.load::<ServerConfigDocument>(CONFIG_FILE).await?;
        Ok(document.and_then(|document| document.google))
    }

    async fn load_credential(&self) -> Result<Option<Credential>, StoreError> {
        self.load(TOKENS_FILE).await
    }

    async fn save_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        info!(dir = %self.dir.display(), "persisting OAuth credential");
        self.save(TOKENS_FILE, credential).await.inspect_err(|e| {
            warn!(error = %e, "failed to persist OAuth credential");
        })
    }
}
