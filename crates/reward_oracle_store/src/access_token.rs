use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use serde::Deserialize;

use crate::StoreError;

pub const DEFAULT_OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Where Firestore bearer tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirestoreCredentials {
    /// Fixed token, never refreshed.
    Static { access_token: String },
    /// `authorized_user` application default credentials, refreshed with the OAuth
    /// refresh-token grant.
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        token_url: String,
    },
    /// Default service account of the compute instance.
    MetadataServer { token_url: String },
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    refresh_token: String,
}

impl FirestoreCredentials {
    pub fn metadata_server() -> Self {
        FirestoreCredentials::MetadataServer {
            token_url: DEFAULT_METADATA_TOKEN_URL.to_string(),
        }
    }

    /// Reads an application default credentials file. Only `authorized_user` files are
    /// understood; service account keys need a JWT signer and are refused.
    pub fn from_credentials_file(path: &Path) -> Result<Self, StoreError> {
        let source = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|err| StoreError::Io {
            path: source.clone(),
            message: err.to_string(),
        })?;
        let file: CredentialsFile =
            serde_json::from_str(raw.as_str()).map_err(|err| StoreError::Decode {
                source: source.clone(),
                message: err.to_string(),
            })?;
        if file.kind != "authorized_user" {
            return Err(StoreError::Unavailable {
                reason: format!(
                    "unsupported credentials type {:?} in {source}; use authorized_user credentials or the metadata server",
                    file.kind
                ),
            });
        }
        if file.refresh_token.trim().is_empty() {
            return Err(StoreError::Decode {
                source,
                message: "refresh_token is empty".to_string(),
            });
        }
        Ok(FirestoreCredentials::AuthorizedUser {
            client_id: file.client_id,
            client_secret: file.client_secret,
            refresh_token: file.refresh_token,
            token_url: DEFAULT_OAUTH_TOKEN_URL.to_string(),
        })
    }

    fn refreshes(&self) -> bool {
        !matches!(self, FirestoreCredentials::Static { .. })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Hands out bearer tokens, fetching a new one once the cached token is within a minute
/// of expiry.
#[derive(Debug)]
pub(crate) struct AccessTokenSource {
    credentials: FirestoreCredentials,
    cached: Mutex<Option<CachedToken>>,
}

impl AccessTokenSource {
    pub(crate) fn new(credentials: FirestoreCredentials) -> Self {
        Self {
            credentials,
            cached: Mutex::new(None),
        }
    }

    pub(crate) fn refreshes(&self) -> bool {
        self.credentials.refreshes()
    }

    pub(crate) fn access_token(&self, client: &Client) -> Result<String, StoreError> {
        if let FirestoreCredentials::Static { access_token } = &self.credentials {
            return Ok(access_token.clone());
        }
        let mut cached = self.lock();
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }
        let fetched_at = Instant::now();
        let response = self.fetch(client)?;
        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            refresh_at: fetched_at + lifetime,
        });
        Ok(response.access_token)
    }

    pub(crate) fn invalidate(&self) {
        *self.lock() = None;
    }

    fn fetch(&self, client: &Client) -> Result<TokenResponse, StoreError> {
        let request = match &self.credentials {
            FirestoreCredentials::Static { .. } => {
                return Err(StoreError::Unavailable {
                    reason: "static token cannot be refreshed".to_string(),
                })
            }
            FirestoreCredentials::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_url,
            } => client.post(token_url.as_str()).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ]),
            FirestoreCredentials::MetadataServer { token_url } => client
                .get(token_url.as_str())
                .header("Metadata-Flavor", "Google"),
        };
        let response = request.send().map_err(|err| StoreError::Http {
            message: format!("access token request failed: {err}"),
        })?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_else(|_| "<no body>".to_string());
            return Err(StoreError::HttpStatus {
                code: status.as_u16(),
                message: format!("access token endpoint: {message}"),
            });
        }
        let token: TokenResponse = response.json().map_err(|err| StoreError::Decode {
            source: "access token response".to_string(),
            message: err.to_string(),
        })?;
        if token.access_token.is_empty() {
            return Err(StoreError::Decode {
                source: "access token response".to_string(),
                message: "access_token is empty".to_string(),
            });
        }
        Ok(token)
    }

    fn lock(&self) -> MutexGuard<'_, Option<CachedToken>> {
        self.cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
