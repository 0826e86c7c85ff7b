//! Service account authentication for the Firestore REST API.
//!
//! Mints an RS256 JWT from a service account key and exchanges it for an OAuth2
//! access token (JWT bearer grant). Tokens are cached until shortly before expiry.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_LIFETIME_SECS: u64 = 3600;
const REFRESH_MARGIN_SECS: u64 = 60;

/// Fields of a service account JSON key we need.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    private_key: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    /// Read and parse a key file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account key: {:?}", path))?;
        let key: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse service account key: {:?}", path))?;
        info!("Loaded service account key for {}", key.client_email);
        Ok(key)
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }
}

struct CachedToken {
    access_token: String,
    expires_at: u64,
}

/// How requests to the store authenticate.
pub enum Credentials {
    ServiceAccount(TokenSource),
    /// The Firestore emulator accepts a fixed owner token.
    Emulator,
}

impl Credentials {
    /// Bearer token for the next request.
    pub async fn bearer(&self, client: &reqwest::Client) -> Result<String> {
        match self {
            Self::ServiceAccount(source) => source.access_token(client).await,
            Self::Emulator => Ok("owner".to_string()),
        }
    }
}

/// Access token provider backed by a service account key.
pub struct TokenSource {
    key: ServiceAccountKey,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(key: ServiceAccountKey) -> Self {
        Self {
            key,
            cache: Mutex::new(None),
        }
    }

    /// Get a valid access token, refreshing if expired.
    pub async fn access_token(&self, client: &reqwest::Client) -> Result<String> {
        // Held across the refresh so concurrent callers never mint twice
        let mut cache = self.cache.lock().await;
        if let Some(ref cached) = *cache {
            if is_fresh(cached.expires_at, now_secs()) {
                return Ok(cached.access_token.clone());
            }
        }

        let now = now_secs();
        let jwt = self.sign_assertion(now)?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let resp: TokenResponse = client
            .post(self.key.token_uri())
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", jwt.as_str()),
            ])
            .send()
            .await
            .context("Token exchange request failed")?
            .error_for_status()
            .context("Token exchange returned error")?
            .json()
            .await
            .context("Failed to parse token response")?;

        debug!(
            "Minted access token for {} (expires in {}s)",
            self.key.client_email, resp.expires_in
        );

        let token = resp.access_token.clone();
        *cache = Some(CachedToken {
            access_token: resp.access_token,
            expires_at: now + resp.expires_in,
        });

        Ok(token)
    }

    fn sign_assertion(&self, now: u64) -> Result<String> {
        let claims = serde_json::json!({
            "iss": self.key.client_email,
            "scope": DATASTORE_SCOPE,
            "aud": self.key.token_uri(),
            "iat": now,
            "exp": now + TOKEN_LIFETIME_SECS,
        });

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .context("Invalid RSA private key in service account JSON")?;

        jsonwebtoken::encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }
}

fn is_fresh(expires_at: u64, now: u64) -> bool {
    now < expires_at.saturating_sub(REFRESH_MARGIN_SECS)
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
