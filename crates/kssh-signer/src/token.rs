//! OAuth access tokens for Google Cloud KMS.

use crate::error::SigningError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;
use zeroize::Zeroizing;

pub const KMS_SCOPE: &str = "https://www.googleapis.com/auth/cloudkms";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const JWT_BEARER_GRANT: &str = "urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;
const GCLOUD_TOKEN_TTL: Duration = Duration::from_secs(600);
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub fn load(path: &Path) -> Result<Self, SigningError> {
        let data = Zeroizing::new(std::fs::read_to_string(path)?);
        serde_json::from_str(&data).map_err(|e| {
            SigningError::AuthenticationFailed(format!(
                "credentials file {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }

    /// Self-signed RS256 JWT used for the bearer grant.
    pub fn assertion(&self, issued_at: u64) -> Result<String, SigningError> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let claims = serde_json::json!({
            "iss": self.client_email,
            "scope": KMS_SCOPE,
            "aud": self.token_uri(),
            "iat": issued_at,
            "exp": issued_at + ASSERTION_LIFETIME_SECS,
        });
        let claims = URL_SAFE_NO_PAD.encode(claims.to_string());
        let signing_input = format!("{}.{}", header, claims);

        let key = RsaPrivateKey::from_pkcs8_pem(&self.private_key)
            .map_err(|e| SigningError::AuthenticationFailed(format!("service account key: {e}")))?;
        let sig = key
            .sign(
                Pkcs1v15Sign::new::<Sha256>(),
                &Sha256::digest(signing_input.as_bytes()),
            )
            .map_err(|e| SigningError::AuthenticationFailed(e.to_string()))?;
        Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig)))
    }
}

#[derive(Clone, Debug)]
pub enum TokenProvider {
    Static(String),
    ServiceAccount(ServiceAccountKey),
    /// `gcloud auth print-access-token`, then the GCE metadata server.
    Ambient,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct TokenSource {
    provider: TokenProvider,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.provider {
            TokenProvider::Static(_) => "static",
            TokenProvider::ServiceAccount(_) => "service-account",
            TokenProvider::Ambient => "ambient",
        };
        f.debug_struct("TokenSource").field("provider", &kind).finish()
    }
}

impl TokenSource {
    pub fn new(provider: TokenProvider) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }

    /// Picks a provider: explicit token, `GOOGLE_OAUTH_ACCESS_TOKEN`,
    /// service-account file, then ambient credentials.
    pub fn discover(
        access_token: Option<String>,
        credentials_file: Option<&Path>,
    ) -> Result<Self, SigningError> {
        let env_token = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        let provider = if let Some(token) = access_token.or(env_token) {
            TokenProvider::Static(token)
        } else if let Some(path) = credentials_file {
            TokenProvider::ServiceAccount(ServiceAccountKey::load(path)?)
        } else {
            TokenProvider::Ambient
        };
        Ok(Self::new(provider))
    }

    pub async fn token(&self, http: &reqwest::Client) -> Result<String, SigningError> {
        let service_account = match &self.provider {
            TokenProvider::Static(token) => return Ok(token.clone()),
            TokenProvider::ServiceAccount(key) => Some(key),
            TokenProvider::Ambient => None,
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let (value, ttl) = match service_account {
            Some(key) => exchange_assertion(http, key).await?,
            None => match gcloud_token().await {
                Ok(token) => (token, GCLOUD_TOKEN_TTL),
                Err(err) => {
                    debug!(error = %err, "gcloud token unavailable, trying metadata server");
                    metadata_token(http).await?
                }
            },
        };
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(value)
    }
}

async fn exchange_assertion(
    http: &reqwest::Client,
    key: &ServiceAccountKey,
) -> Result<(String, Duration), SigningError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| SigningError::AuthenticationFailed(e.to_string()))?
        .as_secs();
    let body = format!(
        "grant_type={}&assertion={}",
        JWT_BEARER_GRANT,
        key.assertion(now)?
    );
    let resp = http
        .post(key.token_uri())
        .header("content-type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(|e| SigningError::BackendUnavailable(format!("token endpoint: {e}")))?;
    read_token(resp).await
}

async fn metadata_token(http: &reqwest::Client) -> Result<(String, Duration), SigningError> {
    let resp = http
        .get(METADATA_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| {
            SigningError::AuthenticationFailed(format!("no usable google credentials: {e}"))
        })?;
    read_token(resp).await
}

async fn read_token(resp: reqwest::Response) -> Result<(String, Duration), SigningError> {
    let status = resp.status();
    if !status.is_success() {
        let detail = resp.text().await.unwrap_or_default();
        return Err(SigningError::AuthenticationFailed(format!(
            "token request failed with {}: {}",
            status, detail
        )));
    }
    let token: TokenResponse = resp
        .json()
        .await
        .map_err(|e| SigningError::AuthenticationFailed(e.to_string()))?;
    let ttl = Duration::from_secs(token.expires_in.unwrap_or(300));
    Ok((token.access_token, ttl))
}

async fn gcloud_token() -> Result<String, SigningError> {
    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .await?;
    if !output.status.success() {
        return Err(SigningError::AuthenticationFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(SigningError::AuthenticationFailed(
            "gcloud printed an empty token".to_string(),
        ));
    }
    Ok(token)
}
