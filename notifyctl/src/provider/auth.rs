//! OAuth2 client-credentials access tokens for the messaging provider.
//!
//! The client proves its identity with a short-lived RS512 JWT (`client_assertion`) signed by a
//! private key whose public half is registered with the provider. The exchanged access token is
//! cached on the instance until shortly before it expires.

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    config::OAuthConfig,
    errors::{Error, Result},
};

/// Lifetime of a client assertion.
const ASSERTION_LIFETIME_SECS: i64 = 300;
/// Tokens are refreshed this long before the provider-reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 300;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ClientAssertionClaims {
    pub sub: String,
    pub iss: String,
    pub jti: String,
    pub aud: String,
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    /// `expires_in` arrives as a number or a numeric string depending on the gateway.
    fn lifetime(&self) -> Duration {
        let secs = match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        Duration::from_secs(secs.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS))
    }
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

pub struct AccessTokenProvider {
    client: reqwest::Client,
    config: OAuthConfig,
    cached: Mutex<Option<CachedToken>>,
}

impl AccessTokenProvider {
    pub fn new(client: reqwest::Client, config: OAuthConfig) -> Self {
        Self {
            client,
            config,
            cached: Mutex::new(None),
        }
    }

    /// Return a valid bearer token, exchanging a fresh client assertion when needed.
    #[instrument(skip(self), err)]
    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.token.clone());
        }

        let assertion = self.client_assertion()?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_assertion_type", "urn:ietf:params:oauth:client-assertion-type:jwt-bearer")
            .append_pair("client_assertion", &assertion)
            .finish();

        let response = self
            .client
            .post(self.config.token_url.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = token.lifetime();
        debug!(lifetime_secs = lifetime.as_secs(), "Obtained provider access token");

        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        });
        Ok(token.access_token)
    }

    pub(crate) fn client_assertion(&self) -> Result<String> {
        let mut header = Header::new(Algorithm::RS512);
        header.kid = Some(self.config.key_id.clone());

        let claims = ClientAssertionClaims {
            sub: self.config.client_id.clone(),
            iss: self.config.client_id.clone(),
            jti: Uuid::new_v4().to_string(),
            aud: self.config.token_url.to_string(),
            exp: Utc::now().timestamp() + ASSERTION_LIFETIME_SECS,
        };

        let key = EncodingKey::from_rsa_pem(self.config.private_key_pem.as_bytes()).map_err(|e| Error::Internal {
            operation: format!("load OAuth signing key: {e}"),
        })?;

        jsonwebtoken::encode(&header, &claims, &key).map_err(|e| Error::Internal {
            operation: format!("sign OAuth client assertion: {e}"),
        })
    }
}
