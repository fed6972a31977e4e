//! Ephemeral credential fetching
//!
//! The Realtime socket is authenticated with a short-lived token minted by a
//! token-issuing endpoint we don't own. This module asks that endpoint for one
//! token per connection attempt and never retries on its own.
//!
//! # Endpoint contract
//!
//! ```text
//! POST {token_endpoint}   { "sessionConfig": { ... } }
//!   200 → { "success": true, "token": "ek_...", "expires_at": 1730000000 }
//!   4xx/5xx → { "error": "human readable reason" }
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::protocol::{SessionConfig, API_KEY_SUBPROTOCOL_PREFIX};

/// Default bound on one token request
pub const DEFAULT_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything shorter can't be a real ephemeral key
const MIN_TOKEN_LEN: usize = 10;

/// Short-lived token authenticating one streaming session
///
/// `Debug` never prints the token. Converting into a subprotocol consumes it.
pub struct Credential {
    token: SecretString,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// True when the expiry is known and has passed
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    pub fn token_len(&self) -> usize {
        self.token.expose_secret().len()
    }

    /// Subprotocol entry carrying the token (`openai-insecure-api-key.<token>`)
    pub fn into_subprotocol(self) -> SecretString {
        SecretString::from(format!(
            "{}{}",
            API_KEY_SUBPROTOCOL_PREFIX,
            self.token.expose_secret()
        ))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Why a credential could not be obtained
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CredentialError {
    #[error("Session token request timed out after {0:?}, please try again")]
    Timeout(Duration),

    #[error("Could not reach the session token endpoint: {0}")]
    Network(String),

    #[error("Session token request failed (HTTP {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Session token response could not be parsed: {0}")]
    Parse(String),

    #[error("Session token endpoint refused the request: {0}")]
    Rejected(String),

    #[error("Session token response did not contain a token")]
    MissingToken,

    #[error("Session token is malformed: {0}")]
    Malformed(String),
}

/// Anything that can mint a credential for a session
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, config: &SessionConfig) -> Result<Credential, CredentialError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    session_config: &'a SessionConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    token: Option<String>,
    /// Unix timestamp (seconds)
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Fetches credentials from an HTTP token endpoint
pub struct HttpCredentialFetcher {
    client: Client,
    endpoint: String,
    timeout: Duration,
    model: Option<String>,
}

impl HttpCredentialFetcher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CredentialError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
            model: None,
        })
    }

    /// Ask the endpoint to mint the token for a specific model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn map_send_error(&self, err: reqwest::Error) -> CredentialError {
        if err.is_timeout() {
            CredentialError::Timeout(self.timeout)
        } else {
            CredentialError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialFetcher {
    async fn fetch(&self, config: &SessionConfig) -> Result<Credential, CredentialError> {
        log::info!("Credential: requesting session token from {}", self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&TokenRequest {
                session_config: config,
                model: self.model.as_deref(),
            })
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();

            let message = match serde_json::from_str::<ErrorResponse>(&error_text) {
                Ok(body) => body.error,
                Err(_) if error_text.trim().is_empty() => status
                    .canonical_reason()
                    .unwrap_or("no details")
                    .to_string(),
                Err(_) => error_text,
            };

            log::error!(
                "Credential: token endpoint error ({}): {}",
                status.as_u16(),
                message
            );

            return Err(CredentialError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                CredentialError::Timeout(self.timeout)
            } else {
                CredentialError::Parse(e.to_string())
            }
        })?;

        if !body.success {
            return Err(CredentialError::Rejected(
                body.error
                    .unwrap_or_else(|| "response was not marked successful".to_string()),
            ));
        }

        let token = body
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or(CredentialError::MissingToken)?;

        if token.len() < MIN_TOKEN_LEN {
            return Err(CredentialError::Malformed(format!(
                "expected at least {} characters, got {}",
                MIN_TOKEN_LEN,
                token.len()
            )));
        }

        let expires_at = body
            .expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        let credential = Credential::new(token, expires_at);
        log::info!(
            "Credential: obtained token ({} chars, expires {:?})",
            credential.token_len(),
            credential.expires_at()
        );

        Ok(credential)
    }
}
