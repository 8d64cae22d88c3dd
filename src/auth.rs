// 🔐 Token Verification Relay
// Hands the caller's ID token to the identity provider and returns the claims.
// No retry, no caching: every call goes to the provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Identity Toolkit lookup endpoint; the API key goes in the `key` query parameter.
pub const DEFAULT_IDENTITY_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:lookup";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token is required")]
    MissingToken,

    #[error("token rejected: {0}")]
    Rejected(String),

    #[error("identity provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Decoded identity claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Extract the token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

// ============================================================================
// HTTP VERIFIER
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    id_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    error: ProviderErrorBody,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    message: String,
}

#[derive(Debug, Clone)]
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpIdentityVerifier {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }

        debug!(token_len = token.len(), "verifying token with identity provider");

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&LookupRequest { id_token: token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ProviderError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("status {}", status.as_u16()));
            warn!(status = status.as_u16(), %reason, "identity provider rejected token");
            return Err(AuthError::Rejected(reason));
        }

        let lookup: LookupResponse = response.json().await?;
        let user = lookup
            .users
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::Rejected("no user for token".to_string()))?;

        Ok(Claims {
            uid: user.local_id,
            email: user.email,
        })
    }
}
