//! Pending authorization requests, keyed by `state`.
//!
//! A record is written by a login initiator and consumed exactly once by the
//! matching callback: [`consume`] reads and deletes it in one store call, so a
//! replayed callback finds nothing and fails with `NoSuchAuthRequest`.

use crate::atproto::AtprotoAuthRequest;
use crate::fediverse::MastodonAuthRequest;
use crate::oidc::OidcAuthRequest;
use crate::store::{self, keys, KvStore};
use crate::AuthError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Per-protocol handshake state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum AuthRequest {
    Oidc(OidcAuthRequest),
    Atproto(AtprotoAuthRequest),
    Mastodon(MastodonAuthRequest),
}

impl AuthRequest {
    pub fn protocol(&self) -> &'static str {
        match self {
            AuthRequest::Oidc(_) => "oidc",
            AuthRequest::Atproto(_) => "atproto",
            AuthRequest::Mastodon(_) => "mastodon",
        }
    }
}

/// A started login: where to send the browser and what to remember.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub state: String,
    pub authorization_url: String,
    pub request: AuthRequest,
}

/// Query parameters of a provider callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    /// RFC 9207 issuer identifier
    pub iss: Option<String>,
}

impl CallbackParams {
    /// Fail with `ProviderError` if the provider reported an error.
    pub fn check_error(&self) -> Result<(), AuthError> {
        match &self.error {
            Some(error) => Err(AuthError::ProviderError(match &self.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error.clone(),
            })),
            None => Ok(()),
        }
    }

    pub fn require_code(&self) -> Result<&str, AuthError> {
        self.code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::InvalidRequest("missing code parameter".to_string()))
    }
}

/// Persist `request` under `state`.
pub async fn save(
    store: &dyn KvStore,
    state: &str,
    request: &AuthRequest,
    ttl: Duration,
) -> Result<(), AuthError> {
    store::put_json(store, &keys::auth_request(state), request, Some(ttl)).await?;
    debug!(protocol = request.protocol(), "Auth request saved");
    Ok(())
}

/// Read and delete the request stored under `state`.
pub async fn consume(store: &dyn KvStore, state: &str) -> Result<AuthRequest, AuthError> {
    match store::take_json(store, &keys::auth_request(state)).await? {
        Some(request) => Ok(request),
        None => {
            warn!("Callback state has no pending auth request");
            Err(AuthError::NoSuchAuthRequest)
        }
    }
}
