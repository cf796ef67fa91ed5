//! Error taxonomy for the login broker.
//!
//! Every expected failure of a login attempt is a variant of [`AuthError`].
//! The broker turns them into HTTP responses with [`AuthError::status`] and
//! [`AuthError::error_code`]; nothing here panics on bad input.

use crate::store::StoreError;
use http::StatusCode;
use thiserror::Error;

/// Authentication-related errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No compatible login protocol found for {0}")]
    NoCompatibleProtocol(String),

    #[error("DID not found for {0}")]
    DidNotFound(String),

    #[error("Unsupported DID method: {0}")]
    UnsupportedDidMethod(String),

    #[error("DID document fetch failed: {0}")]
    DidDocumentFetchFailed(String),

    #[error("OAuth server discovery failed: {0}")]
    OAuthDiscoveryFailed(String),

    #[error("No such auth request")]
    NoSuchAuthRequest,

    #[error("Issuer mismatch: expected {expected}, got {found}")]
    IssuerMismatch { expected: String, found: String },

    #[error("Audience mismatch: expected {0}")]
    AudienceMismatch(String),

    #[error("DID mismatch: expected {expected}, got {found}")]
    DidMismatch { expected: String, found: String },

    #[error("Invalid ID token: {0}")]
    InvalidIdToken(String),

    #[error("Unsupported server software: {0}")]
    UnsupportedServerSoftware(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Identity provider returned an error: {0}")]
    ProviderError(String),

    #[error("OAuth authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AuthError {
    /// HTTP status the broker answers with for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidIdentifier(_)
            | AuthError::InvalidRequest(_)
            | AuthError::NoCompatibleProtocol(_)
            | AuthError::DidNotFound(_)
            | AuthError::UnsupportedDidMethod(_)
            | AuthError::NoSuchAuthRequest
            | AuthError::IssuerMismatch { .. }
            | AuthError::AudienceMismatch(_)
            | AuthError::DidMismatch { .. }
            | AuthError::InvalidIdToken(_)
            | AuthError::UnsupportedServerSoftware(_)
            | AuthError::NotSupported(_)
            | AuthError::ProviderError(_) => StatusCode::BAD_REQUEST,
            AuthError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AuthError::DidDocumentFetchFailed(_)
            | AuthError::OAuthDiscoveryFailed(_)
            | AuthError::AuthorizationFailed(_)
            | AuthError::HttpError(_) => StatusCode::BAD_GATEWAY,
            AuthError::TokenExchangeFailed(_)
            | AuthError::Store(_)
            | AuthError::CryptoError(_)
            | AuthError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidIdentifier(_) => "invalid_identifier",
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::NoCompatibleProtocol(_) => "no_compatible_protocol",
            AuthError::DidNotFound(_) => "did_not_found",
            AuthError::UnsupportedDidMethod(_) => "unsupported_did_method",
            AuthError::DidDocumentFetchFailed(_) => "did_document_failed",
            AuthError::OAuthDiscoveryFailed(_) => "oauth_discovery_failed",
            AuthError::NoSuchAuthRequest => "no_such_auth_request",
            AuthError::IssuerMismatch { .. } => "issuer_mismatch",
            AuthError::AudienceMismatch(_) => "audience_mismatch",
            AuthError::DidMismatch { .. } => "did_mismatch",
            AuthError::InvalidIdToken(_) => "invalid_id_token",
            AuthError::UnsupportedServerSoftware(_) => "unsupported_server_software",
            AuthError::NotSupported(_) => "not_supported",
            AuthError::ProviderError(_) => "provider_error",
            AuthError::AuthorizationFailed(_) => "authorization_failed",
            AuthError::TokenExchangeFailed(_) => "token_exchange_failed",
            AuthError::Unauthorized(_) => "unauthorized",
            AuthError::Store(_) => "store_error",
            AuthError::HttpError(_) => "http_error",
            AuthError::CryptoError(_) => "crypto_error",
            AuthError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Serialization(err.to_string())
    }
}
