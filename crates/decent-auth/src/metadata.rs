//! OAuth 2.0 / OpenID Connect discovery documents.

use crate::AuthError;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const OIDC_WELL_KNOWN: &str = "/.well-known/openid-configuration";
pub const OAUTH_AS_WELL_KNOWN: &str = "/.well-known/oauth-authorization-server";
pub const PROTECTED_RESOURCE_WELL_KNOWN: &str = "/.well-known/oauth-protected-resource";

/// Protected Resource metadata (from PDS)
///
/// Fetched from `/.well-known/oauth-protected-resource` on the PDS.
/// This tells us where to find the Authorization Server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// The resource identifier (usually the PDS URL)
    #[serde(default)]
    pub resource: Option<String>,

    /// List of authorization server URLs
    pub authorization_servers: Vec<String>,
}

/// Authorization server metadata (OAuth 2.0 / OpenID Connect discovery)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    /// Issuer identifier
    pub issuer: String,

    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Pushed authorization request endpoint (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_authorization_request_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_challenge_methods_supported: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dpop_signing_alg_values_supported: Vec<String>,
}

/// GET `url` and decode a JSON body, failing with `OAuthDiscoveryFailed`.
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    client: &Client,
    url: &str,
) -> Result<T, AuthError> {
    debug!("Fetching metadata from: {}", url);

    let response = client.get(url).send().await.map_err(|e| {
        AuthError::OAuthDiscoveryFailed(format!("Failed to fetch {}: {}", url, e))
    })?;

    if !response.status().is_success() {
        return Err(AuthError::OAuthDiscoveryFailed(format!(
            "{} returned status {}",
            url,
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| AuthError::OAuthDiscoveryFailed(format!("Failed to parse {}: {}", url, e)))
}

/// Fetch `{base}{well_known}` as authorization server metadata.
pub async fn fetch_auth_server_metadata(
    client: &Client,
    base: &str,
    well_known: &str,
) -> Result<AuthServerMetadata, AuthError> {
    let url = format!("{}{}", base.trim_end_matches('/'), well_known);
    fetch_json(client, &url).await
}

/// Discover the authorization server that protects a PDS.
///
/// 1. Fetch `/.well-known/oauth-protected-resource` from the PDS
/// 2. Take the first entry of `authorization_servers`
/// 3. Fetch `/.well-known/oauth-authorization-server` from it
pub async fn discover_authorization_server(
    client: &Client,
    pds_url: &str,
) -> Result<AuthServerMetadata, AuthError> {
    let resource_url = format!(
        "{}{}",
        pds_url.trim_end_matches('/'),
        PROTECTED_RESOURCE_WELL_KNOWN
    );
    let resource: ProtectedResourceMetadata = fetch_json(client, &resource_url).await?;

    let auth_server = resource.authorization_servers.first().ok_or_else(|| {
        AuthError::OAuthDiscoveryFailed(
            "No authorization servers found in protected resource metadata".to_string(),
        )
    })?;
    debug!("Found authorization server: {}", auth_server);

    fetch_auth_server_metadata(client, auth_server, OAUTH_AS_WELL_KNOWN).await
}
