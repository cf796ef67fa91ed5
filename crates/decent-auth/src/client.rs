//! The broker's own client identity: client ids, redirect URIs and the
//! client metadata documents identity providers fetch.

use serde::Serialize;

pub const ATPROTO_SCOPE: &str = "atproto transition:generic";
pub const OIDC_SCOPE: &str = "openid email profile";

/// URLs of the broker as seen from outside, for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUrls {
    /// `https://host[:port]`
    pub origin: String,
    /// Mount prefix without a trailing slash
    pub prefix: String,
}

impl ClientUrls {
    pub fn new(origin: &str, prefix: &str) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Host part of the origin, used to key app registrations.
    pub fn host(&self) -> &str {
        self.origin
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.origin)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.origin, self.prefix, path)
    }

    pub fn atproto_client_id(&self) -> String {
        self.url("/client-metadata.json")
    }

    pub fn atproto_redirect_uri(&self) -> String {
        self.url("/atproto-callback")
    }

    pub fn oidc_client_id(&self) -> String {
        self.url("/oidc-client")
    }

    pub fn oidc_redirect_uri(&self) -> String {
        self.url("/oidc-callback")
    }

    pub fn fediverse_redirect_uri(&self) -> String {
        self.url("/fediverse-callback")
    }

    /// Document served at `/client-metadata.json`
    pub fn atproto_metadata(&self, client_name: &str) -> ClientMetadata {
        ClientMetadata {
            client_id: self.atproto_client_id(),
            client_name: client_name.to_string(),
            client_uri: self.origin.clone(),
            application_type: "web".to_string(),
            redirect_uris: vec![self.atproto_redirect_uri()],
            grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            response_types: vec!["code".to_string()],
            scope: ATPROTO_SCOPE.to_string(),
            token_endpoint_auth_method: "none".to_string(),
            dpop_bound_access_tokens: true,
        }
    }

    /// Document served at `/oidc-client`
    pub fn oidc_metadata(&self, client_name: &str) -> ClientMetadata {
        ClientMetadata {
            client_id: self.oidc_client_id(),
            redirect_uris: vec![self.oidc_redirect_uri()],
            scope: OIDC_SCOPE.to_string(),
            ..self.atproto_metadata(client_name)
        }
    }
}

/// OAuth client metadata document
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub client_name: String,
    pub client_uri: String,
    pub application_type: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub scope: String,
    pub token_endpoint_auth_method: String,
    pub dpop_bound_access_tokens: bool,
}
