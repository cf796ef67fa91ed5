//! ATProto OAuth Implementation
//!
//! # OAuth Flow
//!
//! 1. Resolve the DID document and find the PDS
//! 2. Discover the authorization server from the PDS
//! 3. Generate PKCE, `state` and a fresh DPoP keypair
//! 4. Push the authorization request (PAR), DPoP-signed
//! 5. Redirect with only `client_id` and `request_uri`
//! 6. On callback, exchange the code (DPoP-signed) and check the `sub` DID
//!
//! Both DPoP-signed calls retry exactly once when the server answers
//! `use_dpop_nonce` with a `DPoP-Nonce` header.

use crate::auth_request::{AuthRequest, CallbackParams, PendingLogin};
use crate::client::{ClientUrls, ATPROTO_SCOPE};
use crate::did::DidResolver;
use crate::dpop::DpopKeyPair;
use crate::metadata::{self, AuthServerMetadata};
use crate::session::{Session, UserIdType};
use crate::token::{generate_pkce, generate_state};
use crate::AuthError;
use http::StatusCode;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";
const USE_DPOP_NONCE: &str = "use_dpop_nonce";

/// State kept between the PAR redirect and the callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtprotoAuthRequest {
    pub handle: Option<String>,
    /// DID the login was started for; `None` when started from a bare
    /// authorization server
    pub did: Option<String>,
    pub auth_server: AuthServerMetadata,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_verifier: String,
    /// Exported DPoP private key (JWK)
    pub dpop_key: String,
    pub dpop_nonce: Option<String>,
}

/// PAR (Pushed Authorization Request) response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParResponse {
    /// The request URI to use in the authorization URL
    pub request_uri: String,
    /// How long until the request expires (seconds)
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// OAuth token response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,

    /// Token type (usually "DPoP")
    pub token_type: String,

    #[serde(default)]
    pub expires_in: Option<u64>,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub scope: Option<String>,

    /// Subject (DID)
    #[serde(default)]
    pub sub: Option<String>,
}

/// Response of a DPoP-signed POST, after any nonce retry.
#[derive(Debug)]
struct DpopResponse {
    status: StatusCode,
    body: Vec<u8>,
    /// Latest nonce the server handed out
    nonce: Option<String>,
}

impl DpopResponse {
    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// ATProto OAuth client
#[derive(Clone)]
pub struct AtprotoClient {
    http_client: Client,
    did_resolver: DidResolver,
}

impl AtprotoClient {
    pub fn new(http_client: Client, did_resolver: DidResolver) -> Self {
        Self {
            http_client,
            did_resolver,
        }
    }

    pub fn did_resolver(&self) -> &DidResolver {
        &self.did_resolver
    }

    /// Start a login for a known DID.
    #[instrument(skip(self, urls))]
    pub async fn start_for_did(
        &self,
        did: &str,
        urls: &ClientUrls,
    ) -> Result<PendingLogin, AuthError> {
        let did_doc = self.did_resolver.resolve_did_document(did).await?;
        let handle = did_doc.get_handle();

        let pds_url = did_doc.get_pds_endpoint().ok_or_else(|| {
            AuthError::DidDocumentFetchFailed("No PDS endpoint found in DID document".to_string())
        })?;
        debug!("Found PDS endpoint: {}", pds_url);

        let auth_server = metadata::discover_authorization_server(&self.http_client, &pds_url).await?;
        self.start(auth_server, Some(did.to_string()), handle, urls)
            .await
    }

    /// Push an authorization request to `auth_server` and build the redirect.
    pub async fn start(
        &self,
        auth_server: AuthServerMetadata,
        did: Option<String>,
        handle: Option<String>,
        urls: &ClientUrls,
    ) -> Result<PendingLogin, AuthError> {
        let par_endpoint = auth_server
            .pushed_authorization_request_endpoint
            .clone()
            .ok_or_else(|| {
                AuthError::OAuthDiscoveryFailed(
                    "Authorization server does not support PAR".to_string(),
                )
            })?;

        let pkce = generate_pkce();
        let state = generate_state();
        let dpop_keypair = DpopKeyPair::generate();
        let client_id = urls.atproto_client_id();
        let redirect_uri = urls.atproto_redirect_uri();

        let mut params = vec![
            ("response_type", "code"),
            ("client_id", client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", ATPROTO_SCOPE),
            ("state", state.as_str()),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
        ];
        if let Some(hint) = handle.as_deref().or(did.as_deref()) {
            params.push(("login_hint", hint));
        }

        debug!("Making PAR request to: {}", par_endpoint);
        let response = self
            .post_with_dpop(&par_endpoint, &params, &dpop_keypair, None)
            .await
            .map_err(|e| AuthError::AuthorizationFailed(format!("PAR request failed: {}", e)))?;

        if !response.status.is_success() {
            warn!("PAR request failed: {} - {}", response.status, response.body_text());
            return Err(AuthError::AuthorizationFailed(format!(
                "PAR request failed with status {}: {}",
                response.status,
                response.body_text()
            )));
        }

        let par_response: ParResponse = serde_json::from_slice(&response.body).map_err(|e| {
            AuthError::AuthorizationFailed(format!("Failed to parse PAR response: {}", e))
        })?;
        info!("PAR successful, got request_uri: {}", par_response.request_uri);

        let mut authorization_url = Url::parse(&auth_server.authorization_endpoint).map_err(|e| {
            AuthError::OAuthDiscoveryFailed(format!("Invalid authorization endpoint: {}", e))
        })?;
        authorization_url
            .query_pairs_mut()
            .append_pair("client_id", &client_id)
            .append_pair("request_uri", &par_response.request_uri);

        Ok(PendingLogin {
            state,
            authorization_url: authorization_url.to_string(),
            request: AuthRequest::Atproto(AtprotoAuthRequest {
                handle,
                did,
                auth_server,
                client_id,
                redirect_uri,
                code_verifier: pkce.verifier,
                dpop_key: dpop_keypair.export(),
                dpop_nonce: response.nonce,
            }),
        })
    }

    /// Finish the login and return the session for the authenticated DID.
    #[instrument(skip_all, fields(did = ?request.did))]
    pub async fn complete(
        &self,
        request: &AtprotoAuthRequest,
        params: &CallbackParams,
    ) -> Result<Session, AuthError> {
        params.check_error()?;

        if let Some(iss) = &params.iss {
            if iss != &request.auth_server.issuer {
                return Err(AuthError::IssuerMismatch {
                    expected: request.auth_server.issuer.clone(),
                    found: iss.clone(),
                });
            }
        }

        let code = params.require_code()?;
        let dpop_keypair = DpopKeyPair::import(&request.dpop_key)?;
        let token = self.exchange_code(request, code, &dpop_keypair).await?;

        let sub = token.sub.clone().ok_or_else(|| {
            AuthError::TokenExchangeFailed("token response has no sub".to_string())
        })?;

        let handle = match &request.did {
            Some(expected) => {
                if &sub != expected {
                    return Err(AuthError::DidMismatch {
                        expected: expected.clone(),
                        found: sub,
                    });
                }
                match &request.handle {
                    Some(handle) => Some(handle.clone()),
                    None => self.lookup_handle(&sub).await,
                }
            }
            None => self.verify_issuer_for(&sub, &request.auth_server.issuer).await?,
        };

        Ok(Session::new(
            UserIdType::Atproto,
            sub.clone(),
            json!({
                "did": sub,
                "handle": handle,
                "iss": request.auth_server.issuer,
                "scope": token.scope,
            }),
        ))
    }

    /// Exchange an authorization code for tokens, DPoP-signed.
    async fn exchange_code(
        &self,
        request: &AtprotoAuthRequest,
        code: &str,
        dpop_keypair: &DpopKeyPair,
    ) -> Result<TokenResponse, AuthError> {
        debug!("Exchanging authorization code for tokens");

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", request.redirect_uri.as_str()),
            ("client_id", request.client_id.as_str()),
            ("code_verifier", request.code_verifier.as_str()),
        ];

        let response = self
            .post_with_dpop(
                &request.auth_server.token_endpoint,
                &params,
                dpop_keypair,
                request.dpop_nonce.clone(),
            )
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(format!("Token request failed: {}", e)))?;

        if !response.status.is_success() {
            warn!("Token request failed: {} - {}", response.status, response.body_text());
            return Err(AuthError::TokenExchangeFailed(format!(
                "Token endpoint returned status {}: {}",
                response.status,
                response.body_text()
            )));
        }

        serde_json::from_slice(&response.body).map_err(|e| {
            AuthError::TokenExchangeFailed(format!("Failed to parse token response: {}", e))
        })
    }

    /// POST a form with a DPoP proof, renegotiating the nonce at most once.
    async fn post_with_dpop(
        &self,
        url: &str,
        form: &[(&str, &str)],
        dpop_keypair: &DpopKeyPair,
        nonce: Option<String>,
    ) -> Result<DpopResponse, AuthError> {
        let mut nonce = nonce;
        let mut retried = false;

        loop {
            let proof = dpop_keypair.create_proof("POST", url, nonce.as_deref(), None)?;
            let response = self
                .http_client
                .post(url)
                .header("DPoP", proof)
                .form(form)
                .send()
                .await?;

            let status = response.status();
            let fresh_nonce = header_string(response.headers(), DPOP_NONCE_HEADER);
            let www_authenticate = header_string(response.headers(), WWW_AUTHENTICATE.as_str());
            let body = response.bytes().await?.to_vec();

            if fresh_nonce.is_some() {
                nonce = fresh_nonce.clone();
            }

            if !retried
                && fresh_nonce.is_some()
                && (status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED)
                && requests_nonce(&body, www_authenticate.as_deref())
            {
                debug!("Server asked for a DPoP nonce, retrying once");
                retried = true;
                continue;
            }

            return Ok(DpopResponse {
                status,
                body,
                nonce,
            });
        }
    }

    async fn lookup_handle(&self, did: &str) -> Option<String> {
        match self.did_resolver.resolve_handle_for_did(did).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Could not resolve handle for {}", did);
                None
            }
        }
    }

    /// For logins started without a DID: the DID's own PDS must be protected
    /// by the issuer that authenticated it. Returns the DID's handle.
    async fn verify_issuer_for(
        &self,
        did: &str,
        issuer: &str,
    ) -> Result<Option<String>, AuthError> {
        let did_doc = self.did_resolver.resolve_did_document(did).await?;
        let pds_url = did_doc.get_pds_endpoint().ok_or_else(|| {
            AuthError::DidDocumentFetchFailed("No PDS endpoint found in DID document".to_string())
        })?;

        let auth_server = metadata::discover_authorization_server(&self.http_client, &pds_url).await?;
        if auth_server.issuer != issuer {
            return Err(AuthError::IssuerMismatch {
                expected: auth_server.issuer,
                found: issuer.to_string(),
            });
        }

        Ok(did_doc.get_handle())
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Whether an error response asks for a DPoP nonce.
fn requests_nonce(body: &[u8], www_authenticate: Option<&str>) -> bool {
    #[derive(Deserialize)]
    struct OAuthError {
        error: String,
    }

    let in_body = serde_json::from_slice::<OAuthError>(body)
        .map(|e| e.error == USE_DPOP_NONCE)
        .unwrap_or(false);
    in_body || www_authenticate.is_some_and(|h| h.contains(USE_DPOP_NONCE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AtprotoClient {
        let config = BrokerConfig {
            plc_directory_url: server.uri(),
            doh_url: format!("{}/dns-query", server.uri()),
            outbound_scheme: "http".to_string(),
            ..Default::default()
        };
        AtprotoClient::new(Client::new(), DidResolver::new(Client::new(), &config))
    }

    fn auth_server(server: &MockServer) -> AuthServerMetadata {
        serde_json::from_value(json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/oauth/authorize", server.uri()),
            "token_endpoint": format!("{}/oauth/token", server.uri()),
            "pushed_authorization_request_endpoint": format!("{}/oauth/par", server.uri()),
        }))
        .unwrap()
    }

    fn urls() -> ClientUrls {
        ClientUrls::new("https://app.example", "/auth")
    }

    fn nonce_error() -> ResponseTemplate {
        ResponseTemplate::new(400)
            .insert_header(DPOP_NONCE_HEADER, "nonce-1")
            .set_body_json(json!({"error": "use_dpop_nonce"}))
    }

    #[test]
    fn nonce_signal_detection() {
        assert!(requests_nonce(br#"{"error":"use_dpop_nonce"}"#, None));
        assert!(requests_nonce(b"", Some(r#"DPoP error="use_dpop_nonce""#)));
        assert!(!requests_nonce(br#"{"error":"invalid_grant"}"#, None));
        assert!(!requests_nonce(b"not json", None));
    }

    #[tokio::test]
    async fn par_retries_once_with_nonce() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth/par"))
            .respond_with(nonce_error())
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/par"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header(DPOP_NONCE_HEADER, "nonce-2")
                    .set_body_json(json!({"request_uri": "urn:req:1", "expires_in": 60})),
            )
            .with_priority(2)
            .mount(&server)
            .await;

        let pending = client_for(&server)
            .start(
                auth_server(&server),
                Some("did:plc:abc".to_string()),
                Some("alice.example".to_string()),
                &urls(),
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let body = String::from_utf8(requests[1].body.clone()).unwrap();
        assert!(body.contains("login_hint=alice.example"));
        assert!(requests[1].headers.get("DPoP").is_some());

        let url = Url::parse(&pending.authorization_url).unwrap();
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query.len(), 2);
        assert_eq!(query["request_uri"], "urn:req:1");
        assert_eq!(query["client_id"], "https://app.example/auth/client-metadata.json");

        let AuthRequest::Atproto(request) = pending.request else {
            panic!("expected atproto request");
        };
        assert_eq!(request.dpop_nonce.as_deref(), Some("nonce-2"));
        assert!(DpopKeyPair::import(&request.dpop_key).is_ok());
    }

    #[tokio::test]
    async fn second_nonce_failure_is_terminal() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth/par"))
            .respond_with(nonce_error())
            .expect(2)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .start(auth_server(&server), None, None, &urls())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationFailed(_)));
    }

    #[tokio::test]
    async fn requires_par_endpoint() {
        let server = MockServer::start().await;
        let mut meta = auth_server(&server);
        meta.pushed_authorization_request_endpoint = None;

        let err = client_for(&server)
            .start(meta, None, None, &urls())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::OAuthDiscoveryFailed(_)));
    }

    #[tokio::test]
    async fn callback_issuer_parameter_must_match() {
        let server = MockServer::start().await;
        let request = AtprotoAuthRequest {
            handle: None,
            did: Some("did:plc:abc".to_string()),
            auth_server: auth_server(&server),
            client_id: "cid".to_string(),
            redirect_uri: "https://app.example/auth/atproto-callback".to_string(),
            code_verifier: "v".to_string(),
            dpop_key: DpopKeyPair::generate().export(),
            dpop_nonce: None,
        };
        let params = CallbackParams {
            code: Some("c".to_string()),
            iss: Some("https://evil.example".to_string()),
            ..Default::default()
        };

        let err = client_for(&server)
            .complete(&request, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::IssuerMismatch { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn token_exchange_uses_stored_nonce_and_checks_did() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "token_type": "DPoP",
                "scope": "atproto transition:generic",
                "sub": "did:plc:someoneelse"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = AtprotoAuthRequest {
            handle: Some("alice.example".to_string()),
            did: Some("did:plc:abc".to_string()),
            auth_server: auth_server(&server),
            client_id: "cid".to_string(),
            redirect_uri: "https://app.example/auth/atproto-callback".to_string(),
            code_verifier: "v".to_string(),
            dpop_key: DpopKeyPair::generate().export(),
            dpop_nonce: Some("stored-nonce".to_string()),
        };
        let params = CallbackParams {
            code: Some("c".to_string()),
            ..Default::default()
        };

        let err = client_for(&server)
            .complete(&request, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DidMismatch { .. }));

        let requests = server.received_requests().await.unwrap();
        let proof = requests[0].headers.get("DPoP").unwrap().to_str().unwrap();
        let claims_segment = proof.split('.').nth(1).unwrap();
        let claims: serde_json::Value = serde_json::from_slice(
            &base64::Engine::decode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                claims_segment,
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(claims["nonce"], "stored-nonce");
    }
}
