//! OpenID Connect login (also used for email identifiers).
//!
//! The broker is a public client: PKCE, no client secret. The ID token is
//! decoded without signature verification; only `iss` and `aud` are checked.

use crate::auth_request::{AuthRequest, CallbackParams, PendingLogin};
use crate::client::{ClientUrls, OIDC_SCOPE};
use crate::metadata::AuthServerMetadata;
use crate::session::{Session, UserIdType};
use crate::token::{generate_pkce, generate_state};
use crate::AuthError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

/// State kept between the OIDC redirect and callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcAuthRequest {
    pub issuer: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub token_endpoint: String,
    pub code_verifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Clone)]
pub struct OidcClient {
    http_client: Client,
}

impl OidcClient {
    pub fn new(http_client: Client) -> Self {
        Self { http_client }
    }

    /// Build the authorization redirect for `meta`.
    pub fn start(
        &self,
        meta: &AuthServerMetadata,
        urls: &ClientUrls,
        login_hint: Option<&str>,
    ) -> Result<PendingLogin, AuthError> {
        let pkce = generate_pkce();
        let state = generate_state();
        let client_id = urls.oidc_client_id();
        let redirect_uri = urls.oidc_redirect_uri();

        let mut authorization_url = Url::parse(&meta.authorization_endpoint).map_err(|e| {
            AuthError::OAuthDiscoveryFailed(format!("Invalid authorization endpoint: {}", e))
        })?;
        {
            let mut query = authorization_url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &client_id)
                .append_pair("redirect_uri", &redirect_uri)
                .append_pair("state", &state)
                .append_pair("scope", OIDC_SCOPE)
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(hint) = login_hint {
                query.append_pair("login_hint", hint);
            }
        }

        debug!(issuer = %meta.issuer, "Starting OIDC login");

        Ok(PendingLogin {
            state,
            authorization_url: authorization_url.to_string(),
            request: AuthRequest::Oidc(OidcAuthRequest {
                issuer: meta.issuer.clone(),
                client_id,
                redirect_uri,
                token_endpoint: meta.token_endpoint.clone(),
                code_verifier: pkce.verifier,
            }),
        })
    }

    /// Finish the login: exchange the code and verify the ID token.
    #[instrument(skip_all, fields(issuer = %request.issuer))]
    pub async fn complete(
        &self,
        request: &OidcAuthRequest,
        params: &CallbackParams,
    ) -> Result<Session, AuthError> {
        params.check_error()?;
        let code = params.require_code()?;

        let token = self.exchange_code(request, code).await?;
        let id_token = token.id_token.as_deref().ok_or_else(|| {
            AuthError::InvalidIdToken("token response has no id_token".to_string())
        })?;

        let claims = decode_id_token(id_token)?;
        verify_id_token(&claims, &request.issuer, &request.client_id)?;

        // Some providers omit email; fall back to the username
        let email = value_string(claims.get("email"))
            .or_else(|| value_string(claims.get("preferred_username")))
            .ok_or_else(|| {
                AuthError::InvalidIdToken("no email or preferred_username claim".to_string())
            })?;

        Ok(Session::new(UserIdType::Email, email, claims))
    }

    async fn exchange_code(
        &self,
        request: &OidcAuthRequest,
        code: &str,
    ) -> Result<OAuthTokenResponse, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", request.client_id.as_str()),
            ("code", code),
            ("redirect_uri", request.redirect_uri.as_str()),
            ("code_verifier", request.code_verifier.as_str()),
        ];

        let res = self
            .http_client
            .post(&request.token_endpoint)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("Token request failed: {} - {}", status, body);
            return Err(AuthError::TokenExchangeFailed(format!(
                "token endpoint {}: {}",
                status, body
            )));
        }

        res.json::<OAuthTokenResponse>()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(format!("Invalid token response: {}", e)))
    }
}

/// Decode the claims of a compact JWT without checking its signature.
pub fn decode_id_token(jwt: &str) -> Result<Value, AuthError> {
    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::InvalidIdToken(format!(
            "expected 3 segments, got {}",
            parts.len()
        )));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| AuthError::InvalidIdToken(format!("bad base64: {}", e)))?;

    let claims: Value = serde_json::from_slice(&payload)
        .map_err(|e| AuthError::InvalidIdToken(format!("bad claims JSON: {}", e)))?;
    if !claims.is_object() {
        return Err(AuthError::InvalidIdToken("claims are not an object".to_string()));
    }
    Ok(claims)
}

/// Enforce `iss == issuer` and that `aud` equals or contains `client_id`.
pub fn verify_id_token(claims: &Value, issuer: &str, client_id: &str) -> Result<(), AuthError> {
    let iss = value_string(claims.get("iss")).unwrap_or_default();
    if iss != issuer {
        return Err(AuthError::IssuerMismatch {
            expected: issuer.to_string(),
            found: iss,
        });
    }

    let aud_matches = match claims.get("aud") {
        Some(Value::String(aud)) => aud == client_id,
        Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(client_id)),
        _ => false,
    };
    if !aud_matches {
        return Err(AuthError::AudienceMismatch(client_id.to_string()));
    }

    Ok(())
}

fn value_string(value: Option<&Value>) -> Option<String> {
    value.and_then(|v| {
        if let Some(s) = v.as_str() {
            Some(s.to_string())
        } else if v.is_number() || v.is_boolean() {
            Some(v.to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Unsigned compact JWT carrying `claims`.
    pub(crate) fn fake_jwt(claims: &Value) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap())
        )
    }

    fn meta(server: &MockServer) -> AuthServerMetadata {
        serde_json::from_value(json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
        }))
        .unwrap()
    }

    fn urls() -> ClientUrls {
        ClientUrls::new("https://app.example", "/auth")
    }

    #[test]
    fn authorization_url_parameters() {
        let meta: AuthServerMetadata = serde_json::from_value(json!({
            "issuer": "https://idp.example",
            "authorization_endpoint": "https://idp.example/authorize",
            "token_endpoint": "https://idp.example/token",
        }))
        .unwrap();

        let pending = OidcClient::new(Client::new())
            .start(&meta, &urls(), Some("bob@idp.example"))
            .unwrap();
        let url = Url::parse(&pending.authorization_url).unwrap();
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "https://app.example/auth/oidc-client");
        assert_eq!(query["redirect_uri"], "https://app.example/auth/oidc-callback");
        assert_eq!(query["scope"], "openid email profile");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["state"], pending.state);
        assert_eq!(query["login_hint"], "bob@idp.example");

        match pending.request {
            AuthRequest::Oidc(req) => {
                assert_eq!(req.issuer, "https://idp.example");
                assert_eq!(
                    query["code_challenge"],
                    crate::token::code_challenge(&req.code_verifier)
                );
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn audience_may_be_array() {
        let claims = json!({"iss": "https://idp", "aud": ["other", "me"]});
        assert!(verify_id_token(&claims, "https://idp", "me").is_ok());

        let claims = json!({"iss": "https://idp", "aud": ["other"]});
        assert!(matches!(
            verify_id_token(&claims, "https://idp", "me"),
            Err(AuthError::AudienceMismatch(_))
        ));
    }

    #[test]
    fn issuer_is_checked_first() {
        let claims = json!({"iss": "https://evil", "aud": "me"});
        assert!(matches!(
            verify_id_token(&claims, "https://idp", "me"),
            Err(AuthError::IssuerMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_malformed_tokens() {
        assert!(decode_id_token("only.two").is_err());
        assert!(decode_id_token("a.!!!.c").is_err());
        assert!(decode_id_token(&format!("a.{}.c", URL_SAFE_NO_PAD.encode("[1]"))).is_err());
        let jwt = fake_jwt(&json!({"sub": "1"}));
        assert_eq!(decode_id_token(&jwt).unwrap()["sub"], "1");
    }

    #[tokio::test]
    async fn complete_falls_back_to_preferred_username() {
        let server = MockServer::start().await;
        let client = OidcClient::new(Client::new());
        let pending = client.start(&meta(&server), &urls(), None).unwrap();
        let AuthRequest::Oidc(request) = pending.request else {
            panic!("expected oidc request");
        };

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "token_type": "Bearer",
                "id_token": fake_jwt(&json!({
                    "iss": server.uri(),
                    "aud": "https://app.example/auth/oidc-client",
                    "preferred_username": "rauthy-user"
                }))
            })))
            .expect(1)
            .mount(&server)
            .await;

        let params = CallbackParams {
            state: Some(pending.state.clone()),
            code: Some("abc".to_string()),
            ..Default::default()
        };
        let session = client.complete(&request, &params).await.unwrap();
        assert_eq!(session.user_id_type, UserIdType::Email);
        assert_eq!(session.user_id, "rauthy-user");
    }

    #[tokio::test]
    async fn missing_id_token_is_rejected() {
        let server = MockServer::start().await;
        let client = OidcClient::new(Client::new());
        let AuthRequest::Oidc(request) = client.start(&meta(&server), &urls(), None).unwrap().request
        else {
            panic!("expected oidc request");
        };

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "at"})))
            .mount(&server)
            .await;

        let params = CallbackParams {
            code: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            client.complete(&request, &params).await,
            Err(AuthError::InvalidIdToken(_))
        ));
    }

    #[tokio::test]
    async fn token_endpoint_failure() {
        let server = MockServer::start().await;
        let client = OidcClient::new(Client::new());
        let AuthRequest::Oidc(request) = client.start(&meta(&server), &urls(), None).unwrap().request
        else {
            panic!("expected oidc request");
        };

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let params = CallbackParams {
            code: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            client.complete(&request, &params).await,
            Err(AuthError::TokenExchangeFailed(_))
        ));
    }
}
