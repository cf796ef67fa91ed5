//! Mastodon login for fediverse handles.
//!
//! The server's software is checked through NodeInfo before anything else,
//! then an OAuth app is registered once per `(server, broker host)` pair and
//! cached in the store.

use crate::auth_request::{AuthRequest, CallbackParams, PendingLogin};
use crate::client::ClientUrls;
use crate::config::BrokerConfig;
use crate::session::{Session, UserIdType};
use crate::store::{self, keys, KvStore};
use crate::token::generate_state;
use crate::AuthError;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub const MASTODON_SCOPE: &str = "read:accounts";

const NODEINFO_RELS: [&str; 2] = [
    "http://nodeinfo.diaspora.software/ns/schema/2.0",
    "http://nodeinfo.diaspora.software/ns/schema/2.1",
];

/// A registered OAuth app on a Mastodon server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MastodonApp {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// State kept between the Mastodon redirect and callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MastodonAuthRequest {
    pub server_domain: String,
    pub app: MastodonApp,
}

#[derive(Debug, Deserialize)]
struct NodeInfoLinks {
    #[serde(default)]
    links: Vec<NodeInfoLink>,
}

#[derive(Debug, Deserialize)]
struct NodeInfoLink {
    rel: String,
    href: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub software: NodeInfoSoftware,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfoSoftware {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisteredApp {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct MastodonToken {
    access_token: String,
}

#[derive(Clone)]
pub struct FediverseClient {
    http_client: Client,
    config: BrokerConfig,
}

impl FediverseClient {
    pub fn new(http_client: Client, config: &BrokerConfig) -> Self {
        Self {
            http_client,
            config: config.clone(),
        }
    }

    fn server_url(&self, server_domain: &str, path: &str) -> String {
        format!("{}://{}{}", self.config.outbound_scheme, server_domain, path)
    }

    /// Fetch the NodeInfo document advertised at `/.well-known/nodeinfo`.
    #[instrument(skip(self))]
    pub async fn fetch_node_info(&self, server_domain: &str) -> Result<NodeInfo, AuthError> {
        let well_known = self.server_url(server_domain, "/.well-known/nodeinfo");
        let links: NodeInfoLinks = self.get_json(&well_known).await?;

        let href = links
            .links
            .into_iter()
            .find(|link| NODEINFO_RELS.contains(&link.rel.as_str()))
            .map(|link| link.href)
            .ok_or_else(|| {
                AuthError::UnsupportedServerSoftware(format!(
                    "{} does not publish NodeInfo 2.x",
                    server_domain
                ))
            })?;

        self.get_json(&href).await
    }

    /// Check the server software, register (or reuse) the app and build the
    /// authorization redirect.
    #[instrument(skip(self, store, urls))]
    pub async fn start(
        &self,
        store: &dyn KvStore,
        server_domain: &str,
        urls: &ClientUrls,
    ) -> Result<PendingLogin, AuthError> {
        let node_info = self.fetch_node_info(server_domain).await?;
        let software = node_info.software.name;
        if !self.config.is_supported_software(&software) {
            warn!(software = %software, "Unsupported fediverse server");
            return Err(AuthError::UnsupportedServerSoftware(software));
        }

        let app = self.app_for(store, server_domain, urls).await?;
        let state = generate_state();

        let mut authorization_url = Url::parse(&self.server_url(server_domain, "/oauth/authorize"))
            .map_err(|e| AuthError::InvalidIdentifier(format!("{}: {}", server_domain, e)))?;
        authorization_url
            .query_pairs_mut()
            .append_pair("client_id", &app.client_id)
            .append_pair("redirect_uri", &app.redirect_uri)
            .append_pair("state", &state)
            .append_pair("response_type", "code")
            .append_pair("scope", MASTODON_SCOPE);

        Ok(PendingLogin {
            state,
            authorization_url: authorization_url.to_string(),
            request: AuthRequest::Mastodon(MastodonAuthRequest {
                server_domain: server_domain.to_string(),
                app,
            }),
        })
    }

    /// Cached app for this server and broker host, registering one if needed.
    async fn app_for(
        &self,
        store: &dyn KvStore,
        server_domain: &str,
        urls: &ClientUrls,
    ) -> Result<MastodonApp, AuthError> {
        let key = keys::app(server_domain, urls.host());
        let redirect_uri = urls.fediverse_redirect_uri();

        if let Some(app) = store::get_json::<MastodonApp>(store, &key).await? {
            if app.redirect_uri == redirect_uri {
                debug!("Reusing registered app");
                return Ok(app);
            }
            debug!("Cached app has a stale redirect URI, registering again");
        }

        let app = self.register_app(server_domain, &redirect_uri).await?;
        store::put_json(store, &key, &app, None).await?;
        Ok(app)
    }

    async fn register_app(
        &self,
        server_domain: &str,
        redirect_uri: &str,
    ) -> Result<MastodonApp, AuthError> {
        let url = self.server_url(server_domain, "/api/v1/apps");
        let params = [
            ("client_name", self.config.client_name.as_str()),
            ("redirect_uris", redirect_uri),
            ("scopes", MASTODON_SCOPE),
        ];

        let res = self.http_client.post(&url).form(&params).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::AuthorizationFailed(format!(
                "app registration {}: {}",
                status, body
            )));
        }

        let registered: RegisteredApp = res.json().await.map_err(|e| {
            AuthError::AuthorizationFailed(format!("Invalid app registration response: {}", e))
        })?;
        info!("Registered app on {}", server_domain);

        Ok(MastodonApp {
            client_id: registered.client_id,
            client_secret: registered.client_secret,
            redirect_uri: redirect_uri.to_string(),
        })
    }

    /// Exchange the code, verify the credentials and build the session.
    #[instrument(skip_all, fields(server = %request.server_domain))]
    pub async fn complete(
        &self,
        request: &MastodonAuthRequest,
        params: &CallbackParams,
    ) -> Result<Session, AuthError> {
        params.check_error()?;
        let code = params.require_code()?;

        let token = self.exchange_code(request, code).await?;

        let cred_url = self.server_url(
            &request.server_domain,
            "/api/v1/accounts/verify_credentials",
        );
        let res = self
            .http_client
            .get(&cred_url)
            .bearer_auth(&token.access_token)
            .send()
            .await?;

        if res.status() != StatusCode::OK {
            return Err(AuthError::Unauthorized(format!(
                "verify_credentials returned {}",
                res.status()
            )));
        }

        let account: Value = res.json().await?;
        let username = account
            .get("username")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AuthError::Unauthorized("verify_credentials has no username".to_string())
            })?;

        let user_id = format!("@{}@{}", username, request.server_domain);
        Ok(Session::new(UserIdType::Mastodon, user_id, account))
    }

    async fn exchange_code(
        &self,
        request: &MastodonAuthRequest,
        code: &str,
    ) -> Result<MastodonToken, AuthError> {
        let url = self.server_url(&request.server_domain, "/oauth/token");
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", request.app.client_id.as_str()),
            ("client_secret", request.app.client_secret.as_str()),
            ("redirect_uri", request.app.redirect_uri.as_str()),
            ("scope", MASTODON_SCOPE),
        ];

        let res = self
            .http_client
            .post(&url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchangeFailed(format!(
                "token endpoint {}: {}",
                status, body
            )));
        }

        res.json()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(format!("Invalid token response: {}", e)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, AuthError> {
        let res = self.http_client.get(url).send().await?;
        if !res.status().is_success() {
            return Err(AuthError::HttpError(format!(
                "{} returned status {}",
                url,
                res.status()
            )));
        }
        Ok(res.json().await?)
    }
}
