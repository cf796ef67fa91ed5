//! The broker: routes requests under the mount prefix to the login
//! initiators and callback handlers.

use crate::atproto::AtprotoClient;
use crate::auth_request::{self, AuthRequest, CallbackParams, PendingLogin};
use crate::client::ClientUrls;
use crate::config::{BrokerConfig, LoginMethod};
use crate::cookies::{self, SESSION_COOKIE};
use crate::did::DidResolver;
use crate::discovery::{Protocol, ProtocolDiscovery};
use crate::fediverse::FediverseClient;
use crate::http::{Request, Response};
use crate::identifier::{authority, Identifier};
use crate::oidc::OidcClient;
use crate::session::{self, Session};
use crate::store::KvStore;
use crate::AuthError;
use http::header::SET_COOKIE;
use http::{Method, StatusCode};
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Which callback route a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackRoute {
    Oidc,
    Atproto,
    Fediverse,
}

impl CallbackRoute {
    fn accepts(self, request: &AuthRequest) -> bool {
        matches!(
            (self, request),
            (CallbackRoute::Oidc, AuthRequest::Oidc(_))
                | (CallbackRoute::Atproto, AuthRequest::Atproto(_))
                | (CallbackRoute::Fediverse, AuthRequest::Mastodon(_))
        )
    }
}

/// Multi-protocol login broker.
///
/// Holds no per-user state itself; everything between the redirect and the
/// callback lives in the store handed to [`Broker::new`].
#[derive(Clone)]
pub struct Broker {
    config: BrokerConfig,
    store: Arc<dyn KvStore>,
    discovery: ProtocolDiscovery,
    oidc: OidcClient,
    atproto: AtprotoClient,
    fediverse: FediverseClient,
}

impl Broker {
    /// Build a broker with its own HTTP client.
    pub fn new(config: BrokerConfig, store: Arc<dyn KvStore>) -> Result<Self, AuthError> {
        let http_client = Client::builder()
            .timeout(config.http_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AuthError::HttpError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_http_client(config, store, http_client))
    }

    pub fn with_http_client(
        config: BrokerConfig,
        store: Arc<dyn KvStore>,
        http_client: Client,
    ) -> Self {
        let resolver = DidResolver::new(http_client.clone(), &config);
        Self {
            discovery: ProtocolDiscovery::new(http_client.clone(), resolver.clone(), &config),
            oidc: OidcClient::new(http_client.clone()),
            atproto: AtprotoClient::new(http_client.clone(), resolver),
            fediverse: FediverseClient::new(http_client, &config),
            config,
            store,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Serve one request. Failures become JSON error responses.
    #[instrument(skip_all, fields(method = %request.method, path = %request.url.path()))]
    pub async fn handle(&self, request: &Request) -> Response {
        match self.route(request).await {
            Ok(response) => response,
            Err(e) => {
                if e.status().is_server_error() {
                    error!(error = %e, "Request failed");
                } else {
                    warn!(error = %e, "Request rejected");
                }
                Response::from(&e)
            }
        }
    }

    async fn route(&self, request: &Request) -> Result<Response, AuthError> {
        let Some(path) = request.route_path(self.config.prefix()) else {
            return Ok(not_found());
        };

        // Routes that store or consume state answer GET only
        let read_only = matches!(
            path.as_str(),
            "/" | "/client-metadata.json" | "/oidc-client" | "/session"
        );
        if request.method != Method::GET && !(read_only && request.method == Method::HEAD) {
            return Ok(Response::text(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed",
            ));
        }

        match path.as_str() {
            "/" => Ok(self.login_page()),
            "/initiate" => self.initiate(request).await,
            "/oidc-callback" => self.callback(request, CallbackRoute::Oidc).await,
            "/atproto-callback" => self.callback(request, CallbackRoute::Atproto).await,
            "/fediverse-callback" => self.callback(request, CallbackRoute::Fediverse).await,
            "/client-metadata.json" => Response::json(
                StatusCode::OK,
                &self
                    .client_urls(request)
                    .atproto_metadata(&self.config.client_name),
            ),
            "/oidc-client" => Response::json(
                StatusCode::OK,
                &self
                    .client_urls(request)
                    .oidc_metadata(&self.config.client_name),
            ),
            "/session" => match self.session(request).await? {
                Some(session) => Response::json(StatusCode::OK, &session),
                None => Err(AuthError::Unauthorized("no session".to_string())),
            },
            "/logout" => self.logout(request).await,
            _ => Ok(not_found()),
        }
    }

    /// Externally visible URLs of the broker for this request.
    pub fn client_urls(&self, request: &Request) -> ClientUrls {
        let origin = match &self.config.public_origin {
            Some(origin) => origin.clone(),
            None => format!("https://{}", authority(&request.url)),
        };
        ClientUrls::new(&origin, self.config.prefix())
    }

    fn login_page(&self) -> Response {
        let action = html_escape::encode_double_quoted_attribute(self.config.prefix());

        let identifier_form = if self.accepts_identifiers() {
            format!(
                r#"      <form action="{action}/initiate" method="get">
        <label for="login-identifier">Handle, email, DID or server</label>
        <input type="text" id="login-identifier" name="value" autofocus>
        <button type="submit">Continue</button>
      </form>
"#
            )
        } else {
            String::new()
        };

        let providers: String = self
            .config
            .oidc_providers()
            .map(|(name, _)| {
                format!(
                    r#"      <form action="{action}/initiate" method="get">
        <input type="hidden" name="provider" value="{value}">
        <button type="submit">Login with {label}</button>
      </form>
"#,
                    value = html_escape::encode_double_quoted_attribute(name),
                    label = html_escape::encode_text(name),
                )
            })
            .collect();

        Response::html(
            StatusCode::OK,
            format!(
                r#"<!doctype html>
<html>
  <head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Login</title>
  </head>
  <body>
    <main>
      <h1>Login</h1>
{identifier_form}{providers}    </main>
  </body>
</html>
"#
            ),
        )
    }

    fn accepts_identifiers(&self) -> bool {
        self.config
            .login_methods
            .iter()
            .any(|method| !matches!(method, LoginMethod::Oidc { .. }))
    }

    async fn initiate(&self, request: &Request) -> Result<Response, AuthError> {
        let urls = self.client_urls(request);
        let pending = match (request.query("provider"), request.query("value")) {
            (Some(provider), _) => self.start_provider_login(&provider, &urls).await?,
            (None, Some(value)) => self.start_login(&value, &urls).await?,
            (None, None) => {
                return Err(AuthError::InvalidRequest(
                    "missing value parameter".to_string(),
                ))
            }
        };

        auth_request::save(
            self.store.as_ref(),
            &pending.state,
            &pending.request,
            self.config.auth_request_ttl(),
        )
        .await?;

        Response::redirect(&pending.authorization_url)
    }

    /// Pick the protocol for `value` and start its login.
    #[instrument(skip(self, urls))]
    pub async fn start_login(
        &self,
        value: &str,
        urls: &ClientUrls,
    ) -> Result<PendingLogin, AuthError> {
        let identifier = Identifier::parse(value)?;
        debug!(kind = %identifier.kind(), "Parsed identifier");

        match &identifier {
            Identifier::Did(did) => {
                self.require(&LoginMethod::Atproto)?;
                self.atproto.start_for_did(did, urls).await
            }
            Identifier::Handle { server, .. } => {
                self.require(&LoginMethod::Fediverse)?;
                self.fediverse
                    .start(self.store.as_ref(), server, urls)
                    .await
            }
            Identifier::Email { domain, .. } => {
                self.require(&LoginMethod::Email)?;
                let meta = self.discovery.oidc_metadata(domain).await.map_err(|e| {
                    debug!(error = %e, "No OIDC provider for email domain");
                    AuthError::NoCompatibleProtocol(domain.clone())
                })?;
                let email = identifier.to_string();
                self.oidc.start(&meta, urls, Some(&email))
            }
            Identifier::Url(url) => {
                self.require(&LoginMethod::Discovery)?;
                match self.discovery.discover(url).await? {
                    Protocol::Atproto { did } => {
                        self.require(&LoginMethod::Atproto)?;
                        self.atproto.start_for_did(&did, urls).await
                    }
                    Protocol::IndieAuth(_) => {
                        Err(AuthError::NotSupported("IndieAuth login".to_string()))
                    }
                    Protocol::Oidc(meta) => self.oidc.start(&meta, urls, None),
                    Protocol::OAuth2(meta) => {
                        self.require(&LoginMethod::Atproto)?;
                        self.atproto.start(meta, None, None, urls).await
                    }
                }
            }
        }
    }

    /// Start an OIDC login against the configured provider called `name`.
    #[instrument(skip(self, urls))]
    pub async fn start_provider_login(
        &self,
        name: &str,
        urls: &ClientUrls,
    ) -> Result<PendingLogin, AuthError> {
        let uri = self
            .config
            .oidc_provider(name)
            .ok_or_else(|| AuthError::InvalidRequest(format!("unknown provider {}", name)))?;

        let meta = self.discovery.oidc_metadata_at(uri).await?;
        self.oidc.start(&meta, urls, None)
    }

    fn require(&self, method: &LoginMethod) -> Result<(), AuthError> {
        if self.config.allows(method) {
            Ok(())
        } else {
            debug!(?method, "Login method disabled");
            Err(AuthError::NotSupported(format!("{:?} login", method)))
        }
    }

    async fn callback(
        &self,
        request: &Request,
        route: CallbackRoute,
    ) -> Result<Response, AuthError> {
        let params = CallbackParams {
            state: request.query("state"),
            code: request.query("code"),
            error: request.query("error"),
            error_description: request.query("error_description"),
            iss: request.query("iss"),
        };

        let state = params
            .state
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::InvalidRequest("missing state parameter".to_string()))?;

        let auth_request = auth_request::consume(self.store.as_ref(), state).await?;
        if !route.accepts(&auth_request) {
            return Err(AuthError::InvalidRequest(format!(
                "state belongs to a {} login",
                auth_request.protocol()
            )));
        }

        let session = match &auth_request {
            AuthRequest::Oidc(req) => self.oidc.complete(req, &params).await?,
            AuthRequest::Atproto(req) => self.atproto.complete(req, &params).await?,
            AuthRequest::Mastodon(req) => self.fediverse.complete(req, &params).await?,
        };

        self.finish_login(&session).await
    }

    /// Persist `session` and answer with the cookie and a redirect to `/`.
    async fn finish_login(&self, session: &Session) -> Result<Response, AuthError> {
        let token =
            session::create(self.store.as_ref(), session, self.config.session_max_age()).await?;
        let cookie = cookies::session_cookie(&token, self.config.session_max_age_secs);

        info!(user_id = %session.user_id, "Login complete");
        Response::redirect("/")?.with_header(SET_COOKIE, &cookie)
    }

    /// Session of the caller, if the session cookie names a live one.
    pub async fn session(&self, request: &Request) -> Result<Option<Session>, AuthError> {
        match request.cookie(SESSION_COOKIE) {
            Some(token) if !token.is_empty() => session::get(self.store.as_ref(), &token).await,
            _ => Ok(None),
        }
    }

    async fn logout(&self, request: &Request) -> Result<Response, AuthError> {
        if let Some(token) = request.cookie(SESSION_COOKIE).filter(|t| !t.is_empty()) {
            session::delete(self.store.as_ref(), &token).await?;
        }

        Response::redirect("/")?.with_header(SET_COOKIE, &cookies::clear_session_cookie())
    }
}

fn not_found() -> Response {
    Response::text(StatusCode::NOT_FOUND, "Not found")
}
