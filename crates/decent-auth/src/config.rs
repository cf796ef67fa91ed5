//! Broker configuration.
//!
//! The embedding process builds a [`BrokerConfig`] (the server crate loads it
//! from a TOML file and `DECENT_AUTH__*` environment variables). Every field
//! has a default so an empty config is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Path prefix the broker is mounted under (e.g. `/auth`)
    pub path_prefix: String,

    /// Externally visible origin (`https://host[:port]`).
    ///
    /// When unset, the origin is derived from the inbound request URL.
    pub public_origin: Option<String>,

    /// Session lifetime, also used as the cookie `Max-Age`
    pub session_max_age_secs: u64,

    /// How long a pending auth request stays valid
    pub auth_request_ttl_secs: u64,

    /// Name shown to identity providers
    pub client_name: String,

    /// PLC directory used to resolve `did:plc` documents
    pub plc_directory_url: String,

    /// DNS-over-HTTPS endpoint (JSON API) used for `_atproto` TXT lookups
    pub doh_url: String,

    /// Scheme used for outbound requests to identifier-derived hosts.
    ///
    /// Always `https` in production.
    pub outbound_scheme: String,

    /// Timeout for every outbound HTTP request
    pub http_timeout_secs: u64,

    /// User-Agent for outbound requests
    pub user_agent: String,

    /// NodeInfo software names accepted for fediverse login
    pub supported_fediverse_software: Vec<String>,

    /// Login methods offered by this broker
    pub login_methods: Vec<LoginMethod>,
}

/// A login method the broker accepts.
///
/// Identifier-driven methods (`atproto`, `fediverse`, `email`, `discovery`)
/// gate what the typed identifier may resolve to. `oidc` entries are named
/// providers listed on the login page and started with
/// `/initiate?provider=<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoginMethod {
    /// DIDs, handles on ATProto domains and ATProto authorization servers
    Atproto,
    /// `@user@server` handles on Mastodon-compatible servers
    Fediverse,
    /// Email addresses whose domain runs an OpenID provider
    Email,
    /// Typed domains or URLs that advertise an OpenID provider
    Discovery,
    /// A fixed OpenID provider
    Oidc { name: String, uri: String },
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path_prefix: "/auth".to_string(),
            public_origin: None,
            session_max_age_secs: 84600,
            auth_request_ttl_secs: 600,
            client_name: "Decent Auth Client".to_string(),
            plc_directory_url: "https://plc.directory".to_string(),
            doh_url: "https://cloudflare-dns.com/dns-query".to_string(),
            outbound_scheme: "https".to_string(),
            http_timeout_secs: 10,
            user_agent: concat!("decent-auth/", env!("CARGO_PKG_VERSION")).to_string(),
            supported_fediverse_software: vec!["mastodon".to_string()],
            login_methods: vec![
                LoginMethod::Atproto,
                LoginMethod::Fediverse,
                LoginMethod::Email,
                LoginMethod::Discovery,
            ],
        }
    }
}

impl BrokerConfig {
    /// Path prefix without a trailing slash. Empty when mounted at the root.
    pub fn prefix(&self) -> &str {
        self.path_prefix.trim_end_matches('/')
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    pub fn auth_request_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_request_ttl_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn is_supported_software(&self, name: &str) -> bool {
        self.supported_fediverse_software
            .iter()
            .any(|s| s.eq_ignore_ascii_case(name))
    }

    pub fn allows(&self, method: &LoginMethod) -> bool {
        self.login_methods.contains(method)
    }

    /// Configured OpenID providers as `(name, uri)` pairs, in order.
    pub fn oidc_providers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.login_methods.iter().filter_map(|method| match method {
            LoginMethod::Oidc { name, uri } => Some((name.as_str(), uri.as_str())),
            _ => None,
        })
    }

    pub fn oidc_provider(&self, name: &str) -> Option<&str> {
        self.oidc_providers()
            .find(|(provider, _)| *provider == name)
            .map(|(_, uri)| uri)
    }

    /// Log configuration (without sensitive values)
    pub fn log_config(&self) {
        info!(
            path_prefix = %self.path_prefix,
            public_origin = ?self.public_origin,
            session_max_age_secs = self.session_max_age_secs,
            auth_request_ttl_secs = self.auth_request_ttl_secs,
            plc_directory_url = %self.plc_directory_url,
            doh_url = %self.doh_url,
            outbound_scheme = %self.outbound_scheme,
            supported_fediverse_software = ?self.supported_fediverse_software,
            login_methods = ?self.login_methods,
            "Broker configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.prefix(), "/auth");
        assert_eq!(config.session_max_age(), Duration::from_secs(84600));
        assert_eq!(config.outbound_scheme, "https");
        assert!(config.is_supported_software("mastodon"));
        assert!(config.is_supported_software("Mastodon"));
        assert!(!config.is_supported_software("misskey"));
        assert!(config.allows(&LoginMethod::Atproto));
        assert!(config.allows(&LoginMethod::Discovery));
        assert_eq!(config.oidc_providers().count(), 0);
    }

    #[test]
    fn login_methods_from_json() {
        let config: BrokerConfig = serde_json::from_value(serde_json::json!({
            "login_methods": [
                { "type": "oidc", "name": "LastLogin", "uri": "https://lastlogin.net" },
                { "type": "atproto" }
            ]
        }))
        .unwrap();

        assert!(config.allows(&LoginMethod::Atproto));
        assert!(!config.allows(&LoginMethod::Fediverse));
        assert_eq!(config.oidc_provider("LastLogin"), Some("https://lastlogin.net"));
        assert_eq!(config.oidc_provider("lastlogin"), None);
    }

    #[test]
    fn prefix_strips_trailing_slash() {
        let config = BrokerConfig {
            path_prefix: "/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.prefix(), "");

        let config = BrokerConfig {
            path_prefix: "/login/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.prefix(), "/login");
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{"path_prefix": "/sso", "session_max_age_secs": 60}"#)
                .unwrap();
        assert_eq!(config.prefix(), "/sso");
        assert_eq!(config.session_max_age_secs, 60);
        assert_eq!(config.auth_request_ttl_secs, 600);
    }
}
