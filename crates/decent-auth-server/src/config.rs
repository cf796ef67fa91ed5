//! Server configuration.
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file (`--config`)
//! 3. `DECENT_AUTH__*` environment variables, `__` separating nested keys
//!    (e.g. `DECENT_AUTH__BROKER__PUBLIC_ORIGIN=https://auth.example`)
//!
//! ```toml
//! listen_addr = "0.0.0.0:3000"
//!
//! [store]
//! kind = "sqlite"
//! path = "/var/lib/decent-auth/kv.db"
//!
//! [broker]
//! path_prefix = "/auth"
//! client_name = "Example"
//!
//! [[broker.login_methods]]
//! type = "atproto"
//!
//! [[broker.login_methods]]
//! type = "oidc"
//! name = "LastLogin"
//! uri = "https://lastlogin.net"
//! ```

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use decent_auth::BrokerConfig;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tracing::info;

pub const ENV_PREFIX: &str = "DECENT_AUTH";

/// Which [`decent_auth::KvStore`] backend to run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process memory, lost on restart
    #[default]
    Memory,
    /// libSQL database file
    Sqlite,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Memory => write!(f, "memory"),
            StoreKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Database file, used by the `sqlite` backend
    pub path: String,
    /// How often expired in-memory entries are purged
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: "decent-auth.db".to_string(),
            purge_interval_secs: 60,
        }
    }
}

/// Process-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub listen_addr: String,
    pub store: StoreConfig,
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            store: StoreConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from an optional TOML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("broker.supported_fediverse_software")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("Listen address: {}", self.listen_addr);
        match self.store.kind {
            StoreKind::Memory => info!("Store: memory"),
            StoreKind::Sqlite => info!("Store: sqlite at {}", self.store.path),
        }
        self.broker.log_config();
    }
}
