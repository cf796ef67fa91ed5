//! Classification of the identifier a visitor types into the login form.

use crate::AuthError;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Kind of identifier, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Did,
    Handle,
    Email,
    Url,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierKind::Did => write!(f, "did"),
            IdentifierKind::Handle => write!(f, "handle"),
            IdentifierKind::Email => write!(f, "email"),
            IdentifierKind::Url => write!(f, "url"),
        }
    }
}

/// A parsed login identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// A literal `did:plc:...`
    Did(String),
    /// A fediverse handle, `@user@server`
    Handle { user: String, server: String },
    /// An email address
    Email { local: String, domain: String },
    /// A bare domain or URL (`https://` is assumed when no scheme is given)
    Url(Url),
}

impl Identifier {
    /// Classify `input`.
    ///
    /// Rules, in order: `did:plc` prefix, `@user@server`, `user@domain`,
    /// then domain/URL.
    pub fn parse(input: &str) -> Result<Self, AuthError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AuthError::InvalidIdentifier(
                "identifier is empty".to_string(),
            ));
        }

        if input.starts_with("did:plc") {
            return Ok(Identifier::Did(input.to_string()));
        }

        let parts: Vec<&str> = input.split('@').collect();
        match parts.len() {
            1 => {}
            2 => {
                if parts[0].is_empty() || parts[1].is_empty() {
                    return Err(AuthError::InvalidIdentifier(input.to_string()));
                }
                return Ok(Identifier::Email {
                    local: parts[0].to_string(),
                    domain: parts[1].to_lowercase(),
                });
            }
            3 if parts[0].is_empty() => {
                if parts[1].is_empty() || parts[2].is_empty() {
                    return Err(AuthError::InvalidIdentifier(input.to_string()));
                }
                return Ok(Identifier::Handle {
                    user: parts[1].to_string(),
                    server: parts[2].to_lowercase(),
                });
            }
            _ => return Err(AuthError::InvalidIdentifier(input.to_string())),
        }

        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("https://{}", input)
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| AuthError::InvalidIdentifier(format!("{}: {}", input, e)))?;
        if url.host_str().is_none() {
            return Err(AuthError::InvalidIdentifier(format!(
                "{}: no host",
                input
            )));
        }

        Ok(Identifier::Url(url))
    }

    pub fn kind(&self) -> IdentifierKind {
        match self {
            Identifier::Did(_) => IdentifierKind::Did,
            Identifier::Handle { .. } => IdentifierKind::Handle,
            Identifier::Email { .. } => IdentifierKind::Email,
            Identifier::Url(_) => IdentifierKind::Url,
        }
    }

    /// The domain the identifier points at, if it has one.
    ///
    /// For URLs this includes an explicit port.
    pub fn domain(&self) -> Option<String> {
        match self {
            Identifier::Did(_) => None,
            Identifier::Handle { server, .. } => Some(server.clone()),
            Identifier::Email { domain, .. } => Some(domain.clone()),
            Identifier::Url(url) => Some(authority(url)),
        }
    }
}

impl FromStr for Identifier {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identifier::parse(s)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Did(did) => write!(f, "{}", did),
            Identifier::Handle { user, server } => write!(f, "@{}@{}", user, server),
            Identifier::Email { local, domain } => write!(f, "{}@{}", local, domain),
            Identifier::Url(url) => write!(f, "{}", url),
        }
    }
}

/// `host[:port]` of a URL.
pub fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
