//! Protocol discovery for a bare domain or URL.
//!
//! Four lookups run concurrently against the target:
//!
//! | precedence | lookup                                       |
//! |------------|----------------------------------------------|
//! | 1          | ATProto DID resolution                       |
//! | 2          | IndieAuth `Link: rel="indieauth-metadata"`   |
//! | 3          | `/.well-known/openid-configuration`          |
//! | 4          | `/.well-known/oauth-authorization-server`    |
//!
//! A lookup that fails for any reason abstains. The result is decided as soon
//! as the highest-precedence lookup that has not abstained has an answer, so a
//! slow lower-precedence lookup never delays a winning higher one.

use crate::config::BrokerConfig;
use crate::did::DidResolver;
use crate::identifier::authority;
use crate::indieauth::{self, IndieAuthMetadata};
use crate::metadata::{self, AuthServerMetadata, OAUTH_AS_WELL_KNOWN, OIDC_WELL_KNOWN};
use crate::AuthError;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Client;
use tracing::{debug, info, instrument};
use url::Url;

/// The protocol chosen for a domain.
#[derive(Debug, Clone, PartialEq)]
pub enum Protocol {
    Atproto { did: String },
    IndieAuth(IndieAuthMetadata),
    Oidc(AuthServerMetadata),
    /// Bare OAuth2 authorization server, treated as a PDS-less ATProto server
    OAuth2(AuthServerMetadata),
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Atproto { .. } => "atproto",
            Protocol::IndieAuth(_) => "indieauth",
            Protocol::Oidc(_) => "oidc",
            Protocol::OAuth2(_) => "oauth2",
        }
    }
}

const ATPROTO: usize = 0;
const INDIEAUTH: usize = 1;
const OIDC: usize = 2;
const OAUTH2: usize = 3;

#[derive(Debug)]
enum Slot {
    Pending,
    Abstained,
    Found(Protocol),
}

/// Take the winner if the slots already decide the race.
fn decided(slots: &mut [Slot; 4]) -> Option<Protocol> {
    for slot in slots.iter_mut() {
        match slot {
            Slot::Pending => return None,
            Slot::Abstained => continue,
            Slot::Found(_) => {
                if let Slot::Found(protocol) = std::mem::replace(slot, Slot::Abstained) {
                    return Some(protocol);
                }
            }
        }
    }
    None
}

/// Races protocol lookups against a domain.
#[derive(Clone)]
pub struct ProtocolDiscovery {
    http_client: Client,
    resolver: DidResolver,
    scheme: String,
}

impl ProtocolDiscovery {
    pub fn new(http_client: Client, resolver: DidResolver, config: &BrokerConfig) -> Self {
        Self {
            http_client,
            resolver,
            scheme: config.outbound_scheme.clone(),
        }
    }

    /// Pick exactly one protocol for `target`.
    #[instrument(skip(self), fields(target = %target))]
    pub async fn discover(&self, target: &Url) -> Result<Protocol, AuthError> {
        let domain = authority(target);
        let base = self.base_url(target);
        let profile = indieauth::canonical_profile_url(&self.scheme, target)?;

        let mut lookups: FuturesUnordered<BoxFuture<'_, (usize, Option<Protocol>)>> =
            FuturesUnordered::new();

        lookups.push(
            async {
                let found = self
                    .resolver
                    .resolve_did(&domain)
                    .await
                    .map(|did| Protocol::Atproto { did });
                (ATPROTO, abstain_on_error("atproto", found))
            }
            .boxed(),
        );
        lookups.push(
            async {
                let found = indieauth::lookup_indieauth_server(&self.http_client, &profile)
                    .await
                    .and_then(|meta| {
                        meta.map(Protocol::IndieAuth).ok_or_else(|| {
                            AuthError::OAuthDiscoveryFailed("no indieauth link".to_string())
                        })
                    });
                (INDIEAUTH, abstain_on_error("indieauth", found))
            }
            .boxed(),
        );
        lookups.push(
            async {
                let found = self.oidc_metadata_at(&base).await.map(Protocol::Oidc);
                (OIDC, abstain_on_error("oidc", found))
            }
            .boxed(),
        );
        lookups.push(
            async {
                let found =
                    metadata::fetch_auth_server_metadata(&self.http_client, &base, OAUTH_AS_WELL_KNOWN)
                        .await
                        .map(Protocol::OAuth2);
                (OAUTH2, abstain_on_error("oauth2", found))
            }
            .boxed(),
        );

        let mut slots = [Slot::Pending, Slot::Pending, Slot::Pending, Slot::Pending];

        while let Some((index, result)) = lookups.next().await {
            slots[index] = match result {
                Some(protocol) => Slot::Found(protocol),
                None => Slot::Abstained,
            };

            if let Some(protocol) = decided(&mut slots) {
                info!(protocol = protocol.name(), "Discovered login protocol");
                return Ok(protocol);
            }
        }

        drop(lookups);
        Err(AuthError::NoCompatibleProtocol(domain))
    }

    /// OIDC discovery document for a bare domain.
    pub async fn oidc_metadata(&self, domain: &str) -> Result<AuthServerMetadata, AuthError> {
        let base = format!("{}://{}", self.scheme, domain);
        self.oidc_metadata_at(&base).await
    }

    /// OIDC discovery document of the issuer at `base`.
    pub async fn oidc_metadata_at(&self, base: &str) -> Result<AuthServerMetadata, AuthError> {
        metadata::fetch_auth_server_metadata(&self.http_client, base, OIDC_WELL_KNOWN).await
    }

    /// `{scheme}://{authority}{path}` without a trailing slash.
    fn base_url(&self, target: &Url) -> String {
        format!(
            "{}://{}{}",
            self.scheme,
            authority(target),
            target.path().trim_end_matches('/')
        )
    }
}

fn abstain_on_error(lookup: &str, result: Result<Protocol, AuthError>) -> Option<Protocol> {
    match result {
        Ok(protocol) => Some(protocol),
        Err(e) => {
            debug!(lookup, error = %e, "Discovery lookup abstained");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oidc_meta() -> AuthServerMetadata {
        AuthServerMetadata {
            issuer: "https://idp.example".to_string(),
            authorization_endpoint: "https://idp.example/authorize".to_string(),
            token_endpoint: "https://idp.example/token".to_string(),
            pushed_authorization_request_endpoint: None,
            userinfo_endpoint: None,
            scopes_supported: vec![],
            code_challenge_methods_supported: vec![],
            dpop_signing_alg_values_supported: vec![],
        }
    }

    #[test]
    fn waits_for_higher_precedence() {
        let mut slots = [
            Slot::Pending,
            Slot::Abstained,
            Slot::Found(Protocol::Oidc(oidc_meta())),
            Slot::Pending,
        ];
        assert!(decided(&mut slots).is_none());

        slots[ATPROTO] = Slot::Abstained;
        assert_eq!(decided(&mut slots), Some(Protocol::Oidc(oidc_meta())));
    }

    #[test]
    fn highest_found_wins_without_waiting_for_lower() {
        let mut slots = [
            Slot::Found(Protocol::Atproto {
                did: "did:plc:a".to_string(),
            }),
            Slot::Pending,
            Slot::Pending,
            Slot::Pending,
        ];
        assert_eq!(
            decided(&mut slots),
            Some(Protocol::Atproto {
                did: "did:plc:a".to_string()
            })
        );
    }

    #[test]
    fn all_abstained_is_undecided() {
        let mut slots = [
            Slot::Abstained,
            Slot::Abstained,
            Slot::Abstained,
            Slot::Abstained,
        ];
        assert!(decided(&mut slots).is_none());
    }
}
