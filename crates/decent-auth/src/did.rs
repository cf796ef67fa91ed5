//! DID resolution for ATProto
//!
//! A domain is resolved to a DID by racing two lookups:
//! 1. DNS TXT record at `_atproto.{domain}` (via a DNS-over-HTTPS JSON API)
//! 2. HTTPS request to `https://{domain}/.well-known/atproto-did`
//!
//! The first usable answer wins. Only `did:plc` is supported; its document is
//! fetched from the PLC directory.

use crate::config::BrokerConfig;
use crate::AuthError;
use futures::future::{select_ok, BoxFuture, FutureExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// DID Resolver for ATProto domains and DIDs
#[derive(Clone)]
pub struct DidResolver {
    http_client: Client,
    plc_directory_url: String,
    doh_url: String,
    scheme: String,
}

impl DidResolver {
    pub fn new(http_client: Client, config: &BrokerConfig) -> Self {
        Self {
            http_client,
            plc_directory_url: config.plc_directory_url.trim_end_matches('/').to_string(),
            doh_url: config.doh_url.clone(),
            scheme: config.outbound_scheme.clone(),
        }
    }

    /// Resolve a domain to a `did:plc` DID.
    ///
    /// Fails with `DidNotFound` when neither lookup yields a DID and with
    /// `UnsupportedDidMethod` when the DID is not `did:plc`.
    #[instrument(skip(self))]
    pub async fn resolve_did(&self, domain: &str) -> Result<String, AuthError> {
        let lookups: Vec<BoxFuture<'_, Result<String, AuthError>>> = vec![
            self.lookup_via_dns(domain).boxed(),
            self.lookup_via_well_known(domain).boxed(),
        ];

        let did = match select_ok(lookups).await {
            Ok((did, _rest)) => did,
            Err(e) => {
                debug!(error = %e, "No DID found for {}", domain);
                return Err(AuthError::DidNotFound(domain.to_string()));
            }
        };

        if !did.starts_with("did:plc:") {
            return Err(AuthError::UnsupportedDidMethod(did));
        }

        debug!("Resolved {} -> {}", domain, did);
        Ok(did)
    }

    /// Look up `_atproto.{domain}` TXT records over DNS-over-HTTPS
    async fn lookup_via_dns(&self, domain: &str) -> Result<String, AuthError> {
        let name = format!("_atproto.{}", domain);

        let response = self
            .http_client
            .get(&self.doh_url)
            .query(&[("name", name.as_str()), ("type", "TXT")])
            .header("Accept", "application/dns-json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::DidNotFound(format!(
                "DNS-over-HTTPS returned status {}",
                response.status()
            )));
        }

        let answer: DohResponse = response.json().await?;
        answer
            .answer
            .iter()
            .filter(|record| record.name.trim_end_matches('.') == name)
            .find_map(|record| parse_did_txt(&record.data))
            .ok_or_else(|| AuthError::DidNotFound(format!("no DID TXT record at {}", name)))
    }

    /// Fetch `/.well-known/atproto-did` from the domain
    async fn lookup_via_well_known(&self, domain: &str) -> Result<String, AuthError> {
        let url = format!("{}://{}/.well-known/atproto-did", self.scheme, domain);

        let response = self.http_client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::DidNotFound(format!(
                ".well-known returned status {}",
                response.status()
            )));
        }

        let did = response.text().await?.trim().to_string();
        if !did.starts_with("did:") {
            return Err(AuthError::DidNotFound(format!(
                ".well-known returned a non-DID body for {}",
                domain
            )));
        }

        Ok(did)
    }

    /// Fetch a DID document from the PLC directory
    #[instrument(skip(self))]
    pub async fn resolve_did_document(&self, did: &str) -> Result<DidDocument, AuthError> {
        if !did.starts_with("did:plc:") {
            return Err(AuthError::UnsupportedDidMethod(did.to_string()));
        }

        let url = format!("{}/{}", self.plc_directory_url, did);
        debug!("Fetching PLC DID document from: {}", url);

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            AuthError::DidDocumentFetchFailed(format!("Failed to fetch PLC document: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(AuthError::DidDocumentFetchFailed(format!(
                "PLC directory returned status {}",
                response.status()
            )));
        }

        let doc: DidDocument = response.json().await.map_err(|e| {
            AuthError::DidDocumentFetchFailed(format!("Failed to parse DID document: {}", e))
        })?;

        if doc.id != did {
            return Err(AuthError::DidDocumentFetchFailed(format!(
                "PLC directory returned a document for {}",
                doc.id
            )));
        }

        Ok(doc)
    }

    /// Handle from the `alsoKnownAs` entries of a DID's document.
    pub async fn resolve_handle_for_did(&self, did: &str) -> Result<Option<String>, AuthError> {
        Ok(self.resolve_did_document(did).await?.get_handle())
    }
}

/// Extract the DID from a `_atproto` TXT record value.
///
/// DoH JSON APIs return TXT data JSON-quoted (`"\"did=did:plc:...\""`); the
/// value is decoded as a JSON string first and used raw if that fails.
/// Anything other than `did=did:...` is ignored.
fn parse_did_txt(data: &str) -> Option<String> {
    let text = serde_json::from_str::<String>(data).unwrap_or_else(|_| data.to_string());
    let (key, did) = text.split_once('=')?;
    let did = did.trim();
    if key.trim() != "did" || !did.starts_with("did:") {
        return None;
    }
    Some(did.to_string())
}

/// DNS-over-HTTPS JSON response
#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(default, rename = "Answer")]
    answer: Vec<DohRecord>,
}

#[derive(Debug, Deserialize)]
struct DohRecord {
    name: String,
    #[serde(default)]
    data: String,
}

/// DID Document structure (simplified for ATProto)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidDocument {
    /// The DID this document is for
    pub id: String,

    /// Also known as (handles)
    #[serde(default, rename = "alsoKnownAs")]
    pub also_known_as: Vec<String>,

    /// Services (PDS endpoint, etc.)
    #[serde(default)]
    pub service: Vec<Service>,
}

impl DidDocument {
    /// PDS endpoint, falling back to the first listed service.
    pub fn get_pds_endpoint(&self) -> Option<String> {
        self.service
            .iter()
            .find(|s| s.service_type == "AtprotoPersonalDataServer")
            .or_else(|| self.service.first())
            .map(|s| s.service_endpoint.clone())
    }

    /// Get the handle from alsoKnownAs
    pub fn get_handle(&self) -> Option<String> {
        self.also_known_as
            .iter()
            .find_map(|h| h.strip_prefix("at://"))
            .map(str::to_string)
    }
}

/// Service endpoint in a DID document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver_for(server: &MockServer) -> DidResolver {
        let config = BrokerConfig {
            plc_directory_url: server.uri(),
            doh_url: format!("{}/dns-query", server.uri()),
            outbound_scheme: "http".to_string(),
            ..Default::default()
        };
        DidResolver::new(Client::new(), &config)
    }

    fn authority(server: &MockServer) -> String {
        server.uri().trim_start_matches("http://").to_string()
    }

    #[test]
    fn txt_parsing() {
        assert_eq!(
            parse_did_txt("\"did=did:plc:abc123\"").as_deref(),
            Some("did:plc:abc123")
        );
        assert_eq!(
            parse_did_txt("did=did:plc:abc123").as_deref(),
            Some("did:plc:abc123")
        );
        assert_eq!(parse_did_txt("\"v=spf1\""), None);
        assert_eq!(parse_did_txt("did=notadid"), None);
        assert_eq!(parse_did_txt("\"nothing\""), None);
        assert_eq!(parse_did_txt("did="), None);
    }

    #[test]
    fn did_document_accessors() {
        let doc: DidDocument = serde_json::from_value(serde_json::json!({
            "id": "did:plc:test123",
            "alsoKnownAs": ["at://alice.bsky.social"],
            "service": [{
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": "https://pds.example"
            }]
        }))
        .unwrap();

        assert_eq!(doc.get_pds_endpoint().as_deref(), Some("https://pds.example"));
        assert_eq!(doc.get_handle().as_deref(), Some("alice.bsky.social"));
    }

    #[tokio::test]
    async fn resolves_via_dns() {
        let server = MockServer::start().await;
        let domain = authority(&server);

        Mock::given(method("GET"))
            .and(path("/dns-query"))
            .and(query_param("type", "TXT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Status": 0,
                "Answer": [{
                    "name": format!("_atproto.{}.", domain),
                    "type": 16,
                    "data": "\"did=did:plc:fromdns\""
                }]
            })))
            .mount(&server)
            .await;

        let did = resolver_for(&server).resolve_did(&domain).await.unwrap();
        assert_eq!(did, "did:plc:fromdns");
    }

    #[tokio::test]
    async fn junk_txt_record_does_not_beat_well_known() {
        let server = MockServer::start().await;
        let domain = authority(&server);

        Mock::given(method("GET"))
            .and(path("/dns-query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Status": 0,
                "Answer": [{
                    "name": format!("_atproto.{}.", domain),
                    "type": 16,
                    "data": "\"foo=bar\""
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/atproto-did"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("did:plc:good")
                    .set_delay(std::time::Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let did = resolver_for(&server).resolve_did(&domain).await.unwrap();
        assert_eq!(did, "did:plc:good");
    }

    #[tokio::test]
    async fn resolves_via_well_known_when_dns_is_empty() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/dns-query"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"Status": 3})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/atproto-did"))
            .respond_with(ResponseTemplate::new(200).set_body_string("did:plc:fromhttp\n"))
            .mount(&server)
            .await;

        let did = resolver_for(&server)
            .resolve_did(&authority(&server))
            .await
            .unwrap();
        assert_eq!(did, "did:plc:fromhttp");
    }

    #[tokio::test]
    async fn not_found_when_both_lookups_fail() {
        let server = MockServer::start().await;

        let err = resolver_for(&server)
            .resolve_did(&authority(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::DidNotFound(_)));
    }

    #[tokio::test]
    async fn rejects_non_plc_dids() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/.well-known/atproto-did"))
            .respond_with(ResponseTemplate::new(200).set_body_string("did:web:example.com"))
            .mount(&server)
            .await;

        let err = resolver_for(&server)
            .resolve_did(&authority(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedDidMethod(_)));
    }

    #[tokio::test]
    async fn fetches_plc_document() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/did:plc:abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "did:plc:abc",
                "alsoKnownAs": ["at://abc.example"],
                "service": [{
                    "id": "#atproto_pds",
                    "type": "AtprotoPersonalDataServer",
                    "serviceEndpoint": "https://pds.example"
                }]
            })))
            .mount(&server)
            .await;

        let resolver = resolver_for(&server);
        let doc = resolver.resolve_did_document("did:plc:abc").await.unwrap();
        assert_eq!(doc.get_pds_endpoint().as_deref(), Some("https://pds.example"));
        assert_eq!(
            resolver.resolve_handle_for_did("did:plc:abc").await.unwrap().as_deref(),
            Some("abc.example")
        );

        let err = resolver.resolve_did_document("did:plc:missing").await.unwrap_err();
        assert!(matches!(err, AuthError::DidDocumentFetchFailed(_)));
    }
}
