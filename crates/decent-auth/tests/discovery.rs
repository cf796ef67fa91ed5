//! Protocol discovery against a mocked domain.
//!
//! Every lookup is answered over plain HTTP from a single wiremock server, with
//! delays used to make the fastest lookup differ from the preferred one.

use decent_auth::{
    AuthError, Broker, BrokerConfig, DidResolver, MemoryStore, Protocol, ProtocolDiscovery,
    Request,
};
use http::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> BrokerConfig {
    BrokerConfig {
        public_origin: Some("https://app.example".to_string()),
        plc_directory_url: server.uri(),
        doh_url: format!("{}/dns-query", server.uri()),
        outbound_scheme: "http".to_string(),
        ..Default::default()
    }
}

fn discovery(server: &MockServer) -> ProtocolDiscovery {
    let config = config(server);
    let client = reqwest::Client::new();
    let resolver = DidResolver::new(client.clone(), &config);
    ProtocolDiscovery::new(client, resolver, &config)
}

fn target(server: &MockServer) -> Url {
    Url::parse(&server.uri()).unwrap()
}

fn as_metadata(server: &MockServer) -> Value {
    json!({
        "issuer": server.uri(),
        "authorization_endpoint": format!("{}/authorize", server.uri()),
        "token_endpoint": format!("{}/token", server.uri())
    })
}

async fn mount_oidc(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(as_metadata(server))
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

async fn mount_oauth2(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(as_metadata(server))
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn atproto_wins_over_a_faster_oidc_answer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/atproto-did"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("did:plc:alice\n")
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    mount_oidc(&server, Duration::ZERO).await;

    let protocol = discovery(&server).discover(&target(&server)).await.unwrap();
    assert_eq!(
        protocol,
        Protocol::Atproto {
            did: "did:plc:alice".to_string()
        }
    );
}

#[tokio::test]
async fn atproto_via_dns_txt_record() {
    let server = MockServer::start().await;
    let authority = server.uri().trim_start_matches("http://").to_string();
    Mock::given(method("GET"))
        .and(path("/dns-query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Status": 0,
            "Answer": [{
                "name": format!("_atproto.{}.", authority),
                "type": 16,
                "TTL": 300,
                "data": "\"did=did:plc:bob\""
            }]
        })))
        .mount(&server)
        .await;

    let protocol = discovery(&server).discover(&target(&server)).await.unwrap();
    assert_eq!(
        protocol,
        Protocol::Atproto {
            did: "did:plc:bob".to_string()
        }
    );
}

#[tokio::test]
async fn oidc_wins_over_a_faster_oauth2_answer() {
    let server = MockServer::start().await;
    mount_oidc(&server, Duration::from_millis(200)).await;
    mount_oauth2(&server, Duration::ZERO).await;

    let protocol = discovery(&server).discover(&target(&server)).await.unwrap();
    match protocol {
        Protocol::Oidc(meta) => assert_eq!(meta.issuer, server.uri()),
        other => panic!("expected OIDC, got {}", other.name()),
    }
}

#[tokio::test]
async fn oauth2_is_the_last_resort() {
    let server = MockServer::start().await;
    mount_oauth2(&server, Duration::ZERO).await;

    let protocol = discovery(&server).discover(&target(&server)).await.unwrap();
    assert_eq!(protocol.name(), "oauth2");
}

#[tokio::test]
async fn indieauth_link_is_found_and_refused_by_the_broker() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Link", r#"</indieauth-metadata>; rel="indieauth-metadata""#),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/indieauth-metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/auth", server.uri())
        })))
        .mount(&server)
        .await;
    mount_oidc(&server, Duration::ZERO).await;

    let protocol = discovery(&server).discover(&target(&server)).await.unwrap();
    assert_eq!(protocol.name(), "indieauth");

    let broker = Broker::new(config(&server), Arc::new(MemoryStore::new())).unwrap();
    let request = Request::get(&format!(
        "https://app.example/auth/initiate?value={}",
        server.uri().trim_start_matches("http://")
    ))
    .unwrap();
    let response = broker.handle(&request).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["error"], "not_supported");
}

#[tokio::test]
async fn nothing_found_is_no_compatible_protocol() {
    let server = MockServer::start().await;

    let err = discovery(&server)
        .discover(&target(&server))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::NoCompatibleProtocol(_)));
    assert_eq!(err.error_code(), "no_compatible_protocol");
}
