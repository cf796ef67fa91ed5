//! Multi-protocol login broker.
//!
//! A visitor types one identifier (a DID, a fediverse handle, an email
//! address or a domain/URL). The broker decides which identity protocol
//! applies, drives that protocol's authorization handshake, verifies the
//! result on callback and mints a session cookie:
//!
//! - ATProto OAuth with PAR, PKCE and DPoP
//! - Mastodon OAuth with dynamic app registration
//! - OpenID Connect (also used for email identifiers)
//! - IndieAuth (discovery only)
//!
//! The broker is runtime independent: hosts translate their HTTP requests
//! into [`Request`], call [`Broker::handle`] and write back the [`Response`].
//! All state lives in a [`KvStore`] supplied by the host.

pub mod atproto;
pub mod auth_request;
pub mod broker;
pub mod client;
pub mod config;
pub mod cookies;
pub mod did;
pub mod discovery;
pub mod dpop;
pub mod error;
pub mod fediverse;
pub mod http;
pub mod identifier;
pub mod indieauth;
pub mod metadata;
pub mod oidc;
pub mod session;
pub mod store;
pub mod token;

pub use auth_request::{AuthRequest, CallbackParams, PendingLogin};
pub use broker::Broker;
pub use client::ClientUrls;
pub use config::{BrokerConfig, LoginMethod};
pub use did::{DidDocument, DidResolver};
pub use discovery::{Protocol, ProtocolDiscovery};
pub use dpop::DpopKeyPair;
pub use error::AuthError;
pub use crate::http::{Request, Response};
pub use identifier::{Identifier, IdentifierKind};
pub use session::{Session, UserIdType};
pub use store::{KvStore, MemoryStore, StoreError};
