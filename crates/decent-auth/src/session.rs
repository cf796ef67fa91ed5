//! Sessions minted by successful callbacks.

use crate::store::{self, keys, KvStore};
use crate::token::generate_session_token;
use crate::AuthError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Which protocol authenticated the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserIdType {
    Atproto,
    Mastodon,
    Email,
}

impl fmt::Display for UserIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserIdType::Atproto => write!(f, "atproto"),
            UserIdType::Mastodon => write!(f, "mastodon"),
            UserIdType::Email => write!(f, "email"),
        }
    }
}

/// A logged-in session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id_type: UserIdType,
    /// DID, `@user@server` handle or email address
    pub user_id: String,
    /// Raw provider claims
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id_type: UserIdType, user_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            user_id_type,
            user_id: user_id.into(),
            data,
            created_at: Utc::now(),
        }
    }
}

/// Persist `session` under a fresh token and return the token.
pub async fn create(
    store: &dyn KvStore,
    session: &Session,
    max_age: Duration,
) -> Result<String, AuthError> {
    let token = generate_session_token();
    store::put_json(store, &keys::session(&token), session, Some(max_age)).await?;
    info!(
        user_id_type = %session.user_id_type,
        user_id = %session.user_id,
        "Session created"
    );
    Ok(token)
}

pub async fn get(store: &dyn KvStore, token: &str) -> Result<Option<Session>, AuthError> {
    Ok(store::get_json(store, &keys::session(token)).await?)
}

pub async fn delete(store: &dyn KvStore, token: &str) -> Result<(), AuthError> {
    store.delete(&keys::session(token)).await?;
    debug!("Session deleted");
    Ok(())
}
