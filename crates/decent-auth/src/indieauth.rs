//! IndieAuth server discovery.
//!
//! Only discovery is implemented: the profile URL is requested with `HEAD` and
//! the `Link` header's `rel="indieauth-metadata"` target is fetched. Logging
//! in with IndieAuth is answered with `NotSupported`.

use crate::metadata::fetch_json;
use crate::AuthError;
use reqwest::header::LINK;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

pub const INDIEAUTH_METADATA_REL: &str = "indieauth-metadata";

/// IndieAuth server metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndieAuthMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_challenge_methods_supported: Vec<String>,
}

/// One entry of a `Link` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub target: String,
    pub rels: Vec<String>,
}

/// Parse an RFC 8288 `Link` header value.
///
/// Entries without a `<target>` are skipped. `rel` may hold several
/// space-separated values and may be quoted with `"` or `'`.
pub fn parse_link_header(value: &str) -> Vec<LinkEntry> {
    split_outside_brackets(value, ',')
        .into_iter()
        .filter_map(|entry| {
            let mut params = split_outside_brackets(entry, ';').into_iter();
            let target = params
                .next()?
                .trim()
                .strip_prefix('<')?
                .strip_suffix('>')?
                .to_string();

            let rels = params
                .filter_map(|param| {
                    let (name, value) = param.split_once('=')?;
                    if !name.trim().eq_ignore_ascii_case("rel") {
                        return None;
                    }
                    Some(value.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
                })
                .flat_map(|rel| {
                    rel.split_whitespace()
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .collect();

            Some(LinkEntry { target, rels })
        })
        .collect()
}

fn split_outside_brackets(value: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            '"' => in_quotes = !in_quotes,
            c if c == sep && depth == 0 && !in_quotes => {
                parts.push(&value[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);

    parts
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect()
}

/// Canonical profile URL used for discovery: `{scheme}://{authority}{path}`
/// with a trailing slash.
pub fn canonical_profile_url(scheme: &str, url: &Url) -> Result<Url, AuthError> {
    let authority = crate::identifier::authority(url);
    let mut canonical = format!("{}://{}{}", scheme, authority, url.path());
    if !canonical.ends_with('/') {
        canonical.push('/');
    }
    Url::parse(&canonical).map_err(|e| AuthError::InvalidIdentifier(e.to_string()))
}

/// Look up `profile` for IndieAuth metadata.
///
/// Returns `Ok(None)` when the profile does not advertise a metadata link.
#[instrument(skip(client), fields(profile = %profile))]
pub async fn lookup_indieauth_server(
    client: &Client,
    profile: &Url,
) -> Result<Option<IndieAuthMetadata>, AuthError> {
    let response = client.head(profile.as_str()).send().await?;

    let metadata_url = response
        .headers()
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(parse_link_header)
        .find(|entry| entry.rels.iter().any(|r| r == INDIEAUTH_METADATA_REL))
        .map(|entry| profile.join(&entry.target))
        .transpose()
        .map_err(|e| AuthError::OAuthDiscoveryFailed(format!("Invalid metadata link: {}", e)))?;

    let Some(metadata_url) = metadata_url else {
        debug!("No indieauth-metadata link");
        return Ok(None);
    };

    let metadata = fetch_json(client, metadata_url.as_str()).await?;
    Ok(Some(metadata))
}
