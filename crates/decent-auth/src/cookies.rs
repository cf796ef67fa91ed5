//! Session cookie helpers.

use cookie::time::Duration;
use cookie::Cookie;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "session_key";

/// `Set-Cookie` value carrying a fresh session token.
pub fn session_cookie(token: &str, max_age_secs: u64) -> String {
    let max_age = i64::try_from(max_age_secs).unwrap_or(i64::MAX);
    Cookie::build((SESSION_COOKIE, token.to_string()))
        .path("/")
        .max_age(Duration::seconds(max_age))
        .secure(true)
        .http_only(true)
        .build()
        .to_string()
}

/// `Set-Cookie` value that removes the session cookie.
pub fn clear_session_cookie() -> String {
    Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .max_age(Duration::ZERO)
        .secure(true)
        .http_only(true)
        .build()
        .to_string()
}

/// Find cookie `name` in a `Cookie` request header.
pub fn find(header: &str, name: &str) -> Option<String> {
    Cookie::split_parse(header)
        .filter_map(Result::ok)
        .find(|c| c.name() == name)
        .map(|c| c.value().to_string())
}
