//! Transport-neutral request/response model.
//!
//! The broker never sees a socket. Host adapters convert their native request
//! into a [`Request`] and write the returned [`Response`] back.

use crate::cookies;
use crate::AuthError;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use url::Url;

/// An inbound HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Absolute URL, including scheme and host
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Shorthand for a bodiless `GET`.
    pub fn get(url: &str) -> Result<Self, AuthError> {
        let url = Url::parse(url).map_err(|e| AuthError::InvalidRequest(e.to_string()))?;
        Ok(Self::new(Method::GET, url))
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Result<Self, AuthError> {
        let value =
            HeaderValue::from_str(value).map_err(|e| AuthError::InvalidRequest(e.to_string()))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First query parameter called `name`.
    pub fn query(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of the cookie `name` from the `Cookie` header(s).
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|header| cookies::find(header, name))
    }

    /// Path relative to `prefix`, or `None` if the request is outside it.
    ///
    /// `/auth` and `/auth/` both map to `/`.
    pub fn route_path(&self, prefix: &str) -> Option<String> {
        let rest = self.url.path().strip_prefix(prefix)?;
        if rest.is_empty() {
            return Some("/".to_string());
        }
        if !rest.starts_with('/') {
            return None;
        }
        Some(rest.to_string())
    }
}

/// An outbound HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// `303 See Other` to `location`.
    pub fn redirect(location: &str) -> Result<Self, AuthError> {
        Self::new(StatusCode::SEE_OTHER).with_header(LOCATION, location)
    }

    pub fn html(status: StatusCode, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response.body = body.into().into_bytes();
        response
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.body = body.into().into_bytes();
        response
    }

    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Result<Self, AuthError> {
        let mut response = Self::new(status);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response.body = serde_json::to_vec(value)?;
        Ok(response)
    }

    /// Append a header. Appending keeps earlier values (needed for `Set-Cookie`).
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Result<Self, AuthError> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| AuthError::InvalidRequest(format!("invalid header value: {}", e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// JSON body for error responses
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl From<&AuthError> for Response {
    fn from(err: &AuthError) -> Self {
        let body = ErrorResponse {
            error: err.error_code().to_string(),
            message: err.to_string(),
        };
        // ErrorResponse always serializes
        Response::json(err.status(), &body).unwrap_or_else(|_| Response::new(err.status()))
    }
}
