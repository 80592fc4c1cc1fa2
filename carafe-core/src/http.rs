// HTTP request and response types

use crate::routing::RouteMatch;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// HTTP request wrapper.
///
/// Constructed by the transport adapter (or a test client) from the raw
/// request environment. After routing succeeds, the dispatch pipeline
/// records the matched endpoint and extracted path variables here so they
/// stay introspectable for the rest of the request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub query_params: HashMap<String, String>,
    route: OnceLock<RouteMatch>,
}

impl HttpRequest {
    /// Create a request from a method and a request target. A query string
    /// in the target is split off and parsed into `query_params`.
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = target
            .split_once('?')
            .map(|(p, q)| (p, Some(q)))
            .unwrap_or((target, None));

        let query_params = query
            .and_then(|q| serde_urlencoded::from_str::<HashMap<String, String>>(q).ok())
            .unwrap_or_default();

        Self {
            method: method.into(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
            query_params,
            route: OnceLock::new(),
        }
    }

    /// Create a request with headers and body already in place.
    pub fn from_parts(
        method: impl Into<String>,
        target: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        let mut request = Self::new(method, target);
        request.headers = headers;
        request.body = body;
        request
    }

    /// Parse the request body as JSON
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers.get(name)
    }

    /// Get a cookie value from the Cookie header
    pub fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.headers.get("Cookie").or_else(|| self.headers.get("cookie"))?;
        for pair in raw.split(';') {
            let (key, value) = pair.trim().split_once('=')?;
            if key == name {
                return urlencoding::decode(value).ok().map(|v| v.into_owned());
            }
        }
        None
    }

    /// Get a query parameter by name
    pub fn query(&self, name: &str) -> Option<&String> {
        self.query_params.get(name)
    }

    /// Endpoint name recorded after a successful route match.
    pub fn endpoint(&self) -> Option<&str> {
        self.route.get().map(|m| m.endpoint.as_str())
    }

    /// Path variables recorded after a successful route match.
    pub fn route_params(&self) -> Option<&HashMap<String, String>> {
        self.route.get().map(|m| &m.params)
    }

    /// Get a single extracted path variable by name
    pub fn param(&self, name: &str) -> Option<&String> {
        self.route_params().and_then(|params| params.get(name))
    }

    /// Record the route match. Set once per request, after matching.
    pub(crate) fn record_match(&self, matched: RouteMatch) {
        let _ = self.route.set(matched);
    }
}

/// HTTP response wrapper
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn empty() -> Self {
        Self::new(204)
    }

    /// A 200 response with a plain text body
    pub fn text(body: impl Into<String>) -> Self {
        Self::ok()
            .with_body(body.into().into_bytes())
            .with_header("Content-Type", "text/plain; charset=utf-8")
    }

    /// A 200 response with an HTML body. This is the default shape a bare
    /// text handler result coerces into.
    pub fn html(body: impl Into<String>) -> Self {
        Self::ok()
            .with_body(body.into().into_bytes())
            .with_header("Content-Type", "text/html; charset=utf-8")
    }

    /// A 200 response with a JSON body
    pub fn json<T: Serialize>(value: &T) -> Result<Self, Error> {
        let body = serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self::ok()
            .with_body(body)
            .with_header("Content-Type", "application/json"))
    }

    /// A 302 redirect to the given location
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new(302).with_header("Location", location)
    }

    /// A 301 redirect to the given location
    pub fn redirect_permanent(location: impl Into<String>) -> Self {
        Self::new(301).with_header("Location", location)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn content_type(self, value: &str) -> Self {
        self.with_header("Content-Type", value)
    }

    /// Set a cookie on the response. The value is URL-encoded.
    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.headers.insert(
            "Set-Cookie".to_string(),
            format!("{}={}; Path=/; HttpOnly", name, urlencoding::encode(value)),
        );
    }

    /// The body as UTF-8 text (lossy)
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// JSON response helper
#[derive(Debug)]
pub struct Json<T: Serialize>(pub T);

impl<T: Serialize> Json<T> {
    pub fn into_response(self) -> Result<HttpResponse, Error> {
        HttpResponse::json(&self.0)
    }
}
