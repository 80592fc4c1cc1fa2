// Error types for the Carafe framework

use crate::HttpResponse;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// An ambient proxy was used outside any active request context.
    #[error("no request context is active on this task")]
    NoContext,

    /// The context stack was popped while empty. Pushes and pops are
    /// strictly paired; hitting this means the pairing was violated.
    #[error("request context stack underflow")]
    EmptyStack,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The request path matched a rule up to its trailing slash and must
    /// be retried at the canonical location.
    #[error("redirect required to {location}")]
    RedirectRequired { location: String },

    /// A generic failure that carries an HTTP status code, e.g. built
    /// with [`abort`]. Participates in error-handler lookup by exact code.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// A handler produced a value that response coercion cannot interpret.
    #[error("cannot turn handler result into a response: {0}")]
    UnroutableResult(String),

    /// Failure raised by application code during request handling.
    #[error("handler error: {0}")]
    Handler(String),

    /// Reverse URL building failed (unknown endpoint, missing variable).
    #[error("cannot build URL: {0}")]
    UrlBuild(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The "carries a status code" capability. `Some` only for failures
    /// with HTTP semantics; programmer errors return `None` and are only
    /// ever recovered through the 500 slot.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::NotFound(_) => Some(404),
            Error::MethodNotAllowed(_) => Some(405),
            Error::RedirectRequired { .. } => Some(308),
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Status code used when this error surfaces as a response.
    pub fn status_code(&self) -> u16 {
        self.http_status().unwrap_or(500)
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status_code())
    }

    /// Render the minimal canonical response for this failure: status,
    /// reason-phrase body, and a Location header for redirects. Never
    /// includes internal details.
    pub fn to_response(&self) -> HttpResponse {
        let status = self.status_code();
        let reason = reason_phrase(status);
        let mut response = HttpResponse::text(format!("{} {}", status, reason)).with_status(status);
        if let Error::RedirectRequired { location } = self {
            response = response.with_header("Location", location.as_str());
        }
        response
    }
}

/// Canonical reason phrase for a status code, or "Unknown" for codes
/// outside the registered ranges.
pub fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Build a status-carrying failure from handler code, to be recovered by
/// a registered error handler or surfaced as its canonical response.
pub fn abort(status: u16) -> Error {
    Error::Http {
        status,
        message: reason_phrase(status).to_string(),
    }
}
