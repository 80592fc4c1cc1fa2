// Handler results and response coercion

use crate::{ambient, Application, Error, HttpRequest, HttpResponse};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// A nested application: invoked with the current request environment,
/// its output is buffered into the response. This is how one dispatch
/// core composes another.
pub type NestedApp =
    Arc<dyn Fn(HttpRequest) -> BoxFuture<'static, Result<HttpResponse, Error>> + Send + Sync>;

/// What a handler (or a hook, or an error handler) may return. Response
/// coercion turns any of these into a canonical [`HttpResponse`].
#[derive(Clone)]
pub enum Reply {
    /// Already canonical; passed through unchanged
    Response(HttpResponse),
    /// A text body; becomes a 200 response with the default content type
    Text(String),
    /// Response constructor arguments, positional: body, status, headers
    Parts {
        body: String,
        status: u16,
        headers: HashMap<String, String>,
    },
    /// A nested application to run against the current request
    Nested(NestedApp),
}

impl Reply {
    /// A redirect reply to the given location
    pub fn redirect(location: impl Into<String>) -> Self {
        Reply::Response(HttpResponse::redirect(location))
    }

    /// A JSON reply
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, Error> {
        Ok(Reply::Response(HttpResponse::json(value)?))
    }

    /// Wrap a nested application
    pub fn nested<F, Fut>(app: F) -> Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        Reply::Nested(Arc::new(move |request| Box::pin(app(request))))
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Response(r) => f.debug_tuple("Response").field(&r.status).finish(),
            Reply::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Reply::Parts { status, .. } => f.debug_tuple("Parts").field(status).finish(),
            Reply::Nested(_) => f.write_str("Nested"),
        }
    }
}

impl From<HttpResponse> for Reply {
    fn from(response: HttpResponse) -> Self {
        Reply::Response(response)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::Text(text.to_string())
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(text)
    }
}

impl<S: Into<String>> From<(S, u16)> for Reply {
    fn from((body, status): (S, u16)) -> Self {
        Reply::Parts {
            body: body.into(),
            status,
            headers: HashMap::new(),
        }
    }
}

impl<S: Into<String>> From<(S, u16, HashMap<String, String>)> for Reply {
    fn from((body, status, headers): (S, u16, HashMap<String, String>)) -> Self {
        Reply::Parts {
            body: body.into(),
            status,
            headers,
        }
    }
}

impl From<serde_json::Value> for Reply {
    fn from(value: serde_json::Value) -> Self {
        match HttpResponse::json(&value) {
            Ok(response) => Reply::Response(response),
            Err(_) => Reply::Text(value.to_string()),
        }
    }
}

impl Application {
    /// Coerce a dispatch result into a canonical response.
    ///
    /// Coercion is idempotent on an already-canonical response. Text
    /// becomes a 200 with the default content type. Parts are applied
    /// positionally and fail at construction when the status is not a
    /// valid HTTP status code. A nested application is invoked against
    /// the current request's environment.
    pub async fn make_response(&self, reply: Reply) -> Result<HttpResponse, Error> {
        match reply {
            Reply::Response(response) => Ok(response),
            Reply::Text(text) => Ok(HttpResponse::html(text)),
            Reply::Parts {
                body,
                status,
                headers,
            } => {
                http::StatusCode::from_u16(status).map_err(|_| {
                    Error::UnroutableResult(format!("invalid status code {} in reply", status))
                })?;
                let mut response = HttpResponse::html(body).with_status(status);
                for (key, value) in headers {
                    response.headers.insert(key, value);
                }
                Ok(response)
            }
            Reply::Nested(app) => {
                let request = ambient::current_request()?;
                app((*request).clone()).await
            }
        }
    }
}
