//! Testing utilities for Carafe applications.
//!
//! [`TestClient`] drives the full dispatch pipeline in-process, without a
//! socket: each request runs inside its own ambient scope, and cookies set
//! by one response are replayed on the next request, so session-dependent
//! flows can be tested end to end.

use carafe_core::{ambient, Application, Error, HttpRequest, HttpResponse};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// In-process HTTP client for exercising an application under test.
pub struct TestClient {
    app: Arc<Application>,
    cookies: Mutex<HashMap<String, String>>,
}

impl TestClient {
    /// Create a test client for a fully configured application.
    pub fn new(app: Application) -> Self {
        Self::from_shared(Arc::new(app))
    }

    /// Create a test client sharing an already-wrapped application.
    pub fn from_shared(app: Arc<Application>) -> Self {
        Self {
            app,
            cookies: Mutex::new(HashMap::new()),
        }
    }

    pub fn app(&self) -> Arc<Application> {
        self.app.clone()
    }

    /// Forget all cookies collected from previous responses.
    pub fn clear_cookies(&self) {
        self.cookies.lock().clear();
    }

    /// Make a GET request
    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(TestRequestBuilder::new("GET", path)).await
    }

    /// Make a POST request
    pub async fn post(&self, path: &str, body: Vec<u8>) -> TestResponse {
        self.send(TestRequestBuilder::new("POST", path).body(body)).await
    }

    /// Make a PUT request
    pub async fn put(&self, path: &str, body: Vec<u8>) -> TestResponse {
        self.send(TestRequestBuilder::new("PUT", path).body(body)).await
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.send(TestRequestBuilder::new("DELETE", path)).await
    }

    /// Make a PATCH request
    pub async fn patch(&self, path: &str, body: Vec<u8>) -> TestResponse {
        self.send(TestRequestBuilder::new("PATCH", path).body(body)).await
    }

    /// Dispatch a built request through the application.
    pub async fn send(&self, builder: TestRequestBuilder) -> TestResponse {
        let mut request = builder.build();

        let cookie_header = {
            let stored = self.cookies.lock();
            if !stored.is_empty() && !request.headers.contains_key("Cookie") {
                Some(
                    stored
                        .iter()
                        .map(|(name, value)| format!("{}={}", name, value))
                        .collect::<Vec<_>>()
                        .join("; "),
                )
            } else {
                None
            }
        };
        if let Some(header) = cookie_header {
            request.headers.insert("Cookie".to_string(), header);
        }

        let result = ambient::scope(self.app.clone().handle(request)).await;

        match result {
            Ok(response) => {
                if let Some(raw) = response.headers.get("Set-Cookie") {
                    if let Some((name, value)) =
                        raw.split(';').next().and_then(|pair| pair.split_once('='))
                    {
                        self.cookies
                            .lock()
                            .insert(name.to_string(), value.to_string());
                    }
                }
                TestResponse::Success(response)
            }
            Err(error) => TestResponse::Error(error),
        }
    }
}

/// Builder for test requests
pub struct TestRequestBuilder {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    query_params: Vec<(String, String)>,
}

impl TestRequestBuilder {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
            query_params: Vec::new(),
        }
    }

    /// Add a header
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the body
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Set a JSON body and content type
    pub fn json<T: serde::Serialize>(mut self, data: &T) -> Self {
        self.body = serde_json::to_vec(data).unwrap_or_default();
        self.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        self
    }

    /// Add a query parameter
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query_params.push((key.to_string(), value.to_string()));
        self
    }

    /// Build the request
    pub fn build(self) -> HttpRequest {
        let target = if self.query_params.is_empty() {
            self.path
        } else {
            let query = self
                .query_params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&");
            format!("{}?{}", self.path, query)
        };

        HttpRequest::from_parts(self.method, &target, self.headers, self.body)
    }
}

/// Outcome of a test request
#[derive(Debug)]
pub enum TestResponse {
    Success(HttpResponse),
    Error(Error),
}

impl TestResponse {
    /// Assert the request produced a response
    pub fn assert_success(&self) -> &HttpResponse {
        match self {
            TestResponse::Success(response) => response,
            TestResponse::Error(error) => {
                panic!("expected a response, got error: {:?}", error)
            }
        }
    }

    /// Assert the request failed, returning the error
    pub fn assert_error(&self) -> &Error {
        match self {
            TestResponse::Error(error) => error,
            TestResponse::Success(response) => {
                panic!("expected an error, got {} response", response.status)
            }
        }
    }

    /// Assert a specific response status
    pub fn assert_status(&self, expected: u16) -> &HttpResponse {
        let response = self.assert_success();
        assert_eq!(
            response.status, expected,
            "expected status {}, got {}",
            expected, response.status
        );
        response
    }

    /// Status code of the response, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            TestResponse::Success(response) => Some(response.status),
            TestResponse::Error(_) => None,
        }
    }

    /// Response body as a string, if any
    pub fn body_string(&self) -> Option<String> {
        match self {
            TestResponse::Success(response) => Some(response.body_string()),
            TestResponse::Error(_) => None,
        }
    }

    /// Response body parsed as JSON
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        match self {
            TestResponse::Success(response) => {
                serde_json::from_slice(&response.body).map_err(|e| e.to_string())
            }
            TestResponse::Error(error) => Err(format!("{:?}", error)),
        }
    }

    /// A header value, if any
    pub fn header(&self, key: &str) -> Option<&String> {
        match self {
            TestResponse::Success(response) => response.headers.get(key),
            TestResponse::Error(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_app() -> Application {
        let mut app = Application::new("demo");
        app.route("/ping", "ping", &["GET"], |_params| async { Ok("pong".into()) });
        app.route("/echo", "echo", &["POST"], |_params| async {
            let request = carafe_core::current_request()?;
            Ok(request.json::<serde_json::Value>()?.into())
        });
        app
    }

    #[test]
    fn test_request_builder() {
        let request = TestRequestBuilder::new("GET", "/test")
            .header("Authorization", "Bearer token")
            .query("foo", "bar")
            .build();

        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/test");
        assert_eq!(request.query("foo"), Some(&"bar".to_string()));
        assert_eq!(
            request.headers.get("Authorization"),
            Some(&"Bearer token".to_string())
        );
    }

    #[tokio::test]
    async fn test_get_round_trip() {
        let client = TestClient::new(demo_app());
        let response = client.get("/ping").await;
        assert_eq!(response.status(), Some(200));
        assert_eq!(response.body_string(), Some("pong".to_string()));
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let client = TestClient::new(demo_app());
        let response = client
            .send(TestRequestBuilder::new("POST", "/echo").json(&serde_json::json!({"n": 1})))
            .await;
        let body: serde_json::Value = response.body_json().unwrap();
        assert_eq!(body, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_missing_route_is_a_404_response() {
        let client = TestClient::new(demo_app());
        let response = client.get("/nope").await;
        response.assert_status(404);
    }

    #[tokio::test]
    async fn test_cookies_carry_across_requests() {
        let mut app = Application::new("demo");
        app.set_secret_key("testing");
        app.route("/set", "set", &["GET"], |_params| async {
            let session = carafe_core::current_session()?
                .ok_or_else(|| carafe_core::Error::Handler("no session".into()))?;
            session.set("seen", true)?;
            Ok("set".into())
        });
        app.route("/get", "get", &["GET"], |_params| async {
            let session = carafe_core::current_session()?
                .ok_or_else(|| carafe_core::Error::Handler("no session".into()))?;
            Ok(format!("{}", session.get::<bool>("seen").unwrap_or(false)).into())
        });

        let client = TestClient::new(app);
        client.get("/set").await.assert_status(200);
        let response = client.get("/get").await;
        assert_eq!(response.body_string(), Some("true".to_string()));

        client.clear_cookies();
        let response = client.get("/get").await;
        assert_eq!(response.body_string(), Some("false".to_string()));
    }
}
