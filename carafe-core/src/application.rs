// Application: the central registry and HTTP server bootstrapper

use crate::routing::{RouteTable, Router};
use crate::{
    ambient, CookieSessionStore, Error, Hooks, HttpRequest, HttpResponse, Reply, Session,
    SessionStore,
};
use bytes::Bytes;
use carafe_log::{error, info};
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming as IncomingBody, Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// A registered view function: called with the extracted path variables,
/// returns a coercible reply or fails.
pub type HandlerFn =
    Arc<dyn Fn(HashMap<String, String>) -> BoxFuture<'static, Result<Reply, Error>> + Send + Sync>;

/// A registered error handler: receives the failure it recovers from.
pub type ErrorHandlerFn =
    Arc<dyn Fn(Error) -> BoxFuture<'static, Result<Reply, Error>> + Send + Sync>;

/// Application configuration. Read-only during request handling.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Debug flag. Uncaught non-HTTP failures propagate instead of being
    /// routed through the 500 handler.
    pub debug: bool,
    /// Keep the request context on the stack when a request fails, so a
    /// post-mortem inspector can still read it. Defaults to the debug
    /// flag. This deliberately breaks scoped teardown for the failing
    /// request's task.
    pub retain_context_on_error: Option<bool>,
    /// Name of the session cookie
    pub session_cookie_name: String,
    /// Key handed to the session store; without one, no session is opened
    pub secret_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug: false,
            retain_context_on_error: None,
            session_cookie_name: "session".to_string(),
            secret_key: None,
        }
    }
}

impl AppConfig {
    /// Effective retention policy: explicit setting, or the debug flag.
    pub fn retain_on_error(&self) -> bool {
        self.retain_context_on_error.unwrap_or(self.debug)
    }
}

/// The central object: owns the routing table, the registered view
/// functions, the error handlers, and the hook lists. All registration
/// happens during setup; once requests are being served the application
/// is only read, so it can be shared freely across tasks.
pub struct Application {
    pub name: String,
    pub config: AppConfig,
    router: RouteTable,
    view_functions: HashMap<String, HandlerFn>,
    error_handlers: HashMap<u16, ErrorHandlerFn>,
    pub(crate) hooks: Hooks,
    session_store: Option<Arc<dyn SessionStore>>,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        let mut app = Self {
            name: name.into(),
            config: AppConfig::default(),
            router: RouteTable::new(),
            view_functions: HashMap::new(),
            error_handlers: HashMap::new(),
            hooks: Hooks::new(),
            session_store: None,
        };
        app.context_processor(default_context_processor);
        app
    }

    // ---- setup-time configuration ----

    pub fn set_debug(&mut self, debug: bool) -> &mut Self {
        self.config.debug = debug;
        self
    }

    pub fn set_retain_context_on_error(&mut self, retain: bool) -> &mut Self {
        self.config.retain_context_on_error = Some(retain);
        self
    }

    pub fn set_secret_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.config.secret_key = Some(key.into());
        self
    }

    pub fn set_session_cookie_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.config.session_cookie_name = name.into();
        self
    }

    /// Replace the default cookie-backed session store
    pub fn set_session_store(&mut self, store: Arc<dyn SessionStore>) -> &mut Self {
        self.session_store = Some(store);
        self
    }

    /// Register a URL rule without a view function. Registering a rule
    /// with an endpoint that already has a view function is how the rule
    /// and the function get connected.
    pub fn add_url_rule(&mut self, rule: &str, endpoint: &str, methods: &[&str]) -> &mut Self {
        let methods: &[&str] = if methods.is_empty() { &["GET"] } else { methods };
        self.router.add(rule, endpoint, methods);
        self
    }

    /// Register a view function for a URL rule. Methods default to GET
    /// when the slice is empty.
    pub fn route<F, Fut>(
        &mut self,
        rule: &str,
        endpoint: &str,
        methods: &[&str],
        handler: F,
    ) -> &mut Self
    where
        F: Fn(HashMap<String, String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.add_url_rule(rule, endpoint, methods);
        self.view_functions
            .insert(endpoint.to_string(), Arc::new(move |params| Box::pin(handler(params))));
        self
    }

    /// Register a handler for an exact status code
    pub fn error_handler<F, Fut>(&mut self, status: u16, handler: F) -> &mut Self
    where
        F: Fn(Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.error_handlers
            .insert(status, Arc::new(move |err| Box::pin(handler(err))));
        self
    }

    /// Register a function to run before each request. The first hook
    /// that returns `Some` short-circuits routing and handler invocation.
    pub fn before_request<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Reply>, Error>> + Send + 'static,
    {
        self.hooks
            .before_request
            .push(Arc::new(move || Box::pin(hook())));
        self
    }

    /// Register a function to run after each request, receiving the
    /// response and returning the one handed to the next hook.
    pub fn after_request<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(HttpResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, Error>> + Send + 'static,
    {
        self.hooks
            .after_request
            .push(Arc::new(move |response| Box::pin(hook(response))));
        self
    }

    /// Register a template context processor
    pub fn context_processor<F>(&mut self, processor: F) -> &mut Self
    where
        F: Fn() -> HashMap<String, serde_json::Value> + Send + Sync + 'static,
    {
        self.hooks.context_processors.push(Arc::new(processor));
        self
    }

    // ---- read-side accessors used by the pipeline ----

    pub(crate) fn view_function(&self, endpoint: &str) -> Option<HandlerFn> {
        self.view_functions.get(endpoint).cloned()
    }

    pub(crate) fn registered_error_handler(&self, status: u16) -> Option<ErrorHandlerFn> {
        self.error_handlers.get(&status).cloned()
    }

    /// The routing table, through the router contract
    pub fn router(&self) -> &dyn Router {
        &self.router
    }

    /// Build a URL for a registered endpoint
    pub fn url_for(&self, endpoint: &str, values: &HashMap<String, String>) -> Result<String, Error> {
        self.router.build(endpoint, values)
    }

    /// Merge all context processors, in registration order, into the
    /// given template context. Later processors override earlier values.
    pub fn update_template_context(&self, context: &mut HashMap<String, serde_json::Value>) {
        for processor in &self.hooks.context_processors {
            context.extend(processor());
        }
    }

    /// Open the session for a request through the configured store.
    pub async fn open_session(&self, request: &HttpRequest) -> Result<Option<Session>, Error> {
        match &self.session_store {
            Some(store) => store.open(request).await,
            None => {
                let store = CookieSessionStore::new(
                    self.config.session_cookie_name.clone(),
                    self.config.secret_key.clone(),
                );
                store.open(request).await
            }
        }
    }

    /// Write the session into the response through the configured store.
    pub async fn save_session(
        &self,
        session: &Session,
        response: &mut HttpResponse,
    ) -> Result<(), Error> {
        match &self.session_store {
            Some(store) => store.save(session, response).await,
            None => {
                let store = CookieSessionStore::new(
                    self.config.session_cookie_name.clone(),
                    self.config.secret_key.clone(),
                );
                store.save(session, response).await
            }
        }
    }

    // ---- serving ----

    /// Serve the application over HTTP/1.1. Each request runs inside its
    /// own ambient scope on its own task.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), Error> {
        let app = Arc::new(self);
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, app = %app.name, "carafe application listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let app = app.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<IncomingBody>| {
                    let app = app.clone();
                    async move { transport_request(req, app).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %err, "error serving connection");
                }
            });
        }
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("debug", &self.config.debug)
            .field("rules", &self.router.len())
            .finish()
    }
}

/// Default context processor: injects the current request, session, and
/// globals so templates can use them directly.
fn default_context_processor() -> HashMap<String, serde_json::Value> {
    let mut context = HashMap::new();
    let Ok(ctx) = ambient::current() else {
        return context;
    };

    let request = ctx.request();
    context.insert(
        "request".to_string(),
        serde_json::json!({
            "method": request.method,
            "path": request.path,
            "endpoint": request.endpoint(),
        }),
    );
    if let Some(session) = ctx.session() {
        let map: serde_json::Map<String, serde_json::Value> =
            session.to_map().into_iter().collect();
        context.insert("session".to_string(), serde_json::Value::Object(map));
    }
    let globals: serde_json::Map<String, serde_json::Value> =
        ctx.globals().to_map().into_iter().collect();
    context.insert("g".to_string(), serde_json::Value::Object(globals));

    context
}

/// Bridge one hyper request through the dispatch pipeline.
async fn transport_request(
    req: Request<IncomingBody>,
    app: Arc<Application>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let mut request = HttpRequest::new(method, &target);
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            request.headers.insert(name.to_string(), value.to_string());
        }
    }
    request.body = req.collect().await?.to_bytes().to_vec();

    let response = match ambient::scope(app.handle(request)).await {
        Ok(response) => response,
        Err(err) => {
            // An unrecovered failure surfaces as a bare 500; the details
            // stay in the log, never in the response body.
            error!(error = %err, "unhandled error during dispatch");
            HttpResponse::new(500)
                .with_body(b"500 Internal Server Error".to_vec())
                .with_header("Content-Type", "text/plain; charset=utf-8")
        }
    };

    let mut builder = Response::builder().status(response.status);
    for (key, value) in response.headers {
        builder = builder.header(key, value);
    }
    let body = Full::new(Bytes::from(response.body));
    Ok(builder
        .body(body)
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"")))))
}
