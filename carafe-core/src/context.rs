// Request context: the unit of per-request state, and the stack that
// scopes it to one task of execution

use crate::{Application, Error, HttpRequest, Session};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Session key the flash helpers store pending messages under.
pub(crate) const FLASHES_KEY: &str = "_flashes";

/// Request-scoped key/value bag. Everything stored here lives exactly as
/// long as the owning request context.
#[derive(Debug, Default)]
pub struct Globals {
    data: RwLock<HashMap<String, serde_json::Value>>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.data
            .read()
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), Error> {
        let value = serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.data.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn clear(&self) {
        self.data.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Snapshot of the stored values
    pub fn to_map(&self) -> HashMap<String, serde_json::Value> {
        self.data.read().clone()
    }
}

/// All state bound to one in-flight request: the request object, the
/// session opened for it, a scratch globals bag, and the lazily-loaded
/// flash cache. Created at the start of dispatch, pushed onto the ambient
/// stack, popped at the end.
pub struct RequestContext {
    id: Uuid,
    app: Arc<Application>,
    request: Arc<HttpRequest>,
    session: Option<Arc<Session>>,
    globals: Arc<Globals>,
    flashes: Mutex<Option<Vec<String>>>,
    session_saved: AtomicBool,
}

impl RequestContext {
    /// Bind a request to an application: opens the session through the
    /// application's store and initializes an empty globals bag.
    pub async fn new(app: Arc<Application>, request: HttpRequest) -> Result<Arc<Self>, Error> {
        let session = app.open_session(&request).await?.map(Arc::new);
        Ok(Arc::new(Self {
            id: Uuid::new_v4(),
            app,
            request: Arc::new(request),
            session,
            globals: Arc::new(Globals::new()),
            flashes: Mutex::new(None),
            session_saved: AtomicBool::new(false),
        }))
    }

    /// Correlation id for this request, used in log output.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn app(&self) -> Arc<Application> {
        self.app.clone()
    }

    pub fn request(&self) -> Arc<HttpRequest> {
        self.request.clone()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.clone()
    }

    pub fn globals(&self) -> Arc<Globals> {
        self.globals.clone()
    }

    /// Pull the flashed messages out of the session, once. Later calls in
    /// the same request return the cached list.
    pub fn flashed_messages(&self) -> Vec<String> {
        let mut cache = self.flashes.lock();
        if let Some(messages) = cache.as_ref() {
            return messages.clone();
        }
        let messages: Vec<String> = self
            .session
            .as_ref()
            .and_then(|s| s.take(FLASHES_KEY))
            .unwrap_or_default();
        *cache = Some(messages.clone());
        messages
    }

    /// Mark the session as written to the response. Returns false if it
    /// was already marked, so persistence happens at most once.
    pub(crate) fn mark_session_saved(&self) -> bool {
        !self.session_saved.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn session_saved(&self) -> bool {
        self.session_saved.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("path", &self.request.path)
            .finish()
    }
}

/// Stack of active request contexts for one task of execution. The most
/// recently pushed, not-yet-popped entry is the current context; nested
/// pushes are allowed so a request can be simulated inside another.
#[derive(Default)]
pub struct ContextStack {
    entries: Vec<Arc<RequestContext>>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Make `ctx` the new current top
    pub fn push(&mut self, ctx: Arc<RequestContext>) {
        self.entries.push(ctx);
    }

    /// Remove and return the current top
    pub fn pop(&mut self) -> Result<Arc<RequestContext>, Error> {
        self.entries.pop().ok_or(Error::EmptyStack)
    }

    /// The current top, if any
    pub fn top(&self) -> Option<Arc<RequestContext>> {
        self.entries.last().cloned()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
