// Ambient access to the current request context.
//
// Each task of execution carries its own context stack in task-local
// storage, so concurrently handled requests never observe each other's
// state, and a handler suspended at an await point resumes seeing the
// same context. The accessors below resolve against the current top on
// every call and are never cached.

use crate::context::FLASHES_KEY;
use crate::{Application, ContextStack, Error, Globals, HttpRequest, RequestContext, Session};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static STACK: RefCell<ContextStack>;
}

/// Run a future with a fresh, empty context stack installed for its task.
/// The transport adapter and the test client wrap each request in one of
/// these; tests use it to hold onto a retained context after a failure.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    STACK.scope(RefCell::new(ContextStack::new()), fut).await
}

/// Whether an ambient stack is installed on the current task.
pub fn in_scope() -> bool {
    STACK.try_with(|_| ()).is_ok()
}

/// Whether a request context is currently active.
pub fn has_context() -> bool {
    STACK
        .try_with(|stack| !stack.borrow().is_empty())
        .unwrap_or(false)
}

/// Depth of the ambient stack, 0 outside any scope.
pub fn depth() -> usize {
    STACK
        .try_with(|stack| stack.borrow().depth())
        .unwrap_or(0)
}

pub(crate) fn push(ctx: Arc<RequestContext>) -> Result<(), Error> {
    STACK
        .try_with(|stack| stack.borrow_mut().push(ctx))
        .map_err(|_| Error::NoContext)
}

pub(crate) fn pop() -> Result<Arc<RequestContext>, Error> {
    STACK
        .try_with(|stack| stack.borrow_mut().pop())
        .map_err(|_| Error::NoContext)?
}

/// The current request context, innermost first.
pub fn current() -> Result<Arc<RequestContext>, Error> {
    STACK
        .try_with(|stack| stack.borrow().top())
        .ok()
        .flatten()
        .ok_or(Error::NoContext)
}

/// The application handling the current request
pub fn current_app() -> Result<Arc<Application>, Error> {
    current().map(|ctx| ctx.app())
}

/// The request currently being handled
pub fn current_request() -> Result<Arc<HttpRequest>, Error> {
    current().map(|ctx| ctx.request())
}

/// The session opened for the current request. `None` when the
/// application runs without sessions.
pub fn current_session() -> Result<Option<Arc<Session>>, Error> {
    current().map(|ctx| ctx.session())
}

/// The request-scoped globals bag
pub fn current_globals() -> Result<Arc<Globals>, Error> {
    current().map(|ctx| ctx.globals())
}

/// Queue a message to be flashed on the next request. Requires a session.
pub fn flash(message: impl Into<String>) -> Result<(), Error> {
    let ctx = current()?;
    let session = ctx
        .session()
        .ok_or_else(|| Error::Handler("flash requires a session; configure a secret key".into()))?;
    let mut pending: Vec<String> = session.get(FLASHES_KEY).unwrap_or_default();
    pending.push(message.into());
    session.set(FLASHES_KEY, pending)
}

/// Pull the flashed messages for the current request. The first call
/// consumes them from the session; later calls return the same list.
pub fn flashed_messages() -> Result<Vec<String>, Error> {
    current().map(|ctx| ctx.flashed_messages())
}

/// Build a URL for a registered endpoint through the current application.
/// Values not consumed by the rule become a query string.
pub fn url_for(endpoint: &str, values: &[(&str, &str)]) -> Result<String, Error> {
    let app = current_app()?;
    let values: HashMap<String, String> = values
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    app.url_for(endpoint, &values)
}
