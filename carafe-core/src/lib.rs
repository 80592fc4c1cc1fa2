// Core library for the Carafe microframework
// Request lifecycle, ambient context, dispatch pipeline, response coercion

pub mod ambient;
pub mod application;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod http;
pub mod reply;
pub mod routing;
pub mod session;

// Re-export commonly used types
pub use ambient::{
    current, current_app, current_globals, current_request, current_session, flash,
    flashed_messages, url_for,
};
pub use application::{AppConfig, Application, ErrorHandlerFn, HandlerFn};
pub use context::{ContextStack, Globals, RequestContext};
pub use error::{abort, reason_phrase, Error};
pub use hooks::{AfterHookFn, BeforeHookFn, ContextProcessorFn, Hooks};
pub use http::{HttpRequest, HttpResponse, Json};
pub use reply::{NestedApp, Reply};
pub use routing::{RouteMatch, RouteTable, Router};
pub use session::{CookieSessionStore, Session, SessionStore};
