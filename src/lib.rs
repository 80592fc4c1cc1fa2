// Carafe - a micro web framework for Rust
//
// The core is an isolated per-request context: handlers reach the current
// request, session, and globals ambiently, and a single dispatch pipeline
// sequences hooks, routing, error recovery, and response coercion.

// Re-export core functionality
pub use carafe_core::*;

// Re-export the logging layer
pub use carafe_log;

#[cfg(feature = "testing")]
pub use carafe_testing;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        abort, current_app, current_globals, current_request, current_session, flash,
        flashed_messages, url_for, AppConfig, Application, Error, HttpRequest, HttpResponse, Json,
        Reply, Session, SessionStore,
    };
}
