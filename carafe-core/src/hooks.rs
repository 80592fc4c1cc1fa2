// Hook registry: before/after-request callbacks and template context
// processors, registered at setup time and invoked by the dispatch
// pipeline in registration order

use crate::{Error, HttpResponse, Reply};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Runs before routing. Returning `Some(reply)` short-circuits the
/// pipeline: the value becomes the handler result, even when it is an
/// empty string. `None` is the explicit "no value" sentinel.
pub type BeforeHookFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<Reply>, Error>> + Send + Sync>;

/// Runs after response coercion. Receives the current response and
/// returns the response handed to the next hook.
pub type AfterHookFn =
    Arc<dyn Fn(HttpResponse) -> BoxFuture<'static, Result<HttpResponse, Error>> + Send + Sync>;

/// Produces values to merge into the template context.
pub type ContextProcessorFn =
    Arc<dyn Fn() -> HashMap<String, serde_json::Value> + Send + Sync>;

/// Ordered hook lists. Append-only during setup; read-only once request
/// serving begins.
#[derive(Default, Clone)]
pub struct Hooks {
    pub(crate) before_request: Vec<BeforeHookFn>,
    pub(crate) after_request: Vec<AfterHookFn>,
    pub(crate) context_processors: Vec<ContextProcessorFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_count(&self) -> usize {
        self.before_request.len()
    }

    pub fn after_count(&self) -> usize {
        self.after_request.len()
    }

    pub fn processor_count(&self) -> usize {
        self.context_processors.len()
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_request", &self.before_request.len())
            .field("after_request", &self.after_request.len())
            .field("context_processors", &self.context_processors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut hooks = Hooks::new();
        hooks
            .before_request
            .push(Arc::new(|| Box::pin(async { Ok(None) })));
        hooks
            .after_request
            .push(Arc::new(|response| Box::pin(async { Ok(response) })));
        hooks.context_processors.push(Arc::new(|| HashMap::new()));

        assert_eq!(hooks.before_count(), 1);
        assert_eq!(hooks.after_count(), 1);
        assert_eq!(hooks.processor_count(), 1);
    }
}
