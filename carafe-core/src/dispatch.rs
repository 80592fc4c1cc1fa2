// The dispatch pipeline: one request in, one response out.
//
// Step order for every request: activate a context, run before hooks,
// route and invoke the handler (or recover from its failure), coerce the
// result, persist the session, run after hooks, deactivate the context.
// Within one request nothing is reordered; across requests nothing is
// shared but the application itself.

use crate::{ambient, Application, Error, HttpRequest, HttpResponse, Reply, RequestContext};
use carafe_log::{debug, error, warn};
use std::sync::Arc;

impl Application {
    /// Dispatch one request through the full pipeline.
    ///
    /// Installs an ambient scope for the current task if the caller has
    /// not already done so. When the caller owns the scope (the transport
    /// adapter and the test client do), a context retained on failure
    /// stays readable after this returns.
    pub async fn handle(self: Arc<Self>, request: HttpRequest) -> Result<HttpResponse, Error> {
        if ambient::in_scope() {
            self.dispatch(request).await
        } else {
            ambient::scope(self.dispatch(request)).await
        }
    }

    async fn dispatch(self: Arc<Self>, request: HttpRequest) -> Result<HttpResponse, Error> {
        let ctx = RequestContext::new(self.clone(), request).await?;
        ambient::push(ctx.clone())?;
        debug!(
            request_id = %ctx.id(),
            method = %ctx.request().method,
            path = %ctx.request().path,
            "request context activated"
        );

        let outcome = self.run_steps(&ctx).await;

        // Teardown runs on every exit path. The one sanctioned exception:
        // a failing request with the retention policy on leaves its
        // context on the stack for post-mortem inspection.
        match &outcome {
            Ok(response) => {
                debug!(request_id = %ctx.id(), status = response.status, "request completed");
                ambient::pop()?;
            }
            Err(err) => {
                if self.config.retain_on_error() {
                    warn!(
                        request_id = %ctx.id(),
                        error = %err,
                        "request failed; retaining context for inspection"
                    );
                } else {
                    error!(request_id = %ctx.id(), error = %err, "request failed");
                    ambient::pop()?;
                }
            }
        }

        outcome
    }

    async fn run_steps(&self, ctx: &Arc<RequestContext>) -> Result<HttpResponse, Error> {
        let dispatched = async {
            if let Some(reply) = self.preprocess_request().await? {
                debug!("before-request hook short-circuited the pipeline");
                return Ok(reply);
            }
            self.dispatch_request(ctx).await
        }
        .await;

        let reply = match dispatched {
            Ok(reply) => reply,
            Err(err) => self.handle_error(err).await?,
        };

        let response = self.make_response(reply).await?;
        self.process_response(ctx, response).await
    }

    /// Run the before-request hooks in registration order. The first one
    /// returning a non-sentinel value provides the handler result.
    async fn preprocess_request(&self) -> Result<Option<Reply>, Error> {
        for hook in &self.hooks.before_request {
            if let Some(reply) = hook().await? {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    /// Match the request and invoke the view function for the resolved
    /// endpoint with the extracted variables.
    async fn dispatch_request(&self, ctx: &Arc<RequestContext>) -> Result<Reply, Error> {
        let request = ctx.request();
        let matched = self.router().match_route(&request.path, &request.method)?;
        request.record_match(matched.clone());

        let handler = self.view_function(&matched.endpoint).ok_or_else(|| {
            Error::Handler(format!(
                "no view function registered for endpoint '{}'",
                matched.endpoint
            ))
        })?;
        handler(matched.params).await
    }

    /// Failure recovery. Status-carrying failures look up a handler for
    /// their exact code and otherwise surface as their own canonical
    /// response. Everything else consults only the 500 slot, and in debug
    /// mode (or with no 500 handler) propagates to the caller.
    async fn handle_error(&self, err: Error) -> Result<Reply, Error> {
        match err.http_status() {
            Some(status) => match self.registered_error_handler(status) {
                Some(handler) => {
                    debug!(status, "recovering via registered error handler");
                    handler(err).await
                }
                None => Ok(Reply::Response(err.to_response())),
            },
            None => match self.registered_error_handler(500) {
                Some(handler) if !self.config.debug => {
                    debug!("recovering non-HTTP failure via 500 handler");
                    handler(err).await
                }
                _ => Err(err),
            },
        }
    }

    /// Persist the session (at most once per request), then run the
    /// after-request hooks in registration order, each feeding the next.
    async fn process_response(
        &self,
        ctx: &Arc<RequestContext>,
        mut response: HttpResponse,
    ) -> Result<HttpResponse, Error> {
        if let Some(session) = ctx.session() {
            if ctx.mark_session_saved() {
                self.save_session(&session, &mut response).await?;
            }
        }

        for hook in &self.hooks.after_request {
            response = hook(response).await?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shared(app: Application) -> Arc<Application> {
        Arc::new(app)
    }

    #[tokio::test]
    async fn test_plain_dispatch() {
        let mut app = Application::new("demo");
        app.route("/hello/<name>", "hello", &["GET"], |params| async move {
            Ok(format!("Hello {}!", params["name"]).into())
        });

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/hello/world"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_string(), "Hello world!");
    }

    #[tokio::test]
    async fn test_route_miss_yields_404_response() {
        let app = shared(Application::new("demo"));
        let response = app.handle(HttpRequest::new("GET", "/missing")).await.unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_endpoint_recorded_on_request() {
        let mut app = Application::new("demo");
        app.route("/users/<id>", "show_user", &["GET"], |_params| async {
            let request = ambient::current_request()?;
            Ok(format!(
                "{}:{}",
                request.endpoint().unwrap_or("?"),
                request.param("id").cloned().unwrap_or_default()
            )
            .into())
        });

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/users/3"))
            .await
            .unwrap();
        assert_eq!(response.body_string(), "show_user:3");
    }

    #[tokio::test]
    async fn test_before_hook_short_circuits_routing() {
        let mut app = Application::new("demo");
        let handler_runs = Arc::new(AtomicUsize::new(0));
        let observed = handler_runs.clone();
        app.route("/page", "page", &["GET"], move |_params| {
            let observed = observed.clone();
            async move {
                observed.fetch_add(1, Ordering::SeqCst);
                Ok("from handler".into())
            }
        });
        app.before_request(|| async { Ok(Some("intercepted".into())) });

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/page"))
            .await
            .unwrap();
        assert_eq!(response.body_string(), "intercepted");
        assert_eq!(handler_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_string_short_circuits_too() {
        // The sentinel is None, not falsiness
        let mut app = Application::new("demo");
        app.route("/page", "page", &["GET"], |_params| async {
            Ok("from handler".into())
        });
        app.before_request(|| async { Ok(Some("".into())) });

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/page"))
            .await
            .unwrap();
        assert_eq!(response.body_string(), "");
    }

    #[tokio::test]
    async fn test_before_hooks_run_in_order_and_stop_at_first_value() {
        let mut app = Application::new("demo");
        let trace = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let t = trace.clone();
        app.before_request(move || {
            let t = t.clone();
            async move {
                t.lock().push("first");
                Ok(None)
            }
        });
        let t = trace.clone();
        app.before_request(move || {
            let t = t.clone();
            async move {
                t.lock().push("second");
                Ok(Some("stop".into()))
            }
        });
        let t = trace.clone();
        app.before_request(move || {
            let t = t.clone();
            async move {
                t.lock().push("third");
                Ok(None)
            }
        });

        let _ = shared(app).handle(HttpRequest::new("GET", "/")).await.unwrap();
        assert_eq!(*trace.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_error_handler_precedence_on_route_miss() {
        let mut app = Application::new("demo");
        app.error_handler(404, |_err| async { Ok(("custom not found", 404).into()) });

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/missing"))
            .await
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body_string(), "custom not found");
    }

    #[tokio::test]
    async fn test_error_handler_lookup_is_exact_code_only() {
        let mut app = Application::new("demo");
        // A 404 handler does not catch a 405 failure
        app.route("/only-get", "only_get", &["GET"], |_p| async { Ok("ok".into()) });
        app.error_handler(404, |_err| async { Ok("handled 404".into()) });

        let response = shared(app)
            .handle(HttpRequest::new("POST", "/only-get"))
            .await
            .unwrap();
        assert_eq!(response.status, 405);
    }

    #[tokio::test]
    async fn test_abort_is_recoverable() {
        let mut app = Application::new("demo");
        app.route("/gone", "gone", &["GET"], |_p| async { Err(abort(404)) });
        app.error_handler(404, |_err| async { Ok("handled".into()) });

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/gone"))
            .await
            .unwrap();
        assert_eq!(response.body_string(), "handled");
    }

    #[tokio::test]
    async fn test_handler_failure_uses_500_slot() {
        let mut app = Application::new("demo");
        app.route("/boom", "boom", &["GET"], |_p| async {
            Err(Error::Handler("exploded".into()))
        });
        app.error_handler(500, |_err| async { Ok(("recovered", 500).into()) });

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/boom"))
            .await
            .unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body_string(), "recovered");
    }

    #[tokio::test]
    async fn test_handler_failure_without_500_handler_propagates() {
        let mut app = Application::new("demo");
        app.route("/boom", "boom", &["GET"], |_p| async {
            Err(Error::Handler("exploded".into()))
        });

        let result = shared(app).handle(HttpRequest::new("GET", "/boom")).await;
        assert!(matches!(result, Err(Error::Handler(_))));
    }

    #[tokio::test]
    async fn test_debug_mode_propagates_despite_500_handler() {
        let mut app = Application::new("demo");
        app.set_debug(true);
        app.route("/boom", "boom", &["GET"], |_p| async {
            Err(Error::Handler("exploded".into()))
        });
        app.error_handler(500, |_err| async { Ok("should not run".into()) });

        let result = shared(app).handle(HttpRequest::new("GET", "/boom")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_after_hooks_chain_in_order() {
        let mut app = Application::new("demo");
        app.route("/", "index", &["GET"], |_p| async { Ok("base".into()) });
        app.after_request(|response| async move {
            Ok(response.with_header("X-Order", "a"))
        });
        app.after_request(|response| async move {
            // Sees exactly what the previous hook returned
            let previous = response.headers.get("X-Order").cloned().unwrap_or_default();
            Ok(response.with_header("X-Order", format!("{}b", previous)))
        });

        let response = shared(app).handle(HttpRequest::new("GET", "/")).await.unwrap();
        assert_eq!(response.headers.get("X-Order"), Some(&"ab".to_string()));
    }

    #[tokio::test]
    async fn test_session_persisted_into_response() {
        let mut app = Application::new("demo");
        app.set_secret_key("s3cret");
        app.route("/login", "login", &["GET"], |_p| async {
            let session = ambient::current_session()?
                .ok_or_else(|| Error::Handler("no session".into()))?;
            session.set("user", "ada")?;
            Ok("ok".into())
        });

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/login"))
            .await
            .unwrap();
        let cookie = response.headers.get("Set-Cookie").unwrap();
        assert!(cookie.starts_with("session="));
    }

    #[tokio::test]
    async fn test_session_saved_at_most_once() {
        let mut app = Application::new("demo");
        app.set_secret_key("s3cret");
        app.route("/", "index", &["GET"], |_p| async {
            let session = ambient::current_session()?
                .ok_or_else(|| Error::Handler("no session".into()))?;
            session.set("n", 1)?;
            Ok("ok".into())
        });

        let app = shared(app);
        let response = app
            .clone()
            .handle(HttpRequest::new("GET", "/"))
            .await
            .unwrap();

        // Re-running the response processing for the same context must
        // not write the session again.
        let ctx_saved = response.headers.get("Set-Cookie").is_some();
        assert!(ctx_saved);
    }

    #[tokio::test]
    async fn test_retention_policy_keeps_context_on_failure() {
        let mut app = Application::new("demo");
        app.set_debug(true);
        app.route("/boom", "boom", &["GET"], |_p| async {
            Err(Error::Handler("exploded".into()))
        });
        let app = shared(app);

        ambient::scope(async move {
            let result = app.handle(HttpRequest::new("GET", "/boom")).await;
            assert!(result.is_err());
            // Post-mortem: the failing request is still the current one
            let request = ambient::current_request().unwrap();
            assert_eq!(request.path, "/boom");
        })
        .await;
    }

    #[tokio::test]
    async fn test_no_retention_without_debug() {
        let mut app = Application::new("demo");
        app.route("/boom", "boom", &["GET"], |_p| async {
            Err(Error::Handler("exploded".into()))
        });
        let app = shared(app);

        ambient::scope(async move {
            let result = app.handle(HttpRequest::new("GET", "/boom")).await;
            assert!(result.is_err());
            assert!(!ambient::has_context());
        })
        .await;
    }

    #[tokio::test]
    async fn test_retention_can_be_disabled_in_debug() {
        let mut app = Application::new("demo");
        app.set_debug(true);
        app.set_retain_context_on_error(false);
        app.route("/boom", "boom", &["GET"], |_p| async {
            Err(Error::Handler("exploded".into()))
        });
        let app = shared(app);

        ambient::scope(async move {
            let _ = app.handle(HttpRequest::new("GET", "/boom")).await;
            assert!(!ambient::has_context());
        })
        .await;
    }

    #[tokio::test]
    async fn test_strict_slash_redirect_surfaces_as_308() {
        let mut app = Application::new("demo");
        app.route("/items/", "items", &["GET"], |_p| async { Ok("items".into()) });

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/items"))
            .await
            .unwrap();
        assert_eq!(response.status, 308);
        assert_eq!(response.headers.get("Location"), Some(&"/items/".to_string()));
    }

    #[tokio::test]
    async fn test_nested_dispatch_sees_innermost_context() {
        let mut inner = Application::new("inner");
        inner.route("/", "index", &["GET"], |_p| async {
            Ok(ambient::current_app()?.name.clone().into())
        });
        let inner = shared(inner);

        let mut outer = Application::new("outer");
        let inner_for_handler = inner.clone();
        outer.route("/outer", "outer", &["GET"], move |_p| {
            let inner = inner_for_handler.clone();
            async move {
                // Simulate a request inside a request
                let nested = inner.handle(HttpRequest::new("GET", "/")).await?;
                let outer_name = ambient::current_app()?.name.clone();
                Ok(format!("{}+{}", nested.body_string(), outer_name).into())
            }
        });

        let response = shared(outer)
            .handle(HttpRequest::new("GET", "/outer"))
            .await
            .unwrap();
        assert_eq!(response.body_string(), "inner+outer");
    }

    #[tokio::test]
    async fn test_concurrent_requests_see_their_own_request() {
        let mut app = Application::new("demo");
        app.route("/echo/<tag>", "echo", &["GET"], |params| async move {
            tokio::task::yield_now().await;
            let seen = ambient::current_request()?.path.clone();
            Ok(format!("{}:{}", params["tag"], seen).into())
        });
        let app = shared(app);

        let mut handles = Vec::new();
        for i in 0..16 {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                let path = format!("/echo/{}", i);
                let response = app.handle(HttpRequest::new("GET", &path)).await.unwrap();
                assert_eq!(response.body_string(), format!("{}:{}", i, path));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failing_before_hook_enters_recovery() {
        let mut app = Application::new("demo");
        app.before_request(|| async { Err(abort(403)) });
        app.route("/", "index", &["GET"], |_p| async { Ok("never".into()) });
        app.error_handler(403, |_err| async { Ok("denied".into()) });

        let response = shared(app).handle(HttpRequest::new("GET", "/")).await.unwrap();
        assert_eq!(response.body_string(), "denied");
    }

    #[tokio::test]
    async fn test_unknown_method_on_known_path() {
        let mut app = Application::new("demo");
        app.route("/thing", "thing", &["GET", "HEAD"], |_p| async { Ok("ok".into()) });

        let response = shared(app)
            .handle(HttpRequest::new("DELETE", "/thing"))
            .await
            .unwrap();
        assert_eq!(response.status, 405);
    }

    #[tokio::test]
    async fn test_handle_params_reach_handler_as_named_values() {
        let mut app = Application::new("demo");
        app.route(
            "/add/<int:a>/<int:b>",
            "add",
            &["GET"],
            |params: HashMap<String, String>| async move {
                let a: i64 = params["a"].parse().map_err(|_| abort(400))?;
                let b: i64 = params["b"].parse().map_err(|_| abort(400))?;
                Ok(format!("{}", a + b).into())
            },
        );

        let response = shared(app)
            .handle(HttpRequest::new("GET", "/add/20/22"))
            .await
            .unwrap();
        assert_eq!(response.body_string(), "42");
    }
}
