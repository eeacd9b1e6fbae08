//! HTTP routing.
//!
//! [`RouteTable`] is an ordered list of exact `(method, path)` bindings plus
//! one fallback. It is filled before the server starts and then frozen into an
//! axum [`Router`]. Lookup is deterministic: the first registration for a
//! `(method, path)` pair wins, later duplicates are ignored with a warning, and
//! any request that matches no binding goes to the fallback. That includes a
//! known path requested with an unbound method, which would otherwise be a
//! `405`.
//!
//! | Method | Path      | Handler                      |
//! |--------|-----------|------------------------------|
//! | GET    | `/`       | [`index::index`]             |
//! | POST   | `/`       | [`form::echo_form`]          |
//! | GET    | `/ws`     | [`crate::ws::ws_upgrade`]    |
//! | GET    | `/events` | [`events::event_stream`]     |
//! | *      | *         | static files from the document root |

pub mod events;
pub mod form;
pub mod index;

use std::collections::HashSet;
use std::convert::Infallible;
use std::path::Path;

use axum::{
    extract::{DefaultBodyLimit, Request},
    handler::Handler,
    http::Method,
    response::IntoResponse,
    routing::{on, MethodFilter, MethodRouter},
    Router,
};
use tower::Service;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::RouteError;
use crate::AppState;

/// The fallback, installable both as the router's fallback and as the
/// method fallback of every bound path.
struct Fallback<S> {
    router: Box<dyn FnOnce(Router<S>) -> Router<S> + Send>,
    method: Box<dyn Fn(MethodRouter<S>) -> MethodRouter<S> + Send + Sync>,
}

struct Route<S> {
    method: Method,
    path: String,
    handler: MethodRouter<S>,
}

/// Ordered `(method, path) → handler` bindings plus a single fallback.
pub struct RouteTable<S = AppState> {
    routes: Vec<Route<S>>,
    seen: HashSet<(Method, String)>,
    fallback: Option<Fallback<S>>,
}

impl<S> Default for RouteTable<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> RouteTable<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            seen: HashSet::new(),
            fallback: None,
        }
    }

    /// Bind `handler` to an exact `method` + `path`.
    ///
    /// Registering a pair that is already bound keeps the earlier binding.
    pub fn add_route<H, T>(
        &mut self,
        method: Method,
        path: &str,
        handler: H,
    ) -> Result<&mut Self, RouteError>
    where
        H: Handler<T, S>,
        T: 'static,
    {
        validate_path(path)?;
        let filter = MethodFilter::try_from(method.clone())
            .map_err(|_| RouteError::UnsupportedMethod(method.clone()))?;

        if !self.seen.insert((method.clone(), path.to_string())) {
            warn!(%method, path, "Route already registered, keeping the first binding");
            return Ok(self);
        }

        self.routes.push(Route {
            method,
            path: path.to_string(),
            handler: on(filter, handler),
        });
        Ok(self)
    }

    /// Set the handler for requests that match no route. Replaces any earlier
    /// fallback.
    pub fn set_fallback<H, T>(&mut self, handler: H) -> &mut Self
    where
        H: Handler<T, S>,
        T: 'static,
    {
        let per_method = handler.clone();
        self.replace_fallback(Fallback {
            router: Box::new(move |router| router.fallback(handler)),
            method: Box::new(move |methods| methods.fallback(per_method.clone())),
        })
    }

    /// Like [`RouteTable::set_fallback`], for a tower service such as
    /// [`ServeDir`].
    pub fn set_fallback_service<T>(&mut self, service: T) -> &mut Self
    where
        T: Service<Request, Error = Infallible> + Clone + Send + Sync + 'static,
        T::Response: IntoResponse + 'static,
        T::Future: Send + 'static,
    {
        let per_method = service.clone();
        self.replace_fallback(Fallback {
            router: Box::new(move |router| router.fallback_service(service)),
            method: Box::new(move |methods| methods.fallback_service(per_method.clone())),
        })
    }

    fn replace_fallback(&mut self, fallback: Fallback<S>) -> &mut Self {
        if self.fallback.replace(fallback).is_some() {
            warn!("Fallback handler replaced");
        }
        self
    }

    /// Whether an exact binding exists for `method` + `path`.
    pub fn contains(&self, method: &Method, path: &str) -> bool {
        self.seen.contains(&(method.clone(), path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Freeze the table into an axum router, in registration order.
    pub fn into_router(self) -> Router<S> {
        let Self {
            routes, fallback, ..
        } = self;

        // One MethodRouter per path, so the method fallback is attached once.
        let mut paths: Vec<(String, MethodRouter<S>)> = Vec::new();
        for route in routes {
            debug!(method = %route.method, path = %route.path, "Route bound");
            match paths.iter_mut().find(|(path, _)| *path == route.path) {
                Some((_, methods)) => {
                    let earlier = std::mem::replace(methods, MethodRouter::new());
                    *methods = earlier.merge(route.handler);
                }
                None => paths.push((route.path, route.handler)),
            }
        }

        let mut router = Router::new();
        for (path, methods) in paths {
            let methods = match &fallback {
                Some(fallback) => (fallback.method)(methods),
                None => methods,
            };
            router = router.route(&path, methods);
        }
        match fallback {
            Some(fallback) => (fallback.router)(router),
            None => router,
        }
    }
}

/// Paths are matched literally, so reject anything axum would read as a
/// parameter or wildcard.
fn validate_path(path: &str) -> Result<(), RouteError> {
    let literal = path.starts_with('/')
        && !path.contains(['{', '}', '*'])
        && !path.split('/').any(|segment| segment.starts_with(':'));
    if literal {
        Ok(())
    } else {
        Err(RouteError::InvalidPath(path.to_string()))
    }
}

/// Static file service rooted at `root`. Missing files answer `404`.
pub fn static_files(root: &Path) -> ServeDir {
    ServeDir::new(root).append_index_html_on_directories(true)
}

/// Register the standard endpoints on `table` and point the fallback at
/// `document_root`. Bindings already present in `table` take precedence.
pub fn register_defaults(
    table: &mut RouteTable<AppState>,
    document_root: &Path,
) -> Result<(), RouteError> {
    table
        .add_route(Method::GET, "/", index::index)?
        .add_route(Method::POST, "/", form::echo_form)?
        .add_route(Method::GET, "/ws", crate::ws::ws_upgrade)?
        .add_route(Method::GET, "/events", events::event_stream)?
        .set_fallback_service(static_files(document_root));
    Ok(())
}

/// Build the finished application router from `table`.
///
/// Applies the request body cap (`server.post_max_size`) and HTTP tracing.
pub fn into_app(table: RouteTable<AppState>, state: AppState) -> Router {
    let body_limit = state.config.server.post_max_size.as_usize();
    table
        .into_router()
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The standard application: default routes over the configured document root.
pub fn app(state: AppState) -> Result<Router, RouteError> {
    let mut table = RouteTable::new();
    register_defaults(&mut table, &state.config.server.document_root_path())?;
    Ok(into_app(table, state))
}
