use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use http::{Request, Response};

/// Future returned by a hook handler.
pub type HookFuture = Pin<Box<dyn Future<Output = Response<Body>> + Send>>;

/// An exact-path override. When the inbound path equals `path`, the handler
/// fully owns the response and the forwarding pipeline never runs.
#[derive(Clone)]
pub struct Hook {
    pub(crate) path: String,
    pub(crate) handler: Arc<dyn Fn(Request<Body>) -> HookFuture + Send + Sync>,
}

impl Hook {
    pub fn new<F, Fut>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response<Body>> + Send + 'static,
    {
        Self {
            path: path.into(),
            handler: Arc::new(move |req| Box::pin(handler(req)) as HookFuture),
        }
    }

    /// The exact path this hook intercepts.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook").field("path", &self.path).finish()
    }
}

/// First hook whose path equals `path`, in configuration order.
pub(crate) fn dispatch<'a>(path: &str, hooks: &'a [Hook]) -> Option<&'a Hook> {
    hooks.iter().find(|hook| hook.path == path)
}
