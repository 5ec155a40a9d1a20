use axum::Router;

use crate::proxy::ProxyLayer;

/// Enables conversion from a [`ProxyLayer`] into a standalone axum `Router`.
///
/// The proxy wraps an empty router, so the router's own 404 fallback plays
/// the role of the next handler: paths the proxy resolves are forwarded,
/// everything else falls through to Not Found.
///
/// # Example
///
/// ```no_run
/// use axum::Router;
/// use axum_relay::{ProxyConfig, ProxyLayer};
///
/// # fn main() -> Result<(), axum_relay::ProxyError> {
/// let config = ProxyConfig::builder().host("http://127.0.0.1:3000").build()?;
/// let app: Router = ProxyLayer::new(config).into();
/// # Ok(())
/// # }
/// ```
impl From<ProxyLayer> for Router {
    fn from(layer: ProxyLayer) -> Self {
        Router::new().layer(layer)
    }
}
