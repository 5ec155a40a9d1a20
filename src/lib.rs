//! Configurable request-forwarding middleware for axum.
//!
//! `axum-relay` sits in front of an upstream HTTP origin as a tower layer:
//! it decides whether and where to forward each inbound request, rewrites
//! headers, optionally serves a cached response, and relays the upstream
//! response back to the caller.
//!
//! The pipeline per request: exact-path [`Hook`]s (a hit fully owns the
//! response) → URL resolution from `host`/`map`/`url` (no target → the
//! wrapped service handles the request) → optional match gate → LRU response
//! cache lookup → request-header filtering and `Host` rewriting → the
//! outbound call (redirect following, cookie jar) → response-header
//! filtering → optional cache store → optional legacy-encoding transcoding.
//!
//! # Example
//!
//! ```no_run
//! use axum::Router;
//! use axum_relay::{ProxyConfig, ProxyLayer};
//!
//! # fn main() -> Result<(), axum_relay::ProxyError> {
//! let config = ProxyConfig::builder()
//!     .host("http://127.0.0.1:3000")
//!     .map([("/index.js", "/class.js")])
//!     .suppress_request_headers(["x-internal-auth"])
//!     .cache(true)
//!     .cache_capacity(128)
//!     .build()?;
//!
//! let app: Router<()> = Router::new().layer(ProxyLayer::new(config));
//! # let _ = app;
//! # Ok(())
//! # }
//! ```
//!
//! Construction fails unless at least one of `host`, `map`, or `url` is
//! configured. Everything else is optional.

mod cache;
mod config;
mod error;
mod headers;
mod hooks;
mod proxy;
mod resolve;
mod router;
mod transcode;

pub use config::{CachePolicy, Matcher, PathMap, ProxyConfig, ProxyConfigBuilder, RequestMutator};
pub use error::ProxyError;
pub use hooks::{Hook, HookFuture};
pub use proxy::{ForwardedResponse, ParsedBody, Proxy, ProxyLayer};
