use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use axum::body::Body;
use encoding_rs::Encoding;
use http::{HeaderName, HeaderValue, Request, Response};
use regex::Regex;
use url::Url;

use crate::error::ProxyError;
use crate::hooks::Hook;

/// How inbound paths translate to upstream paths.
#[derive(Clone)]
pub enum PathMap {
    /// Fixed table: an exact inbound path is replaced by the mapped value.
    /// Paths without an entry pass through unchanged.
    Table(HashMap<String, String>),
    /// Arbitrary rewrite function applied to every inbound path.
    Func(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl std::fmt::Debug for PathMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathMap::Table(table) => f.debug_tuple("Table").field(table).finish(),
            PathMap::Func(_) => f.debug_tuple("Func").finish(),
        }
    }
}

/// Gate deciding which inbound paths the proxy handles at all. Rejected
/// paths are handed to the next handler untouched.
#[derive(Clone)]
pub enum Matcher {
    Pattern(Regex),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Matcher {
    pub(crate) fn matches(&self, path: &str) -> bool {
        match self {
            Matcher::Pattern(pattern) => pattern.is_match(path),
            Matcher::Predicate(predicate) => predicate(path),
        }
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Matcher::Pattern(pattern) => f.debug_tuple("Pattern").field(pattern).finish(),
            Matcher::Predicate(_) => f.debug_tuple("Predicate").finish(),
        }
    }
}

/// Which responses may be cached, tested against the inbound path.
#[derive(Clone, Default)]
pub enum CachePolicy {
    /// Never cache. The cache is not even allocated.
    #[default]
    Off,
    /// Cache every path that reaches the forwarder.
    Always,
    Pattern(Regex),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl CachePolicy {
    pub(crate) fn enabled(&self) -> bool {
        !matches!(self, CachePolicy::Off)
    }

    pub(crate) fn cacheable(&self, path: &str) -> bool {
        match self {
            CachePolicy::Off => false,
            CachePolicy::Always => true,
            CachePolicy::Pattern(pattern) => pattern.is_match(path),
            CachePolicy::Predicate(predicate) => predicate(path),
        }
    }
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CachePolicy::Off => f.write_str("Off"),
            CachePolicy::Always => f.write_str("Always"),
            CachePolicy::Pattern(pattern) => f.debug_tuple("Pattern").field(pattern).finish(),
            CachePolicy::Predicate(_) => f.debug_tuple("Predicate").finish(),
        }
    }
}

/// Last-moment adjustment of the outbound request, applied after the request
/// is fully built and immediately before it is sent.
#[derive(Clone)]
pub enum RequestMutator {
    /// Static header overrides merged into the outbound request.
    Headers(http::HeaderMap),
    /// Full access to the built request.
    Func(Arc<dyn Fn(Request<Body>) -> Request<Body> + Send + Sync>),
}

impl std::fmt::Debug for RequestMutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestMutator::Headers(headers) => f.debug_tuple("Headers").field(headers).finish(),
            RequestMutator::Func(_) => f.debug_tuple("Func").finish(),
        }
    }
}

/// Immutable per-middleware configuration snapshot.
///
/// Built once via [`ProxyConfig::builder`]; nothing in here is mutated from a
/// per-request code path. Suppression lists are lower-cased and header
/// overrides validated at build time, so construction fails before the first
/// request is handled.
#[derive(Debug)]
pub struct ProxyConfig {
    pub(crate) host: Option<Url>,
    pub(crate) url: Option<String>,
    pub(crate) map: Option<PathMap>,
    pub(crate) matcher: Option<Matcher>,
    pub(crate) follow_redirect: bool,
    pub(crate) use_cookie_jar: bool,
    pub(crate) suppress_request_headers: HashSet<String>,
    pub(crate) suppress_response_headers: HashSet<String>,
    pub(crate) override_response_headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) encoding: Option<&'static Encoding>,
    pub(crate) cacheable: CachePolicy,
    pub(crate) cache_capacity: Option<NonZeroUsize>,
    pub(crate) hooks: Vec<Hook>,
    pub(crate) forward_control: bool,
    pub(crate) request_mutator: Option<RequestMutator>,
    /// Precomputed `Host` value: the configured host's authority with scheme
    /// and trailing slash stripped.
    pub(crate) host_authority: Option<HeaderValue>,
}

impl ProxyConfig {
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }
}

/// Builder for [`ProxyConfig`]. All inputs are taken as-is and validated in
/// [`build`](ProxyConfigBuilder::build).
pub struct ProxyConfigBuilder {
    host: Option<String>,
    url: Option<String>,
    map: Option<PathMap>,
    matcher: Option<Matcher>,
    follow_redirect: bool,
    use_cookie_jar: bool,
    suppress_request_headers: Vec<String>,
    suppress_response_headers: Vec<String>,
    override_response_headers: Vec<(String, String)>,
    encoding: Option<String>,
    cacheable: CachePolicy,
    cache_capacity: Option<usize>,
    hooks: Vec<Hook>,
    forward_control: bool,
    request_header_overrides: Vec<(String, String)>,
    request_mutator_fn: Option<Arc<dyn Fn(Request<Body>) -> Request<Body> + Send + Sync>>,
}

impl Default for ProxyConfigBuilder {
    fn default() -> Self {
        Self {
            host: None,
            url: None,
            map: None,
            matcher: None,
            follow_redirect: true,
            use_cookie_jar: false,
            suppress_request_headers: Vec::new(),
            suppress_response_headers: Vec::new(),
            override_response_headers: Vec::new(),
            encoding: None,
            cacheable: CachePolicy::Off,
            cache_capacity: None,
            hooks: Vec::new(),
            forward_control: false,
            request_header_overrides: Vec::new(),
            request_mutator_fn: None,
        }
    }
}

impl ProxyConfigBuilder {
    /// Base origin requests are joined onto, e.g. `http://localhost:3000`.
    /// A trailing slash is normalized away.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Fixed target. Absolute URLs are used verbatim; relative ones are
    /// joined onto `host`. The inbound path is ignored in this mode.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Fixed path-to-path mapping table.
    pub fn map<K, V, I>(mut self, table: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.map = Some(PathMap::Table(
            table
                .into_iter()
                .map(|(from, to)| (from.into(), to.into()))
                .collect(),
        ));
        self
    }

    /// Path rewrite function, applied to every inbound path.
    pub fn map_fn<F>(mut self, rewrite: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.map = Some(PathMap::Func(Arc::new(rewrite)));
        self
    }

    /// Only forward paths matching `pattern`; everything else goes to the
    /// next handler.
    pub fn match_pattern(mut self, pattern: Regex) -> Self {
        self.matcher = Some(Matcher::Pattern(pattern));
        self
    }

    /// Predicate form of [`match_pattern`](Self::match_pattern).
    pub fn match_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.matcher = Some(Matcher::Predicate(Arc::new(predicate)));
        self
    }

    /// Whether to follow upstream redirects transparently. Defaults to true.
    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = follow;
        self
    }

    /// Retain upstream `Set-Cookie` values in an in-memory jar and replay
    /// them on later outbound requests to the same authority.
    pub fn cookie_jar(mut self, enabled: bool) -> Self {
        self.use_cookie_jar = enabled;
        self
    }

    /// Header names removed from the inbound request before forwarding.
    /// Matching is case-insensitive.
    pub fn suppress_request_headers<I, T>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.suppress_request_headers
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Header names removed from the upstream response before relaying.
    /// Matching is case-insensitive.
    pub fn suppress_response_headers<I, T>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.suppress_response_headers
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Header set on every relayed response, after the upstream headers.
    /// Overrides always win, even over upstream values.
    pub fn override_response_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.override_response_headers
            .push((name.into(), value.into()));
        self
    }

    /// Decode upstream response bodies with a legacy byte encoding (a WHATWG
    /// label such as `gbk`) into UTF-8 text before relaying.
    pub fn encoding(mut self, label: impl Into<String>) -> Self {
        self.encoding = Some(label.into());
        self
    }

    /// Cache every forwarded response (status 200, non-empty body only).
    pub fn cache(mut self, enabled: bool) -> Self {
        self.cacheable = if enabled {
            CachePolicy::Always
        } else {
            CachePolicy::Off
        };
        self
    }

    /// Cache only paths matching `pattern`.
    pub fn cache_pattern(mut self, pattern: Regex) -> Self {
        self.cacheable = CachePolicy::Pattern(pattern);
        self
    }

    /// Predicate form of [`cache_pattern`](Self::cache_pattern).
    pub fn cache_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.cacheable = CachePolicy::Predicate(Arc::new(predicate));
        self
    }

    /// Maximum number of cached entries; least-recently-used entries are
    /// evicted beyond this. Unbounded when unset.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    /// Register an exact-path hook. The first matching hook fully owns the
    /// response for that path; the forwarding pipeline never runs.
    pub fn hook<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Response<Body>> + Send + 'static,
    {
        self.hooks.push(Hook::new(path, handler));
        self
    }

    /// After producing a proxied response, still invoke the next handler,
    /// exposing the response through request extensions as
    /// [`ForwardedResponse`](crate::ForwardedResponse).
    pub fn forward_control(mut self, enabled: bool) -> Self {
        self.forward_control = enabled;
        self
    }

    /// Static header overrides applied to the outbound request just before
    /// it is sent.
    pub fn request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_header_overrides
            .push((name.into(), value.into()));
        self
    }

    /// Function applied to the fully built outbound request just before it
    /// is sent. Takes precedence over
    /// [`request_header`](Self::request_header).
    pub fn request_mutator<F>(mut self, mutator: F) -> Self
    where
        F: Fn(Request<Body>) -> Request<Body> + Send + Sync + 'static,
    {
        self.request_mutator_fn = Some(Arc::new(mutator));
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// Fails when no target-selection option (`host`, `map`, `url`) is
    /// present, when `host` is not a URL, when a configured header is not
    /// valid HTTP, or when the encoding label is unknown.
    pub fn build(self) -> Result<ProxyConfig, ProxyError> {
        if self.host.is_none() && self.map.is_none() && self.url.is_none() {
            return Err(ProxyError::MissingTarget);
        }

        let host = match self.host {
            Some(raw) => {
                let trimmed = raw.trim_end_matches('/');
                Some(
                    Url::parse(trimmed).map_err(|source| ProxyError::InvalidHost {
                        value: raw.clone(),
                        source,
                    })?,
                )
            }
            None => None,
        };

        let host_authority = match &host {
            Some(url) => {
                let mut authority = url
                    .host_str()
                    .ok_or_else(|| ProxyError::InvalidHeader("host has no authority".into()))?
                    .to_string();
                if let Some(port) = url.port() {
                    authority.push_str(&format!(":{port}"));
                }
                Some(
                    HeaderValue::from_str(&authority)
                        .map_err(|_| ProxyError::InvalidHeader(authority.clone()))?,
                )
            }
            None => None,
        };

        let override_response_headers = parse_headers(&self.override_response_headers)?;

        let encoding = match self.encoding {
            Some(label) => Some(
                Encoding::for_label(label.as_bytes())
                    .ok_or(ProxyError::UnknownEncoding(label))?,
            ),
            None => None,
        };

        let request_mutator = match (self.request_mutator_fn, &self.request_header_overrides[..]) {
            (Some(mutator), _) => Some(RequestMutator::Func(mutator)),
            (None, []) => None,
            (None, overrides) => {
                let mut headers = http::HeaderMap::new();
                for (name, value) in parse_headers(overrides)? {
                    headers.insert(name, value);
                }
                Some(RequestMutator::Headers(headers))
            }
        };

        Ok(ProxyConfig {
            host,
            url: self.url,
            map: self.map,
            matcher: self.matcher,
            follow_redirect: self.follow_redirect,
            use_cookie_jar: self.use_cookie_jar,
            suppress_request_headers: lowered(self.suppress_request_headers),
            suppress_response_headers: lowered(self.suppress_response_headers),
            override_response_headers,
            encoding,
            cacheable: self.cacheable,
            cache_capacity: self.cache_capacity.and_then(NonZeroUsize::new),
            hooks: self.hooks,
            forward_control: self.forward_control,
            request_mutator,
            host_authority,
        })
    }
}

fn lowered(names: Vec<String>) -> HashSet<String> {
    names.into_iter().map(|name| name.to_lowercase()).collect()
}

fn parse_headers(raw: &[(String, String)]) -> Result<Vec<(HeaderName, HeaderValue)>, ProxyError> {
    raw.iter()
        .map(|(name, value)| {
            let name = name
                .parse::<HeaderName>()
                .map_err(|_| ProxyError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ProxyError::InvalidHeader(value.clone()))?;
            Ok((name, value))
        })
        .collect()
}
