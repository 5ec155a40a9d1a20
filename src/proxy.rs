use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tower::{Layer, Service};
use tracing::{error, trace};
use url::Url;

use crate::cache::{CacheEntry, ResponseCache};
use crate::config::{ProxyConfig, RequestMutator};
use crate::headers::{filter_request_headers, filter_response_headers};
use crate::hooks;
use crate::resolve::resolve;
use crate::transcode::transcode;

/// Longest redirect chain the forwarder will follow before giving up.
const MAX_REDIRECTS: usize = 10;

/// An inbound body that an upstream middleware already consumed and
/// re-serialized (the analogue of a framework body parser having run).
///
/// When present in the request extensions the forwarder sends these bytes
/// buffered instead of piping the (now empty) inbound stream.
#[derive(Clone, Debug)]
pub struct ParsedBody(pub Bytes);

/// The proxied upstream response, exposed to the next handler through
/// request extensions when `forward_control` is enabled.
#[derive(Clone, Debug)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardedResponse {
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Outbound body, decided once per request.
enum OutboundBody {
    Empty,
    /// Already-materialized bytes; replayable across redirect hops.
    Buffered(Bytes),
    /// The live inbound stream, piped through without buffering. Can be
    /// sent exactly once.
    Streamed(Body),
}

/// Result of the outbound call.
enum UpstreamOutcome {
    /// A response arrived; relay it through the response pipeline.
    Response(Response<hyper::body::Incoming>),
    /// A transport-level outcome carrying only a status. Relayed as that
    /// status with empty headers and an empty body.
    Status(StatusCode),
    /// Connection refused, reset, DNS failure and friends.
    Fatal(Box<dyn std::error::Error + Send + Sync>),
}

/// Minimal per-middleware cookie jar: `Set-Cookie` pairs from an upstream
/// are replayed on later outbound requests to the same authority. Lives as
/// long as the middleware, like the response cache.
struct CookieJar {
    cookies: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl CookieJar {
    fn new() -> Self {
        Self {
            cookies: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, authority: &str, response_headers: &HeaderMap) {
        for value in response_headers.get_all(header::SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Some(pair) = raw.split(';').next() else { continue };
            let Some((name, value)) = pair.split_once('=') else { continue };
            let (name, value) = (name.trim().to_string(), value.trim().to_string());
            let mut cookies = self.cookies.lock().unwrap();
            let entry = cookies.entry(authority.to_string()).or_default();
            match entry.iter_mut().find(|(existing, _)| *existing == name) {
                Some(slot) => slot.1 = value,
                None => entry.push((name, value)),
            }
        }
    }

    fn cookie_header(&self, authority: &str) -> Option<HeaderValue> {
        let cookies = self.cookies.lock().unwrap();
        let entry = cookies.get(authority)?;
        if entry.is_empty() {
            return None;
        }
        let joined = entry
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }
}

/// State shared by every request one middleware instance handles: the
/// frozen configuration, the upstream client with its connection pool, and
/// the optional cache and cookie jar.
struct Shared {
    config: ProxyConfig,
    client: Client<HttpConnector, Body>,
    cache: Option<ResponseCache>,
    jar: Option<CookieJar>,
}

/// Layer installing the forwarding middleware in front of an inner service.
///
/// The inner service is the "next handler": it runs when resolution yields
/// no target, when the match gate rejects the path, and after a forwarded
/// response when `forward_control` is enabled. A hook or a forwarded
/// response otherwise ends the request here.
///
/// Dropping the response future (caller disconnect) drops the in-flight
/// upstream call with it; hyper aborts the request and releases the
/// connection.
#[derive(Clone)]
pub struct ProxyLayer {
    shared: Arc<Shared>,
}

impl ProxyLayer {
    pub fn new(config: ProxyConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);
        connector.set_keepalive(Some(Duration::from_secs(60)));
        connector.set_connect_timeout(Some(Duration::from_secs(10)));
        connector.set_reuse_address(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(32)
            .set_host(false)
            .build(connector);

        Self::with_client(config, client)
    }

    /// Use a pre-configured upstream client instead of the default pool.
    pub fn with_client(config: ProxyConfig, client: Client<HttpConnector, Body>) -> Self {
        let cache = config
            .cacheable
            .enabled()
            .then(|| ResponseCache::new(config.cache_capacity));
        let jar = config.use_cookie_jar.then(CookieJar::new);
        Self {
            shared: Arc::new(Shared {
                config,
                client,
                cache,
                jar,
            }),
        }
    }
}

impl<S> Layer<S> for ProxyLayer {
    type Service = Proxy<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Proxy {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Forwarding middleware service produced by [`ProxyLayer`].
#[derive(Clone)]
pub struct Proxy<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request<Body>> for Proxy<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let shared = self.shared.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            // hooks run first and own the response outright
            if let Some(hook) = hooks::dispatch(req.uri().path(), &shared.config.hooks) {
                trace!("hook handling path={}", req.uri().path());
                let handler = hook.handler.clone();
                return Ok(handler(req).await);
            }

            let path = req.uri().path().to_string();

            let Some(target) = resolve(&path, &shared.config) else {
                trace!("no upstream target for path={path}, deferring to next handler");
                return inner.call(req).await;
            };

            if let Some(matcher) = &shared.config.matcher {
                if !matcher.matches(&path) {
                    trace!("match gate rejected path={path}");
                    return inner.call(req).await;
                }
            }

            // a cache hit skips forwarding and request-time transformation
            if let Some(cache) = &shared.cache {
                if shared.config.cacheable.cacheable(&path) {
                    if let Some(entry) = cache.lookup(&path) {
                        trace!("cache hit path={path}");
                        return Ok(entry.into_response());
                    }
                }
            }

            let (parts, body) = req.into_parts();
            let next_parts = shared.config.forward_control.then(|| parts.clone());

            let response = shared.forward(&parts, body, &path, &target).await;

            match next_parts {
                None => Ok(response),
                Some(next_parts) => {
                    // hand the materialized response to the next handler;
                    // its response is what the caller sees
                    let (parts, body) = response.into_parts();
                    let body = body
                        .collect()
                        .await
                        .map(|collected| collected.to_bytes())
                        .unwrap_or_default();
                    let mut next_req = Request::from_parts(next_parts, Body::empty());
                    next_req.extensions_mut().insert(ForwardedResponse {
                        status: parts.status,
                        headers: parts.headers,
                        body,
                    });
                    inner.call(next_req).await
                }
            }
        })
    }
}

impl Shared {
    /// Build the outbound request, send it, and run the response pipeline.
    async fn forward(
        &self,
        parts: &http::request::Parts,
        body: Body,
        path: &str,
        target: &str,
    ) -> Response<Body> {
        // the inbound query is appended to the resolved target; configured
        // queries were already stripped during resolution
        let url = match parts.uri.query() {
            Some(query) => format!("{target}?{query}"),
            None => target.to_string(),
        };
        trace!("forwarding {} {path} to {url}", parts.method);

        let mut headers = parts.headers.clone();
        filter_request_headers(&mut headers, &self.config);

        let body = if let Some(parsed) = parts.extensions.get::<ParsedBody>() {
            // the parsed bytes replace the inbound stream, so the framing
            // must describe them rather than the original body
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(parsed.0.len()));
            OutboundBody::Buffered(parsed.0.clone())
        } else if parts.method == Method::GET || parts.method == Method::HEAD {
            OutboundBody::Empty
        } else {
            OutboundBody::Streamed(body)
        };

        match self.send(parts.method.clone(), url, headers, body).await {
            UpstreamOutcome::Response(upstream) => self.relay(upstream, path).await,
            UpstreamOutcome::Status(status) => {
                trace!("recoverable upstream status {status} for path={path}");
                synthetic_response(status)
            }
            UpstreamOutcome::Fatal(err) => {
                error!("upstream request failed path={path} err={err}");
                status_response(
                    StatusCode::BAD_GATEWAY,
                    format!("failed to reach upstream: {err}"),
                )
            }
        }
    }

    /// Issue the outbound call, following redirects for replayable bodies
    /// and keeping the cookie jar current.
    async fn send(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: OutboundBody,
    ) -> UpstreamOutcome {
        let mut method = method;
        let mut url = url;
        let mut headers = headers;
        let mut source = body;
        let mut hops = 0usize;

        loop {
            let uri: Uri = match url.parse() {
                Ok(uri) => uri,
                Err(err) => return UpstreamOutcome::Fatal(err.into()),
            };
            let authority = uri.authority().map(|a| a.as_str().to_string());

            // after a redirect the pinned Host must track the new target
            if hops > 0 {
                if let Some(authority) = &authority {
                    if let Ok(value) = HeaderValue::from_str(authority) {
                        headers.insert(header::HOST, value);
                    }
                }
            }

            let (hop_body, streaming) = match std::mem::replace(&mut source, OutboundBody::Empty) {
                OutboundBody::Empty => (Body::empty(), false),
                OutboundBody::Buffered(bytes) => {
                    source = OutboundBody::Buffered(bytes.clone());
                    (Body::from(bytes), false)
                }
                OutboundBody::Streamed(stream) => (stream, true),
            };

            let mut request = match Request::builder()
                .method(method.clone())
                .uri(uri)
                .version(Version::HTTP_11)
                .body(hop_body)
            {
                Ok(request) => request,
                Err(err) => return UpstreamOutcome::Fatal(err.into()),
            };
            *request.headers_mut() = headers.clone();

            if let (Some(jar), Some(authority)) = (&self.jar, &authority) {
                if let Some(cookie) = jar.cookie_header(authority) {
                    request.headers_mut().insert(header::COOKIE, cookie);
                }
            }

            let request = match &self.config.request_mutator {
                Some(RequestMutator::Headers(overrides)) => {
                    for (name, value) in overrides {
                        request.headers_mut().insert(name.clone(), value.clone());
                    }
                    request
                }
                Some(RequestMutator::Func(mutate)) => mutate(request),
                None => request,
            };

            let response = match self.client.request(request).await {
                Ok(response) => response,
                Err(err) => return UpstreamOutcome::Fatal(err.into()),
            };

            if let (Some(jar), Some(authority)) = (&self.jar, &authority) {
                jar.remember(authority, response.headers());
            }

            if !(self.config.follow_redirect && response.status().is_redirection()) {
                return UpstreamOutcome::Response(response);
            }
            let Some(location) = response
                .headers()
                .get(header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
            else {
                return UpstreamOutcome::Response(response);
            };
            if streaming {
                // the inbound stream is spent and cannot be replayed; the
                // caller gets the redirect itself
                return UpstreamOutcome::Response(response);
            }

            hops += 1;
            if hops > MAX_REDIRECTS {
                return UpstreamOutcome::Status(StatusCode::LOOP_DETECTED);
            }

            url = match Url::parse(&url).and_then(|base| base.join(&location)) {
                Ok(next) => next.to_string(),
                Err(err) => return UpstreamOutcome::Fatal(err.into()),
            };
            if response.status() == StatusCode::SEE_OTHER {
                // 303 downgrades to a bodiless GET; drop the stale framing
                // headers along with the body
                method = Method::GET;
                source = OutboundBody::Empty;
                headers.remove(header::CONTENT_LENGTH);
                headers.remove(header::TRANSFER_ENCODING);
            }
            trace!("following redirect to {url}");
        }
    }

    /// Response pipeline: filter headers, maybe store in the cache, maybe
    /// transcode, and stream everything else straight through.
    async fn relay(&self, upstream: Response<hyper::body::Incoming>, path: &str) -> Response<Body> {
        let (mut parts, body) = upstream.into_parts();
        trace!("upstream responded status={} for path={path}", parts.status);
        filter_response_headers(&mut parts.headers, &self.config);

        let cache_store = parts.status == StatusCode::OK
            && self.cache.is_some()
            && self.config.cacheable.cacheable(path);
        let must_buffer =
            cache_store || self.config.encoding.is_some() || self.config.forward_control;

        if !must_buffer {
            return Response::from_parts(parts, Body::from_stream(body.into_data_stream()));
        }

        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!("failed to read upstream body path={path} err={err}");
                return status_response(
                    StatusCode::BAD_GATEWAY,
                    format!("failed to read upstream body: {err}"),
                );
            }
        };

        if cache_store && !bytes.is_empty() {
            if let Some(cache) = &self.cache {
                trace!("caching response for path={path}");
                cache.store(
                    path,
                    CacheEntry {
                        status: parts.status,
                        headers: parts.headers.clone(),
                        body: bytes.clone(),
                    },
                );
            }
        }

        let bytes = transcode(bytes, self.config.encoding);
        if self.config.encoding.is_some() {
            // transcoding can change the body length; let the server layer
            // recompute framing from the materialized bytes
            parts.headers.remove(header::CONTENT_LENGTH);
        }
        Response::from_parts(parts, Body::from(bytes))
    }
}

/// Status with empty headers and body, standing in for a response the
/// transport layer reported out-of-band.
fn synthetic_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn status_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_response_has_status_and_nothing_else() {
        let response = synthetic_response(StatusCode::NOT_MODIFIED);
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.headers().is_empty());
    }

    #[test]
    fn cookie_jar_replays_last_value_per_name() {
        let jar = CookieJar::new();
        let mut headers = HeaderMap::new();
        headers.append(
            header::SET_COOKIE,
            "session=abc; HttpOnly; Path=/".parse().unwrap(),
        );
        headers.append(header::SET_COOKIE, "theme=dark".parse().unwrap());
        jar.remember("h:1", &headers);

        let mut refreshed = HeaderMap::new();
        refreshed.append(header::SET_COOKIE, "session=def".parse().unwrap());
        jar.remember("h:1", &refreshed);

        assert_eq!(jar.cookie_header("h:1").unwrap(), "session=def; theme=dark");
        assert!(jar.cookie_header("other:1").is_none());
    }

    #[test]
    fn forwarded_response_round_trips_into_response() {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", "1".parse().unwrap());
        let forwarded = ForwardedResponse {
            status: StatusCode::CREATED,
            headers: headers.clone(),
            body: Bytes::from_static(b"body"),
        };
        let response = forwarded.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers(), &headers);
    }
}
