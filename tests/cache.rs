use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::RawQuery, routing::get, Router};
use axum_relay::{ProxyConfig, ProxyLayer};
use http::StatusCode;
use regex::Regex;
use tokio::net::TcpListener;

async fn serve(app: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

fn counting_route(hits: Arc<AtomicUsize>) -> axum::routing::MethodRouter {
    get(move || {
        let n = hits.fetch_add(1, Ordering::SeqCst);
        async move { ([("etag", "\"stable\"")], format!("call {n}")) }
    })
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/x", counting_route(hits.clone()));
    let (upstream_addr, upstream) = serve(app).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .cache(true)
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    let first = reqwest::get(format!("http://{proxy_addr}/x")).await.unwrap();
    assert_eq!(first.headers().get("etag").unwrap(), "\"stable\"");
    let first_body = first.text().await.unwrap();

    let second = reqwest::get(format!("http://{proxy_addr}/x")).await.unwrap();
    // cached headers are replayed along with the body
    assert_eq!(second.headers().get("etag").unwrap(), "\"stable\"");
    assert_eq!(second.text().await.unwrap(), first_body);

    assert_eq!(hits.load(Ordering::SeqCst), 1);

    proxy.abort();
    upstream.abort();
}

#[tokio::test]
async fn query_string_never_affects_cache_identity() {
    let app = Router::new().route(
        "/a",
        get(|RawQuery(query): RawQuery| async move { query.unwrap_or_default() }),
    );
    let (upstream_addr, upstream) = serve(app).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .cache(true)
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    let first = reqwest::get(format!("http://{proxy_addr}/a?x=1"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(first, "x=1");

    // same path, different query: same cache entry
    let second = reqwest::get(format!("http://{proxy_addr}/a?x=2"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(second, "x=1");

    proxy.abort();
    upstream.abort();
}

#[tokio::test]
async fn non_200_responses_are_not_cached() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/missing",
        get(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { (StatusCode::NOT_FOUND, format!("gone {n}")) }
        }),
    );
    let (upstream_addr, upstream) = serve(app).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .cache(true)
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    for _ in 0..2 {
        let response = reqwest::get(format!("http://{proxy_addr}/missing"))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    proxy.abort();
    upstream.abort();
}

#[tokio::test]
async fn cache_pattern_limits_which_paths_are_cached() {
    let static_hits = Arc::new(AtomicUsize::new(0));
    let dynamic_hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/static/a", counting_route(static_hits.clone()))
        .route("/dynamic", counting_route(dynamic_hits.clone()));
    let (upstream_addr, upstream) = serve(app).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .cache_pattern(Regex::new(r"^/static/").unwrap())
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    for _ in 0..2 {
        reqwest::get(format!("http://{proxy_addr}/static/a"))
            .await
            .unwrap();
        reqwest::get(format!("http://{proxy_addr}/dynamic"))
            .await
            .unwrap();
    }

    assert_eq!(static_hits.load(Ordering::SeqCst), 1);
    assert_eq!(dynamic_hits.load(Ordering::SeqCst), 2);

    proxy.abort();
    upstream.abort();
}

#[tokio::test]
async fn cache_predicate_decides_cacheability() {
    let static_hits = Arc::new(AtomicUsize::new(0));
    let dynamic_hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/a.js", counting_route(static_hits.clone()))
        .route("/feed", counting_route(dynamic_hits.clone()));
    let (upstream_addr, upstream) = serve(app).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .cache_predicate(|path| path.ends_with(".js"))
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    for _ in 0..2 {
        reqwest::get(format!("http://{proxy_addr}/a.js")).await.unwrap();
        reqwest::get(format!("http://{proxy_addr}/feed")).await.unwrap();
    }

    assert_eq!(static_hits.load(Ordering::SeqCst), 1);
    assert_eq!(dynamic_hits.load(Ordering::SeqCst), 2);

    proxy.abort();
    upstream.abort();
}

#[tokio::test]
async fn capacity_bounds_the_cache_by_lru_eviction() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/p/{id}",
        get(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { "body" }
        }),
    );
    let (upstream_addr, upstream) = serve(app).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .cache(true)
        .cache_capacity(1)
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    // /p/1 cached, then evicted by /p/2, so the third request forwards again
    reqwest::get(format!("http://{proxy_addr}/p/1")).await.unwrap();
    reqwest::get(format!("http://{proxy_addr}/p/2")).await.unwrap();
    reqwest::get(format!("http://{proxy_addr}/p/1")).await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 3);

    proxy.abort();
    upstream.abort();
}
