use std::net::SocketAddr;

use axum::{body::Body, extract::Request, routing::get, Router};
use axum_relay::{ProxyConfig, ProxyLayer};
use http::header;
use tokio::net::TcpListener;

async fn serve(app: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

fn upstream_app() -> Router {
    Router::new()
        .route(
            "/cookie-me",
            get(|| async { ([("set-cookie", "test_cookie=nom-nom; Path=/")], "set") }),
        )
        .route(
            "/check-cookie",
            get(|req: Request<Body>| async move {
                req.headers()
                    .get(header::COOKIE)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("missing")
                    .to_string()
            }),
        )
}

#[tokio::test]
async fn jar_replays_upstream_cookies_on_later_requests() {
    let (upstream_addr, upstream) = serve(upstream_app()).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .cookie_jar(true)
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    // the caller keeps no cookies of its own; only the proxy's jar can
    // carry the value across these two requests
    let client = reqwest::Client::new();
    client
        .get(format!("http://{proxy_addr}/cookie-me"))
        .send()
        .await
        .unwrap();

    let response = client
        .get(format!("http://{proxy_addr}/check-cookie"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "test_cookie=nom-nom");

    proxy.abort();
    upstream.abort();
}

#[tokio::test]
async fn without_a_jar_cookies_are_not_replayed() {
    let (upstream_addr, upstream) = serve(upstream_app()).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    let client = reqwest::Client::new();
    client
        .get(format!("http://{proxy_addr}/cookie-me"))
        .send()
        .await
        .unwrap();

    let response = client
        .get(format!("http://{proxy_addr}/check-cookie"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "missing");

    proxy.abort();
    upstream.abort();
}
