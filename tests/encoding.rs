use std::net::SocketAddr;

use axum::{routing::get, Router};
use axum_relay::{ProxyConfig, ProxyLayer};
use bytes::Bytes;
use tokio::net::TcpListener;

async fn serve(app: Router) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

// "你好" in GBK
const GBK_GREETING: &[u8] = &[0xc4, 0xe3, 0xba, 0xc3];

#[tokio::test]
async fn gbk_response_is_transcoded_to_utf8() {
    let app = Router::new().route(
        "/legacy",
        get(|| async {
            (
                [("content-type", "text/plain; charset=gbk")],
                Bytes::from_static(GBK_GREETING),
            )
        }),
    );
    let (upstream_addr, upstream) = serve(app).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .encoding("gbk")
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    let response = reqwest::get(format!("http://{proxy_addr}/legacy"))
        .await
        .unwrap();
    assert_eq!(response.bytes().await.unwrap(), Bytes::from("你好"));

    proxy.abort();
    upstream.abort();
}

#[tokio::test]
async fn bytes_pass_through_untouched_without_an_encoding() {
    let app = Router::new().route(
        "/legacy",
        get(|| async { Bytes::from_static(GBK_GREETING) }),
    );
    let (upstream_addr, upstream) = serve(app).await;

    let config = ProxyConfig::builder()
        .host(format!("http://{upstream_addr}"))
        .build()
        .unwrap();
    let (proxy_addr, proxy) = serve(Router::new().layer(ProxyLayer::new(config))).await;

    let response = reqwest::get(format!("http://{proxy_addr}/legacy"))
        .await
        .unwrap();
    assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(GBK_GREETING));

    proxy.abort();
    upstream.abort();
}
