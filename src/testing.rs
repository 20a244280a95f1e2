//! Loopback helpers shared by unit tests.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

pub(crate) const LARGE_BODY_BYTES: usize = 100_000;

/// Upstream routes:
/// - `/status` → `200 ok`
/// - `/slow` → `200 late` after 3 s
/// - `/large` → `200` with [`LARGE_BODY_BYTES`] bytes of `x`
/// - anything else → echo `"<METHOD> <path[?query]> trace=<x-trace> <body>"`
async fn upstream(req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let trace = req
        .headers()
        .get("x-trace")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let response = match target.as_str() {
        "/status" => Response::builder()
            .status(200)
            .header("content-type", "text/plain")
            .header("x-upstream", "yes")
            .body(Full::new(Bytes::from_static(b"ok"))),
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Response::builder().body(Full::new(Bytes::from_static(b"late")))
        }
        "/large" => Response::builder().body(Full::new(Bytes::from(vec![b'x'; LARGE_BODY_BYTES]))),
        _ => {
            let echo = format!(
                "{} {} trace={} {}",
                method,
                target,
                trace,
                String::from_utf8_lossy(&body)
            );
            Response::builder().body(Full::new(Bytes::from(echo)))
        }
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Start the test upstream on `127.0.0.1:0`.
pub(crate) async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(upstream))
                    .await;
            });
        }
    });
    addr
}
