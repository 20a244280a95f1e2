//! Process-level wiring for each run mode.
//!
//! - `webrtc`: local ingress + multiplexer + WebRTC session
//! - `stream-serve`: iroh host answering protocol streams from the upstream
//! - `stream-connect`: local ingress tunnelling every request as one stream

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use iroh::EndpointId;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{HandlerKind, StreamConnectSettings, StreamServeSettings, WebRtcSettings};
use crate::http::{ControlApi, Egress, Ingress};
use crate::rtc::{Session, SessionConfig};
use crate::secret::load_secret;
use crate::stream::{EnvelopeHandler, Host, IrohHost, RpcForwarder, StreamTunnel};
use crate::transport::{Multiplexer, StreamTransport, Transport};

async fn bind_local(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))
}

/// Cancel `cancel` on Ctrl+C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down...");
        }
        cancel.cancel();
    });
}

async fn bind_host(secret_file: Option<&Path>, relay_urls: &[String]) -> Result<Arc<IrohHost>> {
    let secret = secret_file.map(load_secret).transpose()?;
    let host = IrohHost::bind(secret, relay_urls).await?;
    Ok(Arc::new(host))
}

fn spawn_control_api(
    addr: Option<SocketAddr>,
    tunnel: &Arc<StreamTunnel<IrohHost>>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let addr = addr?;
    let api = Arc::new(ControlApi::new(tunnel.clone(), timeout));
    let cancel = cancel.clone();
    Some(tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Failed to bind control API on {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = api.serve(listener, cancel).await {
            log::error!("Control API stopped: {:#}", e);
        }
    }))
}

/// Data-channel bridge: serve local HTTP through a WebRTC session.
pub async fn run_webrtc(settings: WebRtcSettings) -> Result<()> {
    let egress = Arc::new(Egress::new(settings.upstream.clone(), settings.timeout)?);
    match egress.upstream() {
        Some(upstream) => println!("Forwarding peer requests to {}", upstream),
        None => println!("No upstream configured; peer requests are answered with 502"),
    }
    let (mux, outbound) = Multiplexer::new(egress);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let listener = bind_local(settings.listen_http).await?;
    let ingress = Arc::new(Ingress::<IrohHost>::new(
        Transport::DataChannel(mux.clone()),
        settings.timeout,
    ));
    let ingress_task = tokio::spawn(ingress.serve(listener, cancel.clone()));

    let session = Session::new(
        SessionConfig {
            role: settings.role,
            room: settings.room,
            signal_url: settings.signal_url,
            stun_servers: settings.stun_servers,
        },
        mux,
    );
    let result = session.run(outbound, cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = ingress_task.await {
        log::warn!("Ingress task ended abnormally: {}", e);
    }
    result
}

/// Stream-tunnel inbound side.
pub async fn run_stream_serve(settings: StreamServeSettings) -> Result<()> {
    let host = bind_host(settings.secret_file.as_deref(), &settings.relay_urls).await?;
    let endpoint_id = host.local_id();
    let tunnel = Arc::new(StreamTunnel::new(
        host.clone(),
        settings.protocol.clone(),
        settings.max_message_bytes,
    ));

    match settings.handler {
        HandlerKind::Envelope => {
            let egress = Arc::new(Egress::new(settings.upstream.clone(), settings.timeout)?);
            tunnel.start(Arc::new(EnvelopeHandler::new(egress)));
        }
        HandlerKind::Rpc => {
            let upstream = settings
                .upstream
                .as_deref()
                .ok_or_else(|| anyhow!("The rpc handler needs an upstream"))?;
            let forwarder = RpcForwarder::new(upstream, &settings.rpc_path, settings.timeout)?;
            println!("Forwarding RPC bodies to {}", forwarder.url());
            tunnel.start(Arc::new(forwarder));
        }
    }

    println!("EndpointId: {}", endpoint_id);
    println!("Serving protocol {}", settings.protocol);
    println!("\nOn the other side, run:");
    println!("  tunnel-http stream-connect --peer {}\n", endpoint_id);

    let cancel = CancellationToken::new();
    let api_task = spawn_control_api(settings.http_api, &tunnel, settings.timeout, &cancel);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    println!("\nShutting down...");
    cancel.cancel();
    tunnel.stop();
    if let Some(task) = api_task {
        let _ = task.await;
    }
    host.shutdown().await;
    Ok(())
}

/// Stream-tunnel outbound side: local ingress, one stream per request.
pub async fn run_stream_connect(settings: StreamConnectSettings) -> Result<()> {
    let peer = EndpointId::from_str(&settings.peer)
        .map_err(|e| anyhow!("Invalid peer EndpointId {}: {}", settings.peer, e))?;
    let host = bind_host(settings.secret_file.as_deref(), &settings.relay_urls).await?;
    println!("EndpointId: {}", host.local_id());

    let tunnel = Arc::new(StreamTunnel::new(
        host.clone(),
        settings.protocol.clone(),
        settings.max_message_bytes,
    ));
    let transport = Transport::Stream(Arc::new(StreamTransport::new(tunnel.clone(), peer)));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let api_task = spawn_control_api(settings.http_api, &tunnel, settings.timeout, &cancel);

    let listener = bind_local(settings.listen_http).await?;
    println!("Tunnelling to {} over {}", peer, settings.protocol);
    let ingress = Arc::new(Ingress::new(transport, settings.timeout));
    let result = ingress.serve(listener, cancel.clone()).await;

    cancel.cancel();
    if let Some(task) = api_task {
        let _ = task.await;
    }
    host.shutdown().await;
    result
}
