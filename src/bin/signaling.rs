//! Room-based signaling relay binary.
//!
//! Usage:
//! ```bash
//! tunnel-signaling --bind 0.0.0.0:7999
//! ```
//! Peers connect with `ws://<host>:7999/ws?room=<name>`.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;

use tunnel_http::signaling::SignalingRelay;

#[derive(Parser, Debug)]
#[command(name = "tunnel-signaling")]
#[command(about = "Relay WebRTC offers, answers and candidates between peers in a room")]
#[command(version)]
struct Args {
    /// Address to bind the signaling relay
    #[arg(short, long, default_value = "0.0.0.0:7999")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    log::info!("Starting signaling relay on {}", args.bind);

    SignalingRelay::new().run(args.bind).await
}
