//! tunnel-http
//!
//! Exposes a local HTTP/JSON-RPC service to a remote peer.
//!
//! Usage:
//!   WebRTC answerer: tunnel-http webrtc --role answer --room demo --upstream http://127.0.0.1:8000
//!   WebRTC offerer:  tunnel-http webrtc --role offer --room demo --listen-http 8080
//!   Stream server:   tunnel-http stream-serve --upstream http://127.0.0.1:8000
//!   Stream client:   tunnel-http stream-connect --peer <ENDPOINT_ID> --listen-http 8080

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tunnel_http::bridge;
use tunnel_http::config::{load_bridge_config, StreamConnectArgs, StreamServeArgs, WebRtcArgs};
use tunnel_http::secret;

#[derive(Parser)]
#[command(name = "tunnel-http")]
#[command(version)]
#[command(about = "Tunnel local HTTP/JSON-RPC services to a remote peer")]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Bridge over a WebRTC data channel negotiated through a signaling relay
    Webrtc(WebRtcArgs),
    /// Answer tunnelled requests arriving on iroh streams
    StreamServe(StreamServeArgs),
    /// Expose a local HTTP port that tunnels each request over an iroh stream
    StreamConnect(StreamConnectArgs),
    /// Generate a new secret key file (for a persistent EndpointId)
    GenerateSecret {
        /// Path where to save the secret key file ("-" for stdout)
        #[arg(short, long)]
        output: PathBuf,

        /// Overwrite existing file if it exists
        #[arg(long)]
        force: bool,
    },
    /// Show the EndpointId for an existing secret key file
    ShowId {
        /// Path to the secret key file
        #[arg(short, long)]
        secret_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.mode {
        Mode::Webrtc(args) => {
            let file = load_bridge_config(args.config.as_deref())?;
            bridge::run_webrtc(args.resolve(&file)?).await
        }
        Mode::StreamServe(args) => {
            let file = load_bridge_config(args.config.as_deref())?;
            bridge::run_stream_serve(args.resolve(&file)?).await
        }
        Mode::StreamConnect(args) => {
            let file = load_bridge_config(args.config.as_deref())?;
            bridge::run_stream_connect(args.resolve(&file)?).await
        }
        Mode::GenerateSecret { output, force } => secret::generate_secret(&output, force).map(|_| ()),
        Mode::ShowId { secret_file } => secret::show_id(&secret_file),
    }
}
