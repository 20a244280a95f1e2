//! Configuration file support for tunnel-http.
//!
//! Shared options live at the top level, mode-specific ones in `[webrtc]` and
//! `[stream]`:
//!
//! ```toml
//! timeout_secs = 20
//! listen_http = 8080
//! upstream = "http://127.0.0.1:8000"
//!
//! [webrtc]
//! role = "answer"
//! room = "demo"
//! signal = "ws://127.0.0.1:7999/ws"
//! stun_servers = ["stun.l.google.com:19302"]
//!
//! [stream]
//! protocol = "/p2p-http/1.0"
//! handler = "envelope"
//! secret_file = "~/.config/tunnel-http/host.key"
//! ```
//!
//! Command-line values override the file, the file overrides the defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;

use crate::framing::DEFAULT_MAX_MESSAGE_BYTES;
use crate::rtc::Role;

pub const DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_PROTOCOL: &str = "/p2p-http/1.0";
pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:7999/ws";
pub const DEFAULT_LISTEN_HTTP: u16 = 8080;
pub const DEFAULT_RPC_PATH: &str = "/";

pub fn default_stun_servers() -> Vec<String> {
    vec!["stun.l.google.com:19302".to_string()]
}

/// What the stream-serve side does with an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Decode a request envelope and proxy it to the upstream
    #[default]
    Envelope,
    /// POST the raw JSON-RPC body to the upstream RPC path
    Rpc,
}

// ============================================================================
// File structures
// ============================================================================

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct WebRtcFileConfig {
    pub role: Option<String>,
    pub room: Option<String>,
    pub signal: Option<String>,
    pub stun_servers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct StreamFileConfig {
    pub protocol: Option<String>,
    pub handler: Option<HandlerKind>,
    pub rpc_path: Option<String>,
    pub max_message_bytes: Option<usize>,
    pub secret_file: Option<PathBuf>,
    pub relay_urls: Option<Vec<String>>,
    pub peer: Option<String>,
    pub http_api: Option<SocketAddr>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub timeout_secs: Option<u64>,
    pub listen_http: Option<u16>,
    pub upstream: Option<String>,
    pub webrtc: Option<WebRtcFileConfig>,
    pub stream: Option<StreamFileConfig>,
}

impl BridgeConfig {
    pub fn webrtc(&self) -> WebRtcFileConfig {
        self.webrtc.clone().unwrap_or_default()
    }

    pub fn stream(&self) -> StreamFileConfig {
        self.stream.clone().unwrap_or_default()
    }
}

// ============================================================================
// Loading
// ============================================================================

pub fn parse_config(content: &str) -> Result<BridgeConfig> {
    toml::from_str(content).context("Failed to parse config")
}

fn load_config(path: &Path) -> Result<BridgeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// `~/.config/tunnel-http/bridge.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tunnel-http").join("bridge.toml"))
}

/// Load from an explicit path, or from the default location.
///
/// An explicit path must exist; a missing default file means "no file".
pub fn load_bridge_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(p) => load_config(p),
        None => match default_config_path() {
            Some(p) if p.exists() => {
                log::info!("Using config file {}", p.display());
                load_config(&p)
            }
            _ => Ok(BridgeConfig::default()),
        },
    }
}

// ============================================================================
// Command-line overrides
// ============================================================================

#[derive(Debug, Clone, Default, clap::Args)]
pub struct WebRtcArgs {
    /// Local HTTP port to accept requests on
    #[arg(long)]
    pub listen_http: Option<u16>,

    /// Upstream base URL for requests arriving from the peer (absent: answer 502)
    #[arg(long)]
    pub upstream: Option<String>,

    /// Signaling role: offer or answer (start the answerer first)
    #[arg(long)]
    pub role: Option<String>,

    /// Signaling room shared by both peers
    #[arg(long)]
    pub room: Option<String>,

    /// Signaling relay websocket URL
    #[arg(long)]
    pub signal: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// STUN server host:port (repeatable)
    #[arg(long = "stun-server")]
    pub stun_servers: Vec<String>,

    /// Path to config file (default: ~/.config/tunnel-http/bridge.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct StreamServeArgs {
    /// Upstream base URL of the local service
    #[arg(long)]
    pub upstream: Option<String>,

    /// Protocol id to register
    #[arg(long)]
    pub protocol: Option<String>,

    /// How inbound payloads are handled
    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,

    /// RPC path for the rpc handler
    #[arg(long)]
    pub rpc_path: Option<String>,

    /// Largest accepted message in bytes
    #[arg(long)]
    pub max_message_bytes: Option<usize>,

    /// Upstream request timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Secret key file for a persistent EndpointId
    #[arg(long)]
    pub secret_file: Option<PathBuf>,

    /// Custom relay server URL(s), repeatable
    #[arg(long = "relay-url")]
    pub relay_urls: Vec<String>,

    /// Address for the local control API (disabled when absent)
    #[arg(long)]
    pub http_api: Option<SocketAddr>,

    /// Path to config file (default: ~/.config/tunnel-http/bridge.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct StreamConnectArgs {
    /// Local HTTP port to accept requests on
    #[arg(long)]
    pub listen_http: Option<u16>,

    /// EndpointId of the stream-serve peer
    #[arg(long)]
    pub peer: Option<String>,

    /// Protocol id to request
    #[arg(long)]
    pub protocol: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Largest accepted message in bytes
    #[arg(long)]
    pub max_message_bytes: Option<usize>,

    /// Secret key file for a persistent EndpointId
    #[arg(long)]
    pub secret_file: Option<PathBuf>,

    /// Custom relay server URL(s), repeatable
    #[arg(long = "relay-url")]
    pub relay_urls: Vec<String>,

    /// Address for the local control API (disabled when absent)
    #[arg(long)]
    pub http_api: Option<SocketAddr>,

    /// Path to config file (default: ~/.config/tunnel-http/bridge.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

// ============================================================================
// Resolved settings
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct WebRtcSettings {
    pub listen_http: u16,
    pub upstream: Option<String>,
    pub role: Role,
    pub room: String,
    pub signal_url: String,
    pub timeout: Duration,
    pub stun_servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamServeSettings {
    pub upstream: Option<String>,
    pub protocol: String,
    pub handler: HandlerKind,
    pub rpc_path: String,
    pub max_message_bytes: usize,
    pub timeout: Duration,
    pub secret_file: Option<PathBuf>,
    pub relay_urls: Vec<String>,
    pub http_api: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConnectSettings {
    pub listen_http: u16,
    pub peer: String,
    pub protocol: String,
    pub timeout: Duration,
    pub max_message_bytes: usize,
    pub secret_file: Option<PathBuf>,
    pub relay_urls: Vec<String>,
    pub http_api: Option<SocketAddr>,
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

impl WebRtcArgs {
    pub fn resolve(self, file: &BridgeConfig) -> Result<WebRtcSettings> {
        let section = file.webrtc();
        let role = self
            .role
            .or(section.role)
            .context("--role is required (offer or answer)")?
            .parse()?;
        let room = self
            .room
            .or(section.room)
            .context("--room is required")?;

        Ok(WebRtcSettings {
            listen_http: self
                .listen_http
                .or(file.listen_http)
                .unwrap_or(DEFAULT_LISTEN_HTTP),
            upstream: self.upstream.or_else(|| file.upstream.clone()),
            role,
            room,
            signal_url: self
                .signal
                .or(section.signal)
                .unwrap_or_else(|| DEFAULT_SIGNAL_URL.to_string()),
            timeout: Duration::from_secs(
                self.timeout
                    .or(file.timeout_secs)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            stun_servers: non_empty(self.stun_servers)
                .or(section.stun_servers)
                .unwrap_or_else(default_stun_servers),
        })
    }
}

impl StreamServeArgs {
    pub fn resolve(self, file: &BridgeConfig) -> Result<StreamServeSettings> {
        let section = file.stream();
        let handler = self.handler.or(section.handler).unwrap_or_default();
        let upstream = self.upstream.or_else(|| file.upstream.clone());
        if handler == HandlerKind::Rpc && upstream.is_none() {
            anyhow::bail!("--upstream is required with --handler rpc");
        }

        Ok(StreamServeSettings {
            upstream,
            protocol: self
                .protocol
                .or(section.protocol)
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            handler,
            rpc_path: self
                .rpc_path
                .or(section.rpc_path)
                .unwrap_or_else(|| DEFAULT_RPC_PATH.to_string()),
            max_message_bytes: self
                .max_message_bytes
                .or(section.max_message_bytes)
                .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES),
            timeout: Duration::from_secs(
                self.timeout
                    .or(file.timeout_secs)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            secret_file: self.secret_file.or(section.secret_file),
            relay_urls: non_empty(self.relay_urls)
                .or(section.relay_urls)
                .unwrap_or_default(),
            http_api: self.http_api.or(section.http_api),
        })
    }
}

impl StreamConnectArgs {
    pub fn resolve(self, file: &BridgeConfig) -> Result<StreamConnectSettings> {
        let section = file.stream();
        let peer = self
            .peer
            .or(section.peer)
            .context("--peer is required (EndpointId of the stream-serve side)")?;

        Ok(StreamConnectSettings {
            listen_http: self
                .listen_http
                .or(file.listen_http)
                .unwrap_or(DEFAULT_LISTEN_HTTP),
            peer,
            protocol: self
                .protocol
                .or(section.protocol)
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            timeout: Duration::from_secs(
                self.timeout
                    .or(file.timeout_secs)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            max_message_bytes: self
                .max_message_bytes
                .or(section.max_message_bytes)
                .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES),
            secret_file: self.secret_file.or(section.secret_file),
            relay_urls: non_empty(self.relay_urls)
                .or(section.relay_urls)
                .unwrap_or_default(),
            http_api: self.http_api.or(section.http_api),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
timeout_secs = 7
listen_http = 9000
upstream = "http://127.0.0.1:8000"

[webrtc]
role = "answer"
room = "demo"
signal = "ws://relay.example:7999/ws"
stun_servers = ["stun.example:3478"]

[stream]
protocol = "/custom/1.0"
handler = "rpc"
rpc_path = "/rpc"
peer = "abc"
http_api = "127.0.0.1:9100"
"#;

    #[test]
    fn test_webrtc_defaults() {
        let args = WebRtcArgs {
            role: Some("offer".into()),
            room: Some("r".into()),
            ..Default::default()
        };
        let settings = args.resolve(&BridgeConfig::default()).unwrap();
        assert_eq!(settings.role, Role::Offerer);
        assert_eq!(settings.listen_http, DEFAULT_LISTEN_HTTP);
        assert_eq!(settings.upstream, None);
        assert_eq!(settings.signal_url, DEFAULT_SIGNAL_URL);
        assert_eq!(settings.timeout, Duration::from_secs(20));
        assert_eq!(settings.stun_servers, default_stun_servers());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = parse_config(FILE).unwrap();
        let settings = WebRtcArgs::default().resolve(&file).unwrap();
        assert_eq!(settings.role, Role::Answerer);
        assert_eq!(settings.room, "demo");
        assert_eq!(settings.listen_http, 9000);
        assert_eq!(settings.upstream.as_deref(), Some("http://127.0.0.1:8000"));
        assert_eq!(settings.timeout, Duration::from_secs(7));
        assert_eq!(settings.stun_servers, vec!["stun.example:3478".to_string()]);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = parse_config(FILE).unwrap();
        let args = WebRtcArgs {
            role: Some("offer".into()),
            timeout: Some(3),
            stun_servers: vec!["stun.cli:3478".into()],
            ..Default::default()
        };
        let settings = args.resolve(&file).unwrap();
        assert_eq!(settings.role, Role::Offerer);
        assert_eq!(settings.room, "demo");
        assert_eq!(settings.timeout, Duration::from_secs(3));
        assert_eq!(settings.stun_servers, vec!["stun.cli:3478".to_string()]);
    }

    #[test]
    fn test_webrtc_requires_role_and_room() {
        let err = WebRtcArgs::default()
            .resolve(&BridgeConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("--role"));

        let args = WebRtcArgs {
            role: Some("answer".into()),
            ..Default::default()
        };
        assert!(args.resolve(&BridgeConfig::default()).is_err());
    }

    #[test]
    fn test_stream_settings() {
        let file = parse_config(FILE).unwrap();
        let serve = StreamServeArgs::default().resolve(&file).unwrap();
        assert_eq!(serve.protocol, "/custom/1.0");
        assert_eq!(serve.handler, HandlerKind::Rpc);
        assert_eq!(serve.rpc_path, "/rpc");
        assert_eq!(serve.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(serve.http_api, Some("127.0.0.1:9100".parse().unwrap()));

        let connect = StreamConnectArgs::default().resolve(&file).unwrap();
        assert_eq!(connect.peer, "abc");
        assert_eq!(connect.listen_http, 9000);
        assert!(StreamConnectArgs::default()
            .resolve(&BridgeConfig::default())
            .is_err());
    }

    #[test]
    fn test_rpc_handler_needs_upstream() {
        let args = StreamServeArgs {
            handler: Some(HandlerKind::Rpc),
            ..Default::default()
        };
        assert!(args.resolve(&BridgeConfig::default()).is_err());

        let serve = StreamServeArgs::default()
            .resolve(&BridgeConfig::default())
            .unwrap();
        assert_eq!(serve.handler, HandlerKind::Envelope);
        assert_eq!(serve.protocol, DEFAULT_PROTOCOL);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, FILE).unwrap();
        let file = load_bridge_config(Some(&path)).unwrap();
        assert_eq!(file.timeout_secs, Some(7));

        assert!(load_bridge_config(Some(&dir.path().join("missing.toml"))).is_err());

        std::fs::write(&path, "bogus_key = 1").unwrap();
        assert!(load_bridge_config(Some(&path)).is_err());
    }
}
