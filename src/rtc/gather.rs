//! Local UDP sockets and ICE candidate gathering.
//!
//! Host candidates come from one socket per non-loopback interface address.
//! Server-reflexive candidates come from wildcard sockets queried against
//! STUN, at most one per address family.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{Context, Result};
use get_if_addrs::get_if_addrs;
use str0m::Candidate;
use tokio::net::UdpSocket;

/// A bound UDP socket the session reads from and transmits on.
#[derive(Debug, Clone)]
pub struct LocalSocket {
    pub udp: Arc<UdpSocket>,
    pub local_addr: SocketAddr,
}

impl LocalSocket {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)
            .with_context(|| format!("Failed to bind UDP socket on {}", addr))?;
        Self::from_std(socket)
    }

    fn from_std(socket: std::net::UdpSocket) -> Result<Self> {
        socket
            .set_nonblocking(true)
            .context("Failed to set UDP socket nonblocking")?;
        let local_addr = socket.local_addr().context("UDP socket local addr")?;
        let udp = UdpSocket::from_std(socket).context("Failed to create tokio UDP socket")?;
        Ok(Self {
            udp: Arc::new(udp),
            local_addr,
        })
    }
}

/// A local candidate and the socket that carries it.
#[derive(Debug)]
pub struct Gathered {
    pub candidate: Candidate,
    pub socket: LocalSocket,
}

/// Non-loopback, non-multicast interface addresses.
pub fn list_interface_ips() -> Result<Vec<IpAddr>> {
    let mut ips = Vec::new();
    for iface in get_if_addrs().context("Failed to list network interfaces")? {
        let ip = iface.ip();
        if ip.is_loopback() || ip.is_multicast() {
            continue;
        }
        // Link-local v6 needs a scope id we do not carry in candidates.
        if let IpAddr::V6(v6) = ip {
            if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                continue;
            }
        }
        ips.push(ip);
    }
    Ok(ips)
}

/// Bind one socket per interface address and build its host candidate.
///
/// Falls back to loopback when the machine has no usable interface, so two
/// peers on one host can still connect.
pub fn gather_host() -> Result<Vec<Gathered>> {
    let mut ips = list_interface_ips()?;
    if ips.is_empty() {
        log::warn!("No non-loopback interfaces, using 127.0.0.1 for host candidates");
        ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    let mut gathered = Vec::new();
    for ip in ips {
        let socket = match LocalSocket::bind(SocketAddr::new(ip, 0)) {
            Ok(socket) => socket,
            Err(e) => {
                log::debug!("Skipping {}: {:#}", ip, e);
                continue;
            }
        };
        match Candidate::host(socket.local_addr, "udp") {
            Ok(candidate) => gathered.push(Gathered { candidate, socket }),
            Err(e) => log::debug!("No host candidate for {}: {}", socket.local_addr, e),
        }
    }
    anyhow::ensure!(!gathered.is_empty(), "No host candidates could be gathered");
    Ok(gathered)
}

pub fn resolve_stun_addrs(stun: &str) -> Vec<SocketAddr> {
    match stun.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(e) => {
            log::debug!("Failed to resolve STUN server {}: {}", stun, e);
            Vec::new()
        }
    }
}

/// Query STUN servers for our public mapping. The wildcard socket used for the
/// query is kept as the candidate's socket so the NAT binding stays valid.
pub async fn gather_server_reflexive(stun_servers: &[String]) -> Vec<Gathered> {
    let mut gathered = Vec::new();
    let mut got_ipv4 = false;
    let mut got_ipv6 = false;

    for stun in stun_servers {
        for server in resolve_stun_addrs(stun) {
            let is_ipv4 = server.is_ipv4();
            if (is_ipv4 && got_ipv4) || (!is_ipv4 && got_ipv6) {
                continue;
            }
            let bind_addr = if is_ipv4 {
                SocketAddr::from(([0, 0, 0, 0], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            };
            let socket = match LocalSocket::bind(bind_addr) {
                Ok(socket) => socket,
                Err(e) => {
                    log::warn!("Failed to bind STUN socket for {}: {:#}", server, e);
                    continue;
                }
            };

            let client = stunclient::StunClient::new(server);
            let external = match client.query_external_address_async(&socket.udp).await {
                Ok(external) => external,
                Err(e) => {
                    log::warn!("STUN query failed for {} ({}): {}", stun, server, e);
                    continue;
                }
            };

            match Candidate::server_reflexive(external, socket.local_addr, "udp") {
                Ok(candidate) => {
                    println!("STUN: {} -> external {}", socket.local_addr, external);
                    gathered.push(Gathered { candidate, socket });
                    if is_ipv4 {
                        got_ipv4 = true;
                    } else {
                        got_ipv6 = true;
                    }
                }
                Err(e) => log::warn!("Invalid server-reflexive candidate {}: {}", external, e),
            }
        }
    }
    gathered
}

/// OS errors that only mean one candidate pair is unusable.
pub fn is_no_route_error(err: &std::io::Error) -> bool {
    match err.raw_os_error() {
        Some(65) => true,  // macOS: No route to host
        Some(51) => true,  // ENETUNREACH
        Some(101) => true, // Linux: ENETUNREACH
        Some(113) => true, // Linux: No route to host
        _ => matches!(err.kind(), std::io::ErrorKind::NetworkUnreachable),
    }
}
