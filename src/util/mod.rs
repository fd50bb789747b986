use std::net::{IpAddr, SocketAddr};

use rand::Rng;
use str0m::net::Protocol;
use str0m::Candidate;
use systemstat::{Platform, System};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::error::{BridgeError, Result};
use crate::model::tracks::MediaPorts;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second install fails in tests, which is fine.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn usable(ip: &std::net::Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local() && !ip.is_broadcast() && !ip.is_unspecified()
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Asks the routing table first through `local_ip_address`. If that comes
/// back with nothing routable, walks the interfaces `systemstat` reports,
/// skipping any loopback, link-local or broadcast addresses.
pub fn select_host_address() -> Result<IpAddr> {
    if let Ok(IpAddr::V4(v)) = local_ip_address::local_ip() {
        if usable(&v) {
            return Ok(IpAddr::V4(v));
        }
    }

    let system = System::new();
    let networks = system.networks()?;

    for (name, net) in &networks {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if usable(&v) {
                    info!("iface: {} / {}", name, v);
                    return Ok(IpAddr::V4(v));
                }
            }
        }
    }

    Err(BridgeError::Peer("found no usable network interface".into()))
}

pub fn host_candidate(addr: SocketAddr) -> Result<Candidate> {
    Candidate::host(addr, Protocol::Udp)
        .map_err(|e| BridgeError::Peer(format!("host candidate {addr}: {e}")))
}

/// Picks the two consumer ports for a session from `[start, end)`.
///
/// Both are even, distinct and at least two apart, so each one's RTCP
/// neighbour (`port + 1`) is free of the other.
pub fn allocate_ports<R: Rng>(rng: &mut R, start: u16, end: u16) -> MediaPorts {
    let first = start.div_ceil(2);
    // Highest even base whose RTCP port still fits below `end`.
    let last = (end - 1) / 2;
    let audio = rng.gen_range(first..last) * 2;
    let mut video = rng.gen_range(first..last) * 2;
    if video == audio {
        video = if audio + 2 < end - 1 { audio + 2 } else { audio - 2 };
    }
    debug!("allocated ports audio={} video={}", audio, video);
    MediaPorts { audio, video }
}
