//! Source trust gate.
//!
//! The relay performs no SMTP authentication. A peer is trusted iff its
//! address is private, loopback or link-local.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Check whether a submitting peer sits inside the trusted network boundary.
///
/// Accepts a bare IP (`10.0.0.5`, `fe80::1%eth0`) or a socket address
/// (`[::1]:2525`). Anything unparseable is untrusted.
pub fn is_trusted_peer(address: Option<&str>) -> bool {
    let Some(address) = address.map(str::trim).filter(|a| !a.is_empty()) else {
        return false;
    };
    match parse_peer(address) {
        Some(ip) => is_trusted_ip(ip),
        None => false,
    }
}

/// Check a parsed address against the trusted ranges.
pub fn is_trusted_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_trusted_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_trusted_v4(v4),
            None => is_trusted_v6(v6),
        },
    }
}

fn parse_peer(address: &str) -> Option<IpAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(sock) = address.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    // Scoped IPv6 literal, e.g. fe80::1%eth0
    let (ip, _zone) = address.split_once('%')?;
    ip.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
}

fn is_trusted_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

fn is_trusted_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    ip.is_loopback() || unique_local || link_local
}
