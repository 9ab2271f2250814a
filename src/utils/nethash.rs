//! Coarse network identity for a requester.
//!
//! Logins are ranked per network rather than per address: IPv4 clients are
//! grouped by their /16 prefix, IPv6 clients by a hash of their /48 prefix.

use std::net::IpAddr;

/// Hash the network of `addr` into a 16-bit value.
pub fn network_hash(addr: IpAddr) -> u16 {
    match addr.to_canonical() {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            u16::from_be_bytes([a, b])
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            let high = o[0].wrapping_add(o[2]).wrapping_add(o[4]);
            let low = o[1].wrapping_add(o[3]).wrapping_add(o[5]);
            u16::from_be_bytes([high, low])
        }
    }
}

/// Network hash for a request from `peer`.
///
/// Behind a local reverse proxy every peer is loopback, so the first
/// `X-Forwarded-For` entry is used instead when present. An entry that does
/// not parse as an address leaves the network undefined.
pub fn client_network_hash(peer: IpAddr, forwarded_for: Option<&str>) -> Option<u16> {
    let client = match forwarded_for {
        Some(header) if peer.to_canonical().is_loopback() => {
            match header.split(',').next().map(str::trim) {
                Some(first) if !first.is_empty() => first.parse::<IpAddr>().ok()?,
                _ => peer,
            }
        }
        _ => peer,
    };
    Some(network_hash(client))
}
