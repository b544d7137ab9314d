//! DCC address codec.
//!
//! The legacy DCC wire format carries the sender's IPv4 address as an
//! unsigned 32-bit integer in network byte order, written in decimal
//! (`127.0.0.1` travels as `2130706433`). IPv6 cannot be expressed in this
//! form and is rejected rather than mangled.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};

use super::error::AddressError;

/// Encode an IPv4 address as the DCC wire integer.
pub fn ip_to_u32(addr: IpAddr) -> Result<u32, AddressError> {
    match addr {
        IpAddr::V4(v4) => Ok(u32::from(v4)),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(u32::from)
            .ok_or_else(|| AddressError::NotIpv4(v6.to_string())),
    }
}

pub fn u32_to_ip(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// Decode the decimal address field of a DCC message.
pub fn parse_wire_ip(raw: &str) -> Result<Ipv4Addr, AddressError> {
    raw.parse::<u32>()
        .map(u32_to_ip)
        .map_err(|_| AddressError::Malformed(raw.to_string()))
}

/// Resolve a dotted-quad or hostname to an IPv4 address.
pub async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr, AddressError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .ok_or_else(|| AddressError::NotIpv4(host.to_string())),
        };
    }

    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|_| AddressError::Unresolvable(host.to_string()))?;
    addrs
        .filter_map(|sa| match sa.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| AddressError::Unresolvable(host.to_string()))
}

/// The local address the OS would use to reach `remote`.
///
/// Connecting a UDP socket only picks a route; no packet is sent.
pub fn local_ipv4_towards(remote: SocketAddrV4) -> Option<Ipv4Addr> {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(remote)?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(IpAddr::V4(v4)) if !v4.is_unspecified() => Some(v4),
        _ => None,
    }
}

/// Best-effort guess at the address peers should connect to: the interface
/// that routes to the public internet, else loopback.
pub fn detect_local_ipv4() -> Ipv4Addr {
    let public = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 9);
    local_ipv4_towards(public).unwrap_or(Ipv4Addr::LOCALHOST)
}
