//! Local address lookup for display and configuration.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Address family to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl AddressFamily {
    fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn loopback(self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    // Documentation ranges (RFC 5737 / RFC 3849). Only used to pick a route;
    // connecting a UDP socket sends nothing.
    fn probe_target(self) -> SocketAddr {
        match self {
            AddressFamily::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9),
            AddressFamily::V6 => SocketAddr::new(
                IpAddr::V6(Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 1)),
                9,
            ),
        }
    }
}

/// Return the first local address of `family`.
///
/// Prefers the address the host would use for outbound traffic and falls
/// back to the loopback address when the host has no route. Returns `None`
/// when the host has no address of that family at all.
pub fn local_address(family: AddressFamily) -> Option<IpAddr> {
    routed_address(family).or_else(|| loopback_address(family))
}

fn routed_address(family: AddressFamily) -> Option<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::new(family.unspecified(), 0)).ok()?;
    socket.connect(family.probe_target()).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

fn loopback_address(family: AddressFamily) -> Option<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::new(family.loopback(), 0)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_lookup_returns_ipv4() {
        let addr = local_address(AddressFamily::V4);
        assert!(addr.is_some(), "every host has at least IPv4 loopback");
        assert!(addr.unwrap().is_ipv4());
    }

    #[test]
    fn test_ipv6_lookup_matches_family_when_available() {
        match local_address(AddressFamily::V6) {
            Some(addr) => assert!(addr.is_ipv6()),
            None => eprintln!("IPv6 not available, skipping"),
        }
    }

    #[test]
    fn test_lookup_never_returns_unspecified() {
        for family in [AddressFamily::V4, AddressFamily::V6] {
            if let Some(addr) = local_address(family) {
                assert!(!addr.is_unspecified());
            }
        }
    }
}
