//! Whether an address belongs to this host. Shared memory only works when
//! both processes share a kernel.
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use nix::ifaddrs::getifaddrs;

use crate::Error;

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Addresses currently assigned to the host's interfaces.
pub fn local_addresses() -> Result<Vec<IpAddr>, Error> {
    let mut addrs = Vec::new();
    for ifa in getifaddrs()? {
        let Some(addr) = ifa.address else { continue };
        if let Some(sin) = addr.as_sockaddr_in() {
            addrs.push(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
        } else if let Some(sin6) = addr.as_sockaddr_in6() {
            addrs.push(IpAddr::V6(*SocketAddrV6::from(*sin6).ip()));
        }
    }
    Ok(addrs)
}

pub fn is_local(ip: IpAddr) -> Result<bool, Error> {
    let ip = canonical(ip);
    if ip.is_loopback() || ip.is_unspecified() {
        return Ok(true);
    }
    Ok(local_addresses()?.into_iter().any(|a| canonical(a) == ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn loopback_is_local() {
        assert!(is_local(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap());
        assert!(is_local(IpAddr::V6(Ipv6Addr::LOCALHOST)).unwrap());
        assert!(is_local(IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped())).unwrap());
    }

    #[test]
    fn documentation_range_is_remote() {
        // TEST-NET-3 is never assigned to a real interface.
        assert!(!is_local(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))).unwrap());
    }

    #[test]
    fn interface_addresses_are_local() {
        for addr in local_addresses().unwrap() {
            assert!(is_local(addr).unwrap());
        }
    }
}
