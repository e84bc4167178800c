//! Socket and interface helpers for discovery

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Error, Result};

/// Fallback route target (TEST-NET-1, never actually contacted)
const ROUTE_PROBE_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 9);

/// Find the host's primary non-loopback IPv4 address
///
/// A pinned address is returned as-is. Otherwise the address the OS would use
/// as the source for traffic towards `group` is taken: connecting a UDP socket
/// only performs a route lookup, no packet is sent.
pub fn primary_ipv4(group: SocketAddrV4, pinned: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
    if let Some(ip) = pinned {
        return Ok(ip);
    }

    for target in [group, ROUTE_PROBE_ADDR] {
        match route_source(target) {
            Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => {
                debug!(ip = %ip, via = %target, "Primary address resolved");
                return Ok(ip);
            }
            Ok(ip) => debug!(ip = %ip, via = %target, "Route source is not usable"),
            Err(e) => debug!(via = %target, error = %e, "Route lookup failed"),
        }
    }

    Err(Error::NoUsableInterface {
        message: "no non-loopback IPv4 address has a route to the discovery group".to_string(),
    })
}

fn route_source(target: SocketAddrV4) -> std::io::Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(target)?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "route source is IPv6",
        )),
    }
}

/// Bind the socket a responder listens on
///
/// For a multicast group the wildcard address is bound and the group joined,
/// with address reuse so managers of different sessions can share the port.
/// Any other address is bound directly.
pub fn bind_group_socket(group: SocketAddrV4, interface: Option<Ipv4Addr>) -> Result<UdpSocket> {
    let bind_addr = if group.ip().is_multicast() {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())
    } else {
        group
    };
    let bind_err = |source: std::io::Error| Error::BindFailed {
        addr: SocketAddr::V4(bind_addr),
        source,
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&SocketAddr::V4(bind_addr).into()).map_err(bind_err)?;

    if group.ip().is_multicast() {
        let iface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(group.ip(), &iface).map_err(bind_err)?;
        socket.set_multicast_loop_v4(true).map_err(bind_err)?;
        debug!(group = %group, interface = %iface, "Joined discovery group");
    }

    UdpSocket::from_std(socket.into()).map_err(bind_err)
}
