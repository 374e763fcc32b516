use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::Family;

const LISTEN_BACKLOG: i32 = 1024;

/// Creates a non-blocking TCP listener on the wildcard address of `family`.
///
/// Sets the `IPV6_V6ONLY` flag so we disallow IP4-mapped IPv6 addresses and
/// can bind to IP4 and IP6 addresses on the same port.
pub fn make_listen_socket(family: Family, port: u16) -> io::Result<mio::net::TcpListener> {
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    let domain = match family {
        Family::V4 => Domain::IPV4,
        Family::V6 => Domain::IPV6,
    };
    let address = match family {
        Family::V4 => IpAddr::from(Ipv4Addr::UNSPECIFIED),
        Family::V6 => IpAddr::from(Ipv6Addr::UNSPECIFIED),
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if family == Family::V6 {
        socket.set_only_v6(true)?;
    }

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(SocketAddr::new(address, port)))?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(mio::net::TcpListener::from_std(socket.into()))
}
