//! Listening socket setup

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

use socket2::{Domain, Protocol, Socket, Type};

const LISTEN_BACKLOG: i32 = 128;

/// Address to listen on for `iface`
///
/// `iface` may be an IP address or an interface name; an interface with
/// several addresses binds the first IPv4 one. All interfaces when `None`.
pub fn listen_addr(iface: Option<&str>, port: u16) -> io::Result<SocketAddr> {
    let Some(iface) = iface else {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    };
    if let Ok(ip) = iface.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<IpAddr> = if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|i| i.name == iface)
        .map(|i| i.ip())
        .collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .map(|ip| SocketAddr::new(*ip, port))
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no interface named {}", iface))
        })
}

/// Non-blocking TCP listener with address reuse
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}
