//! Socket setup for partition connections.
//!
//! Connects are started non-blocking so the poll loop can drive many logins
//! concurrently; completion is observed as writability on the socket.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::options::ClusterOptions;

/// Resolves a host/port pair, preferring IPv4 like the other drivers do.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::connection(format!("could not resolve \"{host}\": {e}")))?
        .collect();
    addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| Error::connection(format!("no addresses for \"{host}\"")))
}

/// Starts a non-blocking connect and registers the socket with the runtime.
/// The returned stream is not yet connected; the caller watches for
/// writability and then checks the socket error.
pub(crate) fn start_connect(addr: SocketAddr, options: &ClusterOptions) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    apply_keepalive(&socket, options)?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e.into()),
    }

    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from_std(std_stream)?)
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}

fn apply_keepalive(socket: &Socket, options: &ClusterOptions) -> io::Result<()> {
    let mut keepalive = TcpKeepalive::new();
    if options.keepalive_idle > 0 {
        keepalive = keepalive.with_time(Duration::from_secs(options.keepalive_idle));
    }
    if options.keepalive_interval > 0 {
        keepalive = keepalive.with_interval(Duration::from_secs(options.keepalive_interval));
    }
    if options.keepalive_count > 0 {
        keepalive = keepalive.with_retries(options.keepalive_count);
    }
    socket.set_tcp_keepalive(&keepalive)
}
