//! UDP socket construction
//!
//! All proxy sockets come through here: socket2 for the options the
//! standard library does not expose (SO_REUSEPORT, buffer sizing),
//! then converted into a plain `std::net::UdpSocket`. Option order
//! mirrors the platform layer this replaces: buffers, bind, then
//! timeout or nonblocking mode.

use setu_common::{Address, ProxyError, ProxyResult};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::UdpSocket;
use std::time::Duration;

/// Receive timeout for blocking worker sockets. Bounds shutdown
/// latency: workers notice the quit flag within one timeout.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub enum SocketMode {
    /// Blocking receive with an optional timeout.
    Blocking { timeout: Option<Duration> },
    /// Nonblocking; receives return `WouldBlock` when drained.
    NonBlocking,
}

/// Create and bind a UDP socket.
pub fn create_udp_socket(
    bind_address: &Address,
    mode: SocketMode,
    reuse_port: bool,
    send_buffer_size: usize,
    receive_buffer_size: usize,
) -> ProxyResult<UdpSocket> {
    let addr = bind_address
        .to_socket_addr()
        .ok_or_else(|| ProxyError::Socket(format!("cannot bind {}", bind_address)))?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;

    socket.set_send_buffer_size(send_buffer_size)?;
    socket.set_recv_buffer_size(receive_buffer_size)?;

    socket.bind(&addr.into())?;

    match mode {
        SocketMode::Blocking { timeout } => {
            if let Some(timeout) = timeout {
                socket.set_read_timeout(Some(timeout))?;
            }
        }
        SocketMode::NonBlocking => {
            socket.set_nonblocking(true)?;
        }
    }

    Ok(socket.into())
}

/// Timeouts and empty reads are loop-continue conditions; anything
/// else means the socket is gone and the worker should exit.
#[inline]
#[must_use]
pub fn is_recv_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
