//! TCP accept loop for the streaming socket: one blocking `TcpListener`,
//! `socket2` for the options `std::net` doesn't expose, and non-blocking
//! per-connection sockets polled by a single receive-sweep thread rather
//! than one blocking thread per connection (spec.md §5: "avoids N blocking
//! threads; bounded latency because frames are outbound").

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Socket, TcpKeepalive, Type};
use tracing::{debug, warn};

use crate::error::ServerError;

pub struct ListenerConfig {
    pub bind: SocketAddr,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    pub socket_timeout: Duration,
}

/// Binds a listening socket with `SO_REUSEADDR` set so a restarted server
/// doesn't have to wait out `TIME_WAIT` on the previous bind.
pub fn bind(config: &ListenerConfig) -> Result<TcpListener, ServerError> {
    let domain = if config.bind.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)
        .map_err(|e| ServerError::NetworkFailed(format!("create listen socket: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ServerError::NetworkFailed(format!("set SO_REUSEADDR: {e}")))?;
    socket
        .bind(&config.bind.into())
        .map_err(|e| ServerError::NetworkFailed(format!("bind {}: {e}", config.bind)))?;
    socket
        .listen(128)
        .map_err(|e| ServerError::NetworkFailed(format!("listen: {e}")))?;
    socket
        .set_nonblocking(false)
        .map_err(|e| ServerError::NetworkFailed(format!("set blocking mode: {e}")))?;
    Ok(socket.into())
}

/// Applies per-connection socket options: keepalive, buffer sizes, and the
/// read/write timeout used to bound a stalled peer's blast radius.
pub fn configure_stream(stream: &TcpStream, config: &ListenerConfig) -> Result<(), ServerError> {
    stream
        .set_nodelay(true)
        .map_err(|e| ServerError::NetworkFailed(format!("set TCP_NODELAY: {e}")))?;
    stream
        .set_read_timeout(Some(config.socket_timeout))
        .map_err(|e| ServerError::NetworkFailed(format!("set read timeout: {e}")))?;
    stream
        .set_write_timeout(Some(config.socket_timeout))
        .map_err(|e| ServerError::NetworkFailed(format!("set write timeout: {e}")))?;

    let socket = socket2::SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    socket
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| ServerError::NetworkFailed(format!("set keepalive: {e}")))?;
    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| ServerError::NetworkFailed(format!("set recv buffer: {e}")))?;
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| ServerError::NetworkFailed(format!("set send buffer: {e}")))?;
    // Reads are driven by the receive-sweep loop, which expects a
    // `WouldBlock` rather than a multi-second block when nothing is
    // buffered; the read timeout set above still bounds kernel-level stalls
    // on a non-empty, slow-draining socket.
    stream
        .set_nonblocking(true)
        .map_err(|e| ServerError::NetworkFailed(format!("set non-blocking: {e}")))?;
    Ok(())
}

/// Accepts one connection, applying a short backoff on transient errors
/// (`EMFILE`/`ENFILE`/`ECONNABORTED`) instead of spinning the accept loop hot.
pub fn accept_with_backoff(
    listener: &TcpListener,
) -> Result<(TcpStream, SocketAddr), ServerError> {
    loop {
        match listener.accept() {
            Ok(pair) => return Ok(pair),
            Err(e) if is_transient(&e) => {
                warn!(error = %e, "transient accept error, backing off");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(ServerError::NetworkFailed(format!("accept failed: {e}"))),
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ECONNABORTED)
    )
}

pub fn log_accepted(addr: SocketAddr) {
    debug!(peer = %addr, "accepted connection");
}
