//! Client-side TCP socket helpers: connect-with-timeout and the same
//! `socket2` options the server applies to an accepted stream (spec.md
//! §4.2), so a connection looks identical from either end on the wire.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use socket2::{Domain, Socket, TcpKeepalive, Type};

use crate::error::ClientError;

pub struct StreamConfig {
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    pub socket_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
            socket_timeout: Duration::from_millis(5000),
        }
    }
}

/// Connects to `addr`, bounded by `timeout`, and applies [`StreamConfig`]
/// before handing the stream back. The returned stream is blocking; the
/// demux loop reads it directly rather than polling a non-blocking socket
/// the way the server's receive-sweep does, since a client owns exactly one
/// socket per device instead of sweeping many.
pub fn connect_with_timeout(
    addr: SocketAddr,
    timeout: Duration,
    config: &StreamConfig,
) -> Result<TcpStream, ClientError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)
        .map_err(|e| ClientError::NetworkFailed(format!("create socket: {e}")))?;
    socket
        .connect_timeout(&addr.into(), timeout)
        .map_err(|e| ClientError::NetworkFailed(format!("connect {addr}: {e}")))?;
    let stream: TcpStream = socket.into();
    configure_stream(&stream, config)?;
    Ok(stream)
}

pub fn configure_stream(stream: &TcpStream, config: &StreamConfig) -> Result<(), ClientError> {
    stream
        .set_nodelay(true)
        .map_err(|e| ClientError::NetworkFailed(format!("set TCP_NODELAY: {e}")))?;
    stream
        .set_read_timeout(Some(config.socket_timeout))
        .map_err(|e| ClientError::NetworkFailed(format!("set read timeout: {e}")))?;
    stream
        .set_write_timeout(Some(config.socket_timeout))
        .map_err(|e| ClientError::NetworkFailed(format!("set write timeout: {e}")))?;

    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    sock_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| ClientError::NetworkFailed(format!("set keepalive: {e}")))?;
    sock_ref
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| ClientError::NetworkFailed(format!("set recv buffer: {e}")))?;
    sock_ref
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| ClientError::NetworkFailed(format!("set send buffer: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connects_to_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect_with_timeout(addr, Duration::from_millis(500), &StreamConfig::default());
        assert!(stream.is_ok());
    }

    #[test]
    fn connect_to_closed_port_fails_quickly() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = connect_with_timeout(addr, Duration::from_millis(500), &StreamConfig::default());
        assert!(result.is_err());
    }
}
