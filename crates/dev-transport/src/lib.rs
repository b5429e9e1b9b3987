//! A loopback-TCP [`GuestEndpoint`] used as the guest stand-in in tests
//! and in host-side development against a non-virtualized guest
//! (spec.md §9, "Dual-transport (vsock vs TCP-for-development)").
//!
//! Grounded on `capsa::vsock::VsockSocket::connect` — a thin typed
//! connect wrapper — with `TcpStream` substituted for `UnixStream`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tokio::net::TcpStream;
use vmbridge_core::{GuestEndpoint, TransportError, VsockConnection};

/// Maps vsock port numbers to `127.0.0.1` TCP ports a test or dev-mode
/// guest stand-in is listening on.
#[derive(Debug, Clone, Default)]
pub struct TcpEndpoint {
    port_map: HashMap<u32, u16>,
}

impl TcpEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a vsock port -> host TCP port mapping.
    pub fn with_port(mut self, vsock_port: u32, tcp_port: u16) -> Self {
        self.port_map.insert(vsock_port, tcp_port);
        self
    }
}

#[async_trait]
impl GuestEndpoint for TcpEndpoint {
    async fn connect(
        &self,
        port: u32,
        timeout: Duration,
    ) -> Result<Box<dyn VsockConnection>, TransportError> {
        let tcp_port = *self
            .port_map
            .get(&port)
            .ok_or_else(|| TransportError::ConnectFailed(format!("no stand-in for port {port}")))?;
        let addr: SocketAddr = ([127, 0, 0, 1], tcp_port).into();
        tracing::debug!(vsock_port = port, %addr, "dev-transport connecting");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let std_stream = stream
            .into_std()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        std_stream
            .set_nonblocking(false)
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let fd: OwnedFd = std_stream.into();

        Ok(Box::new(TcpVsockConnection(fd)))
    }
}

struct TcpVsockConnection(OwnedFd);

impl VsockConnection for TcpVsockConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
