//! The seam between the engine (`vmbridge-net`) and a concrete vsock
//! backend (`vmbridge-apple`'s `Virtualization.framework` bridge, or
//! `vmbridge-dev-transport`'s TCP stand-in).
//!
//! Mirrors the `HypervisorBackend` / `BackendVmHandle` split: a small
//! `async_trait` object implemented once per backend, selected at
//! construction time rather than matched on per call (spec.md §9,
//! "dynamic dispatch over transport variants").

use crate::error::TransportError;
use std::os::fd::RawFd;
use std::time::Duration;

/// A logical handle to a running guest exposing a vsock-capable device.
///
/// Implementations are responsible for serializing every operation that
/// touches the underlying socket device onto a single executor (the "VM
/// executor" of spec.md §5) — callers never need to know that detail.
#[async_trait::async_trait]
pub trait GuestEndpoint: Send + Sync {
    /// Opens a vsock connection to `port` on this guest, failing with
    /// [`TransportError::Timeout`] if `timeout` elapses first.
    async fn connect(
        &self,
        port: u32,
        timeout: Duration,
    ) -> Result<Box<dyn VsockConnection>, TransportError>;
}

/// An owned, closable vsock connection.
///
/// The owning object must outlive every use of [`as_raw_fd`]; dropping it
/// closes the descriptor exactly once. Implementations wrap an
/// `OwnedFd` (or equivalent) so this invariant is enforced by the type
/// system rather than by convention.
///
/// [`as_raw_fd`]: VsockConnection::as_raw_fd
pub trait VsockConnection: Send + Sync {
    fn as_raw_fd(&self) -> RawFd;
}

/// A [`VsockConnection`] over any owned descriptor, for callers that
/// already have one (a host-accepted `TcpStream` converted to an
/// `OwnedFd`, for instance) and just need to plug it into the transport
/// layer alongside a real vsock connection.
pub struct OwnedFdConnection(std::os::fd::OwnedFd);

impl OwnedFdConnection {
    pub fn new(fd: std::os::fd::OwnedFd) -> Self {
        Self(fd)
    }
}

impl VsockConnection for OwnedFdConnection {
    fn as_raw_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.0.as_raw_fd()
    }
}
