//! Shared types and traits for the guest-bridge vsock fabric.
//!
//! This crate has no opinion on *how* a vsock connection is obtained
//! (`vmbridge-apple` and `vmbridge-dev-transport` each answer that); it
//! only defines the seam (`GuestEndpoint`/`VsockConnection`), the error
//! taxonomy, and the wire/config data model that every other crate in
//! the workspace builds on.

pub mod async_io;
pub mod endpoint;
pub mod error;
pub mod types;

pub use async_io::{AsyncOwnedFd, AsyncPipe};
pub use endpoint::{GuestEndpoint, OwnedFdConnection, VsockConnection};
pub use error::{TransportError, is_expected_disconnect};
pub use types::{
    ClipboardItem, ClipboardMode, Event, ForwardSpec, GuestPort, GuestPortList, HealthStatus,
    RuntimeError, RuntimeErrorPhase, ports,
};
