//! The guest-bridge engine: vsock transport, the HTTP control-channel
//! codec, the request client, the tunnel listener and its supervisor,
//! the event stream reader, the health monitor, the auto port mapper,
//! and the clipboard bridge.
//!
//! Depends only on `vmbridge_core`'s [`vmbridge_core::GuestEndpoint`] /
//! [`vmbridge_core::VsockConnection`] traits, never on a concrete
//! transport — `vmbridge-apple` and `vmbridge-dev-transport` supply
//! those.

mod automap;
mod client;
mod clipboard;
mod error;
mod events;
mod health;
mod http;
mod supervisor;
mod tunnel;
mod vsock;

pub use automap::{AutoPortMapper, PortProbe, TcpBindProbe, DEFAULT_MINIMUM_PORT};
pub use client::{ClipboardGetResponse, ProgressCallback, RequestClient};
pub use clipboard::{ClipboardBridge, HostPasteboard, UTI_PRIORITY};
pub use error::{ClientError, NetError};
pub use events::{spawn as spawn_event_stream, EventSink};
pub use health::spawn as spawn_health_monitor;
pub use http::{build_request, parse_response, parse_response_binary, BinaryResponse, HeaderMap, TextResponse};
pub use supervisor::PortForwardSupervisor;
pub use tunnel::{ErrorSink, TunnelListener};
pub use vsock::{
    async_handle, connect, pipe_bidirectional, read_once, write_all, COPY_BUFFER_SIZE,
};
