//! Wire and config data types shared across the fabric (spec.md §3).
//!
//! These carry no behavior beyond (de)serialization and the occasional
//! builder method, mirroring `capsa_core::vsock::VsockPortConfig`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// The well-known vsock ports this fabric speaks to (spec.md §6).
pub mod ports {
    pub const CONTROL: u32 = 5000;
    pub const TUNNEL: u32 = 5001;
    pub const HEALTH: u32 = 5002;
    pub const EVENT: u32 = 5003;
}

/// A user-declared mapping of a host TCP port to a guest TCP port
/// (spec.md §3 "Forward Spec"). Keyed by `host_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub host_port: u16,
    pub guest_port: u16,
    pub enabled: bool,
}

impl ForwardSpec {
    pub fn new(host_port: u16, guest_port: u16) -> Self {
        Self {
            host_port,
            guest_port,
            enabled: true,
        }
    }
}

/// The phase a forward runtime error occurred in (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeErrorPhase {
    ConnectToGuest,
    HandshakeWrite,
    HandshakeRead,
    HandshakeProtocol,
    Bridge,
}

/// An operational error surfaced by a tunnel listener (spec.md §3, §7
/// class 2). Expected disconnects are never represented by this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeError {
    pub host_port: u16,
    pub guest_port: u16,
    pub phase: RuntimeErrorPhase,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl RuntimeError {
    pub fn new(
        host_port: u16,
        guest_port: u16,
        phase: RuntimeErrorPhase,
        message: impl Into<String>,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            host_port,
            guest_port,
            phase,
            message: message.into(),
            timestamp_ms,
        }
    }
}

/// A guest-reported listening port, normalized from either wire shape
/// (spec.md §3 "Event Types" / §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestPort {
    pub port: u16,
    #[serde(default)]
    pub process: String,
}

impl<'de> Deserialize<'de> for GuestPortList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Entry {
            Legacy(u16),
            Full(GuestPort),
        }

        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(GuestPortList(
            entries
                .into_iter()
                .map(|e| match e {
                    Entry::Legacy(port) => GuestPort {
                        port,
                        process: String::new(),
                    },
                    Entry::Full(p) => p,
                })
                .collect(),
        ))
    }
}

impl Serialize for GuestPortList {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

/// A `ports` event's payload, accepting both the `{port, process}` object
/// form and the legacy bare-integer list form on deserialization.
#[derive(Debug, Clone, Default)]
pub struct GuestPortList(pub Vec<GuestPort>);

impl GuestPortList {
    pub fn into_inner(self) -> Vec<GuestPort> {
        self.0
    }
}

/// One NDJSON event line from the guest (spec.md §3, §4.6, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Files {
        files: Vec<String>,
    },
    Urls {
        urls: Vec<String>,
    },
    Ports {
        ports: GuestPortList,
    },
    App {
        name: String,
        #[serde(rename = "bundleId")]
        bundle_id: String,
        #[serde(default)]
        icon_base64: Option<String>,
    },
    Log {
        message: String,
    },
}

/// A clipboard payload crossing the host/guest boundary (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardItem {
    pub bytes: Vec<u8>,
    pub uti: String,
}

/// Clipboard bridge direction policy (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClipboardMode {
    Bidirectional,
    HostToGuest,
    GuestToHost,
    Disabled,
}

/// Health monitor tri-state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Connecting,
    Connected,
    NotFound,
}
