//! The Port-Forward Supervisor (spec.md §4.5): owns one [`TunnelListener`]
//! per enabled [`ForwardSpec`], reconciles a declarative configuration
//! set, and collects runtime errors into an observable slot.
//!
//! Grounded on `capsa_net::port_forward::PortForwarder`'s
//! `listener_handles: Vec<JoinHandle<()>>` + `stop()` + `Drop` shape,
//! generalized from a single NAT forwarder to a keyed collection of
//! per-host-port tunnel listeners.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use vmbridge_core::{ForwardSpec, GuestEndpoint, RuntimeError, RuntimeErrorPhase};

use crate::tunnel::TunnelListener;

type UserSink = Box<dyn Fn(RuntimeError) + Send + Sync>;

/// Owns the set of active [`TunnelListener`]s and reconciles it against a
/// declared [`ForwardSpec`] set (spec.md §4.5).
pub struct PortForwardSupervisor {
    endpoint: Arc<dyn GuestEndpoint>,
    listeners: Mutex<HashMap<u16, TunnelListener>>,
    last_runtime_error: Arc<Mutex<Option<RuntimeError>>>,
    error_sink: Arc<Mutex<Option<UserSink>>>,
}

impl PortForwardSupervisor {
    pub fn new(endpoint: Arc<dyn GuestEndpoint>) -> Self {
        Self {
            endpoint,
            listeners: Mutex::new(HashMap::new()),
            last_runtime_error: Arc::new(Mutex::new(None)),
            error_sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers a callback invoked whenever any listener reports a
    /// [`RuntimeError`], in addition to it being recorded for
    /// [`Self::last_runtime_error`] (spec.md §4.5 "error sink callback").
    pub async fn set_error_sink(&self, sink: impl Fn(RuntimeError) + Send + Sync + 'static) {
        *self.error_sink.lock().await = Some(Box::new(sink));
    }

    /// Builds the per-listener [`crate::tunnel::ErrorSink`] that records
    /// into `last_runtime_error` and forwards to the user-registered sink,
    /// both on the supervisor's own executor.
    fn make_error_sink(&self) -> crate::tunnel::ErrorSink {
        let last_runtime_error = self.last_runtime_error.clone();
        let error_sink = self.error_sink.clone();
        Arc::new(move |err: RuntimeError| {
            let last_runtime_error = last_runtime_error.clone();
            let error_sink = error_sink.clone();
            tokio::spawn(async move {
                *last_runtime_error.lock().await = Some(err.clone());
                if let Some(sink) = error_sink.lock().await.as_ref() {
                    sink(err);
                }
            });
        })
    }

    /// Starts a listener for every enabled spec (spec.md §4.5 `start`).
    pub async fn start(&self, specs: &[ForwardSpec]) {
        for spec in specs.iter().filter(|s| s.enabled) {
            self.add(spec.clone()).await;
        }
    }

    /// Stops every active listener (spec.md §4.5 `stop`).
    pub async fn stop(&self) {
        let mut listeners = self.listeners.lock().await;
        for (_, mut listener) in listeners.drain() {
            listener.stop().await;
        }
    }

    /// Adds a single forward. A duplicate `host_port` is a silent no-op
    /// (spec.md §4.5 "`add` rejects duplicate `host_port` silently"). A
    /// failure to bind surfaces an error of phase `ConnectToGuest`, for
    /// reporting consistency with in-flight connection failures.
    pub async fn add(&self, spec: ForwardSpec) {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&spec.host_port) {
            return;
        }

        let sink = self.make_error_sink();
        match TunnelListener::start(spec.host_port, spec.guest_port, self.endpoint.clone(), sink).await {
            Ok(listener) => {
                listeners.insert(spec.host_port, listener);
            }
            Err(e) => {
                let err = RuntimeError::new(
                    spec.host_port,
                    spec.guest_port,
                    RuntimeErrorPhase::ConnectToGuest,
                    e.to_string(),
                );
                *self.last_runtime_error.lock().await = Some(err.clone());
                if let Some(sink) = self.error_sink.lock().await.as_ref() {
                    sink(err);
                }
            }
        }
    }

    /// Removes the listener for `host_port`, if any (spec.md §4.5
    /// `remove`).
    pub async fn remove(&self, host_port: u16) {
        let mut listeners = self.listeners.lock().await;
        if let Some(mut listener) = listeners.remove(&host_port) {
            listener.stop().await;
        }
    }

    /// Declaratively reconciles the active set against `new_specs`:
    /// `current = listeners.keys`, `desired = enabled_specs.host_ports`;
    /// stops `current \ desired`, starts `desired \ current`. Idempotent
    /// (spec.md §4.5 `update`).
    pub async fn update(&self, new_specs: &[ForwardSpec]) {
        let desired: HashMap<u16, &ForwardSpec> = new_specs
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.host_port, s))
            .collect();

        let current: Vec<u16> = {
            let listeners = self.listeners.lock().await;
            listeners.keys().copied().collect()
        };

        for host_port in current {
            if !desired.contains_key(&host_port) {
                self.remove(host_port).await;
            }
        }

        for (host_port, spec) in desired {
            let already_active = {
                let listeners = self.listeners.lock().await;
                listeners.contains_key(&host_port)
            };
            if !already_active {
                self.add(spec.clone()).await;
            }
        }
    }

    /// The host ports with an active listener right now.
    pub async fn active_forwards(&self) -> Vec<u16> {
        self.listeners.lock().await.keys().copied().collect()
    }

    pub async fn last_runtime_error(&self) -> Option<RuntimeError> {
        self.last_runtime_error.lock().await.clone()
    }

    pub async fn clear_runtime_error(&self) {
        *self.last_runtime_error.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbridge_dev_transport::TcpEndpoint;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn add_is_idempotent_for_duplicate_host_port() {
        let endpoint: Arc<dyn GuestEndpoint> = Arc::new(TcpEndpoint::new());
        let supervisor = PortForwardSupervisor::new(endpoint);
        let host_port = free_port();
        let spec = ForwardSpec::new(host_port, 80);

        supervisor.add(spec.clone()).await;
        supervisor.add(spec).await;

        assert_eq!(supervisor.active_forwards().await.len(), 1);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn update_stops_removed_and_starts_added_forwards() {
        let endpoint: Arc<dyn GuestEndpoint> = Arc::new(TcpEndpoint::new());
        let supervisor = PortForwardSupervisor::new(endpoint);
        let port_a = free_port();
        let port_b = free_port();

        supervisor.start(&[ForwardSpec::new(port_a, 80)]).await;
        assert_eq!(supervisor.active_forwards().await, vec![port_a]);

        supervisor.update(&[ForwardSpec::new(port_b, 81)]).await;
        let active = supervisor.active_forwards().await;
        assert_eq!(active, vec![port_b]);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn failed_start_records_connect_to_guest_runtime_error() {
        // Binding the same host port twice with two supervisors makes the
        // second bind fail at the OS level.
        let endpoint: Arc<dyn GuestEndpoint> = Arc::new(TcpEndpoint::new());
        let supervisor_a = PortForwardSupervisor::new(endpoint.clone());
        let supervisor_b = PortForwardSupervisor::new(endpoint);
        let host_port = free_port();

        supervisor_a.add(ForwardSpec::new(host_port, 80)).await;
        supervisor_b.add(ForwardSpec::new(host_port, 80)).await;

        let err = supervisor_b.last_runtime_error().await;
        assert!(matches!(
            err.map(|e| e.phase),
            Some(RuntimeErrorPhase::ConnectToGuest)
        ));

        supervisor_a.stop().await;
        supervisor_b.stop().await;
    }
}
