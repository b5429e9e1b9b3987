//! The Auto Port Mapper (spec.md §4.8): diff-driven ephemeral forward
//! lifecycle from guest port reports.
//!
//! Grounded on `capsa_net::dns_cache::DnsCache`'s insert/lookup/evict
//! reconciliation shape, generalized from a TTL-keyed cache to a
//! desired/mapped/blocked set diff that drives the port-forward
//! supervisor instead of just expiring entries.

use std::collections::{HashMap, HashSet};

use vmbridge_core::{ForwardSpec, GuestPort};

/// spec.md §4.8 "a lower bound `minimum_port = 1025`".
pub const DEFAULT_MINIMUM_PORT: u16 = 1025;

/// How many consecutive host ports to probe, starting at the guest port
/// itself, before giving up on mapping it this batch (spec.md §4.8 step 4
/// "probing `guest+1, guest+2, ... guest+99`").
const PROBE_WINDOW: u16 = 100;

/// A probe for whether a host port is free to bind, abstracted so tests
/// don't need real sockets.
pub trait PortProbe {
    fn is_free(&self, host_port: u16) -> bool;
}

/// Probes by actually attempting to bind `127.0.0.1:port`.
pub struct TcpBindProbe;

impl PortProbe for TcpBindProbe {
    fn is_free(&self, host_port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", host_port)).is_ok()
    }
}

/// Reconciles guest-reported listening ports against manual forwards and
/// a user blocklist, producing ephemeral [`ForwardSpec`]s for the
/// supervisor (spec.md §4.8).
#[derive(Default)]
pub struct AutoPortMapper {
    enabled: bool,
    minimum_port: u16,
    excluded: HashSet<u16>,
    manual_host_ports: HashSet<u16>,
    process_names: HashMap<u16, String>,
    /// guest_port -> host_port
    mapped: HashMap<u16, u16>,
    blocked: HashSet<u16>,
    newly_forwarded: HashSet<u16>,
}

impl AutoPortMapper {
    pub fn new() -> Self {
        Self {
            enabled: true,
            minimum_port: DEFAULT_MINIMUM_PORT,
            ..Default::default()
        }
    }

    pub fn with_excluded(mut self, excluded: impl IntoIterator<Item = u16>) -> Self {
        self.excluded = excluded.into_iter().collect();
        self
    }

    pub fn set_manual_host_ports(&mut self, ports: impl IntoIterator<Item = u16>) {
        self.manual_host_ports = ports.into_iter().collect();
    }

    pub fn mapped_forwards(&self) -> Vec<ForwardSpec> {
        self.mapped
            .iter()
            .map(|(&guest_port, &host_port)| ForwardSpec {
                host_port,
                guest_port,
                enabled: true,
            })
            .collect()
    }

    pub fn newly_forwarded_ports(&self) -> &HashSet<u16> {
        &self.newly_forwarded
    }

    pub fn process_name(&self, guest_port: u16) -> Option<&str> {
        self.process_names.get(&guest_port).map(String::as_str)
    }

    /// Reconciles one batch of guest-reported ports, returning the set of
    /// ephemeral forwards that should now exist (spec.md §4.8 "Per
    /// update" steps 1-5). `active_forward_host_ports` is the supervisor's
    /// current active set, consulted so a probe never collides with a
    /// forward already in flight.
    pub fn update(
        &mut self,
        reported: &[GuestPort],
        probe: &dyn PortProbe,
        active_forward_host_ports: &HashSet<u16>,
    ) -> Vec<ForwardSpec> {
        if !self.enabled {
            return Vec::new();
        }

        // Step 1: update process names for reported ports with non-empty names.
        for port in reported {
            if !port.process.is_empty() {
                self.process_names.insert(port.port, port.process.clone());
            }
        }

        // Step 2: desired = { p | p >= minimum_port AND p not excluded AND p not manual }.
        let desired: HashSet<u16> = reported
            .iter()
            .map(|p| p.port)
            .filter(|&p| p >= self.minimum_port)
            .filter(|p| !self.excluded.contains(p))
            .filter(|p| !self.manual_host_ports.contains(p))
            .collect();

        // Step 3: remove mappings for guest ports no longer desired.
        let stale: Vec<u16> = self
            .mapped
            .keys()
            .copied()
            .filter(|g| !desired.contains(g))
            .collect();
        for guest_port in stale {
            self.mapped.remove(&guest_port);
            self.process_names.remove(&guest_port);
        }

        // Step 4: attempt to bind a new forward for each newly desired port.
        let mut newly_forwarded = HashSet::new();
        for &guest_port in &desired {
            if self.mapped.contains_key(&guest_port) || self.blocked.contains(&guest_port) {
                continue;
            }
            if let Some(host_port) = self.find_free_host_port(guest_port, probe, active_forward_host_ports) {
                self.mapped.insert(guest_port, host_port);
                newly_forwarded.insert(guest_port);
            }
        }

        // Step 5: replace, not accumulate.
        self.newly_forwarded = newly_forwarded;

        self.mapped_forwards()
    }

    fn find_free_host_port(
        &self,
        guest_port: u16,
        probe: &dyn PortProbe,
        active_forward_host_ports: &HashSet<u16>,
    ) -> Option<u16> {
        for offset in 0..PROBE_WINDOW {
            let candidate = guest_port.checked_add(offset)?;
            if self.manual_host_ports.contains(&candidate)
                || self.mapped.values().any(|&h| h == candidate)
                || active_forward_host_ports.contains(&candidate)
            {
                continue;
            }
            if probe.is_free(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Removes any existing mapping for `guest_port`, blocks it, and
    /// drops it from this batch's newly-forwarded set (spec.md §4.8
    /// `block`).
    pub fn block(&mut self, guest_port: u16) {
        self.mapped.remove(&guest_port);
        self.blocked.insert(guest_port);
        self.newly_forwarded.remove(&guest_port);
    }

    /// Unblocks `guest_port`. Does not immediately re-forward it; the
    /// next [`Self::update`] restores the mapping (spec.md §4.8
    /// `unblock`).
    pub fn unblock(&mut self, guest_port: u16) {
        self.blocked.remove(&guest_port);
    }

    pub fn unblock_all(&mut self) {
        self.blocked.clear();
    }

    pub fn is_blocked(&self, guest_port: u16) -> bool {
        self.blocked.contains(&guest_port)
    }

    /// Tears down every auto-mapped forward and clears the blocklist,
    /// batch, and process-name caches when disabling (spec.md §4.8
    /// `setEnabled(false)`).
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.mapped.clear();
            self.blocked.clear();
            self.newly_forwarded.clear();
            self.process_names.clear();
        }
    }
}
