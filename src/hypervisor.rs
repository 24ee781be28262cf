// src/hypervisor.rs
// Gateway to the libvirt daemon: connection handling, domain lookup and
// lifecycle. Snapshot plumbing lives in snapshot.rs.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::errors::{HypervisorCode, LabError};

/// Human vocabulary for libvirt domain state codes.
pub fn state_label(state: u32) -> &'static str {
    match state {
        sys::VIR_DOMAIN_RUNNING => "running",
        sys::VIR_DOMAIN_SHUTOFF => "shut off",
        sys::VIR_DOMAIN_PAUSED => "paused",
        sys::VIR_DOMAIN_CRASHED => "crashed",
        sys::VIR_DOMAIN_PMSUSPENDED => "suspended",
        sys::VIR_DOMAIN_BLOCKED => "blocked",
        sys::VIR_DOMAIN_SHUTDOWN => "shutting down",
        _ => "no state",
    }
}

/// One row of `list()`.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSummary {
    pub name: String,
    pub state: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub runtime_id: Option<u32>,
}

/// Owns one libvirt connection for the duration of a run. Closed explicitly
/// on all exit paths; double-close is a no-op.
pub struct Hypervisor {
    conn: Option<Connect>,
    uri: String,
}

impl Hypervisor {
    pub fn connect(uri: &str) -> Result<Self, LabError> {
        // Keep libvirt's default handler from spraying stderr; faults are
        // reported through our taxonomy.
        virt::error::clear_error_callback();
        match Connect::open(Some(uri)) {
            Ok(conn) => {
                info!(uri, "Connected to libvirt");
                Ok(Hypervisor {
                    conn: Some(conn),
                    uri: uri.to_string(),
                })
            }
            Err(e) => Err(LabError::HypervisorConnect {
                uri: uri.to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn conn_ref(&self) -> Result<&Connect, LabError> {
        self.conn
            .as_ref()
            .ok_or_else(|| LabError::HypervisorConnect {
                uri: self.uri.clone(),
                message: "connection already closed".to_string(),
            })
    }

    /// Close the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            match conn.close() {
                Ok(_) => debug!("Libvirt connection closed"),
                Err(e) => warn!("Error closing libvirt connection: {e}"),
            }
        }
    }

    /// Look up a domain by name.
    pub fn find(&self, vm_name: &str) -> Result<Domain, LabError> {
        let conn = self.conn_ref()?;
        match Domain::lookup_by_name(conn, vm_name) {
            Ok(domain) => {
                let running = domain.is_active().unwrap_or(false);
                debug!(vm_name, running, "Found VM");
                Ok(domain)
            }
            Err(e) => {
                let message = e.to_string();
                match HypervisorCode::classify(&message) {
                    HypervisorCode::NoDomain => Err(LabError::VmNotFound {
                        vm_name: vm_name.to_string(),
                    }),
                    code => Err(LabError::VmAccess {
                        vm_name: vm_name.to_string(),
                        code,
                        message,
                    }),
                }
            }
        }
    }

    /// All defined domains, running first. Running and defined-but-off sets
    /// can overlap depending on the driver; names are deduplicated.
    pub fn list(&self) -> Result<Vec<DomainSummary>, LabError> {
        let conn = self.conn_ref()?;
        let mut names: Vec<String> = Vec::new();
        let mut runtime_ids: std::collections::HashMap<String, u32> =
            std::collections::HashMap::new();

        if let Ok(active_ids) = conn.list_domains() {
            for id in active_ids {
                if let Ok(domain) = Domain::lookup_by_id(conn, id) {
                    if let Ok(name) = domain.get_name() {
                        runtime_ids.insert(name.clone(), id);
                        names.push(name);
                    }
                }
            }
        }
        if let Ok(defined) = conn.list_defined_domains() {
            names.extend(defined);
        }
        names.sort_unstable();
        names.dedup();

        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            let domain = match Domain::lookup_by_name(conn, &name) {
                Ok(d) => d,
                Err(e) => {
                    warn!(vm_name = %name, "Domain vanished while listing: {e}");
                    continue;
                }
            };
            let info = domain.get_info().map_err(|e| LabError::VmAccess {
                vm_name: name.clone(),
                code: HypervisorCode::classify(&e.to_string()),
                message: e.to_string(),
            })?;
            let runtime_id = runtime_ids.get(&name).copied();
            rows.push(DomainSummary {
                name,
                state: state_label(info.state).to_string(),
                cpu_count: info.nr_virt_cpu as u32,
                memory_mb: info.max_mem as u64 / 1024,
                runtime_id,
            });
        }
        Ok(rows)
    }

    /// Cheap probe that the handle still points at a live domain object.
    pub fn is_valid(domain: &Domain) -> bool {
        domain.get_info().is_ok()
    }

    /// Start the domain if it is not already running. Verifies the state
    /// shortly after the create call; an unexpected state is a warning, not
    /// a failure, since the create itself succeeded.
    pub async fn start(&self, domain: &Domain) -> Result<(), LabError> {
        let vm_name = domain.get_name().unwrap_or_default();
        if domain.is_active().unwrap_or(false) {
            info!(vm_name = %vm_name, "VM already running");
            return Ok(());
        }
        info!(vm_name = %vm_name, "Starting VM");
        domain.create().map_err(|e| LabError::VmAccess {
            vm_name: vm_name.clone(),
            code: HypervisorCode::classify(&e.to_string()),
            message: format!("Failed to start VM: {e}"),
        })?;

        tokio::time::sleep(Duration::from_secs(4)).await;
        match domain.get_info() {
            Ok(info) if info.state == sys::VIR_DOMAIN_RUNNING => {
                info!(vm_name = %vm_name, "VM is running");
            }
            Ok(info) => {
                warn!(
                    vm_name = %vm_name,
                    state = state_label(info.state),
                    "VM state unexpected shortly after start; proceeding"
                );
            }
            Err(e) => {
                warn!(vm_name = %vm_name, "Could not confirm VM state after start: {e}");
            }
        }
        Ok(())
    }

    /// Shut the domain down: graceful ACPI first, then a bounded wait, then
    /// a single forced destroy. Returns once the domain is off. A domain
    /// that disappears mid-wait counts as shut down.
    pub async fn shutdown(&self, domain: &Domain, timeout: Duration) -> Result<(), LabError> {
        let vm_name = domain.get_name().unwrap_or_default();
        if !domain.is_active().unwrap_or(false) {
            info!(vm_name = %vm_name, "VM already shut down");
            return Ok(());
        }

        info!(vm_name = %vm_name, "Sending ACPI shutdown");
        let mut acpi_sent = true;
        if let Err(e) = domain.shutdown() {
            let message = e.to_string();
            match HypervisorCode::classify(&message) {
                HypervisorCode::NoDomain => return Ok(()),
                HypervisorCode::OperationInvalid => {
                    // Raced with the guest powering itself off.
                    if !domain.is_active().unwrap_or(false) {
                        return Ok(());
                    }
                    acpi_sent = false;
                }
                _ => {
                    warn!(vm_name = %vm_name, "ACPI shutdown failed: {message}; will force off");
                    acpi_sent = false;
                }
            }
        }

        if acpi_sent {
            let poll = Duration::from_secs(3);
            let start = std::time::Instant::now();
            while start.elapsed() < timeout {
                match domain.is_active() {
                    Ok(false) => {
                        info!(vm_name = %vm_name, "VM shut down gracefully");
                        return Ok(());
                    }
                    Ok(true) => {}
                    Err(e) => {
                        if HypervisorCode::classify(&e.to_string()) == HypervisorCode::NoDomain {
                            warn!(vm_name = %vm_name, "VM disappeared during shutdown wait");
                            return Ok(());
                        }
                    }
                }
                tokio::time::sleep(poll).await;
            }
            warn!(
                vm_name = %vm_name,
                timeout_secs = timeout.as_secs(),
                "Graceful shutdown timed out; forcing power off"
            );
        }

        // Forced destroy, exactly once.
        if domain.is_active().unwrap_or(false) {
            domain.destroy().map_err(|e| LabError::VmAccess {
                vm_name: vm_name.clone(),
                code: HypervisorCode::classify(&e.to_string()),
                message: format!("Failed to force power off: {e}"),
            })?;
            info!(vm_name = %vm_name, "VM destroyed (forced power off)");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Ok(())
    }
}

impl Drop for Hypervisor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_vocabulary_matches_libvirt_codes() {
        assert_eq!(state_label(sys::VIR_DOMAIN_RUNNING), "running");
        assert_eq!(state_label(sys::VIR_DOMAIN_SHUTOFF), "shut off");
        assert_eq!(state_label(sys::VIR_DOMAIN_PAUSED), "paused");
        assert_eq!(state_label(sys::VIR_DOMAIN_CRASHED), "crashed");
        assert_eq!(state_label(sys::VIR_DOMAIN_PMSUSPENDED), "suspended");
        assert_eq!(state_label(sys::VIR_DOMAIN_BLOCKED), "blocked");
        assert_eq!(state_label(sys::VIR_DOMAIN_SHUTDOWN), "shutting down");
        assert_eq!(state_label(sys::VIR_DOMAIN_NOSTATE), "no state");
    }

    #[test]
    fn unknown_state_code_maps_to_no_state() {
        assert_eq!(state_label(250), "no state");
    }
}
