// src/snapshot.rs
// External disk snapshot controller: overlay planning, snapshot XML
// synthesis, create/revert/delete with correct ordering around VM power
// state, stale-overlay cleanup and (opt-in) permission repair.
//
// Snapshot calls go through virsh: the virt crate bindings do not cover the
// snapshot entry points.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use virt::domain::Domain;

use crate::agent::AgentClient;
use crate::errors::{HypervisorCode, LabError};
use crate::events::{EventSink, RunEvent, StepOutcome};
use crate::hypervisor::Hypervisor;
use crate::xml::{parse_domain_disks, parse_snapshot_meta, DomainDisk};

const OVERLAY_COLLISION_ATTEMPTS: usize = 3;

/// One planned overlay file for an eligible disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPlan {
    pub target_dev: String,
    pub base_file: PathBuf,
    pub overlay_file: PathBuf,
    pub driver_type: String,
}

/// One row of `list()`. Unreadable metadata shows up in `description`
/// instead of failing the whole listing.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub name: String,
    pub created: String,
    pub state: String,
    pub kind: String,
    pub description: String,
}

pub struct SnapshotController {
    uri: String,
    vm_name: String,
    keep_overlays: usize,
    permission_repair: bool,
    shutdown_timeout: Duration,
    sink: Arc<dyn EventSink>,
}

impl SnapshotController {
    pub fn new(
        uri: &str,
        vm_name: &str,
        keep_overlays: usize,
        permission_repair: bool,
        shutdown_timeout: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        SnapshotController {
            uri: uri.to_string(),
            vm_name: vm_name.to_string(),
            keep_overlays,
            permission_repair,
            shutdown_timeout,
            sink,
        }
    }

    async fn virsh(&self, args: &[&str]) -> Result<Output, LabError> {
        let mut cmd = Command::new("virsh");
        cmd.args(["--connect", &self.uri]).args(args);
        cmd.output().await.map_err(|e| LabError::SnapshotOperation {
            vm_name: self.vm_name.clone(),
            snapshot_name: String::new(),
            code: HypervisorCode::Other,
            message: format!("Failed to execute virsh: {e}"),
        })
    }

    /// Whether snapshot metadata with this name exists.
    pub async fn exists(&self, snapshot_name: &str) -> Result<bool, LabError> {
        let output = self
            .virsh(&["snapshot-dumpxml", &self.vm_name, snapshot_name])
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        match HypervisorCode::classify(&stderr) {
            HypervisorCode::NoDomainSnapshot => Ok(false),
            code => Err(LabError::SnapshotOperation {
                vm_name: self.vm_name.clone(),
                snapshot_name: snapshot_name.to_string(),
                code,
                message: format!("Error looking up snapshot: {}", stderr.trim()),
            }),
        }
    }

    /// Create an external, disk-only snapshot.
    pub async fn create(
        &self,
        domain: &Domain,
        agent: &AgentClient,
        snapshot_name: &str,
    ) -> Result<(), LabError> {
        info!(vm_name = %self.vm_name, snapshot_name, "Creating external snapshot");

        let domain_xml = domain.get_xml_desc(0).map_err(|e| {
            LabError::snapshot(&self.vm_name, snapshot_name, format!("XMLDesc failed: {e}"))
        })?;
        let disks = parse_domain_disks(&domain_xml)?;

        if self.permission_repair {
            self.repair_disk_permissions(&disks).await;
        }

        self.cleanup_old_overlays(&disks);

        // Freeze only when the guest is up and an agent answers.
        let running = domain.is_active().unwrap_or(false);
        let mut frozen = false;
        if running {
            if agent.ping().await {
                frozen = agent.fs_freeze().await;
                if frozen {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
            if !frozen {
                warn!(
                    vm_name = %self.vm_name,
                    "Agent freeze unavailable; relying on the QUIESCE flag for consistency"
                );
            }
        } else {
            debug!(vm_name = %self.vm_name, "VM not running, skipping filesystem freeze");
        }

        let quiesce = running && !frozen;
        let result = self
            .create_inner(snapshot_name, &disks, frozen, quiesce)
            .await;

        // Thaw no matter how the create went.
        if frozen && !agent.fs_thaw().await {
            error!(
                vm_name = %self.vm_name,
                "CRITICAL: filesystem thaw failed after a successful freeze; \
                 guest filesystems may be stuck frozen (run 'fsfreeze -u /' inside the VM)"
            );
        }

        result
    }

    async fn create_inner(
        &self,
        snapshot_name: &str,
        disks: &[DomainDisk],
        frozen: bool,
        quiesce: bool,
    ) -> Result<(), LabError> {
        let plans = plan_overlays(disks, snapshot_name)?;
        let snapshot_xml = generate_snapshot_xml(snapshot_name, &plans, frozen);
        debug!(vm_name = %self.vm_name, xml = %snapshot_xml, "Generated snapshot XML");

        let mut attempt = self
            .run_snapshot_create(snapshot_name, &snapshot_xml, quiesce)
            .await;

        // One repair-and-retry round for permission faults.
        if let Err(ref err) = attempt {
            if err.hypervisor_code() == Some(HypervisorCode::PermissionDenied)
                && self.permission_repair
            {
                warn!(
                    vm_name = %self.vm_name,
                    "Snapshot create hit a permission fault; repairing and retrying once"
                );
                self.repair_disk_permissions(disks).await;
                attempt = self
                    .run_snapshot_create(snapshot_name, &snapshot_xml, quiesce)
                    .await;
            }
        }
        attempt?;

        info!(vm_name = %self.vm_name, snapshot_name, "External snapshot created");
        Ok(())
    }

    async fn run_snapshot_create(
        &self,
        snapshot_name: &str,
        snapshot_xml: &str,
        quiesce: bool,
    ) -> Result<(), LabError> {
        let mut xml_file = tempfile::NamedTempFile::new().map_err(LabError::Io)?;
        xml_file
            .write_all(snapshot_xml.as_bytes())
            .map_err(LabError::Io)?;
        let xml_path = xml_file.path().to_string_lossy().into_owned();

        let mut args = vec![
            "snapshot-create",
            self.vm_name.as_str(),
            xml_path.as_str(),
            "--disk-only",
            "--atomic",
        ];
        if quiesce {
            args.push("--quiesce");
        }

        let output = self.virsh(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let code = HypervisorCode::classify(stderr);
        let message = match code {
            HypervisorCode::ConfigExist => {
                format!("Snapshot metadata '{snapshot_name}' already exists. Delete it first.")
            }
            HypervisorCode::AgentUnresponsive if quiesce => format!(
                "Snapshot creation failed: the QUIESCE flag requires guest agent \
                 interaction, but the agent was unresponsive ({stderr})"
            ),
            HypervisorCode::OperationInvalid => format!(
                "Snapshot creation failed (operation invalid): check snapshot flags and \
                 disk configuration. Libvirt error: {stderr}"
            ),
            _ => format!("Error creating external snapshot: {stderr}"),
        };
        Err(LabError::SnapshotOperation {
            vm_name: self.vm_name.clone(),
            snapshot_name: snapshot_name.to_string(),
            code,
            message,
        })
    }

    /// Revert the domain to a named snapshot. Disk-only external snapshots
    /// leave the VM off afterwards; a running VM is logged, not failed.
    pub async fn revert(
        &self,
        hypervisor: &Hypervisor,
        domain: &Domain,
        snapshot_name: &str,
    ) -> Result<(), LabError> {
        info!(vm_name = %self.vm_name, snapshot_name, "Reverting to snapshot");

        if !self.exists(snapshot_name).await? {
            return Err(LabError::SnapshotOperation {
                vm_name: self.vm_name.clone(),
                snapshot_name: snapshot_name.to_string(),
                code: HypervisorCode::NoDomainSnapshot,
                message: format!("Snapshot '{snapshot_name}' not found. Cannot revert."),
            });
        }

        if domain.is_active().unwrap_or(false) {
            warn!(vm_name = %self.vm_name, "VM is running; shutting down before revert");
            hypervisor.shutdown(domain, self.shutdown_timeout).await?;
            if domain.is_active().unwrap_or(false) {
                return Err(LabError::snapshot(
                    &self.vm_name,
                    snapshot_name,
                    "VM failed to shut down before revert. Aborting.",
                ));
            }
        }

        // FORCE tolerates the state mismatch disk-only snapshots produce.
        let mut output = self
            .virsh(&["snapshot-revert", &self.vm_name, snapshot_name, "--force"])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if HypervisorCode::classify(&stderr) == HypervisorCode::ArgumentUnsupported {
                debug!("--force not supported by this libvirt; retrying plain revert");
                output = self
                    .virsh(&["snapshot-revert", &self.vm_name, snapshot_name])
                    .await?;
            }
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LabError::snapshot(
                &self.vm_name,
                snapshot_name,
                format!("Error reverting to snapshot: {}", stderr.trim()),
            ));
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        if domain.is_active().unwrap_or(false) {
            warn!(
                vm_name = %self.vm_name,
                "VM is running after disk-only revert; this is unexpected"
            );
        } else {
            debug!(vm_name = %self.vm_name, "VM is shut off after revert (expected)");
        }
        info!(vm_name = %self.vm_name, snapshot_name, "Revert complete");
        Ok(())
    }

    /// Delete a named snapshot. The VM is powered off first; a snapshot
    /// that is already gone counts as success. Overlay files may survive an
    /// asynchronous block commit; that is acceptable.
    pub async fn delete(
        &self,
        hypervisor: &Hypervisor,
        domain: &Domain,
        snapshot_name: &str,
    ) -> Result<(), LabError> {
        info!(vm_name = %self.vm_name, snapshot_name, "Deleting snapshot");

        if !self.exists(snapshot_name).await? {
            info!(
                vm_name = %self.vm_name,
                snapshot_name, "Snapshot already deleted or never existed"
            );
            return Ok(());
        }

        if domain.is_active().unwrap_or(false) {
            warn!(vm_name = %self.vm_name, "VM is running; shutting down before delete");
            hypervisor.shutdown(domain, self.shutdown_timeout).await?;
            if domain.is_active().unwrap_or(false) {
                return Err(LabError::snapshot(
                    &self.vm_name,
                    snapshot_name,
                    "VM failed to shut down before snapshot delete. Aborting.",
                ));
            }
        }

        let disks = domain
            .get_xml_desc(0)
            .ok()
            .and_then(|xml| parse_domain_disks(&xml).ok())
            .unwrap_or_default();
        if self.permission_repair {
            self.repair_disk_permissions(&disks).await;
        }

        // Metadata-only first; it cannot trip over overlay file access.
        let output = self
            .virsh(&["snapshot-delete", &self.vm_name, snapshot_name, "--metadata"])
            .await?;
        if output.status.success() {
            info!(vm_name = %self.vm_name, snapshot_name, "Snapshot metadata deleted");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match HypervisorCode::classify(&stderr) {
            // Lost a race with another delete; the post-condition holds.
            HypervisorCode::NoDomainSnapshot => Ok(()),
            HypervisorCode::PermissionDenied => {
                if self.permission_repair {
                    warn!(
                        vm_name = %self.vm_name,
                        "Metadata delete hit a permission fault; repairing and retrying"
                    );
                    self.repair_disk_permissions(&disks).await;
                }
                // Retry with no flags: libvirt merges or drops the overlay
                // as it sees fit.
                let retry = self
                    .virsh(&["snapshot-delete", &self.vm_name, snapshot_name])
                    .await?;
                if retry.status.success() {
                    info!(vm_name = %self.vm_name, snapshot_name, "Snapshot deleted on retry");
                    Ok(())
                } else {
                    let retry_err = String::from_utf8_lossy(&retry.stderr);
                    Err(LabError::snapshot(
                        &self.vm_name,
                        snapshot_name,
                        format!(
                            "Snapshot deletion failed even after retry: {}",
                            retry_err.trim()
                        ),
                    ))
                }
            }
            code => Err(LabError::SnapshotOperation {
                vm_name: self.vm_name.clone(),
                snapshot_name: snapshot_name.to_string(),
                code,
                message: format!("Error deleting snapshot: {}", stderr.trim()),
            }),
        }
    }

    /// Per-snapshot metadata rows. A snapshot whose metadata cannot be read
    /// is reported in place rather than failing the listing.
    pub async fn list(&self) -> Result<Vec<SnapshotRow>, LabError> {
        let output = self.virsh(&["snapshot-list", &self.vm_name, "--name"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LabError::snapshot(
                &self.vm_name,
                "",
                format!("Error listing snapshots: {}", stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut rows = Vec::new();
        for name in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let dump = self
                .virsh(&["snapshot-dumpxml", &self.vm_name, name])
                .await?;
            if !dump.status.success() {
                let stderr = String::from_utf8_lossy(&dump.stderr);
                let detail = if HypervisorCode::classify(&stderr) == HypervisorCode::NoDomainSnapshot
                {
                    "(disappeared)".to_string()
                } else {
                    format!("(error reading metadata: {})", stderr.trim())
                };
                rows.push(SnapshotRow {
                    name: name.to_string(),
                    created: "N/A".to_string(),
                    state: "N/A".to_string(),
                    kind: "Unknown".to_string(),
                    description: detail,
                });
                continue;
            }

            let xml = String::from_utf8_lossy(&dump.stdout);
            match parse_snapshot_meta(&xml) {
                Ok(meta) => rows.push(SnapshotRow {
                    name: name.to_string(),
                    created: meta
                        .created_epoch
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "N/A".to_string()),
                    kind: meta.kind_label(),
                    state: meta.state.unwrap_or_else(|| "N/A".to_string()),
                    description: meta
                        .description
                        .unwrap_or_else(|| "No description".to_string()),
                }),
                Err(e) => rows.push(SnapshotRow {
                    name: name.to_string(),
                    created: "N/A".to_string(),
                    state: "N/A".to_string(),
                    kind: "Unknown".to_string(),
                    description: format!("(error parsing XML: {e})"),
                }),
            }
        }
        Ok(rows)
    }

    /// Remove stale overlay files beyond the keep-count, newest first.
    /// Best effort: failures are logged and skipped.
    fn cleanup_old_overlays(&self, disks: &[DomainDisk]) {
        for disk in disks.iter().filter(|d| d.snapshot_eligible()) {
            let Some(base) = disk.source_file.as_deref() else {
                continue;
            };
            let removed = cleanup_overlays_for_base(base, self.keep_overlays);
            for path in removed {
                info!(vm_name = %self.vm_name, overlay = %path.display(), "Removed stale overlay");
            }
        }
    }

    /// Chown/chmod disk and overlay files the hypervisor identity cannot
    /// access, then bounce libvirtd so the change takes effect. Every
    /// mutation is evented; nothing here runs silently.
    async fn repair_disk_permissions(&self, disks: &[DomainDisk]) {
        let mut candidates: Vec<PathBuf> = Vec::new();
        for disk in disks.iter().filter(|d| d.snapshot_eligible()) {
            if let Some(base) = disk.source_file.clone() {
                candidates.extend(list_overlays_for_base(&base));
                candidates.push(base);
            }
        }

        let mut repaired_any = false;
        for path in candidates {
            if !path.exists() {
                continue;
            }
            match file_needs_repair(&path).await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    debug!(path = %path.display(), "Could not inspect permissions: {e}");
                    continue;
                }
            }

            warn!(path = %path.display(), "Repairing disk file ownership for hypervisor access");
            let path_str = path.to_string_lossy().into_owned();
            let chown = Command::new("sudo")
                .args(["chown", "libvirt-qemu:libvirt", &path_str])
                .output()
                .await;
            let chmod = Command::new("sudo")
                .args(["chmod", "660", &path_str])
                .output()
                .await;

            let ok = matches!(&chown, Ok(o) if o.status.success())
                && matches!(&chmod, Ok(o) if o.status.success());
            self.sink.emit(RunEvent::PermissionRepaired {
                path: path_str,
                outcome: if ok {
                    StepOutcome::Passed
                } else {
                    StepOutcome::Error
                },
                detail: if ok {
                    None
                } else {
                    Some("chown/chmod failed".to_string())
                },
            });
            repaired_any |= ok;
        }

        if repaired_any {
            warn!("Restarting libvirtd after permission repair");
            let restart = Command::new("sudo")
                .args(["systemctl", "restart", "libvirtd"])
                .output()
                .await;
            if !matches!(&restart, Ok(o) if o.status.success()) {
                warn!("Could not restart libvirtd after permission repair");
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
    }
}

/// Whether the hypervisor identity can use this file: owned by
/// libvirt-qemu or group libvirt, with rw for owner and group.
async fn file_needs_repair(path: &Path) -> Result<bool, LabError> {
    let output = Command::new("stat")
        .args(["--format=%U:%G:%a"])
        .arg(path)
        .output()
        .await
        .map_err(LabError::Io)?;
    if !output.status.success() {
        return Err(LabError::network(format!(
            "stat failed for {}",
            path.display()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parts: Vec<&str> = stdout.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(LabError::network(format!(
            "unexpected stat output: {}",
            stdout.trim()
        )));
    }
    let (owner, group, mode) = (parts[0], parts[1], parts[2]);
    let mode_bits = u32::from_str_radix(mode, 8).unwrap_or(0);
    let identity_ok = owner == "libvirt-qemu" || group == "libvirt";
    let mode_ok = mode_bits & 0o660 == 0o660;
    Ok(!(identity_ok && mode_ok))
}

/// Base-disk stem with any previous overlay suffix stripped, so repeated
/// snapshots do not pile suffixes onto each other.
fn clean_base_stem(base: &Path) -> String {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.find("-snap") {
        Some(idx) => stem[..idx].to_string(),
        None => stem,
    }
}

fn overlay_suffix(snapshot_name: &str, attempt: usize) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let digest = Sha256::digest(format!("{snapshot_name}-{nanos}-{attempt}").as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Plan one overlay per eligible disk. Overlay paths must not collide with
/// existing files; each collision gets a fresh hash, bounded.
pub fn plan_overlays(
    disks: &[DomainDisk],
    snapshot_name: &str,
) -> Result<Vec<OverlayPlan>, LabError> {
    let eligible: Vec<&DomainDisk> = disks.iter().filter(|d| d.snapshot_eligible()).collect();
    if eligible.is_empty() {
        return Err(LabError::snapshot(
            "",
            snapshot_name,
            "No suitable file-based disks found to snapshot.",
        ));
    }

    let mut plans = Vec::with_capacity(eligible.len());
    for disk in eligible {
        let base = disk.source_file.clone().expect("eligible disk has source");
        let dir = base.parent().ok_or_else(|| {
            LabError::snapshot(
                "",
                snapshot_name,
                format!("Base disk '{}' has no parent directory", base.display()),
            )
        })?;
        if !dir.is_dir() {
            return Err(LabError::snapshot(
                "",
                snapshot_name,
                format!(
                    "Directory '{}' for base disk '{}' does not exist.",
                    dir.display(),
                    base.display()
                ),
            ));
        }

        let stem = clean_base_stem(&base);
        let mut overlay = None;
        for attempt in 0..OVERLAY_COLLISION_ATTEMPTS {
            let candidate = dir.join(format!(
                "{stem}-snap-{}.qcow2",
                overlay_suffix(snapshot_name, attempt)
            ));
            if !candidate.exists() {
                overlay = Some(candidate);
                break;
            }
            warn!(overlay = %candidate.display(), "Overlay name collision, retrying with a fresh hash");
        }
        let overlay = overlay.ok_or_else(|| {
            LabError::snapshot(
                "",
                snapshot_name,
                format!(
                    "Could not find a free overlay name for '{}' after {} attempts",
                    base.display(),
                    OVERLAY_COLLISION_ATTEMPTS
                ),
            )
        })?;

        plans.push(OverlayPlan {
            target_dev: disk.target_dev.clone().expect("eligible disk has target"),
            base_file: base,
            overlay_file: overlay,
            driver_type: disk.driver_type.clone().unwrap_or_else(|| "qcow2".to_string()),
        });
    }
    Ok(plans)
}

/// `<domainsnapshot>` document referencing one external overlay per disk.
pub fn generate_snapshot_xml(snapshot_name: &str, plans: &[OverlayPlan], frozen: bool) -> String {
    let mut disks_xml = String::new();
    for plan in plans {
        disks_xml.push_str(&format!(
            "    <disk name='{}' snapshot='external'>\n      <driver type='{}'/>\n      <source file='{}'/>\n    </disk>\n",
            plan.target_dev,
            plan.driver_type,
            plan.overlay_file.display()
        ));
    }
    format!(
        "<domainsnapshot>\n  <name>{snapshot_name}</name>\n  <description>Practice run snapshot (agent freeze: {frozen})</description>\n  <disks>\n{disks_xml}  </disks>\n</domainsnapshot>\n"
    )
}

fn list_overlays_for_base(base: &Path) -> Vec<PathBuf> {
    let Some(dir) = base.parent() else {
        return Vec::new();
    };
    let stem = clean_base_stem(base);
    let prefix = format!("{stem}-snap-");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| {
                    let n = n.to_string_lossy();
                    n.starts_with(&prefix) && n.ends_with(".qcow2")
                })
                .unwrap_or(false)
        })
        .collect()
}

/// Delete overlays beyond `keep_count`, newest (by mtime) kept. Returns the
/// removed paths.
fn cleanup_overlays_for_base(base: &Path, keep_count: usize) -> Vec<PathBuf> {
    let mut overlays = list_overlays_for_base(base);
    overlays.sort_by_key(|p| {
        std::cmp::Reverse(
            p.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    let mut removed = Vec::new();
    for stale in overlays.into_iter().skip(keep_count) {
        match std::fs::remove_file(&stale) {
            Ok(()) => removed.push(stale),
            Err(e) => warn!(overlay = %stale.display(), "Could not remove stale overlay: {e}"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_domain_disks;

    fn disk(target: &str, source: &str) -> DomainDisk {
        DomainDisk {
            disk_type: "file".to_string(),
            device: "disk".to_string(),
            target_dev: Some(target.to_string()),
            source_file: Some(PathBuf::from(source)),
            driver_type: Some("qcow2".to_string()),
        }
    }

    #[test]
    fn plans_one_overlay_per_eligible_disk() {
        let dir = tempfile::tempdir().unwrap();
        let base_a = dir.path().join("vm-root.qcow2");
        let base_b = dir.path().join("vm-data.qcow2");
        std::fs::write(&base_a, b"x").unwrap();
        std::fs::write(&base_b, b"x").unwrap();

        let disks = vec![
            disk("vda", base_a.to_str().unwrap()),
            disk("vdb", base_b.to_str().unwrap()),
        ];
        let plans = plan_overlays(&disks, "practice").unwrap();
        assert_eq!(plans.len(), 2);
        let name_a = plans[0].overlay_file.file_name().unwrap().to_string_lossy();
        assert!(name_a.starts_with("vm-root-snap-"));
        assert!(name_a.ends_with(".qcow2"));
        // 8 hex chars between the prefix and the extension
        let suffix = name_a
            .strip_prefix("vm-root-snap-")
            .unwrap()
            .strip_suffix(".qcow2")
            .unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn overlay_names_do_not_stack_snapshot_suffixes() {
        let base = Path::new("/images/ubuntu24-snap-deadbeef.qcow2");
        assert_eq!(clean_base_stem(base), "ubuntu24");
    }

    #[test]
    fn no_eligible_disk_is_an_error() {
        let mut cdrom = disk("sda", "/images/seed.iso");
        cdrom.device = "cdrom".to_string();
        let err = plan_overlays(&[cdrom], "practice").unwrap_err();
        assert!(err.to_string().contains("No suitable file-based disks"));
    }

    #[test]
    fn missing_base_directory_is_an_error() {
        let disks = vec![disk("vda", "/nonexistent-labforge-dir/root.qcow2")];
        let err = plan_overlays(&disks, "practice").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn snapshot_xml_references_every_overlay() {
        let plans = vec![
            OverlayPlan {
                target_dev: "vda".to_string(),
                base_file: PathBuf::from("/images/root.qcow2"),
                overlay_file: PathBuf::from("/images/root-snap-12ab34cd.qcow2"),
                driver_type: "qcow2".to_string(),
            },
            OverlayPlan {
                target_dev: "vdb".to_string(),
                base_file: PathBuf::from("/images/data.raw"),
                overlay_file: PathBuf::from("/images/data-snap-56ef78aa.qcow2"),
                driver_type: "raw".to_string(),
            },
        ];
        let xml = generate_snapshot_xml("practice", &plans, true);
        assert!(xml.contains("<name>practice</name>"));
        assert!(xml.contains("agent freeze: true"));
        assert!(xml.contains("<disk name='vda' snapshot='external'>"));
        assert!(xml.contains("<source file='/images/root-snap-12ab34cd.qcow2'/>"));
        assert!(xml.contains("<driver type='raw'/>"));

        // The generated document parses back as an external snapshot.
        let meta = parse_snapshot_meta(&xml).unwrap();
        assert!(meta.external);
        assert_eq!(meta.name.as_deref(), Some("practice"));
    }

    #[test]
    fn planning_respects_full_domain_xml_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("ubuntu24.qcow2");
        std::fs::write(&base, b"x").unwrap();
        let xml = format!(
            r#"<domain>
              <devices>
                <disk type='file' device='disk'>
                  <driver name='qemu' type='qcow2'/>
                  <source file='{}'/>
                  <target dev='vda'/>
                </disk>
                <disk type='file' device='cdrom'>
                  <source file='/tmp/seed.iso'/>
                  <target dev='sda'/>
                </disk>
              </devices>
            </domain>"#,
            base.display()
        );
        let disks = parse_domain_disks(&xml).unwrap();
        let plans = plan_overlays(&disks, "practice").unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].target_dev, "vda");
    }

    #[test]
    fn stale_overlay_cleanup_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("vm.qcow2");
        std::fs::write(&base, b"base").unwrap();

        let mut created = Vec::new();
        for i in 0..7 {
            let p = dir.path().join(format!("vm-snap-{i:08x}.qcow2"));
            std::fs::write(&p, b"overlay").unwrap();
            created.push(p);
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        let removed = cleanup_overlays_for_base(&base, 5);
        assert_eq!(removed.len(), 2);
        // The two oldest are the ones that go.
        assert!(removed.contains(&created[0]));
        assert!(removed.contains(&created[1]));
        assert!(created[6].exists());
    }

    #[test]
    fn cleanup_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("vm.qcow2");
        std::fs::write(&base, b"base").unwrap();
        let other = dir.path().join("other-snap-00000000.qcow2");
        std::fs::write(&other, b"x").unwrap();

        let removed = cleanup_overlays_for_base(&base, 0);
        assert!(removed.is_empty());
        assert!(other.exists());
    }
}
