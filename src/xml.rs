// src/xml.rs
// Parsing of the libvirt XML descriptions the controller consumes: domain
// disk/interface topology and snapshot metadata.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::PathBuf;

use crate::errors::{HypervisorCode, LabError};

/// One `<disk>` device from a domain description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDisk {
    pub disk_type: String,
    pub device: String,
    pub target_dev: Option<String>,
    pub source_file: Option<PathBuf>,
    pub driver_type: Option<String>,
}

impl DomainDisk {
    /// File-backed data disks are the only snapshot candidates; CDROMs and
    /// block/network disks are skipped.
    pub fn snapshot_eligible(&self) -> bool {
        self.disk_type == "file"
            && self.device == "disk"
            && self.target_dev.is_some()
            && self.source_file.is_some()
    }
}

/// First `<interface type='network'>` of a domain, for DHCP lease lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainNic {
    pub mac: String,
    pub network: String,
}

/// Metadata distilled from a `<domainsnapshot>` description.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMeta {
    pub name: Option<String>,
    pub created_epoch: Option<i64>,
    pub state: Option<String>,
    pub description: Option<String>,
    pub external: bool,
    pub has_memory: bool,
}

impl SnapshotMeta {
    pub fn kind_label(&self) -> String {
        let base = if self.external { "External" } else { "Internal" };
        if self.has_memory {
            format!("{base}+Mem")
        } else {
            base.to_string()
        }
    }
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn parse_error(what: &str, err: impl std::fmt::Display) -> LabError {
    LabError::VmAccess {
        vm_name: String::new(),
        code: HypervisorCode::Other,
        message: format!("Error parsing {what} XML: {err}"),
    }
}

fn last_is(path: &[String], name: &str) -> bool {
    path.last().map(String::as_str) == Some(name)
}

/// Enumerate every `<devices>/<disk>` in a domain description.
pub fn parse_domain_disks(xml: &str) -> Result<Vec<DomainDisk>, LabError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut disks = Vec::new();
    let mut current: Option<DomainDisk> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                disk_element(&path, &name, &e, &mut current);
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                disk_element(&path, &name, &e, &mut current);
                if name == "disk" && last_is(&path, "devices") {
                    if let Some(disk) = current.take() {
                        disks.push(disk);
                    }
                }
            }
            Ok(Event::End(_)) => {
                let popped = path.pop();
                if popped.as_deref() == Some("disk") && last_is(&path, "devices") {
                    if let Some(disk) = current.take() {
                        disks.push(disk);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(parse_error("domain", e)),
        }
    }

    Ok(disks)
}

fn disk_element(path: &[String], name: &str, e: &BytesStart<'_>, current: &mut Option<DomainDisk>) {
    if name == "disk" && last_is(path, "devices") {
        *current = Some(DomainDisk {
            disk_type: attr(e, b"type").unwrap_or_default(),
            device: attr(e, b"device").unwrap_or_default(),
            target_dev: None,
            source_file: None,
            driver_type: None,
        });
        return;
    }
    if !last_is(path, "disk") {
        return;
    }
    if let Some(disk) = current.as_mut() {
        match name {
            "target" => disk.target_dev = attr(e, b"dev"),
            "driver" => disk.driver_type = attr(e, b"type"),
            "source" => disk.source_file = attr(e, b"file").map(PathBuf::from),
            _ => {}
        }
    }
}

/// First network-type interface (MAC + source network), if any.
pub fn parse_first_network_interface(xml: &str) -> Result<Option<DomainNic>, LabError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut in_network_iface = false;
    let mut mac: Option<String> = None;
    let mut network: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                iface_element(
                    &path,
                    &name,
                    &e,
                    &mut in_network_iface,
                    &mut mac,
                    &mut network,
                );
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                iface_element(
                    &path,
                    &name,
                    &e,
                    &mut in_network_iface,
                    &mut mac,
                    &mut network,
                );
            }
            Ok(Event::End(_)) => {
                let popped = path.pop();
                if popped.as_deref() == Some("interface") {
                    if in_network_iface {
                        if let (Some(m), Some(n)) = (&mac, &network) {
                            return Ok(Some(DomainNic {
                                mac: m.clone(),
                                network: n.clone(),
                            }));
                        }
                    }
                    in_network_iface = false;
                    mac = None;
                    network = None;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(parse_error("domain", e)),
        }
    }

    Ok(None)
}

fn iface_element(
    path: &[String],
    name: &str,
    e: &BytesStart<'_>,
    in_network_iface: &mut bool,
    mac: &mut Option<String>,
    network: &mut Option<String>,
) {
    if name == "interface" && last_is(path, "devices") {
        *in_network_iface = attr(e, b"type").as_deref() == Some("network");
        *mac = None;
        *network = None;
    } else if *in_network_iface && last_is(path, "interface") {
        match name {
            "mac" => *mac = attr(e, b"address"),
            "source" => *network = attr(e, b"network"),
            _ => {}
        }
    }
}

/// Distill `<domainsnapshot>` metadata for listing.
pub fn parse_snapshot_meta(xml: &str) -> Result<SnapshotMeta, LabError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut meta = SnapshotMeta::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                snapshot_element(&path, &name, &e, &mut meta);
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                snapshot_element(&path, &name, &e, &mut meta);
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| parse_error("snapshot", e))?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                if path.len() == 2 && path[0] == "domainsnapshot" {
                    match path[1].as_str() {
                        "name" => meta.name = Some(text.to_string()),
                        "creationTime" => meta.created_epoch = text.parse::<i64>().ok(),
                        "state" => meta.state = Some(text.to_string()),
                        "description" => meta.description = Some(text.to_string()),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(parse_error("snapshot", e)),
        }
    }

    Ok(meta)
}

fn snapshot_element(path: &[String], name: &str, e: &BytesStart<'_>, meta: &mut SnapshotMeta) {
    match name {
        "disk" if last_is(path, "disks") => {
            if attr(e, b"snapshot").as_deref() == Some("external") {
                meta.external = true;
            }
        }
        "memory" if last_is(path, "domainsnapshot") => {
            let snap = attr(e, b"snapshot").unwrap_or_else(|| "no".to_string());
            meta.has_memory = snap != "no";
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = r#"
    <domain type='kvm'>
      <name>ubuntu24-practice</name>
      <devices>
        <disk type='file' device='disk'>
          <driver name='qemu' type='qcow2'/>
          <source file='/var/lib/libvirt/images/ubuntu24.qcow2'/>
          <target dev='vda' bus='virtio'/>
        </disk>
        <disk type='file' device='cdrom'>
          <driver name='qemu' type='raw'/>
          <source file='/var/lib/libvirt/images/seed.iso'/>
          <target dev='sda' bus='sata'/>
          <readonly/>
        </disk>
        <disk type='block' device='disk'>
          <source dev='/dev/sdb'/>
          <target dev='vdb' bus='virtio'/>
        </disk>
        <interface type='network'>
          <mac address='52:54:00:aa:bb:cc'/>
          <source network='default'/>
          <model type='virtio'/>
        </interface>
      </devices>
    </domain>
    "#;

    #[test]
    fn finds_all_disks_and_eligibility() {
        let disks = parse_domain_disks(DOMAIN_XML).unwrap();
        assert_eq!(disks.len(), 3);

        let vda = &disks[0];
        assert!(vda.snapshot_eligible());
        assert_eq!(vda.target_dev.as_deref(), Some("vda"));
        assert_eq!(vda.driver_type.as_deref(), Some("qcow2"));
        assert_eq!(
            vda.source_file.as_deref(),
            Some(std::path::Path::new(
                "/var/lib/libvirt/images/ubuntu24.qcow2"
            ))
        );

        // CDROM and block device are filtered out
        assert!(!disks[1].snapshot_eligible());
        assert!(!disks[2].snapshot_eligible());
    }

    #[test]
    fn finds_first_network_interface() {
        let nic = parse_first_network_interface(DOMAIN_XML).unwrap().unwrap();
        assert_eq!(nic.mac, "52:54:00:aa:bb:cc");
        assert_eq!(nic.network, "default");
    }

    #[test]
    fn no_interface_yields_none() {
        let xml = "<domain><devices></devices></domain>";
        assert!(parse_first_network_interface(xml).unwrap().is_none());
    }

    #[test]
    fn parses_external_snapshot_meta() {
        let xml = r#"
        <domainsnapshot>
          <name>practice_external_snapshot</name>
          <description>Pre-run snapshot</description>
          <state>shutoff</state>
          <creationTime>1722500000</creationTime>
          <memory snapshot='no'/>
          <disks>
            <disk name='vda' snapshot='external'>
              <source file='/var/lib/libvirt/images/ubuntu24-snap-1a2b3c4d.qcow2'/>
            </disk>
          </disks>
        </domainsnapshot>
        "#;
        let meta = parse_snapshot_meta(xml).unwrap();
        assert_eq!(meta.name.as_deref(), Some("practice_external_snapshot"));
        assert_eq!(meta.created_epoch, Some(1722500000));
        assert_eq!(meta.state.as_deref(), Some("shutoff"));
        assert!(meta.external);
        assert!(!meta.has_memory);
        assert_eq!(meta.kind_label(), "External");
    }

    #[test]
    fn internal_snapshot_with_memory() {
        let xml = r#"
        <domainsnapshot>
          <name>full</name>
          <memory snapshot='internal' file=''/>
          <disks>
            <disk name='vda' snapshot='internal'/>
          </disks>
        </domainsnapshot>
        "#;
        let meta = parse_snapshot_meta(xml).unwrap();
        assert!(!meta.external);
        assert!(meta.has_memory);
        assert_eq!(meta.kind_label(), "Internal+Mem");
    }

    #[test]
    fn mismatched_end_tag_is_an_error() {
        let bad = "<domain><devices><disk></devices></domain>";
        assert!(parse_domain_disks(bad).is_err());
    }
}
