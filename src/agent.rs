// src/agent.rs
// QEMU guest agent client. The agent side-channel is driven through
// `virsh qemu-agent-command`; interface inventory prefers the hypervisor's
// interfaceAddresses API with the agent source.

use serde_json::Value;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use virt::domain::Domain;
use virt::sys;

/// One guest NIC as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInterface {
    pub name: String,
    pub hwaddr: Option<String>,
    pub ipv4: Vec<String>,
}

/// Stateless client bound to one domain name. Agent absence is expected in
/// many environments: every operation degrades to `None`/`false` instead of
/// failing the run.
pub struct AgentClient {
    uri: String,
    vm_name: String,
}

impl AgentClient {
    pub fn new(uri: &str, vm_name: &str) -> Self {
        AgentClient {
            uri: uri.to_string(),
            vm_name: vm_name.to_string(),
        }
    }

    /// Send a JSON command to the guest agent. Returns the parsed response,
    /// `Some({})` when the agent acknowledged with no payload, and `None`
    /// when the agent is missing, unresponsive, or reported an error.
    pub async fn send(&self, command: &Value, timeout_secs: u64) -> Option<Value> {
        let payload = command.to_string();
        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs + 5),
            Command::new("virsh")
                .args([
                    "--connect",
                    &self.uri,
                    "qemu-agent-command",
                    &self.vm_name,
                    &payload,
                    "--timeout",
                    &timeout_secs.to_string(),
                ])
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(vm_name = %self.vm_name, "Failed to spawn virsh for agent command: {e}");
                return None;
            }
            Err(_) => {
                debug!(vm_name = %self.vm_name, "Agent command timed out at the host side");
                return None;
            }
        };

        if !output.status.success() {
            // Unresponsive/absent agent is the common case; keep it quiet.
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(vm_name = %self.vm_name, "Agent command failed: {}", stderr.trim());
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            // Success with no payload (fsfreeze-style commands).
            return Some(Value::Object(serde_json::Map::new()));
        }

        match serde_json::from_str::<Value>(stdout) {
            Ok(response) => {
                if let Some(err) = response.get("error") {
                    let class = err.get("class").and_then(Value::as_str).unwrap_or("GenericError");
                    let desc = err.get("desc").and_then(Value::as_str).unwrap_or("unknown error");
                    warn!(vm_name = %self.vm_name, class, desc, "Guest agent reported error");
                    None
                } else {
                    Some(response)
                }
            }
            Err(e) => {
                warn!(vm_name = %self.vm_name, "Could not decode agent response: {e}");
                None
            }
        }
    }

    /// Probe agent availability with `guest-ping`.
    pub async fn ping(&self) -> bool {
        self.send(&serde_json::json!({"execute": "guest-ping"}), 5)
            .await
            .is_some()
    }

    /// Freeze guest filesystems. `true` iff the agent reports a
    /// non-negative frozen count (an empty reply counts as zero).
    pub async fn fs_freeze(&self) -> bool {
        info!(vm_name = %self.vm_name, "Attempting filesystem freeze via guest agent");
        match self
            .send(&serde_json::json!({"execute": "guest-fsfreeze-freeze"}), 10)
            .await
        {
            Some(response) => {
                let frozen = response.get("return").and_then(Value::as_i64).unwrap_or(0);
                if frozen >= 0 {
                    info!(vm_name = %self.vm_name, frozen, "Filesystems frozen");
                    true
                } else {
                    warn!(vm_name = %self.vm_name, frozen, "Unexpected freeze reply");
                    false
                }
            }
            None => {
                warn!(vm_name = %self.vm_name, "Filesystem freeze failed or agent unavailable");
                false
            }
        }
    }

    /// Thaw guest filesystems. Must be called whenever `fs_freeze` returned
    /// `true`; a failed thaw can leave the guest stuck frozen, which the
    /// caller must surface as a critical condition.
    pub async fn fs_thaw(&self) -> bool {
        info!(vm_name = %self.vm_name, "Attempting filesystem thaw via guest agent");
        match self
            .send(&serde_json::json!({"execute": "guest-fsfreeze-thaw"}), 10)
            .await
        {
            Some(response) => {
                let thawed = response.get("return").and_then(Value::as_i64).unwrap_or(0);
                if thawed >= 0 {
                    info!(vm_name = %self.vm_name, thawed, "Filesystems thawed");
                    true
                } else {
                    warn!(vm_name = %self.vm_name, thawed, "Unexpected thaw reply");
                    false
                }
            }
            None => false,
        }
    }

    /// Guest NIC inventory: interfaceAddresses with the agent source first,
    /// then the raw agent command as fallback.
    pub async fn interfaces(&self, domain: &Domain) -> Vec<GuestInterface> {
        if !domain.is_active().unwrap_or(false) {
            return Vec::new();
        }

        match domain.interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT, 0) {
            Ok(ifaces) if !ifaces.is_empty() => {
                return ifaces
                    .into_iter()
                    .map(|iface| GuestInterface {
                        name: iface.name,
                        hwaddr: Some(iface.hwaddr),
                        ipv4: iface
                            .addrs
                            .into_iter()
                            .filter(|a| a.typed == 0)
                            .map(|a| a.addr)
                            .collect(),
                    })
                    .collect();
            }
            Ok(_) => {}
            Err(e) => {
                debug!(vm_name = %self.vm_name, "interfaceAddresses via agent failed: {e}");
            }
        }

        // Fallback: ask the agent directly.
        let response = self
            .send(
                &serde_json::json!({"execute": "guest-network-get-interfaces"}),
                10,
            )
            .await;
        parse_guest_interfaces(response.as_ref())
    }
}

/// Parse a `guest-network-get-interfaces` reply into NIC records.
pub fn parse_guest_interfaces(response: Option<&Value>) -> Vec<GuestInterface> {
    let Some(list) = response
        .and_then(|r| r.get("return"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|iface| {
            let name = iface.get("name").and_then(Value::as_str)?.to_string();
            let hwaddr = iface
                .get("hardware-address")
                .and_then(Value::as_str)
                .map(str::to_string);
            let ipv4 = iface
                .get("ip-addresses")
                .and_then(Value::as_array)
                .map(|addrs| {
                    addrs
                        .iter()
                        .filter(|a| {
                            a.get("ip-address-type").and_then(Value::as_str) == Some("ipv4")
                        })
                        .filter_map(|a| a.get("ip-address").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(GuestInterface { name, hwaddr, ipv4 })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_agent_interface_reply() {
        let reply = json!({
            "return": [
                {
                    "name": "lo",
                    "ip-addresses": [
                        {"ip-address-type": "ipv4", "ip-address": "127.0.0.1", "prefix": 8}
                    ]
                },
                {
                    "name": "enp1s0",
                    "hardware-address": "52:54:00:aa:bb:cc",
                    "ip-addresses": [
                        {"ip-address-type": "ipv6", "ip-address": "fe80::1", "prefix": 64},
                        {"ip-address-type": "ipv4", "ip-address": "192.168.122.50", "prefix": 24}
                    ]
                }
            ]
        });
        let ifaces = parse_guest_interfaces(Some(&reply));
        assert_eq!(ifaces.len(), 2);
        assert_eq!(ifaces[0].name, "lo");
        assert_eq!(ifaces[0].ipv4, vec!["127.0.0.1"]);
        assert_eq!(ifaces[1].name, "enp1s0");
        assert_eq!(ifaces[1].hwaddr.as_deref(), Some("52:54:00:aa:bb:cc"));
        assert_eq!(ifaces[1].ipv4, vec!["192.168.122.50"]);
    }

    #[test]
    fn missing_or_malformed_reply_is_empty() {
        assert!(parse_guest_interfaces(None).is_empty());
        assert!(parse_guest_interfaces(Some(&json!({"return": 3}))).is_empty());
        assert!(parse_guest_interfaces(Some(&json!({}))).is_empty());
    }
}
