// src/network.rs
// SSH key validation, guest IP discovery and the remote execution driver.
// Remote commands run through the OpenSSH client; this tool does not speak
// the SSH protocol itself.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use virt::domain::Domain;
use virt::sys;

use crate::agent::AgentClient;
use crate::config::HostKeyPolicy;
use crate::errors::LabError;
use crate::xml::parse_first_network_interface;

/// Exit status when the remote side never delivered one (transport-level
/// failure paths keep this and set `error`).
pub const EXIT_STATUS_NO_STATUS: i64 = -1;
/// Internal sentinel for a command that outlived its timeout.
pub const EXIT_STATUS_TIMEOUT: i64 = -999;

/// OpenSSH client exit code for "something went wrong before/inside ssh
/// itself" (connection, auth, protocol).
const SSH_TRANSPORT_EXIT: i64 = 255;

/// Structured result of one remote command.
#[derive(Debug, Clone, Default)]
pub struct SshResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i64,
    pub error: Option<String>,
    pub execution_time: f64,
}

impl SshResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_status == 0
    }
}

/// Where to run remote commands.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub key_path: PathBuf,
}

impl SshTarget {
    /// The command a human would type to reach the same machine.
    pub fn connect_hint(&self) -> String {
        format!(
            "ssh {}@{} -i {}",
            self.user,
            self.host,
            self.key_path.display()
        )
    }
}

/// Validate the private key path: resolve `~`, require a regular file, and
/// warn (non-fatal) when group/other bits are set.
pub fn validate_ssh_key(raw_path: &str) -> Result<PathBuf, LabError> {
    let resolved = PathBuf::from(shellexpand::tilde(raw_path).into_owned());
    let metadata = std::fs::metadata(&resolved).map_err(|_| LabError::Network {
        message: format!("SSH key file not found: {}", resolved.display()),
    })?;
    if !metadata.is_file() {
        return Err(LabError::Network {
            message: format!("SSH key path is not a regular file: {}", resolved.display()),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                key = %resolved.display(),
                mode = format!("{mode:o}"),
                "SSH key file has insecure permissions; recommended: 600 or 400"
            );
        }
    }

    Ok(resolved)
}

fn eligible_ipv4(addr: &str) -> bool {
    if addr.starts_with("127.") || addr.starts_with("169.254.") {
        return false;
    }
    addr.parse::<std::net::Ipv4Addr>().is_ok()
}

fn first_eligible(
    ifaces: &[virt::domain::Interface],
    preferred_mac: Option<&str>,
) -> Option<String> {
    let pick = |iface: &virt::domain::Interface| {
        iface
            .addrs
            .iter()
            .filter(|a| a.typed == 0)
            .map(|a| a.addr.clone())
            .find(|a| eligible_ipv4(a))
    };

    if let Some(mac) = preferred_mac {
        let mac = mac.to_ascii_lowercase();
        if let Some(ip) = ifaces
            .iter()
            .filter(|i| i.hwaddr.to_ascii_lowercase() == mac)
            .find_map(pick)
        {
            return Some(ip);
        }
    }
    ifaces.iter().find_map(pick)
}

/// Discover the guest's IPv4 address: guest agent first, then the DHCP
/// lease table of the attached network, then the ARP cache.
pub async fn discover_ip(domain: &Domain, agent: &AgentClient) -> Result<String, LabError> {
    // 1. Agent inventory
    for iface in agent.interfaces(domain).await {
        if iface.name == "lo" {
            continue;
        }
        if let Some(ip) = iface.ipv4.iter().find(|a| eligible_ipv4(a)) {
            info!(ip = %ip, "Found guest IP via agent");
            return Ok(ip.clone());
        }
    }
    debug!("Agent IP retrieval failed or unavailable; trying DHCP leases");

    // Prefer the lease of the first network-type NIC when the XML names one.
    let preferred_mac = domain
        .get_xml_desc(0)
        .ok()
        .and_then(|xml| parse_first_network_interface(&xml).ok().flatten())
        .map(|nic| nic.mac);

    // 2. DHCP leases
    if let Ok(ifaces) = domain.interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
    {
        if let Some(ip) = first_eligible(&ifaces, preferred_mac.as_deref()) {
            info!(ip = %ip, "Found guest IP via DHCP lease");
            return Ok(ip);
        }
    }
    debug!("No usable DHCP lease; trying ARP table");

    // 3. ARP table
    if let Ok(ifaces) = domain.interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_ARP, 0) {
        if let Some(ip) = first_eligible(&ifaces, preferred_mac.as_deref()) {
            info!(ip = %ip, "Found guest IP via ARP table");
            return Ok(ip);
        }
    }

    Err(LabError::network(
        "Failed to obtain VM IP address via guest agent, DHCP leases, or ARP. \
         Check the VM network configuration and guest services.",
    ))
}

/// Drives remote commands over the OpenSSH client with structured capture.
/// One process per command; nothing is pooled.
#[derive(Debug, Clone)]
pub struct SshRunner {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
}

impl SshRunner {
    pub fn from_config(ssh: &crate::config::SshConfig) -> Self {
        SshRunner {
            connect_timeout: Duration::from_secs(ssh.connect_timeout_secs),
            command_timeout: Duration::from_secs(ssh.command_timeout_secs),
            host_key_policy: ssh.host_key_policy,
            readiness_timeout: Duration::from_secs(ssh.readiness_timeout_secs),
            readiness_poll: Duration::from_secs(ssh.readiness_poll_secs),
        }
    }

    fn ssh_args(&self, target: &SshTarget, connect_timeout: Duration) -> Vec<String> {
        let host_key_opt = match self.host_key_policy {
            // First-use trust: fine for throwaway practice VMs, and the
            // config knob exists precisely so deployments can tighten it.
            HostKeyPolicy::AcceptNew => "StrictHostKeyChecking=accept-new",
            HostKeyPolicy::Strict => "StrictHostKeyChecking=yes",
        };
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            host_key_opt.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-i".to_string(),
            target.key_path.to_string_lossy().into_owned(),
            format!("{}@{}", target.user, target.host),
        ]
    }

    /// Run one remote command. Remote non-zero exits come back in the
    /// result; only transport/auth failures and spawn errors are `Err`.
    pub async fn run(&self, target: &SshTarget, command: &str) -> Result<SshResult, LabError> {
        self.run_with_stdin(target, command, None, None).await
    }

    pub async fn run_with_stdin(
        &self,
        target: &SshTarget,
        command: &str,
        stdin_data: Option<&[u8]>,
        timeout_override: Option<Duration>,
    ) -> Result<SshResult, LabError> {
        let command_timeout = timeout_override.unwrap_or(self.command_timeout);
        let started = Instant::now();

        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(target, self.connect_timeout))
            .arg(command)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = %target.host, command, "Executing remote command");
        let mut child = cmd.spawn().map_err(|e| LabError::SshCommand {
            host: target.host.clone(),
            message: format!("Failed to spawn ssh: {e}"),
        })?;

        if let Some(data) = stdin_data {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            if let Err(e) = stdin.write_all(data).await {
                warn!(host = %target.host, "Error writing to command stdin: {e}");
            }
            // Dropping the handle half-closes the stream so the remote
            // command sees EOF.
            drop(stdin);
        }

        // Small grace on top of the command timeout for status delivery.
        let deadline = command_timeout + Duration::from_secs(5);
        let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(LabError::SshCommand {
                    host: target.host.clone(),
                    message: format!("Failed to collect ssh output: {e}"),
                });
            }
            Err(_) => {
                // kill_on_drop reaped the child when the future was dropped.
                let secs = command_timeout.as_secs();
                warn!(host = %target.host, command, "Remote command timed out after {secs}s");
                return Ok(SshResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_status: EXIT_STATUS_TIMEOUT,
                    error: Some(format!(
                        "Command execution timed out after {secs}s (waiting for exit status)."
                    )),
                    execution_time: started.elapsed().as_secs_f64(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let execution_time = started.elapsed().as_secs_f64();

        match output.status.code() {
            Some(code) if i64::from(code) == SSH_TRANSPORT_EXIT => {
                // Connection refused, no route, auth failure, host key
                // rejection: ssh itself failed, the command never ran.
                Err(LabError::SshCommand {
                    host: target.host.clone(),
                    message: if stderr.is_empty() {
                        "SSH transport failure (exit 255)".to_string()
                    } else {
                        stderr
                    },
                })
            }
            Some(code) => Ok(SshResult {
                stdout,
                stderr,
                exit_status: i64::from(code),
                error: None,
                execution_time,
            }),
            None => Ok(SshResult {
                stdout,
                stderr,
                exit_status: EXIT_STATUS_NO_STATUS,
                error: Some("Failed to retrieve command exit status.".to_string()),
                execution_time,
            }),
        }
    }

    /// Poll until SSH transport + authentication succeed once. A reachable
    /// server that rejects our key counts as ready (the VM is up; commands
    /// will fail loudly later) and is logged as a warning.
    pub async fn wait_for_ready(&self, target: &SshTarget) -> Result<(), LabError> {
        let timeout = self.readiness_timeout;
        let poll = self.readiness_poll;
        info!(
            host = %target.host,
            timeout_secs = timeout.as_secs(),
            "Waiting for VM SSH readiness"
        );

        let start = Instant::now();
        let mut last_error = "timeout".to_string();
        let probe = SshRunner {
            connect_timeout: Duration::from_secs((poll.as_secs().saturating_sub(1)).max(1)),
            command_timeout: poll,
            host_key_policy: self.host_key_policy,
            readiness_timeout: timeout,
            readiness_poll: poll,
        };

        while start.elapsed() < timeout {
            match probe.run(target, "true").await {
                Ok(result) if result.exit_status >= 0 => {
                    info!(host = %target.host, "VM SSH is ready");
                    return Ok(());
                }
                Ok(result) => {
                    last_error = result
                        .error
                        .unwrap_or_else(|| "no exit status".to_string());
                }
                Err(LabError::SshCommand { message, .. }) => {
                    if message.to_ascii_lowercase().contains("permission denied") {
                        warn!(
                            host = %target.host,
                            user = %target.user,
                            "SSH responded but authentication failed; check the key setup \
                             in the VM. Proceeding, but commands may fail."
                        );
                        return Ok(());
                    }
                    last_error = message;
                }
                Err(e) => return Err(e),
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            tokio::time::sleep(poll.min(remaining)).await;
        }

        Err(LabError::network(format!(
            "VM did not become SSH-ready at {} within {} seconds. Last status: {last_error}",
            target.host,
            timeout.as_secs()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> SshRunner {
        SshRunner {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            host_key_policy: HostKeyPolicy::AcceptNew,
            readiness_timeout: Duration::from_secs(120),
            readiness_poll: Duration::from_secs(5),
        }
    }

    fn target() -> SshTarget {
        SshTarget {
            host: "192.168.122.50".to_string(),
            user: "student".to_string(),
            key_path: PathBuf::from("/home/me/.ssh/id_ed25519"),
        }
    }

    #[test]
    fn key_validation_rejects_missing_and_non_file() {
        assert!(validate_ssh_key("/nonexistent/labforge-key").is_err());

        let dir = tempfile::tempdir().unwrap();
        assert!(validate_ssh_key(dir.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn key_validation_accepts_regular_file_regardless_of_mode() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, b"fake-key").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o644)).unwrap();
        }
        // Loose permissions only warn.
        let resolved = validate_ssh_key(key.to_str().unwrap()).unwrap();
        assert_eq!(resolved, key);
    }

    #[test]
    fn loopback_and_link_local_are_ineligible() {
        assert!(!eligible_ipv4("127.0.0.1"));
        assert!(!eligible_ipv4("127.1.2.3"));
        assert!(!eligible_ipv4("169.254.10.10"));
        assert!(!eligible_ipv4("not-an-ip"));
        assert!(eligible_ipv4("192.168.122.50"));
        assert!(eligible_ipv4("10.0.0.7"));
    }

    #[test]
    fn ssh_args_carry_policy_and_timeouts() {
        let r = runner();
        let args = r.ssh_args(&target(), Duration::from_secs(10));
        let joined = args.join(" ");
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.contains("StrictHostKeyChecking=accept-new"));
        assert!(joined.contains("ConnectTimeout=10"));
        assert!(joined.contains("-i /home/me/.ssh/id_ed25519"));
        assert_eq!(args.last().unwrap(), "student@192.168.122.50");

        let strict = SshRunner {
            host_key_policy: HostKeyPolicy::Strict,
            ..r
        };
        let args = strict.ssh_args(&target(), Duration::from_secs(3));
        assert!(args.join(" ").contains("StrictHostKeyChecking=yes"));
        assert!(args.join(" ").contains("ConnectTimeout=3"));
    }

    #[test]
    fn connect_hint_is_copy_pasteable() {
        assert_eq!(
            target().connect_hint(),
            "ssh student@192.168.122.50 -i /home/me/.ssh/id_ed25519"
        );
    }

    #[test]
    fn ssh_result_success_requires_zero_and_no_error() {
        let ok = SshResult {
            exit_status: 0,
            ..Default::default()
        };
        assert!(ok.succeeded());

        let nonzero = SshResult {
            exit_status: 3,
            ..Default::default()
        };
        assert!(!nonzero.succeeded());

        let timed_out = SshResult {
            exit_status: EXIT_STATUS_TIMEOUT,
            error: Some("timed out".to_string()),
            ..Default::default()
        };
        assert!(!timed_out.succeeded());
    }
}
