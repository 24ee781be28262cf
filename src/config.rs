// src/config.rs
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use xdg::BaseDirectories;

use crate::errors::LabError;

pub const APP_NAME: &str = "labforge";
pub const DEFAULT_CONFIG_FILENAME: &str = "config.toml";

// Main configuration structure, mapping to config.toml
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub challenges: ChallengesConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct VmConfig {
    #[serde(default = "default_vm_name")]
    pub name: String,
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_vm_name() -> String {
    "ubuntu24-practice".to_string()
}
fn default_uri() -> String {
    "qemu:///system".to_string()
}
fn default_shutdown_timeout() -> u64 {
    120
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            name: default_vm_name(),
            uri: default_uri(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Host-key handling for the SSH driver. `AcceptNew` is first-use trust for
/// throwaway practice VMs; `Strict` defers to the user's known_hosts.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    AcceptNew,
    Strict,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_key_path")]
    pub key_path: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_host_key_policy")]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_readiness_poll")]
    pub readiness_poll_secs: u64,
}

fn default_ssh_user() -> String {
    "student".to_string()
}
fn default_ssh_key_path() -> String {
    "~/.ssh/id_ed25519".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_command_timeout() -> u64 {
    30
}
fn default_host_key_policy() -> HostKeyPolicy {
    HostKeyPolicy::AcceptNew
}
fn default_readiness_timeout() -> u64 {
    120
}
fn default_readiness_poll() -> u64 {
    5
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: default_ssh_user(),
            key_path: default_ssh_key_path(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            host_key_policy: default_host_key_policy(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_poll_secs: default_readiness_poll(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_name")]
    pub name: String,
    #[serde(default = "default_keep_overlays")]
    pub keep_overlays: usize,
    // Mutates ownership of hypervisor-managed files; stays off unless the
    // operator opts in.
    #[serde(default)]
    pub permission_repair: bool,
}

fn default_snapshot_name() -> String {
    "practice_external_snapshot".to_string()
}
fn default_keep_overlays() -> usize {
    5
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            name: default_snapshot_name(),
            keep_overlays: default_keep_overlays(),
            permission_repair: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ChallengesConfig {
    #[serde(default = "default_challenges_dir")]
    pub dir: String,
    #[serde(default = "default_challenge_score")]
    pub default_score: u32,
}

fn default_challenges_dir() -> String {
    "./challenges".to_string()
}
fn default_challenge_score() -> u32 {
    100
}

impl Default for ChallengesConfig {
    fn default() -> Self {
        ChallengesConfig {
            dir: default_challenges_dir(),
            default_score: default_challenge_score(),
        }
    }
}

impl Config {
    pub fn load(config_path_override: Option<&Path>) -> Result<Self, LabError> {
        let config_path = match config_path_override {
            Some(path) => path.to_path_buf(),
            None => {
                let xdg_dirs = BaseDirectories::with_prefix(APP_NAME).map_err(|e| {
                    LabError::Configuration {
                        message: format!("XDG directory error: {e}"),
                    }
                })?;
                xdg_dirs
                    .find_config_file(DEFAULT_CONFIG_FILENAME)
                    .unwrap_or_else(|| xdg_dirs.get_config_home().join(DEFAULT_CONFIG_FILENAME))
            }
        };

        info!("Attempting to load configuration from: {:?}", config_path);

        let config: Config = if config_path.exists() {
            let config_str =
                std::fs::read_to_string(&config_path).map_err(|e| LabError::Configuration {
                    message: format!("Failed to read config file {config_path:?}: {e}"),
                })?;
            toml::from_str(&config_str).map_err(|e| LabError::Configuration {
                message: format!("Failed to parse TOML from {config_path:?}: {e}"),
            })?
        } else {
            warn!(
                "Config file not found at {:?}. Using default configuration.",
                config_path
            );
            Config::default()
        };

        Ok(config)
    }

    /// SSH key path with `~` resolved.
    pub fn ssh_key_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.ssh.key_path).into_owned())
    }

    pub fn challenges_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.challenges.dir).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_file_missing() {
        let cfg = Config::load(Some(Path::new("/nonexistent/labforge-config.toml"))).unwrap();
        assert_eq!(cfg.vm.uri, "qemu:///system");
        assert_eq!(cfg.ssh.command_timeout_secs, 30);
        assert_eq!(cfg.ssh.host_key_policy, HostKeyPolicy::AcceptNew);
        assert_eq!(cfg.snapshot.keep_overlays, 5);
        assert!(!cfg.snapshot.permission_repair);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[vm]\nname = \"fedora40-lab\"\n\n[ssh]\nhost_key_policy = \"strict\"\n"
        )
        .unwrap();
        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.vm.name, "fedora40-lab");
        assert_eq!(cfg.ssh.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(cfg.ssh.user, "student");
        assert_eq!(cfg.challenges.default_score, 100);
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[vm\nname=").unwrap();
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, LabError::Configuration { .. }));
    }

    #[test]
    fn tilde_expansion_in_key_path() {
        let cfg = Config::default();
        assert!(!cfg.ssh_key_path().to_string_lossy().contains('~'));
    }
}
