// src/errors.rs
use thiserror::Error;

/// Classified libvirt fault, recovered from the error text reported by the
/// daemon (the virt crate and virsh both surface the same strings).
/// Callers switch on this instead of scraping messages themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorCode {
    NoDomain,
    NoDomainSnapshot,
    ConfigExist,
    AgentUnresponsive,
    OperationInvalid,
    OperationTimeout,
    ArgumentUnsupported,
    InvalidDomain,
    PermissionDenied,
    Other,
}

impl HypervisorCode {
    pub fn classify(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        if msg.contains("no domain snapshot with matching name")
            || msg.contains("domain snapshot not found")
        {
            HypervisorCode::NoDomainSnapshot
        } else if msg.contains("no domain with matching name")
            || msg.contains("domain not found")
            || msg.contains("failed to get domain")
        {
            HypervisorCode::NoDomain
        } else if msg.contains("already exists") {
            HypervisorCode::ConfigExist
        } else if msg.contains("guest agent is not connected")
            || msg.contains("guest agent is not responding")
            || msg.contains("guest agent not available")
            || msg.contains("agent unresponsive")
        {
            HypervisorCode::AgentUnresponsive
        } else if msg.contains("requested operation is not valid") {
            HypervisorCode::OperationInvalid
        } else if msg.contains("timed out during operation") {
            HypervisorCode::OperationTimeout
        } else if msg.contains("argument unsupported") || msg.contains("unsupported flags") {
            HypervisorCode::ArgumentUnsupported
        } else if msg.contains("invalid domain pointer") {
            HypervisorCode::InvalidDomain
        } else if msg.contains("permission denied") {
            HypervisorCode::PermissionDenied
        } else {
            HypervisorCode::Other
        }
    }
}

/// Tool-level error taxonomy. Validation failures are deliberately NOT part
/// of this enum: a probe that fails is a result, not an error, and travels
/// back to the engine as `validator::ValidationFailure`.
#[derive(Error, Debug)]
pub enum LabError {
    #[error("Failed to connect to hypervisor at {uri}: {message}")]
    HypervisorConnect { uri: String, message: String },

    #[error("VM '{vm_name}' not found. Ensure it is defined in libvirt.")]
    VmNotFound { vm_name: String },

    #[error("Hypervisor error for VM '{vm_name}' ({code:?}): {message}")]
    VmAccess {
        vm_name: String,
        code: HypervisorCode,
        message: String,
    },

    #[error("Snapshot '{snapshot_name}' on VM '{vm_name}' ({code:?}): {message}")]
    SnapshotOperation {
        vm_name: String,
        snapshot_name: String,
        code: HypervisorCode,
        message: String,
    },

    #[error("Guest agent command failed on VM '{vm_name}': {message}")]
    AgentCommand { vm_name: String, message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("SSH command error ({host}): {message}")]
    SshCommand { host: String, message: String },

    #[error("Challenge load error: {message}")]
    ChallengeLoad { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run cancelled")]
    Cancelled,
}

impl LabError {
    pub fn snapshot(vm_name: &str, snapshot_name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        LabError::SnapshotOperation {
            vm_name: vm_name.to_string(),
            snapshot_name: snapshot_name.to_string(),
            code: HypervisorCode::classify(&message),
            message,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        LabError::Network {
            message: message.into(),
        }
    }

    /// The classified hypervisor code, when this error carries one.
    pub fn hypervisor_code(&self) -> Option<HypervisorCode> {
        match self {
            LabError::VmAccess { code, .. } | LabError::SnapshotOperation { code, .. } => {
                Some(*code)
            }
            LabError::VmNotFound { .. } => Some(HypervisorCode::NoDomain),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_missing_snapshot() {
        let msg = "Domain snapshot not found: no domain snapshot with matching name 'practice'";
        assert_eq!(
            HypervisorCode::classify(msg),
            HypervisorCode::NoDomainSnapshot
        );
    }

    #[test]
    fn classifies_missing_domain() {
        let msg = "Domain not found: no domain with matching name 'ubuntu24-practice'";
        assert_eq!(HypervisorCode::classify(msg), HypervisorCode::NoDomain);
    }

    #[test]
    fn classifies_existing_snapshot_metadata() {
        let msg = "operation failed: domain snapshot 'practice' already exists";
        assert_eq!(HypervisorCode::classify(msg), HypervisorCode::ConfigExist);
    }

    #[test]
    fn classifies_unresponsive_agent() {
        let msg = "Guest agent is not responding: QEMU guest agent is not connected";
        assert_eq!(
            HypervisorCode::classify(msg),
            HypervisorCode::AgentUnresponsive
        );
    }

    #[test]
    fn classifies_invalid_operation_and_permission() {
        assert_eq!(
            HypervisorCode::classify("Requested operation is not valid: domain is running"),
            HypervisorCode::OperationInvalid
        );
        assert_eq!(
            HypervisorCode::classify("internal error: Permission denied"),
            HypervisorCode::PermissionDenied
        );
    }

    #[test]
    fn unknown_messages_fall_through() {
        assert_eq!(
            HypervisorCode::classify("something completely different"),
            HypervisorCode::Other
        );
    }

    #[test]
    fn snapshot_helper_classifies_from_message() {
        let err = LabError::snapshot("vm0", "snap0", "snapshot 'snap0' already exists");
        assert_eq!(err.hypervisor_code(), Some(HypervisorCode::ConfigExist));
    }
}
