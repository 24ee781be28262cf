// src/validator.rs
// The probe family and its execution. Each probe is one declarative check
// run against the target over SSH; a probe either passes or produces the
// full list of reasons it failed, in discovery order.

use regex::RegexBuilder;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, warn};

use crate::errors::LabError;
use crate::network::{SshResult, SshRunner, SshTarget};

const HISTORY_NOTE: &str = "[Note: History checks are indicative only and easily bypassed]";
const JOURNAL_NOTE: &str =
    "[Note: Journal checks depend on service logging and journald configuration]";
const AUDIT_NOTE: &str =
    "[Note: Audit log checks depend on auditd service running and correctly configured rules]";
const LVM_NOTE: &str = "[Note: LVM checks require lvm2 package installed on the VM]";
const PROCESS_NOTE: &str = "[Note: Process checks rely on pgrep utility on the VM]";

/// A probe that did not pass, with every reason found.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub reasons: Vec<String>,
}

impl ValidationFailure {
    pub fn new(reasons: Vec<String>) -> Self {
        ValidationFailure { reasons }
    }

    fn single(reason: impl Into<String>) -> Self {
        ValidationFailure {
            reasons: vec![reason.into()],
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed: {}", self.reasons.join("; "))
    }
}

impl std::error::Error for ValidationFailure {}

/// POSIX-shell single-quoting for remote command fragments. Everything
/// interpolated into a remote command goes through here.
pub fn sh_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Inactive,
    Failed,
}

impl ServiceStatus {
    fn label(self) -> &'static str {
        match self {
            ServiceStatus::Active => "active",
            ServiceStatus::Inactive => "inactive",
            ServiceStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    #[default]
    Any,
    File,
    Directory,
}

impl FileType {
    fn test_flag(self) -> &'static str {
        match self {
            FileType::Any => "-e",
            FileType::File => "-f",
            FileType::Directory => "-d",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            FileType::Any => "present",
            FileType::File => "a file",
            FileType::Directory => "a directory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LvmCheckType {
    PvExists,
    VgExists,
    LvExists,
    LvSize,
}

/// `expected_count` accepts a bare integer or a comparator expression.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CountExpectation {
    Exact(i64),
    Expr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Comparator {
    fn holds(self, actual: i64, expected: i64) -> bool {
        match self {
            Comparator::Gt => actual > expected,
            Comparator::Ge => actual >= expected,
            Comparator::Lt => actual < expected,
            Comparator::Le => actual <= expected,
            Comparator::Eq => actual == expected,
            Comparator::Ne => actual != expected,
        }
    }
}

/// Parse `>N`, `>=N`, `<N`, `<=N`, `==N`, `!=N`, or a bare `N`.
pub fn parse_count_expr(expr: &str) -> Option<(Comparator, i64)> {
    let expr = expr.trim();
    let (op, rest) = if let Some(rest) = expr.strip_prefix(">=") {
        (Comparator::Ge, rest)
    } else if let Some(rest) = expr.strip_prefix("<=") {
        (Comparator::Le, rest)
    } else if let Some(rest) = expr.strip_prefix("==") {
        (Comparator::Eq, rest)
    } else if let Some(rest) = expr.strip_prefix("!=") {
        (Comparator::Ne, rest)
    } else if let Some(rest) = expr.strip_prefix('>') {
        (Comparator::Gt, rest)
    } else if let Some(rest) = expr.strip_prefix('<') {
        (Comparator::Lt, rest)
    } else {
        (Comparator::Eq, expr)
    };
    rest.trim().parse::<i64>().ok().map(|n| (op, n))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuccessCriteria {
    pub exit_status: Option<i64>,
    pub stdout_equals: Option<String>,
    pub stdout_contains: Option<String>,
    pub stdout_matches_regex: Option<String>,
    #[serde(default)]
    pub stderr_empty: bool,
    pub stderr_contains: Option<String>,
    #[serde(default)]
    pub stdout_empty: bool,
}

fn default_true() -> bool {
    true
}
fn default_journal_since() -> String {
    "10 minutes ago".to_string()
}
fn default_audit_since() -> String {
    "recent".to_string()
}
fn default_history_command() -> String {
    "cat ~/.bash_history 2>/dev/null || history 2>/dev/null".to_string()
}

/// The closed family of validation probes. The discriminator is `type` in
/// the challenge document.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Probe {
    RunCommand {
        command: String,
        success_criteria: Option<SuccessCriteria>,
    },
    CheckServiceStatus {
        service: String,
        expected_status: ServiceStatus,
        check_enabled: Option<bool>,
    },
    CheckPortListening {
        port: u32,
        #[serde(default)]
        protocol: Protocol,
        expected_state: bool,
        address: Option<String>,
    },
    CheckFileExists {
        path: String,
        expected_state: bool,
        #[serde(default)]
        file_type: FileType,
        owner: Option<String>,
        group: Option<String>,
        permissions: Option<String>,
    },
    CheckFileContains {
        path: String,
        text: Option<String>,
        matches_regex: Option<String>,
        expected_state: bool,
    },
    CheckLvmState {
        check_type: LvmCheckType,
        device: Option<String>,
        vg_name: Option<String>,
        lv_name: Option<String>,
        #[serde(default = "default_true")]
        expected_state: bool,
        min_size_mb: Option<f64>,
        max_size_mb: Option<f64>,
        exact_size_mb: Option<f64>,
    },
    CheckProcess {
        process_name: String,
        expected_state: bool,
        pid_file: Option<String>,
    },
    CheckHistory {
        command_pattern: Option<String>,
        disallowed_commands: Option<Vec<String>>,
        expected_count: Option<CountExpectation>,
        #[serde(default = "default_history_command")]
        history_command: String,
    },
    CheckJournalctl {
        service: Option<String>,
        syslog_identifier: Option<String>,
        command_name: Option<String>,
        message_pattern: Option<String>,
        #[serde(default = "default_journal_since")]
        since: String,
        #[serde(default = "default_true")]
        expected_state: bool,
    },
    CheckAuditLog {
        rule_key: String,
        #[serde(default = "default_audit_since")]
        since: String,
        #[serde(default = "default_true")]
        expected_state: bool,
    },
}

fn regex_ok(pattern: &str) -> Result<(), String> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map(|_| ())
        .map_err(|e| format!("Invalid regex '{pattern}': {e}"))
}

impl Probe {
    pub fn type_name(&self) -> &'static str {
        match self {
            Probe::RunCommand { .. } => "run_command",
            Probe::CheckServiceStatus { .. } => "check_service_status",
            Probe::CheckPortListening { .. } => "check_port_listening",
            Probe::CheckFileExists { .. } => "check_file_exists",
            Probe::CheckFileContains { .. } => "check_file_contains",
            Probe::CheckLvmState { .. } => "check_lvm_state",
            Probe::CheckProcess { .. } => "check_process",
            Probe::CheckHistory { .. } => "check_history",
            Probe::CheckJournalctl { .. } => "check_journalctl",
            Probe::CheckAuditLog { .. } => "check_audit_log",
        }
    }

    /// Structural validation beyond what deserialization enforces. Returns
    /// every problem found; an empty list means the probe is well-formed.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self {
            Probe::RunCommand {
                command,
                success_criteria,
            } => {
                if command.is_empty() {
                    errors.push("run_command: 'command' must not be empty.".to_string());
                }
                if let Some(criteria) = success_criteria {
                    if let Some(pattern) = &criteria.stdout_matches_regex {
                        if let Err(e) = regex_ok(pattern) {
                            errors.push(format!("run_command: {e}"));
                        }
                    }
                }
            }
            Probe::CheckServiceStatus { service, .. } => {
                if service.is_empty() {
                    errors.push("check_service_status: 'service' must not be empty.".to_string());
                }
            }
            Probe::CheckPortListening { port, .. } => {
                if *port == 0 || *port > 65535 {
                    errors.push(format!(
                        "check_port_listening: port {port} out of range; must be 1-65535."
                    ));
                }
            }
            Probe::CheckFileExists {
                path, permissions, ..
            } => {
                if path.is_empty() {
                    errors.push("check_file_exists: 'path' must not be empty.".to_string());
                }
                if let Some(perms) = permissions {
                    let ok = (perms.len() == 3 || perms.len() == 4)
                        && perms.chars().all(|c| ('0'..='7').contains(&c));
                    if !ok {
                        errors.push(format!(
                            "check_file_exists: invalid 'permissions' format '{perms}'; \
                             must be 3 or 4 octal digits, e.g. '0644'."
                        ));
                    }
                }
            }
            Probe::CheckFileContains {
                path,
                text,
                matches_regex,
                ..
            } => {
                if path.is_empty() {
                    errors.push("check_file_contains: 'path' must not be empty.".to_string());
                }
                match (text, matches_regex) {
                    (None, None) => errors.push(
                        "check_file_contains: requires 'text' or 'matches_regex'.".to_string(),
                    ),
                    (Some(_), Some(_)) => errors.push(
                        "check_file_contains: cannot have both 'text' and 'matches_regex'."
                            .to_string(),
                    ),
                    (None, Some(pattern)) => {
                        if let Err(e) = regex_ok(pattern) {
                            errors.push(format!("check_file_contains: {e}"));
                        }
                    }
                    _ => {}
                }
            }
            Probe::CheckLvmState {
                check_type,
                device,
                vg_name,
                lv_name,
                min_size_mb,
                max_size_mb,
                exact_size_mb,
                ..
            } => match check_type {
                LvmCheckType::PvExists => {
                    if device.is_none() {
                        errors.push("check_lvm_state: 'pv_exists' requires 'device'.".to_string());
                    }
                }
                LvmCheckType::VgExists => {
                    if vg_name.is_none() {
                        errors.push("check_lvm_state: 'vg_exists' requires 'vg_name'.".to_string());
                    }
                }
                LvmCheckType::LvExists => {
                    if vg_name.is_none() || lv_name.is_none() {
                        errors.push(
                            "check_lvm_state: 'lv_exists' requires 'vg_name' and 'lv_name'."
                                .to_string(),
                        );
                    }
                }
                LvmCheckType::LvSize => {
                    if vg_name.is_none() || lv_name.is_none() {
                        errors.push(
                            "check_lvm_state: 'lv_size' requires 'vg_name' and 'lv_name'."
                                .to_string(),
                        );
                    }
                    if min_size_mb.is_none() && max_size_mb.is_none() && exact_size_mb.is_none() {
                        errors.push(
                            "check_lvm_state: 'lv_size' requires 'min_size_mb'/'max_size_mb' \
                             or 'exact_size_mb'."
                                .to_string(),
                        );
                    }
                }
            },
            Probe::CheckProcess { process_name, .. } => {
                if process_name.is_empty() {
                    errors
                        .push("check_process: 'process_name' must not be empty.".to_string());
                }
            }
            Probe::CheckHistory {
                command_pattern,
                disallowed_commands,
                expected_count,
                ..
            } => {
                let has_disallowed = disallowed_commands
                    .as_ref()
                    .map(|d| !d.is_empty())
                    .unwrap_or(false);
                if command_pattern.is_none() && !has_disallowed {
                    errors.push(
                        "check_history: requires 'command_pattern' or 'disallowed_commands'."
                            .to_string(),
                    );
                }
                if expected_count.is_some() && command_pattern.is_none() {
                    errors.push(
                        "check_history: 'expected_count' requires 'command_pattern'.".to_string(),
                    );
                }
                if let Some(pattern) = command_pattern {
                    if let Err(e) = regex_ok(pattern) {
                        errors.push(format!("check_history: {e}"));
                    }
                }
                if let Some(CountExpectation::Expr(expr)) = expected_count {
                    if parse_count_expr(expr).is_none() {
                        errors.push(format!(
                            "check_history: invalid 'expected_count' expression '{expr}'."
                        ));
                    }
                }
                for pattern in disallowed_commands.iter().flatten() {
                    if let Err(e) = regex_ok(pattern) {
                        errors.push(format!("check_history: disallowed pattern: {e}"));
                    }
                }
            }
            Probe::CheckJournalctl {
                service,
                syslog_identifier,
                command_name,
                message_pattern,
                ..
            } => {
                if service.is_none()
                    && syslog_identifier.is_none()
                    && command_name.is_none()
                    && message_pattern.is_none()
                {
                    errors.push(
                        "check_journalctl: requires at least one filter \
                         (service, syslog_identifier, command_name, or message_pattern)."
                            .to_string(),
                    );
                }
                if let Some(pattern) = message_pattern {
                    if let Err(e) = regex_ok(pattern) {
                        errors.push(format!("check_journalctl: {e}"));
                    }
                }
            }
            Probe::CheckAuditLog { rule_key, .. } => {
                if rule_key.is_empty() {
                    errors.push("check_audit_log: 'rule_key' must not be empty.".to_string());
                }
            }
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// Remote command construction. Pure functions so the exact command lines are
// testable without a target.

pub fn service_active_command(service: &str) -> String {
    format!("systemctl is-active --quiet {}", sh_quote(service))
}

pub fn service_enabled_command(service: &str) -> String {
    format!("systemctl is-enabled --quiet {}", sh_quote(service))
}

pub fn port_check_command(port: u32, protocol: Protocol, address: Option<&str>) -> String {
    let proto_flag = match protocol {
        Protocol::Tcp => "t",
        Protocol::Udp => "u",
    };
    // ss reports listening TCP sockets as LISTEN and listening UDP sockets
    // as UNCONN; -l already restricts to listeners.
    let state_match = match protocol {
        Protocol::Tcp => "$1==\"LISTEN\"",
        Protocol::Udp => "($1==\"UNCONN\" || $1==\"LISTEN\")",
    };
    let awk = format!(
        "BEGIN {{ found=0 }} \
         {state_match} {{ \
           n=split($4, parts, \":\"); p=parts[n]; \
           a=$4; sub(/:[^:]*$/, \"\", a); gsub(/\\[|\\]/, \"\", a); \
           if (p==port) {{ \
             ok=1; \
             if (addr != \"\") {{ if (a!=addr && a!=\"*\" && a!=\"0.0.0.0\" && a!=\"::\") ok=0 }} \
             if (ok) {{ found=1; exit }} \
           }} \
         }} \
         END {{ exit !found }}"
    );
    format!(
        "ss -nl{proto_flag}p | awk -v port={port} -v addr={} '{awk}'",
        sh_quote(address.unwrap_or(""))
    )
}

pub fn file_test_command(path: &str, file_type: FileType) -> String {
    format!("test {} {}", file_type.test_flag(), sh_quote(path))
}

pub fn file_stat_command(path: &str) -> String {
    format!("stat --format='%U:%u:%G:%g:%a' {}", sh_quote(path))
}

pub fn file_readable_command(path: &str) -> String {
    format!("test -r {}", sh_quote(path))
}

pub fn grep_command(path: &str, pattern: &str, fixed: bool) -> String {
    let mode = if fixed { "-F" } else { "-E" };
    format!("grep -q {mode} -- {} {}", sh_quote(pattern), sh_quote(path))
}

pub fn pgrep_command(process_name: &str) -> String {
    format!("pgrep -x -- {}", sh_quote(process_name))
}

pub fn lvm_command(
    check_type: LvmCheckType,
    device: Option<&str>,
    vg_name: Option<&str>,
    lv_name: Option<&str>,
) -> String {
    match check_type {
        LvmCheckType::PvExists => format!(
            "pvs --noheadings -o pv_name {}",
            sh_quote(device.unwrap_or(""))
        ),
        LvmCheckType::VgExists => format!(
            "vgs --noheadings -o vg_name {}",
            sh_quote(vg_name.unwrap_or(""))
        ),
        LvmCheckType::LvExists => format!(
            "lvs --noheadings -o lv_name {}/{}",
            sh_quote(vg_name.unwrap_or("")),
            sh_quote(lv_name.unwrap_or(""))
        ),
        LvmCheckType::LvSize => format!(
            "lvs --noheadings --units m -o lv_size {}/{}",
            sh_quote(vg_name.unwrap_or("")),
            sh_quote(lv_name.unwrap_or(""))
        ),
    }
}

pub fn journalctl_command(
    service: Option<&str>,
    syslog_identifier: Option<&str>,
    command_name: Option<&str>,
    message_pattern: Option<&str>,
    since: &str,
) -> String {
    let mut cmd = format!("journalctl --no-pager --since {}", sh_quote(since));
    if let Some(unit) = service {
        cmd.push_str(&format!(" -u {}", sh_quote(unit)));
    }
    if let Some(ident) = syslog_identifier {
        cmd.push_str(&format!(" SYSLOG_IDENTIFIER={}", sh_quote(ident)));
    }
    if let Some(comm) = command_name {
        cmd.push_str(&format!(" _COMM={}", sh_quote(comm)));
    }
    match message_pattern {
        Some(pattern) => cmd.push_str(&format!(" | grep -Eq -- {}", sh_quote(pattern))),
        None => cmd.push_str(" --quiet"),
    }
    cmd
}

pub fn ausearch_command(rule_key: &str, since: &str) -> String {
    format!(
        "ausearch --input-logs -k {} --start {} -c",
        sh_quote(rule_key),
        sh_quote(since)
    )
}

// ---------------------------------------------------------------------------
// Execution

/// Runs probes against one target. The engine constructs probes and halts
/// at the first failure; this layer never calls back into the engine.
pub struct Validator<'a> {
    runner: &'a SshRunner,
    target: &'a SshTarget,
}

impl<'a> Validator<'a> {
    pub fn new(runner: &'a SshRunner, target: &'a SshTarget) -> Self {
        Validator { runner, target }
    }

    async fn run_remote(&self, command: &str, context: &str) -> Result<SshResult, ValidationFailure> {
        debug!(command, context, "Running validation command");
        match self.runner.run(self.target, command).await {
            Ok(result) => {
                if let Some(error) = &result.error {
                    Err(ValidationFailure::single(format!(
                        "{context} command error: {error}"
                    )))
                } else {
                    Ok(result)
                }
            }
            Err(LabError::SshCommand { message, .. }) => Err(ValidationFailure::single(format!(
                "SSH execution failed during {context}: {message}"
            ))),
            Err(e) => Err(ValidationFailure::single(format!(
                "Unexpected error during {context}: {e}"
            ))),
        }
    }

    /// Execute one probe. `Ok(())` on pass; every discovered reason
    /// otherwise.
    pub async fn execute(
        &self,
        step_index: usize,
        probe: &Probe,
    ) -> Result<(), ValidationFailure> {
        debug!(step_index, probe_type = probe.type_name(), "Executing validation step");
        let structural = probe.validate();
        if !structural.is_empty() {
            return Err(ValidationFailure::new(structural));
        }

        match probe {
            Probe::RunCommand {
                command,
                success_criteria,
            } => self.check_run_command(command, success_criteria.as_ref()).await,
            Probe::CheckServiceStatus {
                service,
                expected_status,
                check_enabled,
            } => {
                self.check_service_status(service, *expected_status, *check_enabled)
                    .await
            }
            Probe::CheckPortListening {
                port,
                protocol,
                expected_state,
                address,
            } => {
                self.check_port_listening(*port, *protocol, *expected_state, address.as_deref())
                    .await
            }
            Probe::CheckFileExists {
                path,
                expected_state,
                file_type,
                owner,
                group,
                permissions,
            } => {
                self.check_file_exists(
                    path,
                    *expected_state,
                    *file_type,
                    owner.as_deref(),
                    group.as_deref(),
                    permissions.as_deref(),
                )
                .await
            }
            Probe::CheckFileContains {
                path,
                text,
                matches_regex,
                expected_state,
            } => {
                self.check_file_contains(
                    path,
                    text.as_deref(),
                    matches_regex.as_deref(),
                    *expected_state,
                )
                .await
            }
            Probe::CheckLvmState {
                check_type,
                device,
                vg_name,
                lv_name,
                expected_state,
                min_size_mb,
                max_size_mb,
                exact_size_mb,
            } => {
                self.check_lvm_state(
                    *check_type,
                    device.as_deref(),
                    vg_name.as_deref(),
                    lv_name.as_deref(),
                    *expected_state,
                    *min_size_mb,
                    *max_size_mb,
                    *exact_size_mb,
                )
                .await
            }
            Probe::CheckProcess {
                process_name,
                expected_state,
                pid_file,
            } => {
                self.check_process(process_name, *expected_state, pid_file.as_deref())
                    .await
            }
            Probe::CheckHistory {
                command_pattern,
                disallowed_commands,
                expected_count,
                history_command,
            } => {
                self.check_history(
                    command_pattern.as_deref(),
                    disallowed_commands.as_deref(),
                    expected_count.as_ref(),
                    history_command,
                )
                .await
            }
            Probe::CheckJournalctl {
                service,
                syslog_identifier,
                command_name,
                message_pattern,
                since,
                expected_state,
            } => {
                self.check_journalctl(
                    service.as_deref(),
                    syslog_identifier.as_deref(),
                    command_name.as_deref(),
                    message_pattern.as_deref(),
                    since,
                    *expected_state,
                )
                .await
            }
            Probe::CheckAuditLog {
                rule_key,
                since,
                expected_state,
            } => self.check_audit_log(rule_key, since, *expected_state).await,
        }
    }

    async fn check_run_command(
        &self,
        command: &str,
        criteria: Option<&SuccessCriteria>,
    ) -> Result<(), ValidationFailure> {
        let result = self.run_remote(command, "command check").await?;

        let default_criteria = SuccessCriteria {
            exit_status: Some(0),
            ..Default::default()
        };
        let criteria = criteria.unwrap_or(&default_criteria);
        // A criteria block with no exit_status still defaults nothing; only
        // the absence of the whole block implies exit 0.

        let mut reasons = Vec::new();
        if let Some(expected) = criteria.exit_status {
            if result.exit_status != expected {
                reasons.push(format!(
                    "Expected exit status {expected}, but got {}.",
                    result.exit_status
                ));
            }
        }
        if let Some(expected) = &criteria.stdout_equals {
            if &result.stdout != expected {
                reasons.push("stdout did not exactly match expected value.".to_string());
            }
        }
        if let Some(needle) = &criteria.stdout_contains {
            if !result.stdout.contains(needle) {
                reasons.push(format!(
                    "stdout did not contain expected text: '{needle}'"
                ));
            }
        }
        if let Some(pattern) = &criteria.stdout_matches_regex {
            // Pre-validated; a build failure here is a probe bug.
            let re = RegexBuilder::new(pattern)
                .multi_line(true)
                .build()
                .map_err(|e| ValidationFailure::single(format!("Invalid regex '{pattern}': {e}")))?;
            if !re.is_match(&result.stdout) {
                reasons.push(format!("stdout did not match regex '{pattern}'."));
            }
        }
        if criteria.stderr_empty && !result.stderr.is_empty() {
            reasons.push("Expected stderr to be empty, but it was not.".to_string());
        }
        if let Some(needle) = &criteria.stderr_contains {
            if !result.stderr.contains(needle) {
                reasons.push(format!(
                    "stderr did not contain expected text: '{needle}'"
                ));
            }
        }
        if criteria.stdout_empty && !result.stdout.is_empty() {
            reasons.push("Expected stdout to be empty, but it was not.".to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure::new(reasons))
        }
    }

    async fn check_service_status(
        &self,
        service: &str,
        expected: ServiceStatus,
        check_enabled: Option<bool>,
    ) -> Result<(), ValidationFailure> {
        let mut reasons = Vec::new();

        let result = self
            .run_remote(&service_active_command(service), "active check")
            .await?;
        let code = result.exit_status;
        let actual = match code {
            0 => "active",
            3 => "inactive",
            _ => "failed",
        };
        if actual != expected.label() {
            reasons.push(format!(
                "Expected service status '{}', but was '{actual}' (is-active exit code: {code}).",
                expected.label()
            ));
        }

        if let Some(expect_enabled) = check_enabled {
            let result = self
                .run_remote(&service_enabled_command(service), "enabled check")
                .await?;
            let enabled = result.exit_status == 0;
            if enabled != expect_enabled {
                let expected_str = if expect_enabled { "enabled" } else { "not enabled" };
                let actual_str = if enabled { "enabled" } else { "not enabled" };
                reasons.push(format!(
                    "Expected service to be {expected_str}, but it was {actual_str} \
                     (is-enabled exit code: {}).",
                    result.exit_status
                ));
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure::new(reasons))
        }
    }

    async fn check_port_listening(
        &self,
        port: u32,
        protocol: Protocol,
        expected_state: bool,
        address: Option<&str>,
    ) -> Result<(), ValidationFailure> {
        let command = port_check_command(port, protocol, address);
        let result = self.run_remote(&command, "port check").await?;

        let listening = result.exit_status == 0;
        if listening != expected_state {
            let proto = match protocol {
                Protocol::Tcp => "tcp",
                Protocol::Udp => "udp",
            };
            let state_str = if listening { "listening" } else { "not listening" };
            let expected_str = if expected_state {
                "be listening"
            } else {
                "not be listening"
            };
            let addr_str = address
                .map(|a| format!(" on address {a}"))
                .unwrap_or_default();
            return Err(ValidationFailure::single(format!(
                "Expected port {proto}/{port}{addr_str} to {expected_str}, but it was {state_str}."
            )));
        }
        Ok(())
    }

    async fn check_file_exists(
        &self,
        path: &str,
        expected_state: bool,
        file_type: FileType,
        owner: Option<&str>,
        group: Option<&str>,
        permissions: Option<&str>,
    ) -> Result<(), ValidationFailure> {
        let result = self
            .run_remote(&file_test_command(path, file_type), "file existence check")
            .await?;
        let exists = result.exit_status == 0;

        if exists != expected_state {
            let type_desc = file_type.describe();
            let state_str = if exists {
                format!("exists and is {type_desc}")
            } else {
                format!("does not exist or is not {type_desc}")
            };
            let expected_str = if expected_state {
                format!("exist and be {type_desc}")
            } else {
                format!("not exist or not be {type_desc}")
            };
            return Err(ValidationFailure::single(format!(
                "Path '{path}' {state_str}, but expected to {expected_str}."
            )));
        }

        if !exists || (owner.is_none() && group.is_none() && permissions.is_none()) {
            return Ok(());
        }

        let result = self
            .run_remote(&file_stat_command(path), "stat check")
            .await?;
        if result.exit_status != 0 {
            return Err(ValidationFailure::single(format!(
                "Stat command failed (Exit: {}) for path '{path}'.",
                result.exit_status
            )));
        }

        let parts: Vec<&str> = result.stdout.trim().split(':').collect();
        if parts.len() != 5 {
            return Err(ValidationFailure::single(format!(
                "Unexpected output format from stat command: {}",
                result.stdout.trim()
            )));
        }
        let (owner_name, owner_uid, group_name, group_gid, perms_octal) =
            (parts[0], parts[1], parts[2], parts[3], parts[4]);

        let mut reasons = Vec::new();
        if let Some(expected_owner) = owner {
            if expected_owner != owner_name && expected_owner != owner_uid {
                reasons.push(format!(
                    "Expected owner '{expected_owner}', but found '{owner_name}' (UID: {owner_uid})."
                ));
            }
        }
        if let Some(expected_group) = group {
            if expected_group != group_name && expected_group != group_gid {
                reasons.push(format!(
                    "Expected group '{expected_group}', but found '{group_name}' (GID: {group_gid})."
                ));
            }
        }
        if let Some(expected_perms) = permissions {
            if !permissions_match(expected_perms, perms_octal) {
                reasons.push(format!(
                    "Expected permissions '{expected_perms}', but found '{perms_octal}'."
                ));
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure::new(reasons))
        }
    }

    async fn check_file_contains(
        &self,
        path: &str,
        text: Option<&str>,
        matches_regex: Option<&str>,
        expected_state: bool,
    ) -> Result<(), ValidationFailure> {
        let result = self
            .run_remote(&file_readable_command(path), "readability check")
            .await?;
        let readable = result.exit_status == 0;

        if !readable {
            return if expected_state {
                Err(ValidationFailure::single(format!(
                    "File '{path}' not found or is not readable by user '{}'.",
                    self.target.user
                )))
            } else {
                // Content cannot be present in a file we cannot read.
                Ok(())
            };
        }

        let (pattern, fixed, search_desc) = match (text, matches_regex) {
            (Some(t), _) => (t, true, format!("text '{}'", truncate(t, 30))),
            (_, Some(r)) => (r, false, format!("regex '{}'", truncate(r, 30))),
            _ => unreachable!("validated: one of text/matches_regex present"),
        };

        let result = self
            .run_remote(&grep_command(path, pattern, fixed), "content check")
            .await?;
        let found = match result.exit_status {
            0 => true,
            1 => false,
            code => {
                return Err(ValidationFailure::single(format!(
                    "Error running grep on '{path}' (exit status {code}). \
                     File might have changed, or permissions issue. STDERR: {}",
                    result.stderr
                )));
            }
        };

        if found != expected_state {
            let state_str = if found { "found" } else { "not found" };
            let expected_str = if expected_state {
                "be found"
            } else {
                "not be found"
            };
            return Err(ValidationFailure::single(format!(
                "Expected {search_desc} to {expected_str} in '{path}', but it was {state_str}."
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn check_lvm_state(
        &self,
        check_type: LvmCheckType,
        device: Option<&str>,
        vg_name: Option<&str>,
        lv_name: Option<&str>,
        expected_state: bool,
        min_size_mb: Option<f64>,
        max_size_mb: Option<f64>,
        exact_size_mb: Option<f64>,
    ) -> Result<(), ValidationFailure> {
        let command = lvm_command(check_type, device, vg_name, lv_name);
        let result = self.run_remote(&command, "LVM check").await?;

        let lv_path = format!("{}/{}", vg_name.unwrap_or(""), lv_name.unwrap_or(""));
        match check_type {
            LvmCheckType::PvExists | LvmCheckType::VgExists | LvmCheckType::LvExists => {
                let found = result.exit_status == 0;
                if found != expected_state {
                    let check_desc = match check_type {
                        LvmCheckType::PvExists => {
                            format!("PV existence for device '{}'", device.unwrap_or(""))
                        }
                        LvmCheckType::VgExists => {
                            format!("VG existence for VG '{}'", vg_name.unwrap_or(""))
                        }
                        _ => format!("LV existence for LV '{lv_path}'"),
                    };
                    let state_str = if found { "found" } else { "not found" };
                    let expected_str = if expected_state { "exist" } else { "not exist" };
                    let mut reasons = vec![format!(
                        "Expected {check_desc} to {expected_str}, but it was {state_str}."
                    )];
                    if result.exit_status != 0 {
                        reasons.push(format!(
                            "LVM tool exit code: {}. STDERR: {}",
                            result.exit_status, result.stderr
                        ));
                    }
                    reasons.push(LVM_NOTE.to_string());
                    return Err(ValidationFailure::new(reasons));
                }
                Ok(())
            }
            LvmCheckType::LvSize => {
                if result.exit_status != 0 {
                    return Err(ValidationFailure::new(vec![
                        format!(
                            "Could not retrieve size for LV '{lv_path}'. Does it exist? \
                             LVM tool exit code: {}. STDERR: {}",
                            result.exit_status, result.stderr
                        ),
                        LVM_NOTE.to_string(),
                    ]));
                }
                let size_str = result.stdout.trim().to_lowercase().replace('m', "");
                let actual_mb: f64 = size_str.trim().parse().map_err(|_| {
                    ValidationFailure::new(vec![
                        format!("Could not parse LVM size output '{}'.", result.stdout.trim()),
                        LVM_NOTE.to_string(),
                    ])
                })?;

                let mut reasons = Vec::new();
                let exact_missed = match exact_size_mb {
                    Some(exact) if (actual_mb - exact).abs() > 0.1 => {
                        reasons.push(format!(
                            "Expected LV size exactly {exact}MB, but found {actual_mb:.2}MB."
                        ));
                        true
                    }
                    _ => false,
                };
                if !exact_missed {
                    if let Some(min) = min_size_mb {
                        if actual_mb < min {
                            reasons.push(format!(
                                "LV size {actual_mb:.2}MB is less than minimum requirement ({min}MB)."
                            ));
                        }
                    }
                    if let Some(max) = max_size_mb {
                        if actual_mb > max {
                            reasons.push(format!(
                                "LV size {actual_mb:.2}MB is greater than maximum requirement ({max}MB)."
                            ));
                        }
                    }
                }
                if reasons.is_empty() {
                    Ok(())
                } else {
                    reasons.push(LVM_NOTE.to_string());
                    Err(ValidationFailure::new(reasons))
                }
            }
        }
    }

    async fn check_process(
        &self,
        process_name: &str,
        expected_state: bool,
        pid_file: Option<&str>,
    ) -> Result<(), ValidationFailure> {
        let result = self
            .run_remote(&pgrep_command(process_name), "process check")
            .await?;
        let running = match result.exit_status {
            0 => true,
            1 => false,
            code => {
                return Err(ValidationFailure::new(vec![
                    format!(
                        "Error running pgrep for '{process_name}' (Exit: {code}). STDERR: {}",
                        result.stderr
                    ),
                    PROCESS_NOTE.to_string(),
                ]));
            }
        };

        if running != expected_state {
            let state_str = if running { "running" } else { "not running" };
            let expected_str = if expected_state {
                "be running"
            } else {
                "not be running"
            };
            return Err(ValidationFailure::new(vec![
                format!(
                    "Expected process '{process_name}' to {expected_str}, but it was {state_str}."
                ),
                PROCESS_NOTE.to_string(),
            ]));
        }

        if let Some(pid_path) = pid_file {
            let result = self
                .run_remote(&file_test_command(pid_path, FileType::File), "PID file check")
                .await?;
            let pid_exists = result.exit_status == 0;
            if pid_exists != expected_state {
                let state_str = if pid_exists { "exists" } else { "does not exist" };
                let expected_str = if expected_state { "exist" } else { "not exist" };
                return Err(ValidationFailure::new(vec![
                    format!(
                        "Expected PID file '{pid_path}' to {expected_str} (matching expected \
                         process state), but it {state_str}."
                    ),
                    PROCESS_NOTE.to_string(),
                ]));
            }
        }
        Ok(())
    }

    async fn check_history(
        &self,
        command_pattern: Option<&str>,
        disallowed_commands: Option<&[String]>,
        expected_count: Option<&CountExpectation>,
        history_command: &str,
    ) -> Result<(), ValidationFailure> {
        let result = self.run_remote(history_command, "history retrieval").await.map_err(
            |mut failure| {
                failure.reasons.push(HISTORY_NOTE.to_string());
                failure
            },
        )?;

        let history = result.stdout.as_str();
        if history.is_empty() && result.exit_status != 0 {
            warn!(
                exit_status = result.exit_status,
                "History command failed and produced no output"
            );
        }

        let mut reasons = Vec::new();

        if let Some(pattern) = command_pattern {
            let re = RegexBuilder::new(pattern)
                .multi_line(true)
                .build()
                .map_err(|e| {
                    ValidationFailure::new(vec![
                        format!("Invalid regex in command_pattern '{pattern}': {e}"),
                        HISTORY_NOTE.to_string(),
                    ])
                })?;
            let actual_count = re.find_iter(history).count() as i64;

            match expected_count {
                Some(CountExpectation::Exact(expected)) => {
                    if actual_count != *expected {
                        reasons.push(format!(
                            "Expected exactly {expected} match(es) for pattern '{pattern}', \
                             but found {actual_count}."
                        ));
                    }
                }
                Some(CountExpectation::Expr(expr)) => match parse_count_expr(expr) {
                    Some((op, expected)) => {
                        if !op.holds(actual_count, expected) {
                            reasons.push(format!(
                                "Expected count '{expr}' for pattern '{pattern}', \
                                 but found {actual_count}."
                            ));
                        }
                    }
                    None => {
                        warn!(expr = %expr, "Invalid expected_count expression; ignoring count check");
                    }
                },
                None => {
                    if actual_count == 0 {
                        reasons.push(format!(
                            "Expected command pattern '{pattern}' not found in history."
                        ));
                    }
                }
            }
        }

        for pattern in disallowed_commands.iter().flat_map(|d| d.iter()) {
            match RegexBuilder::new(pattern).multi_line(true).build() {
                Ok(re) => {
                    if re.is_match(history) {
                        reasons.push(format!(
                            "Disallowed command pattern '{pattern}' found in history."
                        ));
                    }
                }
                Err(e) => {
                    reasons.push(format!(
                        "Invalid regex in disallowed_commands '{pattern}': {e}"
                    ));
                }
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            reasons.push(HISTORY_NOTE.to_string());
            Err(ValidationFailure::new(reasons))
        }
    }

    async fn check_journalctl(
        &self,
        service: Option<&str>,
        syslog_identifier: Option<&str>,
        command_name: Option<&str>,
        message_pattern: Option<&str>,
        since: &str,
        expected_state: bool,
    ) -> Result<(), ValidationFailure> {
        let command =
            journalctl_command(service, syslog_identifier, command_name, message_pattern, since);
        let result = self.run_remote(&command, "journal check").await.map_err(
            |mut failure| {
                failure.reasons.push(JOURNAL_NOTE.to_string());
                failure
            },
        )?;

        let code = result.exit_status;
        let found = code == 0;
        // grep -Eq exits 2 on error; journalctl --quiet exits 1 for "no
        // entries" only.
        let command_error = (code > 1 && message_pattern.is_some()) || code < 0;
        if command_error {
            return Err(ValidationFailure::new(vec![
                format!(
                    "Error running journal/grep command (Exit: {code}). STDERR: {}",
                    result.stderr
                ),
                JOURNAL_NOTE.to_string(),
            ]));
        }

        if found != expected_state {
            let mut filters = Vec::new();
            if let Some(unit) = service {
                filters.push(format!("service='{unit}'"));
            }
            if let Some(ident) = syslog_identifier {
                filters.push(format!("identifier='{ident}'"));
            }
            if let Some(comm) = command_name {
                filters.push(format!("command='{comm}'"));
            }
            if let Some(pattern) = message_pattern {
                filters.push(format!("message matching '{pattern}'"));
            }
            let filter_str = if filters.is_empty() {
                "any relevant entries".to_string()
            } else {
                filters.join(", ")
            };
            let state_str = if found { "found" } else { "not found" };
            let expected_str = if expected_state { "exist" } else { "not exist" };
            return Err(ValidationFailure::new(vec![
                format!(
                    "Expected journal entries for {filter_str} (since '{since}') to \
                     {expected_str}, but they were {state_str}."
                ),
                JOURNAL_NOTE.to_string(),
            ]));
        }
        Ok(())
    }

    async fn check_audit_log(
        &self,
        rule_key: &str,
        since: &str,
        expected_state: bool,
    ) -> Result<(), ValidationFailure> {
        let command = ausearch_command(rule_key, since);
        let result = self.run_remote(&command, "audit check").await.map_err(
            |mut failure| {
                failure.reasons.push(AUDIT_NOTE.to_string());
                failure
            },
        )?;

        let found = match result.exit_status {
            0 => {
                let count: i64 = result.stdout.trim().parse().map_err(|_| {
                    ValidationFailure::new(vec![
                        format!(
                            "Error running ausearch command (Exit: 0) with unparseable \
                             count output '{}'. Check auditd status/config.",
                            result.stdout.trim()
                        ),
                        AUDIT_NOTE.to_string(),
                    ])
                })?;
                count > 0
            }
            // ausearch exits 1 when no events match.
            1 => false,
            code => {
                return Err(ValidationFailure::new(vec![
                    format!(
                        "Error running ausearch command (Exit: {code}). Check auditd \
                         status/config. STDOUT: '{}' STDERR: {}",
                        result.stdout.trim(),
                        result.stderr
                    ),
                    AUDIT_NOTE.to_string(),
                ]));
            }
        };

        if found != expected_state {
            let state_str = if found { "found" } else { "not found" };
            let expected_str = if expected_state { "exist" } else { "not exist" };
            return Err(ValidationFailure::new(vec![
                format!(
                    "Expected audit log entries for key '{rule_key}' (since '{since}') to \
                     {expected_str}, but they were {state_str}."
                ),
                AUDIT_NOTE.to_string(),
            ]));
        }
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

/// Compare an expected octal mode against the one stat reports. Three-digit
/// expectations compare the low three digits; four-digit expectations
/// compare the whole mode.
fn permissions_match(expected: &str, actual: &str) -> bool {
    let actual_norm = actual.trim_start_matches('0');
    let expected_norm = expected.trim_start_matches('0');
    match expected_norm.len() {
        0 => actual_norm.is_empty(),
        3 => {
            let tail = if actual_norm.len() >= 3 {
                &actual_norm[actual_norm.len() - 3..]
            } else {
                actual_norm
            };
            tail == expected_norm
        }
        _ => actual_norm == expected_norm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_probe(yaml: &str) -> Result<Probe, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    #[test]
    fn quoting_wraps_unsafe_strings() {
        assert_eq!(sh_quote("nginx"), "nginx");
        assert_eq!(sh_quote("/etc/fstab"), "/etc/fstab");
        assert_eq!(sh_quote("a b"), "'a b'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("$(reboot)"), "'$(reboot)'");
    }

    #[test]
    fn count_expression_parsing() {
        assert_eq!(parse_count_expr(">0"), Some((Comparator::Gt, 0)));
        assert_eq!(parse_count_expr(">= 2"), Some((Comparator::Ge, 2)));
        assert_eq!(parse_count_expr("==1"), Some((Comparator::Eq, 1)));
        assert_eq!(parse_count_expr("!=3"), Some((Comparator::Ne, 3)));
        assert_eq!(parse_count_expr("<5"), Some((Comparator::Lt, 5)));
        assert_eq!(parse_count_expr("<=5"), Some((Comparator::Le, 5)));
        assert_eq!(parse_count_expr("4"), Some((Comparator::Eq, 4)));
        assert_eq!(parse_count_expr("~5"), None);
        assert_eq!(parse_count_expr(">"), None);
    }

    #[test]
    fn comparator_semantics() {
        assert!(Comparator::Gt.holds(1, 0));
        assert!(!Comparator::Gt.holds(0, 0));
        assert!(Comparator::Ge.holds(0, 0));
        assert!(Comparator::Ne.holds(2, 3));
        assert!(!Comparator::Eq.holds(2, 3));
    }

    #[test]
    fn port_probe_accepts_boundaries_and_rejects_outside() {
        let ok_low: Probe = parse_probe(
            "type: check_port_listening\nport: 1\nexpected_state: true\n",
        )
        .unwrap();
        assert!(ok_low.validate().is_empty());

        let ok_high: Probe = parse_probe(
            "type: check_port_listening\nport: 65535\nexpected_state: true\n",
        )
        .unwrap();
        assert!(ok_high.validate().is_empty());

        let zero: Probe = parse_probe(
            "type: check_port_listening\nport: 0\nexpected_state: true\n",
        )
        .unwrap();
        assert!(!zero.validate().is_empty());

        let high: Probe = parse_probe(
            "type: check_port_listening\nport: 65536\nexpected_state: true\n",
        )
        .unwrap();
        assert!(!high.validate().is_empty());
    }

    #[test]
    fn port_command_filters_state_port_and_address() {
        let cmd = port_check_command(2222, Protocol::Tcp, None);
        assert!(cmd.starts_with("ss -nltp | awk -v port=2222 -v addr='' "));
        assert!(cmd.contains("$1==\"LISTEN\""));
        assert!(cmd.contains("exit !found"));

        let cmd = port_check_command(53, Protocol::Udp, Some("127.0.0.1"));
        assert!(cmd.starts_with("ss -nlup "));
        assert!(cmd.contains("UNCONN"));
        assert!(cmd.contains("-v addr=127.0.0.1"));
        // Wildcard binds satisfy any requested address.
        assert!(cmd.contains("a!=\"0.0.0.0\""));
        assert!(cmd.contains("a!=\"::\""));
        assert!(cmd.contains("a!=\"*\""));
    }

    #[test]
    fn service_commands_are_quoted() {
        assert_eq!(
            service_active_command("nginx"),
            "systemctl is-active --quiet nginx"
        );
        assert_eq!(
            service_enabled_command("weird name"),
            "systemctl is-enabled --quiet 'weird name'"
        );
    }

    #[test]
    fn file_commands_use_type_flags() {
        assert_eq!(file_test_command("/etc/fstab", FileType::Any), "test -e /etc/fstab");
        assert_eq!(file_test_command("/etc/fstab", FileType::File), "test -f /etc/fstab");
        assert_eq!(file_test_command("/mnt/data", FileType::Directory), "test -d /mnt/data");
        assert_eq!(
            file_stat_command("/etc/ssh/sshd_config"),
            "stat --format='%U:%u:%G:%g:%a' /etc/ssh/sshd_config"
        );
    }

    #[test]
    fn grep_commands_select_fixed_or_regex() {
        assert_eq!(
            grep_command("/etc/fstab", "defaults", true),
            "grep -q -F -- defaults /etc/fstab"
        );
        let cmd = grep_command("/etc/fstab", "^/dev/storage_vg", false);
        assert_eq!(cmd, "grep -q -E -- '^/dev/storage_vg' /etc/fstab");
    }

    #[test]
    fn lvm_commands_cover_all_check_types() {
        assert_eq!(
            lvm_command(LvmCheckType::PvExists, Some("/dev/sdb"), None, None),
            "pvs --noheadings -o pv_name /dev/sdb"
        );
        assert_eq!(
            lvm_command(LvmCheckType::VgExists, None, Some("storage_vg"), None),
            "vgs --noheadings -o vg_name storage_vg"
        );
        assert_eq!(
            lvm_command(LvmCheckType::LvExists, None, Some("storage_vg"), Some("data_lv")),
            "lvs --noheadings -o lv_name storage_vg/data_lv"
        );
        assert_eq!(
            lvm_command(LvmCheckType::LvSize, None, Some("storage_vg"), Some("data_lv")),
            "lvs --noheadings --units m -o lv_size storage_vg/data_lv"
        );
    }

    #[test]
    fn journal_command_combines_filters() {
        let cmd = journalctl_command(Some("nginx"), None, None, None, "10 minutes ago");
        assert_eq!(
            cmd,
            "journalctl --no-pager --since '10 minutes ago' -u nginx --quiet"
        );

        let cmd = journalctl_command(
            None,
            Some("sudo"),
            Some("useradd"),
            Some("session opened"),
            "1 hour ago",
        );
        assert!(cmd.contains("SYSLOG_IDENTIFIER=sudo"));
        assert!(cmd.contains("_COMM=useradd"));
        assert!(cmd.ends_with("| grep -Eq -- 'session opened'"));
        assert!(!cmd.contains("--quiet"));
    }

    #[test]
    fn ausearch_command_shape() {
        assert_eq!(
            ausearch_command("passwd_changes", "recent"),
            "ausearch --input-logs -k passwd_changes --start recent -c"
        );
    }

    #[test]
    fn pgrep_command_is_exact_match() {
        assert_eq!(pgrep_command("sshd"), "pgrep -x -- sshd");
    }

    #[test]
    fn permissions_comparison_normalizes_leading_zero() {
        assert!(permissions_match("644", "644"));
        assert!(permissions_match("0644", "644"));
        assert!(permissions_match("644", "0644"));
        assert!(permissions_match("4755", "4755"));
        assert!(!permissions_match("755", "750"));
        assert!(!permissions_match("4755", "755"));
        // A 3-digit expectation ignores setuid bits
        assert!(permissions_match("755", "4755"));
    }

    #[test]
    fn probe_yaml_round_trip_and_type_names() {
        let probe: Probe = parse_probe(
            "type: check_service_status\nservice: nginx\nexpected_status: active\ncheck_enabled: true\n",
        )
        .unwrap();
        assert_eq!(probe.type_name(), "check_service_status");
        assert!(probe.validate().is_empty());

        let probe: Probe = parse_probe(
            "type: run_command\ncommand: uname -r\nsuccess_criteria:\n  stdout_contains: generic\n",
        )
        .unwrap();
        assert_eq!(probe.type_name(), "run_command");
        assert!(probe.validate().is_empty());

        let err = parse_probe("type: totally_unknown\nfoo: 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn bad_service_status_value_is_rejected_at_parse_time() {
        let err = parse_probe("type: check_service_status\nservice: nginx\nexpected_status: dead\n");
        assert!(err.is_err());
    }

    #[test]
    fn file_contains_requires_exactly_one_matcher() {
        let neither: Probe =
            parse_probe("type: check_file_contains\npath: /etc/fstab\nexpected_state: true\n")
                .unwrap();
        assert!(!neither.validate().is_empty());

        let both: Probe = parse_probe(
            "type: check_file_contains\npath: /etc/fstab\ntext: a\nmatches_regex: b\nexpected_state: true\n",
        )
        .unwrap();
        assert!(!both.validate().is_empty());

        let regex_bad: Probe = parse_probe(
            "type: check_file_contains\npath: /etc/fstab\nmatches_regex: '['\nexpected_state: true\n",
        )
        .unwrap();
        let errors = regex_bad.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Invalid regex"));
    }

    #[test]
    fn lvm_probe_field_requirements() {
        let pv: Probe =
            parse_probe("type: check_lvm_state\ncheck_type: pv_exists\n").unwrap();
        assert!(!pv.validate().is_empty());

        let lv_size: Probe = parse_probe(
            "type: check_lvm_state\ncheck_type: lv_size\nvg_name: vg\nlv_name: lv\n",
        )
        .unwrap();
        let errors = lv_size.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("min_size_mb"));

        let ok: Probe = parse_probe(
            "type: check_lvm_state\ncheck_type: lv_size\nvg_name: vg\nlv_name: lv\nmin_size_mb: 95\nmax_size_mb: 105\n",
        )
        .unwrap();
        assert!(ok.validate().is_empty());
    }

    #[test]
    fn history_probe_requirements() {
        let bare: Probe = parse_probe("type: check_history\n").unwrap();
        assert!(!bare.validate().is_empty());

        let count_without_pattern: Probe = parse_probe(
            "type: check_history\ndisallowed_commands: ['rm -rf /']\nexpected_count: '>0'\n",
        )
        .unwrap();
        assert!(count_without_pattern
            .validate()
            .iter()
            .any(|e| e.contains("expected_count")));

        let ok: Probe = parse_probe(
            "type: check_history\ncommand_pattern: 'lvcreate'\nexpected_count: '>0'\n",
        )
        .unwrap();
        assert!(ok.validate().is_empty());

        let exact: Probe = parse_probe(
            "type: check_history\ncommand_pattern: 'lvcreate'\nexpected_count: 2\n",
        )
        .unwrap();
        assert!(exact.validate().is_empty());
    }

    #[test]
    fn journal_probe_requires_a_filter() {
        let bare: Probe = parse_probe("type: check_journalctl\n").unwrap();
        assert!(!bare.validate().is_empty());

        let ok: Probe = parse_probe("type: check_journalctl\nservice: sshd\n").unwrap();
        assert!(ok.validate().is_empty());
    }

    #[test]
    fn defaults_applied_on_deserialize() {
        let probe: Probe = parse_probe("type: check_journalctl\nservice: sshd\n").unwrap();
        if let Probe::CheckJournalctl {
            since,
            expected_state,
            ..
        } = probe
        {
            assert_eq!(since, "10 minutes ago");
            assert!(expected_state);
        } else {
            panic!("wrong variant");
        }

        let probe: Probe = parse_probe("type: check_audit_log\nrule_key: watch_passwd\n").unwrap();
        if let Probe::CheckAuditLog { since, .. } = probe {
            assert_eq!(since, "recent");
        } else {
            panic!("wrong variant");
        }

        let probe: Probe = parse_probe(
            "type: check_port_listening\nport: 80\nexpected_state: true\n",
        )
        .unwrap();
        if let Probe::CheckPortListening { protocol, .. } = probe {
            assert_eq!(protocol, Protocol::Tcp);
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn truncation_marks_long_patterns() {
        assert_eq!(truncate("short", 30), "short");
        let long = "x".repeat(40);
        let t = truncate(&long, 30);
        assert!(t.ends_with("..."));
        assert_eq!(t.len(), 33);
    }
}
