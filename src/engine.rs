// src/engine.rs
// Run orchestration: snapshot -> start -> setup -> user phase ->
// validation -> scoring -> cleanup. The engine emits structured events and
// returns a report; rendering and prompting belong to the caller.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::agent::AgentClient;
use crate::challenge::{
    load_challenges_from_dir, Challenge, Hint, PackageManager, SetupStep,
};
use crate::config::Config;
use crate::errors::LabError;
use crate::events::{EventSink, RunEvent, StepOutcome};
use crate::hypervisor::Hypervisor;
use crate::network::{discover_ip, validate_ssh_key, SshRunner, SshTarget};
use crate::snapshot::SnapshotController;
use crate::validator::{sh_quote, Validator};

/// Signals fed into the engine's user phase from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Hint,
    Proceed,
    Cancel,
}

/// Per-run knobs, assembled by the caller from config and flags.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub challenge_id: String,
    pub vm_name: String,
    pub snapshot_name: String,
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub simulate_user: bool,
    pub keep_snapshot: bool,
    pub verbose: bool,
}

/// What one attempt produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub challenge_id: String,
    pub challenge_name: String,
    pub passed: bool,
    pub base_score: u32,
    pub final_score: u32,
    pub hints_used: usize,
    pub total_hint_cost: u32,
    pub failure_reasons: Vec<String>,
    pub flag: Option<String>,
}

/// Hint bookkeeping: which hints were taken and what they cost.
#[derive(Debug, Default)]
pub struct HintLedger {
    used: usize,
    total_cost: u32,
}

impl HintLedger {
    /// Take the next unseen hint, if any.
    pub fn take<'a>(&mut self, hints: &'a [Hint]) -> Option<&'a Hint> {
        let hint = hints.get(self.used)?;
        self.used += 1;
        self.total_cost += hint.cost;
        Some(hint)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn total_cost(&self) -> u32 {
        self.total_cost
    }

    /// `max(0, base - spent)`.
    pub fn running_score(&self, base_score: u32) -> u32 {
        base_score.saturating_sub(self.total_cost)
    }
}

fn cache_command(manager: PackageManager) -> &'static str {
    match manager {
        PackageManager::Apt => "sudo apt-get update",
        PackageManager::Dnf => "sudo dnf makecache",
        PackageManager::Yum => "sudo yum makecache fast",
        PackageManager::Zypper => "sudo zypper refresh",
    }
}

fn install_command(manager: PackageManager, package: &str) -> String {
    let package = sh_quote(package);
    match manager {
        PackageManager::Apt => {
            format!("sudo apt-get install -y --no-install-recommends {package}")
        }
        PackageManager::Dnf => format!("sudo dnf install -y {package}"),
        PackageManager::Yum => format!("sudo yum install -y {package}"),
        PackageManager::Zypper => format!("sudo zypper install -y {package}"),
    }
}

struct RunContext {
    hypervisor: Option<Hypervisor>,
    domain: Option<virt::domain::Domain>,
    snapshot_created: bool,
}

pub struct ChallengeEngine {
    config: Config,
    runner: SshRunner,
    sink: Arc<dyn EventSink>,
    cancel: watch::Receiver<bool>,
}

impl ChallengeEngine {
    pub fn new(config: Config, sink: Arc<dyn EventSink>, cancel: watch::Receiver<bool>) -> Self {
        let runner = SshRunner::from_config(&config.ssh);
        ChallengeEngine {
            config,
            runner,
            sink,
            cancel,
        }
    }

    /// Race a fallible operation against cancellation. Used at every
    /// suspension point outside cleanup; cleanup itself always runs.
    async fn with_cancel<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, LabError>>,
    ) -> Result<T, LabError> {
        let mut cancel = self.cancel.clone();
        if *cancel.borrow() {
            return Err(LabError::Cancelled);
        }
        tokio::select! {
            res = fut => res,
            _ = cancel.changed() => Err(LabError::Cancelled),
        }
    }

    /// Run one challenge end to end. Cleanup executes on every path,
    /// including errors and cancellation.
    pub async fn run(
        &self,
        opts: &RunOptions,
        mut user_actions: Option<mpsc::Receiver<UserAction>>,
    ) -> Result<RunReport, LabError> {
        self.sink.emit(RunEvent::RunStarted {
            challenge_id: opts.challenge_id.clone(),
            vm_name: opts.vm_name.clone(),
            snapshot_name: opts.snapshot_name.clone(),
        });

        let mut ctx = RunContext {
            hypervisor: None,
            domain: None,
            snapshot_created: false,
        };

        let outcome = self
            .run_inner(opts, &mut ctx, user_actions.as_mut())
            .await;

        self.cleanup(opts, &mut ctx).await;
        self.sink.emit(RunEvent::RunFinished);
        outcome
    }

    async fn run_inner(
        &self,
        opts: &RunOptions,
        ctx: &mut RunContext,
        user_actions: Option<&mut mpsc::Receiver<UserAction>>,
    ) -> Result<RunReport, LabError> {
        // 1. Challenge lookup
        let challenges = load_challenges_from_dir(
            &self.config.challenges_dir(),
            self.config.challenges.default_score,
        )?;
        let challenge = challenges
            .get(&opts.challenge_id)
            .ok_or_else(|| LabError::ChallengeLoad {
                message: format!(
                    "Challenge '{}' not found among valid challenges in '{}'.",
                    opts.challenge_id,
                    self.config.challenges_dir().display()
                ),
            })?;
        let key_path = validate_ssh_key(&opts.ssh_key_path)?;

        // 2. Hypervisor connection and domain
        let hypervisor = Hypervisor::connect(&self.config.vm.uri)?;
        let domain = hypervisor.find(&opts.vm_name)?;
        ctx.hypervisor = Some(hypervisor);
        ctx.domain = Some(domain);
        let hypervisor = ctx.hypervisor.as_ref().expect("just set");
        let domain = ctx.domain.as_ref().expect("just set");

        let agent = AgentClient::new(&self.config.vm.uri, &opts.vm_name);
        let snapshots = self.snapshot_controller(opts);

        // 3. Clean slate: drop any leftover snapshot with our name, then
        // take the pre-run snapshot.
        if snapshots.exists(&opts.snapshot_name).await? {
            warn!(
                snapshot_name = %opts.snapshot_name,
                "Found existing snapshot; deleting it first"
            );
            snapshots
                .delete(hypervisor, domain, &opts.snapshot_name)
                .await?;
        }
        self.with_cancel(snapshots.create(domain, &agent, &opts.snapshot_name))
            .await?;
        ctx.snapshot_created = true;
        self.sink.emit(RunEvent::SnapshotCreated {
            snapshot_name: opts.snapshot_name.clone(),
        });

        // 4. Power on, find the address, wait for SSH
        self.with_cancel(hypervisor.start(domain)).await?;
        let ip = self.with_cancel(discover_ip(domain, &agent)).await?;
        let target = SshTarget {
            host: ip.clone(),
            user: opts.ssh_user.clone(),
            key_path,
        };
        self.with_cancel(self.runner.wait_for_ready(&target)).await?;
        self.sink.emit(RunEvent::VmReady { ip });

        // 5-6. Setup
        self.run_setup(challenge, &target).await?;

        // 7. User phase
        let mut ledger = HintLedger::default();
        if opts.simulate_user {
            self.simulate_user_action(challenge, &target).await?;
        } else {
            self.user_phase(challenge, &target, &mut ledger, user_actions)
                .await?;
        }

        // 8. Validation
        let (passed, failure_reasons) = self.run_validation(challenge, &target).await?;

        // 9. Score
        let base_score = challenge.score;
        let final_score = if passed {
            ledger.running_score(base_score)
        } else {
            0
        };
        let flag = if passed { challenge.flag.clone() } else { None };
        self.sink.emit(RunEvent::Result {
            passed,
            final_score,
            base_score,
            hints_used: ledger.used(),
            total_hint_cost: ledger.total_cost(),
            flag: flag.clone(),
        });

        Ok(RunReport {
            challenge_id: challenge.id.clone(),
            challenge_name: challenge.name.clone(),
            passed,
            base_score,
            final_score,
            hints_used: ledger.used(),
            total_hint_cost: ledger.total_cost(),
            failure_reasons,
            flag,
        })
    }

    fn snapshot_controller(&self, opts: &RunOptions) -> SnapshotController {
        SnapshotController::new(
            &self.config.vm.uri,
            &opts.vm_name,
            self.config.snapshot.keep_overlays,
            self.config.snapshot.permission_repair,
            Duration::from_secs(self.config.vm.shutdown_timeout_secs),
            Arc::clone(&self.sink),
        )
    }

    async fn run_setup(
        &self,
        challenge: &Challenge,
        target: &SshTarget,
    ) -> Result<(), LabError> {
        for (i, step) in challenge.setup.iter().enumerate() {
            let index = i + 1;
            let step_type = step.type_name().to_string();
            let result = self.with_cancel(self.execute_setup_step(step, target)).await;
            match result {
                Ok(detail) => {
                    self.sink.emit(RunEvent::SetupStep {
                        index,
                        step_type,
                        outcome: StepOutcome::Passed,
                        detail,
                    });
                }
                Err(e) => {
                    self.sink.emit(RunEvent::SetupStep {
                        index,
                        step_type,
                        outcome: StepOutcome::Error,
                        detail: Some(e.to_string()),
                    });
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn execute_setup_step(
        &self,
        step: &SetupStep,
        target: &SshTarget,
    ) -> Result<Option<String>, LabError> {
        match step {
            SetupStep::RunCommand { command, .. } => {
                let result = self.runner.run(target, command).await.map_err(|e| {
                    LabError::SshCommand {
                        host: target.host.clone(),
                        message: format!(
                            "Challenge setup failed: error executing '{command}': {e}"
                        ),
                    }
                })?;
                if let Some(error) = &result.error {
                    return Err(LabError::SshCommand {
                        host: target.host.clone(),
                        message: format!("Challenge setup failed: '{command}': {error}"),
                    });
                }
                if result.exit_status != 0 {
                    return Err(LabError::SshCommand {
                        host: target.host.clone(),
                        message: format!(
                            "Challenge setup failed: '{command}' exited with status {}. \
                             STDERR: {}",
                            result.exit_status, result.stderr
                        ),
                    });
                }
                Ok(None)
            }
            SetupStep::EnsurePackageInstalled {
                package,
                manager_type,
                update_cache,
            } => {
                let manager = match manager_type {
                    Some(manager) => *manager,
                    None => self.detect_package_manager(target).await?,
                };

                if *update_cache {
                    let cache_cmd = cache_command(manager);
                    match self.runner.run(target, cache_cmd).await {
                        Ok(result) if result.succeeded() => {}
                        Ok(result) => warn!(
                            exit_status = result.exit_status,
                            "Package cache update failed; install might fail"
                        ),
                        Err(e) => warn!("SSH error updating package cache: {e}"),
                    }
                }

                let install_cmd = install_command(manager, package);
                let result =
                    self.runner
                        .run(target, &install_cmd)
                        .await
                        .map_err(|e| LabError::SshCommand {
                            host: target.host.clone(),
                            message: format!(
                                "Challenge setup failed: SSH error installing '{package}': {e}"
                            ),
                        })?;
                if !result.succeeded() {
                    // Non-zero often just means "already installed"; note it
                    // and move on.
                    warn!(
                        package = %package,
                        exit_status = result.exit_status,
                        "Package install exited non-zero; assuming installed"
                    );
                }
                Ok(Some(format!(
                    "ensured '{package}' via {}",
                    manager.label()
                )))
            }
        }
    }

    async fn detect_package_manager(
        &self,
        target: &SshTarget,
    ) -> Result<PackageManager, LabError> {
        let probe = |cmd: &'static str| self.runner.run(target, cmd);
        if let Ok(result) = probe("command -v dpkg").await {
            if result.exit_status == 0 {
                return Ok(PackageManager::Apt);
            }
        }
        if let Ok(result) = probe("command -v rpm").await {
            if result.exit_status == 0 {
                let dnf = probe("command -v dnf").await;
                return Ok(match dnf {
                    Ok(result) if result.exit_status == 0 => PackageManager::Dnf,
                    _ => PackageManager::Yum,
                });
            }
        }
        if let Ok(result) = probe("command -v zypper").await {
            if result.exit_status == 0 {
                return Ok(PackageManager::Zypper);
            }
        }
        Err(LabError::Configuration {
            message: "Challenge setup failed: cannot determine the VM's package manager."
                .to_string(),
        })
    }

    async fn simulate_user_action(
        &self,
        challenge: &Challenge,
        target: &SshTarget,
    ) -> Result<(), LabError> {
        let Some(command) = &challenge.user_action_simulation else {
            info!("No user_action_simulation defined; nothing to simulate");
            return Ok(());
        };
        info!(command = %command, "Simulating user action");
        match self.with_cancel(async {
            self.runner
                .run(target, command)
                .await
        })
        .await
        {
            Ok(result) if result.succeeded() => {
                info!("Simulation command successful");
            }
            Ok(result) => {
                // Simulation trouble is a warning: validation will tell the
                // real story.
                warn!(
                    exit_status = result.exit_status,
                    error = result.error.as_deref().unwrap_or(""),
                    "User action simulation failed; validation might fail"
                );
            }
            Err(LabError::Cancelled) => return Err(LabError::Cancelled),
            Err(e) => {
                warn!("Failed to execute simulation command: {e}");
            }
        }
        Ok(())
    }

    /// Cooperative pause: announce readiness, serve hint requests, and wait
    /// for the proceed signal. A closed channel counts as cancellation.
    async fn user_phase(
        &self,
        challenge: &Challenge,
        target: &SshTarget,
        ledger: &mut HintLedger,
        user_actions: Option<&mut mpsc::Receiver<UserAction>>,
    ) -> Result<(), LabError> {
        let actions = user_actions.ok_or_else(|| LabError::Configuration {
            message: "Interactive run requires a user action channel.".to_string(),
        })?;

        self.sink.emit(RunEvent::UserReady {
            connect_hint: target.connect_hint(),
            objective: challenge.description.clone(),
        });

        loop {
            let mut cancel = self.cancel.clone();
            let action = tokio::select! {
                action = actions.recv() => action,
                _ = cancel.changed() => return Err(LabError::Cancelled),
            };
            match action {
                Some(UserAction::Hint) => match ledger.take(&challenge.hints) {
                    Some(hint) => {
                        let index = ledger.used();
                        self.sink.emit(RunEvent::HintViewed {
                            index,
                            text: hint.text.clone(),
                            cost: hint.cost,
                            running_score: ledger.running_score(challenge.score),
                        });
                    }
                    None => info!("All hints already shown"),
                },
                Some(UserAction::Proceed) => return Ok(()),
                Some(UserAction::Cancel) | None => return Err(LabError::Cancelled),
            }
        }
    }

    /// Run the probe list in document order, stopping at the first failure.
    /// An empty probe list is a failure, not a pass.
    async fn run_validation(
        &self,
        challenge: &Challenge,
        target: &SshTarget,
    ) -> Result<(bool, Vec<String>), LabError> {
        let probes = challenge.probes();
        if probes.is_empty() {
            warn!("No validation steps found for this challenge; treating as failure");
            return Ok((false, vec!["No validation steps defined.".to_string()]));
        }

        let validator = Validator::new(&self.runner, target);
        for (i, probe) in probes.iter().enumerate() {
            let index = i + 1;
            let step_type = probe.type_name().to_string();
            let result = self
                .with_cancel(async {
                    Ok(validator.execute(index, probe).await)
                })
                .await?;
            match result {
                Ok(()) => {
                    self.sink.emit(RunEvent::ValidationStep {
                        index,
                        step_type,
                        outcome: StepOutcome::Passed,
                        reasons: Vec::new(),
                    });
                }
                Err(failure) => {
                    self.sink.emit(RunEvent::ValidationStep {
                        index,
                        step_type,
                        outcome: StepOutcome::Failed,
                        reasons: failure.reasons.clone(),
                    });
                    info!("Stopping validation due to step failure");
                    return Ok((false, failure.reasons));
                }
            }
        }
        Ok((true, Vec::new()))
    }

    /// Revert, delete (unless kept), close. Always runs; failures are
    /// reported but never change the run's verdict.
    async fn cleanup(&self, opts: &RunOptions, ctx: &mut RunContext) {
        let snapshots = self.snapshot_controller(opts);

        if ctx.snapshot_created {
            if let (Some(hypervisor), Some(domain)) = (&ctx.hypervisor, &ctx.domain) {
                match snapshots.revert(hypervisor, domain, &opts.snapshot_name).await {
                    Ok(()) => self.sink.emit(RunEvent::CleanupStep {
                        name: "revert_snapshot".to_string(),
                        outcome: StepOutcome::Passed,
                        detail: None,
                    }),
                    Err(e) => {
                        warn!("Cleanup: snapshot revert failed: {e}");
                        self.sink.emit(RunEvent::CleanupStep {
                            name: "revert_snapshot".to_string(),
                            outcome: StepOutcome::Error,
                            detail: Some(e.to_string()),
                        });
                    }
                }

                if opts.keep_snapshot {
                    info!(
                        snapshot_name = %opts.snapshot_name,
                        "Keeping snapshot as requested"
                    );
                    self.sink.emit(RunEvent::CleanupStep {
                        name: "delete_snapshot".to_string(),
                        outcome: StepOutcome::Skipped,
                        detail: Some("keep_snapshot set".to_string()),
                    });
                } else {
                    match snapshots.delete(hypervisor, domain, &opts.snapshot_name).await {
                        Ok(()) => self.sink.emit(RunEvent::CleanupStep {
                            name: "delete_snapshot".to_string(),
                            outcome: StepOutcome::Passed,
                            detail: None,
                        }),
                        Err(e) => {
                            warn!("Cleanup: snapshot delete failed: {e}");
                            self.sink.emit(RunEvent::CleanupStep {
                                name: "delete_snapshot".to_string(),
                                outcome: StepOutcome::Error,
                                detail: Some(e.to_string()),
                            });
                        }
                    }
                }
            }
        }

        if let Some(hypervisor) = ctx.hypervisor.as_mut() {
            hypervisor.close();
            self.sink.emit(RunEvent::CleanupStep {
                name: "close_connection".to_string(),
                outcome: StepOutcome::Passed,
                detail: None,
            });
        }
        ctx.domain = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints() -> Vec<Hint> {
        vec![
            Hint {
                text: "first".to_string(),
                cost: 10,
            },
            Hint {
                text: "second".to_string(),
                cost: 25,
            },
            Hint {
                text: "free".to_string(),
                cost: 0,
            },
        ]
    }

    #[test]
    fn hint_ledger_accounts_costs_in_order() {
        let hints = hints();
        let mut ledger = HintLedger::default();
        assert_eq!(ledger.running_score(100), 100);

        assert_eq!(ledger.take(&hints).unwrap().text, "first");
        assert_eq!(ledger.used(), 1);
        assert_eq!(ledger.total_cost(), 10);
        assert_eq!(ledger.running_score(100), 90);

        assert_eq!(ledger.take(&hints).unwrap().text, "second");
        assert_eq!(ledger.total_cost(), 35);
        assert_eq!(ledger.running_score(100), 65);

        assert_eq!(ledger.take(&hints).unwrap().cost, 0);
        assert_eq!(ledger.total_cost(), 35);

        // Exhausted: no further hints, accounting unchanged.
        assert!(ledger.take(&hints).is_none());
        assert_eq!(ledger.used(), 3);
        assert!(ledger.used() <= hints.len());
    }

    #[test]
    fn running_score_floors_at_zero() {
        let hints = vec![Hint {
            text: "expensive".to_string(),
            cost: 150,
        }];
        let mut ledger = HintLedger::default();
        ledger.take(&hints);
        assert_eq!(ledger.running_score(100), 0);
    }

    #[test]
    fn package_commands_per_manager() {
        assert_eq!(cache_command(PackageManager::Apt), "sudo apt-get update");
        assert_eq!(cache_command(PackageManager::Zypper), "sudo zypper refresh");
        assert_eq!(
            install_command(PackageManager::Apt, "lvm2"),
            "sudo apt-get install -y --no-install-recommends lvm2"
        );
        assert_eq!(
            install_command(PackageManager::Dnf, "nginx"),
            "sudo dnf install -y nginx"
        );
        assert_eq!(
            install_command(PackageManager::Yum, "audit"),
            "sudo yum install -y audit"
        );
        assert_eq!(
            install_command(PackageManager::Zypper, "weird pkg"),
            "sudo zypper install -y 'weird pkg'"
        );
    }
}
