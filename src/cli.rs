// src/cli.rs
// Command-line surface. A thin adapter: parses arguments, renders engine
// events as plain text, and feeds user input into the engine's user phase.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::challenge::load_challenges_from_dir;
use crate::config::Config;
use crate::engine::{ChallengeEngine, RunOptions, UserAction};
use crate::errors::LabError;
use crate::events::{EventSink, NullSink, RunEvent, StepOutcome};
use crate::hypervisor::Hypervisor;
use crate::snapshot::SnapshotController;

/// labforge: disposable-VM practice environments for Linux training
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional path to the labforge configuration file
    #[clap(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Set log level
    #[clap(long, value_name = "LEVEL", value_enum, default_value_t = LogLevelCli::Info)]
    pub log_level: LogLevelCli,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a challenge: snapshot, start, setup, user phase, validate, clean up
    Run {
        /// The challenge ID (must match 'id' in a challenge file)
        challenge_id: String,

        /// Name of the libvirt VM to use
        #[clap(long = "vm", value_name = "NAME")]
        vm_name: Option<String>,

        /// Name for the temporary VM snapshot
        #[clap(long = "snap", value_name = "NAME")]
        snapshot_name: Option<String>,

        /// Directory containing challenge YAML files
        #[clap(long, short = 'd', value_name = "DIR")]
        challenges_dir: Option<PathBuf>,

        /// SSH username inside the VM
        #[clap(long = "user", value_name = "USER")]
        ssh_user: Option<String>,

        /// Path to the SSH private key file
        #[clap(long = "key", value_name = "FILE")]
        ssh_key: Option<String>,

        /// Run 'user_action_simulation' automatically instead of pausing
        #[clap(long)]
        simulate: bool,

        /// Do not delete the snapshot after the run (for debugging)
        #[clap(long)]
        keep_snapshot: bool,

        /// Print detailed command output during setup and validation
        #[clap(short, long)]
        verbose: bool,
    },

    /// List libvirt domains visible to the configured URI
    ListVms,

    /// List valid challenges in the challenges directory
    ListChallenges {
        /// Directory containing challenge YAML files
        #[clap(long, short = 'd', value_name = "DIR")]
        challenges_dir: Option<PathBuf>,
    },

    /// List snapshots of a VM
    ListSnapshots {
        /// Name of the libvirt VM
        #[clap(long = "vm", value_name = "NAME")]
        vm_name: Option<String>,
    },

    /// Delete a snapshot (shuts the VM down first if needed)
    DeleteSnapshot {
        /// Name of the libvirt VM
        #[clap(long = "vm", value_name = "NAME")]
        vm_name: Option<String>,

        /// Snapshot name
        #[clap(long = "snap", value_name = "NAME")]
        snapshot_name: Option<String>,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum LogLevelCli {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevelCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevelCli::Trace => "trace",
            LogLevelCli::Debug => "debug",
            LogLevelCli::Info => "info",
            LogLevelCli::Warn => "warn",
            LogLevelCli::Error => "error",
        };
        f.write_str(s)
    }
}

/// Renders engine events as plain text on stdout.
struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn emit(&self, event: RunEvent) {
        match event {
            RunEvent::RunStarted {
                challenge_id,
                vm_name,
                snapshot_name,
            } => {
                println!("=== Starting challenge '{challenge_id}' (VM: {vm_name}, snapshot: {snapshot_name}) ===");
            }
            RunEvent::SnapshotCreated { snapshot_name } => {
                println!("[snapshot] created '{snapshot_name}'");
            }
            RunEvent::VmReady { ip } => {
                println!("[vm] ready at {ip}");
            }
            RunEvent::SetupStep {
                index,
                step_type,
                outcome,
                detail,
            } => {
                let detail = detail.map(|d| format!(" ({d})")).unwrap_or_default();
                println!("[setup {index}] {step_type}: {}{detail}", outcome_label(outcome));
            }
            RunEvent::UserReady {
                connect_hint,
                objective,
            } => {
                println!("\n--- Your turn ---");
                println!("Connect to the VM:\n  {connect_hint}\n");
                println!("Objective:\n{objective}");
                println!("\nType 'hint' for a hint, press Enter to validate, 'quit' to abort.");
            }
            RunEvent::HintViewed {
                index,
                text,
                cost,
                running_score,
            } => {
                println!("\nHint #{index} (cost: {cost}):\n{text}");
                println!("-> current score potential: {running_score}");
            }
            RunEvent::ValidationStep {
                index,
                step_type,
                outcome,
                reasons,
            } => {
                println!("[validate {index}] {step_type}: {}", outcome_label(outcome));
                for reason in reasons {
                    println!("    - {reason}");
                }
            }
            RunEvent::Result {
                passed,
                final_score,
                base_score,
                hints_used,
                total_hint_cost,
                flag,
            } => {
                println!("\n=== {} ===", if passed { "PASSED" } else { "FAILED" });
                println!("Score: {final_score} / {base_score}");
                println!("Hints used: {hints_used} (cost: {total_hint_cost})");
                if let Some(flag) = flag {
                    println!("Flag: {flag}");
                }
            }
            RunEvent::CleanupStep {
                name,
                outcome,
                detail,
            } => {
                let detail = detail.map(|d| format!(" ({d})")).unwrap_or_default();
                println!("[cleanup] {name}: {}{detail}", outcome_label(outcome));
            }
            RunEvent::PermissionRepaired {
                path,
                outcome,
                detail,
            } => {
                let detail = detail.map(|d| format!(" ({d})")).unwrap_or_default();
                println!("[permissions] {path}: {}{detail}", outcome_label(outcome));
            }
            RunEvent::RunFinished => {
                println!("\n>>> Practice session finished. <<<");
            }
        }
    }
}

fn outcome_label(outcome: StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::Passed => "ok",
        StepOutcome::Failed => "FAILED",
        StepOutcome::Error => "ERROR",
        StepOutcome::Skipped => "skipped",
    }
}

/// Read user-phase actions from stdin on a blocking thread.
fn spawn_stdin_reader(tx: mpsc::Sender<UserAction>) {
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            if stdin.read_line(&mut line).unwrap_or(0) == 0 {
                let _ = tx.blocking_send(UserAction::Cancel);
                break;
            }
            let action = match line.trim() {
                "hint" => UserAction::Hint,
                "quit" | "q" => UserAction::Cancel,
                _ => UserAction::Proceed,
            };
            let proceed = action == UserAction::Proceed || action == UserAction::Cancel;
            if tx.blocking_send(action).is_err() || proceed {
                break;
            }
        }
    });
}

/// Dispatch a parsed command. The returned value is the process exit code.
pub async fn handle_command(
    command: Commands,
    mut config: Config,
    cancel: watch::Receiver<bool>,
) -> Result<i32, LabError> {
    match command {
        Commands::Run {
            challenge_id,
            vm_name,
            snapshot_name,
            challenges_dir,
            ssh_user,
            ssh_key,
            simulate,
            keep_snapshot,
            verbose,
        } => {
            if let Some(dir) = challenges_dir {
                config.challenges.dir = dir.to_string_lossy().into_owned();
            }
            let opts = RunOptions {
                challenge_id,
                vm_name: vm_name.unwrap_or_else(|| config.vm.name.clone()),
                snapshot_name: snapshot_name.unwrap_or_else(|| config.snapshot.name.clone()),
                ssh_user: ssh_user.unwrap_or_else(|| config.ssh.user.clone()),
                ssh_key_path: ssh_key.unwrap_or_else(|| config.ssh.key_path.clone()),
                simulate_user: simulate,
                keep_snapshot,
                verbose,
            };

            let engine = ChallengeEngine::new(config, Arc::new(ConsoleSink), cancel);

            let user_actions = if opts.simulate_user {
                None
            } else {
                let (tx, rx) = mpsc::channel(16);
                spawn_stdin_reader(tx);
                Some(rx)
            };

            match engine.run(&opts, user_actions).await {
                Ok(report) => Ok(if report.passed { 0 } else { 1 }),
                Err(LabError::Cancelled) => {
                    eprintln!("Challenge run interrupted.");
                    Ok(130)
                }
                Err(e) => Err(e),
            }
        }

        Commands::ListVms => {
            let mut hypervisor = Hypervisor::connect(&config.vm.uri)?;
            let rows = hypervisor.list()?;
            hypervisor.close();
            if rows.is_empty() {
                println!("No VMs found.");
            } else {
                println!("{:<30} {:<14} {:>5} {:>10} {:>6}", "NAME", "STATE", "CPUS", "MEM(MB)", "ID");
                for row in rows {
                    println!(
                        "{:<30} {:<14} {:>5} {:>10} {:>6}",
                        row.name,
                        row.state,
                        row.cpu_count,
                        row.memory_mb,
                        row.runtime_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            Ok(0)
        }

        Commands::ListChallenges { challenges_dir } => {
            let dir = challenges_dir.unwrap_or_else(|| config.challenges_dir());
            let challenges =
                load_challenges_from_dir(&dir, config.challenges.default_score)?;
            if challenges.is_empty() {
                println!("No valid challenges found in '{}'.", dir.display());
            } else {
                for challenge in challenges.values() {
                    println!(
                        "{:<24} {:<40} [{} / {} / score {}]",
                        challenge.id,
                        challenge.name,
                        challenge.category.as_deref().unwrap_or("-"),
                        challenge.difficulty.as_deref().unwrap_or("-"),
                        challenge.score
                    );
                }
            }
            Ok(0)
        }

        Commands::ListSnapshots { vm_name } => {
            let vm_name = vm_name.unwrap_or_else(|| config.vm.name.clone());
            let controller = snapshot_controller(&config, &vm_name);
            let rows = controller.list().await?;
            if rows.is_empty() {
                println!("No snapshots found for '{vm_name}'.");
            } else {
                println!(
                    "{:<32} {:<20} {:<10} {:<14} DESCRIPTION",
                    "NAME", "CREATED", "STATE", "TYPE"
                );
                for row in rows {
                    println!(
                        "{:<32} {:<20} {:<10} {:<14} {}",
                        row.name, row.created, row.state, row.kind, row.description
                    );
                }
            }
            Ok(0)
        }

        Commands::DeleteSnapshot {
            vm_name,
            snapshot_name,
        } => {
            let vm_name = vm_name.unwrap_or_else(|| config.vm.name.clone());
            let snapshot_name = snapshot_name.unwrap_or_else(|| config.snapshot.name.clone());
            let mut hypervisor = Hypervisor::connect(&config.vm.uri)?;
            let result = async {
                let domain = hypervisor.find(&vm_name)?;
                let controller = snapshot_controller(&config, &vm_name);
                controller.delete(&hypervisor, &domain, &snapshot_name).await
            }
            .await;
            hypervisor.close();
            result?;
            println!("Snapshot '{snapshot_name}' deleted (or already absent).");
            Ok(0)
        }
    }
}

fn snapshot_controller(config: &Config, vm_name: &str) -> SnapshotController {
    SnapshotController::new(
        &config.vm.uri,
        vm_name,
        config.snapshot.keep_overlays,
        config.snapshot.permission_repair,
        Duration::from_secs(config.vm.shutdown_timeout_secs),
        Arc::new(NullSink),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_command_parses_flags() {
        let cli = Cli::parse_from([
            "labforge",
            "run",
            "lvm-volume-01",
            "--vm",
            "fedora-lab",
            "--snap",
            "mysnap",
            "--simulate",
            "--keep-snapshot",
        ]);
        match cli.command {
            Commands::Run {
                challenge_id,
                vm_name,
                snapshot_name,
                simulate,
                keep_snapshot,
                ..
            } => {
                assert_eq!(challenge_id, "lvm-volume-01");
                assert_eq!(vm_name.as_deref(), Some("fedora-lab"));
                assert_eq!(snapshot_name.as_deref(), Some("mysnap"));
                assert!(simulate);
                assert!(keep_snapshot);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn list_subcommands_parse() {
        assert!(matches!(
            Cli::parse_from(["labforge", "list-vms"]).command,
            Commands::ListVms
        ));
        assert!(matches!(
            Cli::parse_from(["labforge", "list-snapshots", "--vm", "x"]).command,
            Commands::ListSnapshots { .. }
        ));
        assert!(matches!(
            Cli::parse_from(["labforge", "delete-snapshot"]).command,
            Commands::DeleteSnapshot { .. }
        ));
    }
}
