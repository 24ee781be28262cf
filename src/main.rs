// src/main.rs

mod agent;
mod challenge;
mod cli;
mod config;
mod engine;
mod errors;
mod events;
mod hypervisor;
mod network;
mod snapshot;
mod validator;
mod xml;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, warn};
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry,
};

use cli::Cli;
use config::Config;

#[tokio::main]
async fn main() {
    let cli_args = Cli::parse();

    // RUST_LOG wins over --log-level; everything goes to stderr so stdout
    // stays clean for command output. `run -v` bumps the level to debug,
    // which includes every remote command and its captured output.
    let verbose_run = matches!(&cli_args.command, cli::Commands::Run { verbose: true, .. });
    let default_level = if verbose_run {
        "debug".to_string()
    } else {
        cli_args.log_level.to_string()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    Registry::default().with(env_filter).with(console_layer).init();

    // Panics are the "unexpected fatal" class.
    std::panic::set_hook(Box::new(|info| {
        eprintln!("unexpected fatal error: {info}");
        std::process::exit(2);
    }));

    let explicit_config = cli_args.config.is_some();
    let config = match Config::load(cli_args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            if explicit_config {
                error!("Failed to load configuration: {e}");
                std::process::exit(1);
            }
            warn!("Proceeding with default configuration: {e}");
            Config::default()
        }
    };

    // Ctrl-C flips the cancellation signal; the engine finishes cleanup and
    // the run surfaces as interrupted (exit 130).
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let code = match cli::handle_command(cli_args.command, config, cancel_rx).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            1
        }
    };
    std::process::exit(code);
}
