mod cli;
mod config;
mod error;

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, LogFormat, RegisterArgs, RunArgs};
use crate::error::{CliError, exit_code};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { exit_code::USAGE } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Err(err) = run(&cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, configured: &str, format: LogFormat) {
    let level = match verbosity {
        0 => configured,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::ConfigPath => {
            println!("{}", config::resolve_path(&cli.global).display());
            Ok(())
        }
        Command::Run(args) => run_bridge(cli, args).await,
        Command::Register(args) => register(cli, args).await,
    }
}

async fn run_bridge(cli: &Cli, args: &RunArgs) -> Result<(), CliError> {
    let path = config::resolve_path(&cli.global);
    let mut cfg = config::load(&cli.global)?;
    config::apply_run_overrides(&mut cfg, args);
    init_tracing(cli.global.verbose, &cfg.log_level, cli.global.log_format);

    let bridge_config = cfg
        .into_bridge_config()
        .map_err(|e| CliError::from_config(e, &path))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    pushok_core::run_bridge(bridge_config, cancel).await?;
    info!("bridge stopped");
    Ok(())
}

async fn register(cli: &Cli, args: &RegisterArgs) -> Result<(), CliError> {
    let path = config::resolve_path(&cli.global);
    let cfg = config::load(&cli.global)?;
    init_tracing(cli.global.verbose, &cfg.log_level, cli.global.log_format);

    let (host, port, use_ssl) = config::register_target(&cfg, args);
    let timeout = Duration::from_secs(cfg.bridge.request_timeout_secs);
    info!(%host, port, use_ssl, "registering with hub");

    let credentials = pushok_core::register(&host, port, use_ssl, timeout).await?;
    let storage = pushok_config::save_credentials(&path, &credentials, args.plaintext)
        .map_err(|e| CliError::from_config(e, &path))?;

    let location = match storage {
        pushok_config::KeyStorage::Keyring => "system keyring",
        pushok_config::KeyStorage::Plaintext => "config file",
    };
    println!("Registered with hub at {host}:{port}");
    println!("User id:     {}", credentials.user_id);
    println!("Private key: stored in {location}");
    println!("Config:      {}", path.display());
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
