//! portkeeperd: forwarding-rule daemon.
//!
//! Keeps one external forwarder (socat by default) running per stored rule,
//! reactivates all rules at startup, and serves the local control protocol
//! used by the `portkeeper` CLI.

mod auth;
mod config;
mod control;
mod locks;
mod manager;
mod process;
mod server;
mod store;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::Daemon;
use std::path::PathBuf;
use tracing::{error, info};

/// portkeeperd: forwarding-rule daemon
#[derive(Parser, Debug)]
#[command(name = "portkeeperd", version, about = "TCP forwarding-rule daemon")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.portkeeper/portkeeperd.toml")]
    config: String,

    /// Control listen address (host:port)
    #[arg(long)]
    control_addr: Option<String>,

    /// SQLite database holding accounts and rules
    #[arg(long)]
    state_file: Option<String>,

    /// Forwarding program to run per rule
    #[arg(long)]
    program: Option<String>,

    /// Default admin username, created on first start
    #[arg(long, env = "PORTKEEPER_ADMIN_USER")]
    admin_user: Option<String>,

    /// Default admin password, used only when the account is created
    #[arg(long, env = "PORTKEEPER_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting portkeeperd");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        control_addr: cli.control_addr,
        state_file: cli.state_file,
        program: cli.program,
        admin_user: cli.admin_user,
        admin_password: cli.admin_password,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    info!(
        control_addr = %server_config.control_addr,
        state_file = %server_config.state_file.display(),
        program = %server_config.forwarder.program,
        "configuration loaded"
    );

    let daemon = match Daemon::start(server_config).await {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = daemon.serve() => {}
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    // Forwarders keep running; the next start reactivates rules anyway.
    info!("portkeeperd stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
