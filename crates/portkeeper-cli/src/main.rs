//! portkeeper: operator CLI for `portkeeperd`.
//!
//! Adds, removes and lists forwarding rules over the daemon's control
//! protocol. Credentials are sent with every request.

mod client;
mod commands;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client::ControlClient;
use portkeeper_core::{Credentials, ForwardSpec, RuleId, RuleParams};
use std::path::PathBuf;
use tracing::error;

/// portkeeper: manage TCP forwarding rules
#[derive(Parser)]
#[command(name = "portkeeper", version, about = "Manage TCP forwarding rules on portkeeperd")]
struct Cli {
    /// Daemon control address (host:port)
    #[arg(short, long, global = true)]
    addr: Option<String>,

    /// Username
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Password (prompted for when omitted)
    #[arg(long, global = true, env = "PORTKEEPER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a rule forwarding LISTEN_PORT to TARGET
    Add {
        /// Local port the forwarder listens on
        listen_port: String,
        /// Destination as host:port ([addr]:port for IPv6)
        target: String,
    },

    /// Stop a rule's forwarder and delete the rule
    #[command(alias = "remove")]
    Rm {
        /// Rule id as shown by `portkeeper ls`
        rule_id: u64,
    },

    /// List your rules
    #[command(alias = "list")]
    Ls,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("portkeeper=debug,portkeeper_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("portkeeper=warn")
            .with_target(false)
            .init();
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("portkeeper: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.config {
        Some(p) => PathBuf::from(p),
        None => dirs::home_dir()
            .unwrap_or_default()
            .join(".portkeeper")
            .join("config.toml"),
    };
    let cfg = config::Config::load(&config_path)?;

    // Reject malformed rules before prompting or connecting.
    let new_rule = match &cli.command {
        Command::Add {
            listen_port,
            target,
        } => {
            let (host, port) = config::parse_target(target)?;
            let params = RuleParams::new(listen_port.as_str(), host, port);
            ForwardSpec::parse(&params).context("invalid rule")?;
            Some(params)
        }
        _ => None,
    };

    let addr = cli.addr.unwrap_or(cfg.default.addr);
    let username = cli.user.unwrap_or(cfg.default.username);
    let password = match cli.password {
        Some(p) => p,
        None => dialoguer::Password::new()
            .with_prompt(format!("Password for {username}"))
            .interact()
            .context("no password given (use --password or PORTKEEPER_PASSWORD)")?,
    };

    let mut client = ControlClient::connect(&addr, Credentials { username, password }).await?;

    match cli.command {
        Command::Add { .. } => {
            let params = new_rule.context("rule parameters missing")?;
            commands::add::run(&mut client, params).await
        }
        Command::Rm { rule_id } => commands::remove::run(&mut client, RuleId(rule_id)).await,
        Command::Ls => commands::list::run(&mut client).await,
    }
}
