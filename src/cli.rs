use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sshwarden::blacklist::Blacklist;
use sshwarden::config::Config;
use sshwarden::extractor::EventExtractor;
use sshwarden::models::AuthEvent;
use sshwarden::service::ServiceInstaller;
use sshwarden::Daemon;

#[derive(Parser)]
#[command(name = "sshwarden")]
#[command(author, version, about = "SSH brute-force protection daemon")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the protection daemon in the foreground
    Start,

    /// List bans stored in the blacklist file
    List {
        /// Output format (table, json, simple)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show how a log line is interpreted
    Check {
        /// Log line to classify
        line: String,
    },

    /// Send one sample of each notification
    TestNotify,

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Install as a systemd service
    Install,

    /// Remove the systemd service and installed files
    Uninstall,
}

/// Blacklist row for display
#[derive(Tabled, Serialize)]
struct BanRow {
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Expires")]
    expires: String,
    #[tabled(rename = "Status")]
    status: String,
}

pub fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Start => cmd_start(config).await,
        Commands::List { format } => cmd_list(config, format),
        Commands::Check { line } => cmd_check(line),
        Commands::TestNotify => cmd_test_notify(config).await,
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::Install => cmd_install(config),
        Commands::Uninstall => cmd_uninstall(config),
    }
}

async fn cmd_start(config: Config) -> Result<()> {
    println!("Starting sshwarden in foreground mode...");

    let daemon = Daemon::new(config);
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down...");
        signal_token.cancel();
    });

    daemon.run(shutdown).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn cmd_list(config: Config, format: String) -> Result<()> {
    let blacklist = Blacklist::new(config.blacklist_path());
    let entries = blacklist
        .load()
        .with_context(|| format!("Failed to read {}", blacklist.path().display()))?;

    if entries.is_empty() {
        println!("No bans in {}", blacklist.path().display());
        return Ok(());
    }

    let now = Utc::now();
    let rows: Vec<BanRow> = entries
        .iter()
        .map(|e| BanRow {
            ip: e.ip.to_string(),
            expires: e
                .expires_at
                .map(format_local)
                .unwrap_or_else(|| "unknown".to_string()),
            status: match e.expires_at {
                Some(at) if at <= now => "expired".to_string(),
                Some(_) => "active".to_string(),
                None => "legacy".to_string(),
            },
        })
        .collect();

    match format.as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        "simple" => {
            for row in &rows {
                println!("{}", row.ip);
            }
        }
        _ => {
            println!("{}", Table::new(&rows));
            let active = rows.iter().filter(|r| r.status == "active").count();
            println!(
                "{} {} active of {} entries",
                "Total:".bold(),
                active.to_string().green(),
                rows.len()
            );
        }
    }

    Ok(())
}

fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn cmd_check(line: String) -> Result<()> {
    let extractor = EventExtractor::new();
    match extractor.extract(&line) {
        Some(AuthEvent::FailedLogin(ip)) => {
            println!("{} from {}", "Failed login".red().bold(), ip);
        }
        Some(AuthEvent::SuccessfulLogin(ip)) => {
            println!("{} from {}", "Successful login".green().bold(), ip);
        }
        None => {
            println!("{}", "No event".dimmed());
        }
    }
    Ok(())
}

async fn cmd_test_notify(config: Config) -> Result<()> {
    let backend = format!("{:?}", config.notify.backend).to_lowercase();
    let daemon = Daemon::new(config);
    let sent = daemon.send_test_notifications().await?;
    println!(
        "{} {} test notifications via {}",
        "Sent".green().bold(),
        sent,
        backend
    );
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let toml_str = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &toml_str)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

fn cmd_install(config: Config) -> Result<()> {
    let installer = ServiceInstaller::new(config.service.clone());
    installer.install(&config)?;
    println!(
        "{} {} (unit {})",
        "Installed".green().bold(),
        installer.binary_path().display(),
        installer.unit_path().display()
    );
    Ok(())
}

fn cmd_uninstall(config: Config) -> Result<()> {
    let installer = ServiceInstaller::new(config.service.clone());
    installer.uninstall();
    println!("{} {}", "Uninstalled".yellow().bold(), config.service.service_name);
    Ok(())
}
