// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 proxid Contributors

// proxid - CLI Client
// Command-line interface for the proxid control API

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use reqwest::Client;

use proxid_common::{ApiResponse, HostRecord, TunnelStatusResponse};

use config::CliConfig;

#[derive(Parser)]
#[command(name = "proxidctl")]
#[command(about = "proxid CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Daemon URL (overrides cli.toml)
    #[arg(short = 'u', long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or switch) the tunnel to a host from ~/.ssh/config
    Start {
        /// Host alias
        host: String,
    },

    /// Stop the active tunnel
    Stop,

    /// List the hosts known to the daemon
    Info {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show which tunnel is running
    Status {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut cli_config = CliConfig::load()?;
    if let Some(url) = cli.url {
        cli_config.daemon_url = url;
    }

    let client = Client::new();

    match cli.command {
        Commands::Start { host } => start_tunnel(&client, &cli_config, host).await?,
        Commands::Stop => stop_tunnel(&client, &cli_config).await?,
        Commands::Info { json } => list_hosts(&client, &cli_config, json).await?,
        Commands::Status { json } => show_status(&client, &cli_config, json).await?,
    }

    Ok(())
}

async fn start_tunnel(client: &Client, cli_config: &CliConfig, host: String) -> Result<()> {
    println!("{}", format!("Starting tunnel to '{}'", host).green().bold());

    let response: ApiResponse = client
        .post(cli_config.endpoint("/start"))
        .form(&[("host", host.as_str())])
        .send()
        .await
        .context("Failed to reach daemon")?
        .error_for_status()?
        .json()
        .await
        .context("Failed to parse daemon response")?;

    report(response, &format!("✓ Tunnel to '{}' is up", host))
}

async fn stop_tunnel(client: &Client, cli_config: &CliConfig) -> Result<()> {
    println!("{}", "Stopping tunnel".yellow());

    let response: ApiResponse = client
        .post(cli_config.endpoint("/stop"))
        .send()
        .await
        .context("Failed to reach daemon")?
        .error_for_status()?
        .json()
        .await
        .context("Failed to parse daemon response")?;

    report(response, "✓ Tunnel stopped")
}

/// Print the daemon's verdict; an error verdict becomes a non-zero exit
fn report(response: ApiResponse, success: &str) -> Result<()> {
    if response.is_ok() {
        println!("{}", success.green().bold());
        return Ok(());
    }

    match response.msg {
        Some(msg) => anyhow::bail!("Daemon reported an error: {}", msg),
        None => anyhow::bail!("Daemon reported an error (see daemon log for details)"),
    }
}

async fn list_hosts(client: &Client, cli_config: &CliConfig, json: bool) -> Result<()> {
    let hosts: Vec<HostRecord> = client
        .get(cli_config.endpoint("/info"))
        .send()
        .await
        .context("Failed to reach daemon")?
        .error_for_status()?
        .json()
        .await
        .context("Failed to parse host list")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hosts)?);
    } else if hosts.is_empty() {
        println!("{}", "No hosts found in the daemon's SSH config.".yellow());
    } else {
        print_hosts_table(&hosts);
    }

    Ok(())
}

async fn show_status(client: &Client, cli_config: &CliConfig, json: bool) -> Result<()> {
    let status: TunnelStatusResponse = client
        .get(cli_config.endpoint("/status"))
        .send()
        .await
        .context("Failed to reach daemon")?
        .error_for_status()?
        .json()
        .await
        .context("Failed to parse tunnel status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match (&status.host, status.active) {
        (Some(host), true) => {
            println!(
                "{} {} on SOCKS port {}",
                "●".green(),
                host.bold(),
                status.socks_port
            );
            if let Some(pid) = status.pid {
                println!("  pid:   {}", pid);
            }
            if let Some(since) = status.since {
                println!("  since: {}", since.to_rfc3339());
            }
        }
        _ => println!("{} no active tunnel", "○".dimmed()),
    }

    Ok(())
}

fn print_hosts_table(hosts: &[HostRecord]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Name")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Remote")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Identity")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
    ]);

    for host in hosts {
        let identity = host
            .identity_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&host.name),
            Cell::new(format!("{}:{}", host.destination(), host.port)),
            Cell::new(identity),
        ]);
    }

    println!("{table}");
}
