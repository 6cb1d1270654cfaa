use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use slowlease::{Config, DhcpServer, Result};

#[derive(Parser)]
#[command(name = "slowlease")]
#[command(author, version, about = "A DHCP server that politely answers last", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Command-line values that take precedence over the configuration file.
#[derive(Args)]
struct Overrides {
    #[arg(long)]
    server_ip: Option<Ipv4Addr>,

    #[arg(long)]
    broadcast: Option<Ipv4Addr>,

    #[arg(long)]
    subnet_mask: Option<Ipv4Addr>,

    #[arg(long)]
    gateway: Option<Ipv4Addr>,

    /// May be repeated.
    #[arg(long = "dns")]
    dns_servers: Vec<Ipv4Addr>,

    #[arg(long)]
    domain: Option<String>,

    #[arg(long)]
    lease_seconds: Option<u32>,

    #[arg(long, allow_negative_numbers = true)]
    reply_delay: Option<i64>,

    #[arg(long)]
    pool_start: Option<Ipv4Addr>,

    #[arg(long)]
    pool_end: Option<Ipv4Addr>,

    /// May be repeated.
    #[arg(long = "exclude")]
    excluded: Vec<Ipv4Addr>,

    #[arg(long)]
    admin_bind: Option<SocketAddr>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(server_ip) = self.server_ip {
            config.server_ip = server_ip;
        }
        if let Some(broadcast) = self.broadcast {
            config.broadcast_address = broadcast;
        }
        if let Some(mask) = self.subnet_mask {
            config.subnet_mask = mask;
        }
        if self.gateway.is_some() {
            config.gateway = self.gateway;
        }
        if !self.dns_servers.is_empty() {
            config.dns_servers = self.dns_servers;
        }
        if self.domain.is_some() {
            config.domain_name = self.domain;
        }
        if let Some(seconds) = self.lease_seconds {
            config.lease_duration_seconds = seconds;
        }
        if let Some(delay) = self.reply_delay {
            config.reply_delay_seconds = delay;
        }
        if let Some(start) = self.pool_start {
            config.pool_start = start;
        }
        if let Some(end) = self.pool_end {
            config.pool_end = end;
        }
        if !self.excluded.is_empty() {
            config.excluded_addresses = self.excluded;
        }
        if let Some(admin_bind) = self.admin_bind {
            config.admin_bind_address = admin_bind;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = Config::load_or_create(&cli.config)?;
    cli.overrides.apply(&mut config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let server = DhcpServer::new(config)?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
