// tftpd: serves a directory over TFTP (RFC 1350).
//
// Startup order matters: the root directory is validated, the well-known port bound, and only then
// are root privileges dropped, since binding port 69 needs them and nothing afterwards does.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tftpd::config::{ConfigFile, ServerConfig};
use tftpd::privileges::drop_privileges;
use tftpd::server::TftpServer;

/// Trivial File Transfer Protocol server.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// TOML configuration file. Flags given on the command line take precedence over it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    host: Option<IpAddr>,

    /// UDP port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory to serve files from and write files to.
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Refuse every write request.
    #[arg(long)]
    read_only: bool,

    /// Retransmission timeouts in seconds, one per attempt (e.g. 1,3,8).
    #[arg(long, value_delimiter = ',')]
    timeouts: Option<Vec<u64>>,

    /// Range of ports for transfer sockets, as LOW-HIGH.
    #[arg(long, value_parser = parse_port_range)]
    port_range: Option<(u16, u16)>,

    /// Unprivileged user to run as once the port is bound.
    #[arg(short, long)]
    user: Option<String>,
}

fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
    let (lo, hi) = s.split_once('-').ok_or_else(|| format!("expected LOW-HIGH, got '{s}'"))?;
    let lo = lo.trim().parse().map_err(|e| format!("bad low port '{lo}': {e}"))?;
    let hi = hi.trim().parse().map_err(|e| format!("bad high port '{hi}': {e}"))?;
    Ok((lo, hi))
}

impl Cli {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = self.root {
            config.tftp_root = root;
        }
        if self.read_only {
            config.writable = false;
        }
        if let Some(timeouts) = self.timeouts {
            config.timeouts = timeouts.into_iter().map(Duration::from_secs).collect();
        }
        if self.port_range.is_some() {
            config.port_range = self.port_range;
        }
        if self.user.is_some() {
            config.user = self.user;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = ServerConfig::default();
    if let Some(path) = &cli.config {
        config.apply_file(ConfigFile::load(path)?);
    }
    cli.apply(&mut config);
    config.validate().context("Configuration error")?;

    log::info!("TFTP root directory set to: {}", config.tftp_root.display());
    if !config.writable {
        log::info!("Running read-only, write requests will be refused");
    }

    let user = config.user.clone();
    let server = TftpServer::bind(config)?;
    if let Some(user) = user {
        drop_privileges(&user)?;
    }

    tokio::select! {
        result = server.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting down");
            Ok(())
        }
    }
}
