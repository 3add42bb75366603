use std::{
  io::Write,
  net::Ipv4Addr,
  path::PathBuf,
  sync::OnceLock,
};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use colored::Colorize;
use orbit_client::entities::{
  logger::{LogConfig, LogLevel},
  node::NodePaths,
};
use serde::Deserialize;

pub fn cli_args() -> &'static CliArgs {
  static CLI_ARGS: OnceLock<CliArgs> = OnceLock::new();
  CLI_ARGS.get_or_init(CliArgs::parse)
}

#[derive(Parser)]
#[command(name = "orbit", author, about, version)]
pub struct CliArgs {
  #[command(subcommand)]
  pub command: Command,

  /// Configure the logging level: error, warn, info, debug, trace.
  /// Default: info
  #[arg(long)]
  pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
  /// Bring this host into an Orbit cluster, creating one when
  /// `--join` is absent.
  Install(InstallArgs),
  /// Stop and disable the Orbit services on this host.
  /// Data, secrets and configs are left on disk.
  Uninstall,
}

#[derive(Debug, Clone, clap::Args)]
pub struct InstallArgs {
  /// This host's public IPv4, announced to peers as the mesh endpoint.
  /// Required unless --dry-run.
  #[arg(long)]
  pub vps_ip: Option<Ipv4Addr>,

  /// This host's own fully qualified name. Used for the node
  /// identifier display and the gateway certificate subject.
  #[arg(long)]
  pub domain: Option<String>,

  /// The cluster's wildcard domain under which user deployments
  /// receive subdomains. Prompted interactively when absent.
  #[arg(long)]
  pub base_domain: Option<String>,

  /// Source channel for building the orbit binaries.
  #[arg(long, value_enum, default_value_t = Branch::Main)]
  pub branch: Branch,

  /// Skip the source refresh; build from what is already on disk.
  #[arg(long)]
  pub no_pull: bool,

  /// Rerun phases whose completion sentinels already exist.
  #[arg(long)]
  pub force: bool,

  /// Plan the install, print the summary, and exit without touching
  /// the filesystem beyond temporary files.
  #[arg(long)]
  pub dry_run: bool,

  /// Bypass the RAM / CPU / disk / port gates (logged as warnings).
  #[arg(long)]
  pub skip_checks: bool,

  /// This host participates in authoritative DNS.
  /// Enables the DNS proxy services.
  #[arg(long)]
  pub nameserver: bool,

  /// Join the cluster reachable at this `host:port`.
  /// Absent means this host creates a new cluster.
  #[arg(long)]
  pub join: Option<String>,

  /// Single-use invite token. Required with --join.
  #[arg(long)]
  pub token: Option<String>,

  /// Provide the cluster secret out of band (64 hex chars).
  /// Disaster recovery for a cluster whose live hosts are down.
  #[arg(long)]
  pub cluster_secret: Option<String>,

  /// Provide the swarm key out of band, as 64 hex chars or the full
  /// three-line file.
  #[arg(long)]
  pub swarm_key: Option<String>,

  /// Comma separated bootstrap peer multiaddrs, out of band.
  #[arg(long)]
  pub peers: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Branch {
  Main,
  Nightly,
}

impl Branch {
  pub fn as_str(&self) -> &'static str {
    match self {
      Branch::Main => "main",
      Branch::Nightly => "nightly",
    }
  }
}

/// Environment overrides, `ORBIT_` prefixed.
#[derive(Deserialize)]
pub struct Env {
  /// Override the base directory (defaults to the service user's
  /// `~/.orbit`). Mostly useful for testing installs in a sandbox.
  pub base_dir: Option<PathBuf>,
  /// SSH port kept open by the firewall. Default: 22.
  pub ssh_port: Option<u16>,
  /// The privacy relay's OR port. 0 disables the relay.
  pub relay_or_port: Option<u16>,
}

/// The resolved install run configuration.
pub struct InstallConfig {
  pub vps_ip: Ipv4Addr,
  pub domain: Option<String>,
  pub base_domain: String,
  pub branch: Branch,
  pub no_pull: bool,
  pub force: bool,
  pub dry_run: bool,
  pub skip_checks: bool,
  pub nameserver: bool,
  /// `host:port` of a live node plus the invite token.
  pub join: Option<JoinTarget>,
  pub cluster_secret: Option<String>,
  pub swarm_key: Option<String>,
  pub bootstrap_peers: Vec<String>,
  pub paths: NodePaths,
  pub ssh_port: u16,
  pub relay_or_port: u16,
  pub logging: LogConfig,
}

#[derive(Debug, Clone)]
pub struct JoinTarget {
  pub address: String,
  pub token: String,
}

impl InstallConfig {
  pub fn is_join(&self) -> bool {
    self.join.is_some()
  }
}

static INSTALL_CONFIG: OnceLock<InstallConfig> = OnceLock::new();

/// Resolve args + environment into the run config.
/// Prompts for the base domain when it was not passed.
pub fn init_install_config(
  args: &InstallArgs,
) -> anyhow::Result<&'static InstallConfig> {
  let env: Env = envy::prefixed("ORBIT_")
    .from_env()
    .context("failed to parse orbit environment")?;

  let vps_ip = match args.vps_ip {
    Some(ip) => ip,
    None if args.dry_run => Ipv4Addr::UNSPECIFIED,
    None => {
      return Err(anyhow!("--vps-ip is required (unless --dry-run)"));
    }
  };

  let join = match (&args.join, &args.token) {
    (Some(address), Some(token)) => Some(JoinTarget {
      address: address.clone(),
      token: token.clone(),
    }),
    (Some(_), None) => {
      return Err(anyhow!("--join requires --token"));
    }
    (None, Some(_)) => {
      return Err(anyhow!("--token is only valid with --join"));
    }
    (None, None) => None,
  };

  let base_domain = match &args.base_domain {
    Some(domain) => domain.clone(),
    None => prompt_base_domain()?,
  };

  let config = InstallConfig {
    vps_ip,
    domain: args.domain.clone(),
    base_domain,
    branch: args.branch,
    no_pull: args.no_pull,
    force: args.force,
    dry_run: args.dry_run,
    skip_checks: args.skip_checks,
    nameserver: args.nameserver,
    join,
    cluster_secret: args.cluster_secret.clone(),
    swarm_key: args.swarm_key.clone(),
    bootstrap_peers: args
      .peers
      .as_deref()
      .map(split_csv)
      .unwrap_or_default(),
    paths: env
      .base_dir
      .map(NodePaths::new)
      .unwrap_or_else(NodePaths::for_service_user),
    ssh_port: env.ssh_port.unwrap_or(22),
    relay_or_port: env.relay_or_port.unwrap_or(0),
    logging: LogConfig {
      level: cli_args().log_level.unwrap_or_default(),
      ..Default::default()
    },
  };

  Ok(INSTALL_CONFIG.get_or_init(|| config))
}

fn split_csv(csv: &str) -> Vec<String> {
  csv
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(String::from)
    .collect()
}

/// Cosmetic defaults; any domain can be typed in.
const BASE_DOMAIN_PRESETS: [&str; 3] =
  ["devnet.orbit.host", "testnet.orbit.host", "mainnet.orbit.host"];

fn prompt_base_domain() -> anyhow::Result<String> {
  println!(
    "{}",
    "Select the cluster base domain (user deployments get subdomains under it):"
      .bold()
  );
  for (i, preset) in BASE_DOMAIN_PRESETS.iter().enumerate() {
    println!("  {}. {preset}", i + 1);
  }
  println!("  4. custom");
  print!("> ");
  std::io::stdout().flush().context("Failed to flush stdout")?;

  let mut line = String::new();
  std::io::stdin()
    .read_line(&mut line)
    .context("Failed to read base domain selection")?;
  let line = line.trim();

  match line {
    "1" | "2" | "3" => {
      let idx = line.parse::<usize>()? - 1;
      Ok(BASE_DOMAIN_PRESETS[idx].to_string())
    }
    "4" | "" => {
      print!("base domain: ");
      std::io::stdout().flush().context("Failed to flush stdout")?;
      let mut domain = String::new();
      std::io::stdin()
        .read_line(&mut domain)
        .context("Failed to read base domain")?;
      let domain = domain.trim();
      if domain.is_empty() {
        Err(anyhow!("a base domain is required"))
      } else {
        Ok(domain.to_string())
      }
    }
    // typed a domain directly at the menu
    other => Ok(other.to_string()),
  }
}
