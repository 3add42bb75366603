use colored::Colorize;

use crate::{
  config::InstallConfig,
  helpers::announce_phase,
};

mod binaries;
mod firewall;
mod handshake;
mod mesh_setup;
mod preflight;
mod provision;
mod repos;
mod secret_setup;
mod services;
mod synth;
mod templates;
mod zone;

/// Drive the phased install.
///
/// Every phase is re-entrant: it returns immediately when its on-disk
/// artifacts are valid, rewrites them when partial, and aborts the
/// whole run on failure, leaving completed phases on disk so the
/// operator can rerun to resume.
pub async fn run(config: &'static InstallConfig) -> anyhow::Result<()> {
  if config.dry_run {
    print_plan(config);
    return Ok(());
  }

  if config.is_join() {
    join_path(config).await
  } else {
    genesis_path(config).await
  }
}

/// First host of a new cluster: generate everything locally.
async fn genesis_path(
  config: &'static InstallConfig,
) -> anyhow::Result<()> {
  let total = 10;

  announce_phase(1, total, "Preflight");
  preflight::run(config).await?;

  announce_phase(2, total, "Provision environment");
  let owner = provision::run(config).await?;

  announce_phase(3, total, "Install binaries");
  binaries::run(config).await?;

  announce_phase(4, total, "Generate secrets");
  let identity = secret_setup::run(config, owner)?;

  announce_phase(5, total, "Mesh setup");
  let mesh = mesh_setup::genesis(config, owner).await?;

  announce_phase(6, total, "Firewall");
  firewall::run(config).await?;

  announce_phase(7, total, "Synthesize configs");
  let network =
    synth::run(config, owner, &identity, &mesh, None).await?;

  announce_phase(8, total, "Initialize daemon repos");
  repos::run(config, &network, None).await?;

  announce_phase(9, total, "Start services");
  services::run(config).await?;

  announce_phase(10, total, "Seed zone records");
  if config.nameserver {
    zone::run(config, &network).await?;
  } else {
    crate::helpers::phase_skipped(
      "Seed zone records",
      "not a nameserver host",
    );
  }

  println!(
    "{} This host now serves a new cluster under *.{}",
    "DONE".green().bold(),
    config.base_domain
  );
  Ok(())
}

/// Joining host: exchange with a live node, then converge.
async fn join_path(
  config: &'static InstallConfig,
) -> anyhow::Result<()> {
  let total = 12;

  announce_phase(1, total, "Preflight");
  preflight::run(config).await?;

  announce_phase(2, total, "Provision environment");
  let owner = provision::run(config).await?;

  announce_phase(3, total, "Install binaries");
  binaries::run(config).await?;

  announce_phase(4, total, "Generate mesh keypair");
  let (keypair, keypair_reused) =
    mesh_setup::ensure_keypair(config, owner).await?;

  announce_phase(5, total, "Join handshake");
  let snapshot =
    handshake::run(config, &keypair, keypair_reused).await?;

  announce_phase(6, total, "Configure mesh with peers");
  let mesh = match &snapshot {
    Some(snapshot) => {
      mesh_setup::configure_with_peers(&keypair, snapshot).await?
    }
    None => mesh_setup::load_existing().await?,
  };

  announce_phase(7, total, "Verify mesh reachability");
  if let Some(snapshot) = &snapshot {
    mesh_setup::verify(snapshot).await?;
  } else {
    crate::helpers::phase_skipped(
      "Verify mesh reachability",
      "mesh already configured",
    );
  }

  announce_phase(8, total, "Firewall");
  firewall::run(config).await?;

  announce_phase(9, total, "Persist received secrets");
  let identity =
    secret_setup::run_join(config, owner, snapshot.as_ref())?;

  announce_phase(10, total, "Synthesize configs");
  let network = synth::run(
    config,
    owner,
    &identity,
    &mesh,
    snapshot.as_ref(),
  )
  .await?;

  announce_phase(11, total, "Initialize daemon repos");
  repos::run(config, &network, snapshot.as_ref()).await?;

  announce_phase(12, total, "Start services");
  services::run(config).await?;

  println!(
    "{} This host has joined the cluster under *.{}",
    "DONE".green().bold(),
    config.base_domain
  );
  Ok(())
}

fn print_plan(config: &InstallConfig) {
  let path = if config.is_join() { "join" } else { "genesis" };
  println!("{}", "Install plan (dry run)".bold());
  println!("  path:          {path}");
  if let Some(join) = &config.join {
    println!("  join target:   {}", join.address);
  }
  println!("  public ip:     {}", config.vps_ip);
  if let Some(domain) = &config.domain {
    println!("  host domain:   {domain}");
  }
  println!("  base domain:   {}", config.base_domain);
  println!("  base dir:      {}", config.paths.base.display());
  println!("  branch:        {}", config.branch.as_str());
  println!("  nameserver:    {}", config.nameserver);
  println!(
    "  ports:         {:?}",
    orbit_client::entities::node::REQUIRED_PORTS
  );
  println!("No filesystem changes were made.");
}
