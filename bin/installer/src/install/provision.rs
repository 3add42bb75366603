use std::os::unix::fs::PermissionsExt;

use anyhow::Context;
use command::{run_stage_command, run_standard_command};
use orbit_client::entities::SERVICE_USER;
use secrets::Owner;

use crate::{
  config::InstallConfig,
  error::InstallError,
  helpers::{phase_done, service_user_owner},
};

/// Daemons a log file is pre-created for, so the supervisor can open
/// them under the service user.
const LOGGED_DAEMONS: [&str; 5] =
  ["ipfs", "ipfs-cluster", "olricd", "orbitd", "coredns"];

/// Create the service user and the directory tree under the base dir.
pub async fn run(
  config: &InstallConfig,
) -> Result<Owner, InstallError> {
  let owner = ensure_service_user()
    .await
    .map_err(InstallError::preflight)?;

  create_tree(config, owner)
    .await
    .map_err(InstallError::preflight)?;

  phase_done("Provision environment");
  Ok(owner)
}

async fn ensure_service_user() -> anyhow::Result<Owner> {
  if let Ok(owner) = service_user_owner().await {
    return Ok(owner);
  }
  run_stage_command(
    "Create service user",
    &format!(
      "useradd --system --create-home --shell /usr/sbin/nologin {SERVICE_USER}"
    ),
    None,
  )
  .await?;
  service_user_owner()
    .await
    .context("service user missing right after creation")
}

async fn create_tree(
  config: &InstallConfig,
  owner: Owner,
) -> anyhow::Result<()> {
  for dir in config.paths.all_dirs() {
    std::fs::create_dir_all(&dir)
      .with_context(|| format!("Failed to create {dir:?}"))?;
    chown(&dir, owner);
  }

  // The secrets dir alone is operator-eyes-only.
  let secrets_dir = config.paths.secrets();
  std::fs::set_permissions(
    &secrets_dir,
    std::fs::Permissions::from_mode(0o700),
  )
  .with_context(|| format!("Failed to set mode 0700 on {secrets_dir:?}"))?;

  for daemon in LOGGED_DAEMONS {
    let log_file = config.paths.log_file(daemon);
    if !log_file.exists() {
      std::fs::write(&log_file, b"")
        .with_context(|| format!("Failed to create {log_file:?}"))?;
    }
    chown(&log_file, owner);
  }

  // The home dir itself must be traversable by the daemons.
  if let Some(home) = config.paths.base.parent() {
    let _ = run_standard_command(
      &format!("chown {SERVICE_USER}:{SERVICE_USER} {}", home.display()),
      None,
    )
    .await;
  }

  Ok(())
}

fn chown(path: &std::path::Path, owner: Owner) {
  if let Err(e) = std::os::unix::fs::chown(
    path,
    Some(owner.uid),
    Some(owner.gid),
  ) {
    warn!("failed to chown {path:?} | {e:#}");
  }
}
