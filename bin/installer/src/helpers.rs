use std::path::Path;

use anyhow::{Context, anyhow};
use colored::Colorize;
use command::{run_stage_command, run_standard_command};
use secrets::Owner;

// ==================
//  Operator output
// ==================

pub fn announce_phase(step: usize, total: usize, name: &str) {
  println!(
    "{} Phase {step}/{total}: {name}",
    "==>".blue().bold()
  );
}

pub fn phase_done(name: &str) {
  println!("  {} {name}", "ok".green().bold());
}

pub fn phase_skipped(name: &str, why: &str) {
  println!("  {} {name} ({why})", "ok".green().bold());
}

pub fn warn(message: impl AsRef<str>) {
  println!("  {} {}", "WARN".yellow().bold(), message.as_ref());
  warn!("{}", message.as_ref());
}

// ==============
//  Service user
// ==============

/// Uid/gid of the service user. Errors when the user does not exist
/// yet; the provision phase creates it.
pub async fn service_user_owner() -> anyhow::Result<Owner> {
  let user = orbit_client::entities::SERVICE_USER;
  let uid = run_standard_command(&format!("id -u {user}"), None).await;
  let gid = run_standard_command(&format!("id -g {user}"), None).await;
  if !uid.success() || !gid.success() {
    return Err(anyhow!("service user {user} does not exist"));
  }
  Ok(Owner {
    uid: uid.stdout.trim().parse().context("unparsable uid")?,
    gid: gid.stdout.trim().parse().context("unparsable gid")?,
  })
}

/// Best effort recursive chown to the service user.
pub async fn chown_to_service_user(path: &Path) {
  let user = orbit_client::entities::SERVICE_USER;
  let output = run_standard_command(
    &format!("chown -R {user}:{user} {}", path.display()),
    None,
  )
  .await;
  if !output.success() {
    warn(format!(
      "failed to chown {} to {user} | {}",
      path.display(),
      output.combined()
    ));
  }
}

// ============
//  Downloads
// ============

/// Fetch a url to a file. Retried once; successful iff the target
/// exists and is non-empty afterwards.
pub async fn download_file(
  url: &str,
  dest: &Path,
) -> anyhow::Result<()> {
  if let Err(e) = try_download(url, dest).await {
    warn(format!("download of {url} failed, retrying | {e:#}"));
    try_download(url, dest)
      .await
      .with_context(|| format!("Failed to download {url} after retry"))?;
  }
  let len = std::fs::metadata(dest)
    .with_context(|| format!("download left nothing at {dest:?}"))?
    .len();
  if len == 0 {
    return Err(anyhow!("download of {url} produced an empty file"));
  }
  Ok(())
}

async fn try_download(url: &str, dest: &Path) -> anyhow::Result<()> {
  if let Some(parent) = dest.parent() {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("Failed to create {parent:?}"))?;
  }
  let res = reqwest::get(url)
    .await
    .with_context(|| format!("Failed to reach {url}"))?;
  let status = res.status();
  if !status.is_success() {
    return Err(anyhow!("{url} answered {status}"));
  }
  let bytes = res
    .bytes()
    .await
    .with_context(|| format!("Failed to read body of {url}"))?;
  std::fs::write(dest, &bytes)
    .with_context(|| format!("Failed to write {dest:?}"))?;
  Ok(())
}

// ==================
//  Package manager
// ==================

/// Install system packages with the host package manager,
/// forced-yes. Any failure is acquisition-fatal in the caller.
pub async fn install_packages(
  packages: &[&str],
) -> anyhow::Result<()> {
  run_stage_command(
    "Install packages",
    &format!(
      "apt-get install -y --no-install-recommends {}",
      packages.join(" ")
    ),
    None,
  )
  .await
  .map(|_| ())
}
