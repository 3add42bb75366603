use std::{
  net::TcpListener,
  path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use command::{binary_on_path, run_standard_command};
use orbit_client::entities::node::REQUIRED_PORTS;
use sysinfo::Disks;

use crate::{
  config::InstallConfig,
  error::InstallError,
  helpers::{phase_done, warn},
};

const MIN_DISK_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const MIN_RAM_KB: u64 = 2 * 1024 * 1024;
const MIN_CPUS: usize = 2;

/// Tools the later phases shell out to.
const REQUIRED_TOOLS: [&str; 7] =
  ["curl", "git", "make", "wget", "tar", "unzip", "systemctl"];

/// Interrogate the host before anything is written.
/// Produces no artifacts; failures name the specific check.
pub async fn run(
  config: &InstallConfig,
) -> Result<(), InstallError> {
  check_privileges().await.map_err(InstallError::preflight)?;
  check_os().map_err(InstallError::preflight)?;
  check_arch().map_err(InstallError::preflight)?;
  check_tools().await.map_err(InstallError::preflight)?;

  let resources = check_resources(config);
  let ports = check_ports();
  for failure in resources.into_iter().chain(ports) {
    if config.skip_checks {
      warn(format!("{failure:#} (skipped by flag)"));
    } else {
      return Err(InstallError::preflight(failure));
    }
  }

  phase_done("Preflight");
  Ok(())
}

async fn check_privileges() -> anyhow::Result<()> {
  let output = run_standard_command("id -u", None).await;
  if output.success() && output.stdout.trim() == "0" {
    Ok(())
  } else {
    Err(anyhow!(
      "the installer must run with elevated privileges (try sudo)"
    ))
  }
}

fn check_os() -> anyhow::Result<()> {
  if std::env::consts::OS != "linux" {
    return Err(anyhow!(
      "unsupported operating system: {}",
      std::env::consts::OS
    ));
  }
  let contents = std::fs::read_to_string("/etc/os-release")
    .context("Failed to read /etc/os-release")?;
  let (id, version) = parse_os_release(&contents);
  info!("detected distribution: {id} {version}");
  Ok(())
}

fn check_arch() -> anyhow::Result<()> {
  match std::env::consts::ARCH {
    "x86_64" | "aarch64" => Ok(()),
    other => Err(anyhow!("unsupported architecture: {other}")),
  }
}

async fn check_tools() -> anyhow::Result<()> {
  for tool in REQUIRED_TOOLS {
    if !binary_on_path(tool).await {
      return Err(anyhow!("required tool is not installed: {tool}"));
    }
  }
  Ok(())
}

/// RAM / CPU / disk gates. Failures are collected so the skip flag
/// can downgrade all of them at once.
fn check_resources(config: &InstallConfig) -> Vec<anyhow::Error> {
  let mut failures = Vec::new();

  match std::fs::read_to_string("/proc/meminfo")
    .ok()
    .as_deref()
    .and_then(parse_mem_total_kb)
  {
    Some(kb) if kb >= MIN_RAM_KB => {}
    Some(kb) => failures.push(anyhow!(
      "insufficient memory: {} MB total, 2048 MB required",
      kb / 1024
    )),
    None => failures.push(anyhow!("could not read MemTotal from /proc/meminfo")),
  }

  let cpus = std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(0);
  if cpus < MIN_CPUS {
    failures.push(anyhow!(
      "insufficient cpu: {cpus} cores, {MIN_CPUS} required"
    ));
  }

  match free_space_for(&config.paths.base) {
    Some(bytes) if bytes >= MIN_DISK_BYTES => {}
    Some(bytes) => failures.push(anyhow!(
      "insufficient disk: {} GB free on the data volume, 10 GB required",
      bytes / (1024 * 1024 * 1024)
    )),
    None => failures.push(anyhow!(
      "could not determine free space for {}",
      config.paths.base.display()
    )),
  }

  failures
}

/// Try a passive bind on every required port, releasing immediately.
/// Reports every port that could not be claimed.
fn check_ports() -> Vec<anyhow::Error> {
  let busy = REQUIRED_PORTS
    .iter()
    .filter(|port| TcpListener::bind(("0.0.0.0", **port)).is_err())
    .map(|port| port.to_string())
    .collect::<Vec<_>>();
  if busy.is_empty() {
    Vec::new()
  } else {
    vec![anyhow!("ports already in use: {}", busy.join(", "))]
  }
}

/// Free bytes on the filesystem that will hold the base directory,
/// walking up from it to the nearest existing ancestor.
fn free_space_for(base: &Path) -> Option<u64> {
  let ancestor = nearest_existing_ancestor(base)?;
  let disks = Disks::new_with_refreshed_list();
  disks
    .iter()
    .filter(|disk| ancestor.starts_with(disk.mount_point()))
    .max_by_key(|disk| disk.mount_point().as_os_str().len())
    .map(|disk| disk.available_space())
}

fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
  path
    .ancestors()
    .find(|ancestor| ancestor.exists())
    .map(Path::to_path_buf)
}

fn parse_os_release(contents: &str) -> (String, String) {
  let field = |key: &str| {
    contents
      .lines()
      .find_map(|line| line.strip_prefix(key))
      .map(|v| v.trim_matches('"').to_string())
      .unwrap_or_else(|| String::from("unknown"))
  };
  (field("ID="), field("VERSION_ID="))
}

fn parse_mem_total_kb(meminfo: &str) -> Option<u64> {
  meminfo
    .lines()
    .find_map(|line| line.strip_prefix("MemTotal:"))?
    .trim()
    .strip_suffix("kB")?
    .trim()
    .parse()
    .ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_mem_total() {
    let meminfo = "MemTotal:        8025420 kB\nMemFree:  123 kB\n";
    assert_eq!(parse_mem_total_kb(meminfo), Some(8025420));
  }

  #[test]
  fn rejects_garbage_meminfo() {
    assert_eq!(parse_mem_total_kb("nonsense"), None);
  }

  #[test]
  fn parses_os_release_quoted_fields() {
    let contents =
      "NAME=\"Debian GNU/Linux\"\nID=debian\nVERSION_ID=\"12\"\n";
    let (id, version) = parse_os_release(contents);
    assert_eq!(id, "debian");
    assert_eq!(version, "12");
  }

  #[test]
  fn walks_up_to_existing_ancestor() {
    let dir = tempfile::tempdir().unwrap();
    let deep = dir.path().join("a/b/c");
    assert_eq!(
      nearest_existing_ancestor(&deep).unwrap(),
      dir.path().to_path_buf()
    );
  }
}
