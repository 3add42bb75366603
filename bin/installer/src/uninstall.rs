use colored::Colorize;
use command::run_standard_command;
use orbit_client::entities::node::NodePaths;

use crate::helpers::warn;

const UNITS: [&str; 5] = [
  "orbit-coredns",
  "orbitd",
  "orbit-ipfs-cluster",
  "orbit-olricd",
  "orbit-ipfs",
];

/// Stop and disable the orbit services and remove their unit files.
///
/// Data, secrets and rendered configs are deliberately left on disk:
/// a reinstalled host reuses its identity and rejoins the cluster as
/// the same member.
pub async fn run() -> anyhow::Result<()> {
  for unit in UNITS {
    let stop = run_standard_command(
      &format!("systemctl disable --now {unit}.service"),
      None,
    )
    .await;
    if !stop.success() {
      warn(format!("failed to stop {unit} | {}", stop.combined()));
    }
    let path = format!("/etc/systemd/system/{unit}.service");
    match std::fs::remove_file(&path) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn(format!("failed to remove {path} | {e:#}")),
    }
  }

  let reload =
    run_standard_command("systemctl daemon-reload", None).await;
  if !reload.success() {
    warn(format!("daemon-reload failed | {}", reload.combined()));
  }

  let paths = NodePaths::for_service_user();
  println!(
    "{} Services stopped. Node state kept at {} (secrets under {}).",
    "DONE".green().bold(),
    paths.base.display(),
    paths.secrets().display(),
  );
  Ok(())
}
