use std::{
  path::{Path, PathBuf},
  process::Stdio,
  time::Duration,
};

use anyhow::{Context, anyhow};
use command::{run_stage_command, run_standard_command};
use orbit_client::entities::mesh::MeshPeer;
use tokio::io::AsyncWriteExt;

use crate::{MESH_INTERFACE, MeshConfig};

/// Write the rendered config, 0600, atomically: temp file in the
/// target directory, then rename. When the process cannot write there
/// directly, fall back to piping the contents into a privileged tee.
pub async fn write_config_file(
  path: &Path,
  contents: &str,
) -> anyhow::Result<()> {
  match write_atomic(path, contents) {
    Ok(()) => Ok(()),
    Err(e) => {
      tracing::debug!(
        "direct write of {path:?} failed ({e:#}), falling back to tee"
      );
      write_via_tee(path, contents).await
    }
  }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
  use std::{io::Write, os::unix::fs::OpenOptionsExt};
  let dir = path.parent().unwrap_or(Path::new("/"));
  std::fs::create_dir_all(dir)?;
  let tmp: PathBuf = dir.join(format!(
    ".{}.tmp",
    path.file_name().and_then(|n| n.to_str()).unwrap_or("wg0.conf")
  ));
  {
    let mut file = std::fs::OpenOptions::new()
      .write(true)
      .create(true)
      .truncate(true)
      .mode(0o600)
      .open(&tmp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
  }
  std::fs::rename(&tmp, path)
}

async fn write_via_tee(
  path: &Path,
  contents: &str,
) -> anyhow::Result<()> {
  let mut child = tokio::process::Command::new("sudo")
    .args(["tee", &path.to_string_lossy()])
    .stdin(Stdio::piped())
    .stdout(Stdio::null())
    .stderr(Stdio::piped())
    .spawn()
    .context("Failed to spawn privileged tee")?;
  child
    .stdin
    .take()
    .context("tee stdin unavailable")?
    .write_all(contents.as_bytes())
    .await
    .context("Failed to pipe config into tee")?;
  let output = child
    .wait_with_output()
    .await
    .context("Failed to wait on tee")?;
  if !output.status.success() {
    return Err(anyhow!(
      "privileged tee failed | {}",
      String::from_utf8_lossy(&output.stderr)
    ));
  }
  run_stage_command(
    "Restrict mesh config",
    &format!("sudo chmod 600 {}", path.display()),
    None,
  )
  .await?;
  Ok(())
}

/// Bring the interface up from its persisted config.
/// Already-up is not an error.
pub async fn interface_up() -> anyhow::Result<()> {
  let output = run_standard_command(
    &format!("wg-quick up {MESH_INTERFACE}"),
    None,
  )
  .await;
  if output.success() || output.stderr.contains("already exists") {
    Ok(())
  } else {
    Err(anyhow!("wg-quick up failed | {}", output.combined()))
  }
}

pub async fn interface_down() -> anyhow::Result<()> {
  let output = run_standard_command(
    &format!("wg-quick down {MESH_INTERFACE}"),
    None,
  )
  .await;
  if output.success() || output.stderr.contains("is not a WireGuard interface") {
    Ok(())
  } else {
    Err(anyhow!("wg-quick down failed | {}", output.combined()))
  }
}

/// Restart the interface so a rewritten config takes effect.
pub async fn interface_restart() -> anyhow::Result<()> {
  interface_down().await?;
  interface_up().await
}

/// Add a peer to the live interface without a restart.
///
/// The caller must also persist the peer into the config file; `wg set`
/// alone does not survive an interface restart.
pub async fn add_live_peer(peer: &MeshPeer) -> anyhow::Result<()> {
  let mut cmd = format!(
    "wg set {MESH_INTERFACE} peer {} allowed-ips {} persistent-keepalive {}",
    peer.public_key,
    peer.allowed_ip_cidr(),
    crate::PERSISTENT_KEEPALIVE,
  );
  if !peer.endpoint.is_empty() {
    cmd.push_str(&format!(" endpoint {}", peer.endpoint));
  }
  run_stage_command("Add mesh peer", &cmd, None).await?;
  Ok(())
}

/// Remove a peer from the live interface.
pub async fn remove_live_peer(public_key: &str) -> anyhow::Result<()> {
  run_stage_command(
    "Remove mesh peer",
    &format!("wg set {MESH_INTERFACE} peer {public_key} remove"),
    None,
  )
  .await?;
  Ok(())
}

/// Probe a peer's overlay address with ICMP echoes, retrying every
/// 2 seconds for up to `timeout`. Used after the tunnel comes up on
/// the join path; failure is fatal for the join.
pub async fn probe_peer(
  overlay_ip: &str,
  timeout: Duration,
) -> anyhow::Result<()> {
  let deadline = tokio::time::Instant::now() + timeout;
  let command = format!("ping -c 1 -W 2 {overlay_ip}");
  loop {
    if run_standard_command(&command, None).await.success() {
      return Ok(());
    }
    if tokio::time::Instant::now() >= deadline {
      return Err(anyhow!(
        "peer {overlay_ip} did not answer over the mesh within {}s",
        timeout.as_secs()
      ));
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
  }
}

/// Load the persisted mesh config, if any.
pub fn load_config(path: &Path) -> anyhow::Result<Option<MeshConfig>> {
  match std::fs::read_to_string(path) {
    Ok(contents) => MeshConfig::parse(&contents)
      .with_context(|| format!("Failed to parse mesh config at {path:?}"))
      .map(Some),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => {
      Err(e).with_context(|| format!("Failed to read mesh config at {path:?}"))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::MeshInterface;

  #[tokio::test]
  async fn write_then_load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wg0.conf");
    let config = MeshConfig {
      interface: MeshInterface {
        private_key: "cHJpdmF0ZQ==".to_string(),
        address: "10.0.0.1/24".to_string(),
        listen_port: 51820,
      },
      peers: vec![],
    };
    write_config_file(&path, &config.render()).await.unwrap();
    let loaded = load_config(&path).unwrap().unwrap();
    assert_eq!(loaded, config);
  }

  #[test]
  fn missing_config_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    assert!(
      load_config(&dir.path().join("wg0.conf"))
        .unwrap()
        .is_none()
    );
  }
}
