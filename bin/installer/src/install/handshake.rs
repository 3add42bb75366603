use std::net::Ipv4Addr;

use anyhow::{Context, anyhow};
use mesh::MeshKeypair;
use orbit_client::{
  OrbitClient,
  api::{JoinRequest, JoinResponse},
};

use crate::{
  config::InstallConfig,
  error::InstallError,
  install::mesh_setup,
  helpers::{phase_done, phase_skipped},
};

/// The single HTTPS round-trip of a join.
///
/// Returns None when this host already completed its join (rerun
/// without --force): a second handshake with a fresh keypair would
/// make the remote node allocate a second overlay address for the
/// same physical host.
pub async fn run(
  config: &InstallConfig,
  keypair: &MeshKeypair,
  keypair_reused: bool,
) -> Result<Option<JoinResponse>, InstallError> {
  let join = config
    .join
    .as_ref()
    .context("handshake invoked without a join target")
    .map_err(InstallError::handshake)?;

  if mesh_setup::join_configured()
    .map_err(InstallError::identity)?
    && !config.force
  {
    phase_skipped("Join handshake", "host already joined");
    return Ok(None);
  }

  if keypair_reused && !config.force {
    return Err(InstallError::handshake(anyhow!(
      "an overlay keypair is already persisted on this host, so a previous join may have been granted an address. Rerunning the handshake would allocate a second one. Pass --force to reconfigure anyway."
    )));
  }

  // Certificate verification stays off for this one call: the
  // cluster only has self-signed certs during bootstrap.
  let client = OrbitClient::new_insecure(&join.address)
    .map_err(InstallError::handshake)?;

  match client.network_status().await {
    Ok(status) => info!("remote node identity: {}", status.peer_id),
    Err(e) => debug!("remote status probe failed | {e:#}"),
  }

  let request = JoinRequest {
    token: join.token.clone(),
    wg_public_key: keypair.public_key.clone(),
    public_ip: config.vps_ip.to_string(),
  };

  info!("requesting membership from {}", join.address);
  let snapshot = client
    .join(&request)
    .await
    .map_err(InstallError::handshake)?;
  validate_snapshot(&snapshot).map_err(InstallError::handshake)?;

  info!("granted overlay address {}", snapshot.wg_ip);
  phase_done("Join handshake");
  Ok(Some(snapshot))
}

fn validate_snapshot(snapshot: &JoinResponse) -> anyhow::Result<()> {
  snapshot
    .wg_ip
    .parse::<Ipv4Addr>()
    .context("remote granted a malformed overlay address")?;
  if !secrets::is_valid_cluster_secret(snapshot.cluster_secret.trim())
  {
    return Err(anyhow!("remote sent a malformed cluster secret"));
  }
  if secrets::normalize_swarm_key(&snapshot.swarm_key).is_none() {
    return Err(anyhow!("remote sent a malformed swarm key"));
  }
  if snapshot.wg_peers.is_empty() {
    return Err(anyhow!("remote sent an empty mesh peer set"));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use orbit_client::entities::mesh::MeshPeer;

  use super::*;

  fn snapshot() -> JoinResponse {
    JoinResponse {
      wg_ip: "10.0.0.2".to_string(),
      wg_peers: vec![MeshPeer {
        public_key: "cGVlcg==".to_string(),
        endpoint: "203.0.113.1:51820".to_string(),
        allowed_ip: "10.0.0.1".to_string(),
      }],
      bootstrap_peers: vec![],
      ipfs_peer: Default::default(),
      ipfs_cluster_peer: Default::default(),
      rqlite_join_address: "10.0.0.1:4802".to_string(),
      base_domain: "example.net".to_string(),
      cluster_secret: "ab".repeat(32),
      swarm_key: secrets::render_swarm_key(&"C".repeat(64)),
    }
  }

  #[test]
  fn valid_snapshot_passes() {
    assert!(validate_snapshot(&snapshot()).is_ok());
  }

  #[test]
  fn malformed_overlay_address_fails() {
    let mut snapshot = snapshot();
    snapshot.wg_ip = "not-an-ip".to_string();
    assert!(validate_snapshot(&snapshot).is_err());
  }

  #[test]
  fn truncated_cluster_secret_fails() {
    let mut snapshot = snapshot();
    snapshot.cluster_secret.truncate(60);
    assert!(validate_snapshot(&snapshot).is_err());
  }

  #[test]
  fn empty_peer_set_fails() {
    let mut snapshot = snapshot();
    snapshot.wg_peers.clear();
    assert!(validate_snapshot(&snapshot).is_err());
  }
}
