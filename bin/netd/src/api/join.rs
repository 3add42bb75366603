use std::{net::Ipv4Addr, path::Path};

use anyhow::{Context, anyhow};
use axum::{Json, http::StatusCode};
use orbit_client::{
  api::{JoinRequest, JoinResponse},
  entities::mesh::MeshPeer,
};
use tokio::sync::Mutex;

use crate::{
  api::ApiError,
  helpers::{
    object_store_identity, pin_coordinator_hint, self_mesh_peer,
  },
  state::{net_state, secret_store},
};

pub async fn handler(
  Json(request): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
  validate_request(&request)
    .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e))?;
  consume_invite(&request.token)
    .await
    .map_err(|e| ApiError(StatusCode::UNAUTHORIZED, e))?;

  let state = net_state();
  let manifest = &state.manifest;

  let (allocated_ip, existing_peers) = allocate_peer(
    &state.mesh_config_path,
    &state.allocation_lock,
    &request.wg_public_key,
    &request.public_ip,
    manifest.mesh_port,
    true,
  )
  .await?;

  // The joining host connects to every existing peer plus this host.
  let mut wg_peers =
    vec![self_mesh_peer(&state.mesh_config_path, manifest)?];
  wg_peers.extend(existing_peers);

  let store = secret_store();
  let cluster_secret = store
    .ensure_cluster_secret()
    .context("This host has no cluster secret to share")?;
  let swarm_key = store
    .ensure_swarm_key()
    .context("This host has no swarm key to share")?;

  let network = &manifest.network;
  let ipfs_peer = object_store_identity(store.paths(), network);
  let bootstrap_peers = if ipfs_peer.is_empty() {
    Vec::new()
  } else {
    vec![format!(
      "/ip4/{}/tcp/{}/p2p/{}",
      network.overlay_ip, network.p2p_port, ipfs_peer.id
    )]
  };

  info!(
    "allocated overlay address {allocated_ip} to {}",
    request.public_ip
  );

  Ok(Json(JoinResponse {
    wg_ip: allocated_ip.to_string(),
    wg_peers,
    bootstrap_peers,
    ipfs_peer,
    ipfs_cluster_peer: pin_coordinator_hint(store.paths(), network),
    rqlite_join_address: network.sql_raft_adv(),
    base_domain: network.base_domain.clone(),
    cluster_secret,
    swarm_key,
  }))
}

fn validate_request(request: &JoinRequest) -> anyhow::Result<()> {
  if request.wg_public_key.trim().is_empty() {
    return Err(anyhow!("wg_public_key is required"));
  }
  request
    .public_ip
    .parse::<Ipv4Addr>()
    .context("public_ip must be a dotted quad")?;
  Ok(())
}

/// Burn a single-use invite. With no configured token list, any
/// non-empty token passes (the wizard validates out of band).
async fn consume_invite(token: &str) -> anyhow::Result<()> {
  if token.trim().is_empty() {
    return Err(anyhow!("an invite token is required"));
  }
  let Some(invites) = &net_state().invites else {
    return Ok(());
  };
  if invites.lock().await.remove(token) {
    Ok(())
  } else {
    Err(anyhow!("invite token is not valid or was already used"))
  }
}

/// Allocate the smallest free overlay address and commit the new peer
/// to the mesh config, all under the allocation mutex.
///
/// Returns the allocation and the peer list as it stood before the
/// new peer was added. The commit happens before the mutex releases,
/// so a concurrent join observes this allocation as taken.
pub async fn allocate_peer(
  mesh_config_path: &Path,
  lock: &Mutex<()>,
  wg_public_key: &str,
  public_ip: &str,
  mesh_port: u16,
  live: bool,
) -> anyhow::Result<(Ipv4Addr, Vec<MeshPeer>)> {
  let _guard = lock.lock().await;

  let mut config = mesh::load_config(mesh_config_path)?
    .context("this host has no mesh config; it cannot serve joins")?;
  let existing_peers = config.peers.clone();

  let allocated_ip = mesh::next_available_ip(&config)?;
  let peer = MeshPeer {
    public_key: wg_public_key.trim().to_string(),
    endpoint: format!("{public_ip}:{mesh_port}"),
    allowed_ip: allocated_ip.to_string(),
  };
  config.push_peer(peer.clone())?;

  mesh::write_config_file(mesh_config_path, &config.render())
    .await
    .context("Failed to persist mesh config with the new peer")?;

  if live && let Err(e) = mesh::add_live_peer(&peer).await {
    // The config is the durable record; the interface picks the peer
    // up on next restart even if the live add failed.
    warn!("failed to add {allocated_ip} to the live interface | {e:#}");
  }

  Ok((allocated_ip, existing_peers))
}

#[cfg(test)]
mod tests {
  use mesh::{MeshConfig, MeshInterface};

  use super::*;

  async fn write_genesis_config(path: &Path) {
    let config = MeshConfig {
      interface: MeshInterface {
        private_key: mesh::MeshKeypair::generate().private_key,
        address: "10.0.0.1/24".to_string(),
        listen_port: 51820,
      },
      peers: vec![],
    };
    mesh::write_config_file(path, &config.render()).await.unwrap();
  }

  #[tokio::test]
  async fn back_to_back_allocations_are_disjoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wg0.conf");
    write_genesis_config(&path).await;
    let lock = Mutex::new(());

    let (first, peers_before_first) = allocate_peer(
      &path, &lock, "a2V5LWE=", "203.0.113.2", 51820, false,
    )
    .await
    .unwrap();
    let (second, _) = allocate_peer(
      &path, &lock, "a2V5LWI=", "203.0.113.3", 51820, false,
    )
    .await
    .unwrap();

    assert!(peers_before_first.is_empty());
    assert_ne!(first, second);
    assert_ne!(first.octets()[3], 1);
    assert_ne!(second.octets()[3], 1);

    // both allocations are recorded in the server's config
    let config = mesh::load_config(&path).unwrap().unwrap();
    let allowed = config
      .peers
      .iter()
      .map(|p| p.allowed_ip.as_str())
      .collect::<Vec<_>>();
    assert!(allowed.contains(&first.to_string().as_str()));
    assert!(allowed.contains(&second.to_string().as_str()));
  }

  #[tokio::test]
  async fn concurrent_allocations_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wg0.conf");
    write_genesis_config(&path).await;
    let lock = std::sync::Arc::new(Mutex::new(()));
    let path_a = path.clone();
    let path_b = path.clone();
    let lock_a = lock.clone();
    let lock_b = lock.clone();

    let (a, b) = tokio::join!(
      tokio::spawn(async move {
        allocate_peer(
          &path_a, &lock_a, "a2V5LWE=", "203.0.113.2", 51820, false,
        )
        .await
        .unwrap()
        .0
      }),
      tokio::spawn(async move {
        allocate_peer(
          &path_b, &lock_b, "a2V5LWI=", "203.0.113.3", 51820, false,
        )
        .await
        .unwrap()
        .0
      }),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a, b);

    let config = mesh::load_config(&path).unwrap().unwrap();
    assert_eq!(config.peers.len(), 2);
  }

  #[tokio::test]
  async fn duplicate_public_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wg0.conf");
    write_genesis_config(&path).await;
    let lock = Mutex::new(());

    allocate_peer(&path, &lock, "a2V5LWE=", "203.0.113.2", 51820, false)
      .await
      .unwrap();
    let res = allocate_peer(
      &path, &lock, "a2V5LWE=", "203.0.113.9", 51820, false,
    )
    .await;
    assert!(res.is_err());
  }
}
