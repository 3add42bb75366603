use std::time::Duration;

use anyhow::{Context, anyhow};
use command::binary_on_path;
use mesh::{MeshConfig, MeshInterface, MeshKeypair};
use orbit_client::{
  api::JoinResponse,
  entities::node::{mesh_config_path, ports},
};
use secrets::Owner;

use crate::{
  config::InstallConfig,
  error::InstallError,
  helpers::{install_packages, phase_done, phase_skipped},
};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Overlay `/24` every cluster runs in.
const OVERLAY_SUBNET: std::net::Ipv4Addr =
  std::net::Ipv4Addr::new(10, 0, 0, 0);

/// Genesis: self-assign the `.1` address with an empty peer list.
/// An existing mesh config is the phase sentinel and is left alone.
pub async fn genesis(
  config: &InstallConfig,
  owner: Owner,
) -> Result<MeshConfig, InstallError> {
  ensure_tooling().await?;

  let path = mesh_config_path();
  if let Some(existing) =
    mesh::load_config(path).map_err(InstallError::identity)?
    && !config.force
  {
    phase_skipped("Mesh setup", "config already present");
    return Ok(existing);
  }

  let (keypair, _) = ensure_keypair(config, owner).await?;
  let address = mesh::genesis_address(OVERLAY_SUBNET);
  let mesh_config = MeshConfig {
    interface: MeshInterface {
      private_key: keypair.private_key.clone(),
      address: format!("{address}/24"),
      listen_port: ports::MESH,
    },
    peers: vec![],
  };
  mesh::write_config_file(path, &mesh_config.render())
    .await
    .map_err(InstallError::mesh)?;
  bring_up().await?;

  phase_done("Mesh setup");
  Ok(mesh_config)
}

/// Load or create the persisted overlay keypair. The bool is true
/// when the keypair was already on disk from a previous run.
///
/// Join path phase 4: runs before the handshake so a handshake
/// failure leaves nothing on disk beyond this keypair.
pub async fn ensure_keypair(
  config: &InstallConfig,
  owner: Owner,
) -> Result<(MeshKeypair, bool), InstallError> {
  ensure_tooling().await?;

  let path = config.paths.mesh_key_file();
  if let Ok(private_key) = std::fs::read_to_string(&path) {
    let keypair = MeshKeypair::from_private_key(&private_key)
      .with_context(|| {
        format!("persisted mesh key at {path:?} is unusable. Inspect or remove the file before rerunning.")
      })
      .map_err(InstallError::identity)?;
    phase_skipped("Generate mesh keypair", "already persisted");
    return Ok((keypair, true));
  }

  let keypair = MeshKeypair::generate();
  let store = secrets::SecretStore::new(
    config.paths.clone(),
    Some(owner),
  );
  store
    .write_in_secrets_dir("mesh.key", &keypair.private_key)
    .map_err(InstallError::identity)?;
  phase_done("Generate mesh keypair");
  Ok((keypair, false))
}

/// Whether a previous run already completed the mesh join.
pub fn join_configured() -> anyhow::Result<bool> {
  Ok(
    mesh::load_config(mesh_config_path())?
      .map(|config| !config.peers.is_empty())
      .unwrap_or(false),
  )
}

/// Join: raise the tunnel with the address granted by the remote node
/// and the peer set it returned.
pub async fn configure_with_peers(
  keypair: &MeshKeypair,
  snapshot: &JoinResponse,
) -> Result<MeshConfig, InstallError> {
  let mesh_config = MeshConfig {
    interface: MeshInterface {
      private_key: keypair.private_key.clone(),
      address: format!("{}/24", snapshot.wg_ip),
      listen_port: ports::MESH,
    },
    peers: snapshot.wg_peers.clone(),
  };
  // Duplicate keys or addresses in the received set indicate a
  // coordination bug on the serving node. Refuse them.
  mesh_config.validate().map_err(InstallError::mesh)?;

  mesh::write_config_file(mesh_config_path(), &mesh_config.render())
    .await
    .map_err(InstallError::mesh)?;
  mesh::interface_restart().await.map_err(InstallError::mesh)?;
  enable_unit().await;

  phase_done("Configure mesh with peers");
  Ok(mesh_config)
}

/// Rerun on an already joined host: reuse the persisted config.
pub async fn load_existing() -> Result<MeshConfig, InstallError> {
  let mesh_config = mesh::load_config(mesh_config_path())
    .map_err(InstallError::identity)?
    .context("mesh config disappeared between phases")
    .map_err(InstallError::mesh)?;
  phase_skipped("Configure mesh with peers", "already configured");
  Ok(mesh_config)
}

/// Probe the first received peer over the tunnel.
/// No answer within 30s is fatal for the join; the mesh is left up
/// for manual diagnosis.
pub async fn verify(
  snapshot: &JoinResponse,
) -> Result<(), InstallError> {
  let first_peer = snapshot
    .wg_peers
    .first()
    .ok_or_else(|| {
      InstallError::mesh(anyhow!(
        "join response carried no mesh peers to verify against"
      ))
    })?;
  mesh::probe_peer(&first_peer.allowed_ip, VERIFY_TIMEOUT)
    .await
    .map_err(InstallError::mesh)?;
  phase_done("Verify mesh reachability");
  Ok(())
}

async fn ensure_tooling() -> Result<(), InstallError> {
  if binary_on_path("wg").await && binary_on_path("wg-quick").await {
    return Ok(());
  }
  install_packages(&["wireguard", "wireguard-tools"])
    .await
    .context("Failed to install the overlay tooling")
    .map_err(InstallError::acquisition)
}

async fn bring_up() -> Result<(), InstallError> {
  mesh::interface_up().await.map_err(InstallError::mesh)?;
  enable_unit().await;
  Ok(())
}

/// Persist the interface across reboots. Best effort; the config
/// file itself is the durable artifact.
async fn enable_unit() {
  let output = command::run_standard_command(
    &format!("systemctl enable wg-quick@{}", mesh::MESH_INTERFACE),
    None,
  )
  .await;
  if !output.success() {
    warn!("failed to enable the mesh unit | {}", output.combined());
  }
}
