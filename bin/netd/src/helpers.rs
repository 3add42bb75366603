use std::path::Path;

use anyhow::Context;
use orbit_client::{
  api::PeerHint,
  entities::{mesh::MeshPeer, network::NetworkConfig, node::NodePaths},
};

use crate::{config::netd_config, state::net_state};

/// This host's own entry in the peer list handed to a joining host.
/// The public key is derived from the interface private key.
pub fn self_mesh_peer(
  mesh_config_path: &Path,
  manifest: &orbit_client::entities::network::NetworkManifest,
) -> anyhow::Result<MeshPeer> {
  let config = mesh::load_config(mesh_config_path)?
    .context("this host has no mesh config")?;
  let public_key =
    mesh::derive_public_key(&config.interface.private_key)?;
  Ok(MeshPeer {
    public_key,
    endpoint: format!("{}:{}", manifest.public_ip, manifest.mesh_port),
    allowed_ip: config.overlay_ip().to_string(),
  })
}

/// The local object store daemon's identity, read from its repo
/// config. Empty when the repo has not been initialized yet.
pub fn object_store_identity(
  paths: &NodePaths,
  network: &NetworkConfig,
) -> PeerHint {
  let config_path = paths.object_store_repo().join("config");
  let Some(id) = read_json_string(&config_path, &["Identity", "PeerID"])
  else {
    return PeerHint::default();
  };
  PeerHint {
    addrs: vec![format!(
      "/ip4/{}/tcp/{}",
      network.overlay_ip, network.p2p_port
    )],
    id,
  }
}

/// The local pin coordinator's identity, read from its identity file.
pub fn pin_coordinator_hint(
  paths: &NodePaths,
  network: &NetworkConfig,
) -> PeerHint {
  let identity_path = paths.pin_coordinator_dir().join("identity.json");
  let Some(id) = read_json_string(&identity_path, &["id"]) else {
    return PeerHint::default();
  };
  PeerHint {
    addrs: vec![format!("{}/p2p/{id}", network.cluster_listen_multiaddr())],
    id,
  }
}

fn read_json_string(path: &Path, pointer: &[&str]) -> Option<String> {
  let contents = std::fs::read_to_string(path).ok()?;
  let mut value: serde_json::Value =
    serde_json::from_str(&contents).ok()?;
  for key in pointer {
    value = value.get_mut(key)?.take();
  }
  match value {
    serde_json::Value::String(s) if !s.is_empty() => Some(s),
    _ => None,
  }
}

/// Generate the bootstrap self-signed certificate when none exists.
/// Replaced by ACME issuance after the first deployment goes live.
pub async fn ensure_ssl_certs() -> anyhow::Result<()> {
  let config = netd_config();
  let key_file = config.ssl_key_file();
  let cert_file = config.ssl_cert_file();
  if key_file.is_file() && cert_file.is_file() {
    return Ok(());
  }

  info!("Generating self signed certs...");

  if let Some(parent) = key_file.parent() {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("Failed to create {parent:?}"))?;
  }

  let manifest = &net_state().manifest;
  let subject = format!(
    "/C=XX/CN={}",
    manifest
      .host_domain
      .as_deref()
      .unwrap_or(&manifest.network.base_domain)
  );
  let command = format!(
    "openssl req -x509 -newkey rsa:4096 -keyout {} -out {} -sha256 -days 3650 -nodes -subj \"{subject}\"",
    key_file.display(),
    cert_file.display(),
  );
  command::run_stage_shell_command("Generate certs", &command, None)
    .await
    .context("Failed to generate self signed certs")?;
  Ok(())
}
