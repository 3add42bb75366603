use std::{
  collections::BTreeMap,
  os::unix::fs::PermissionsExt,
  path::Path,
};

use anyhow::{Context, anyhow};
use mesh::MeshConfig;
use orbit_client::{
  api::JoinResponse,
  entities::{
    network::{
      NETWORK_MANIFEST_FILE, NetworkConfig, NetworkManifest,
    },
    node::ports,
  },
};
use secrets::Owner;

use crate::{
  config::InstallConfig,
  error::InstallError,
  helpers::phase_done,
  install::templates,
};

/// Turn (peers, local addresses, secrets, base domain, join target)
/// into every rendered daemon config.
pub async fn run(
  config: &InstallConfig,
  owner: Owner,
  identity: &secrets::PeerId,
  mesh: &MeshConfig,
  snapshot: Option<&JoinResponse>,
) -> Result<NetworkConfig, InstallError> {
  let network = build_network_config(config, identity, mesh, snapshot)
    .map_err(InstallError::config)?;

  render_all(config, owner, &network)
    .await
    .map_err(InstallError::config)?;

  phase_done("Synthesize configs");
  Ok(network)
}

/// Assemble the aggregate tuple. Every advertised inter-node address
/// prefers the overlay IP; the public IP only ever appears as the
/// mesh endpoint.
fn build_network_config(
  config: &InstallConfig,
  identity: &secrets::PeerId,
  mesh: &MeshConfig,
  snapshot: Option<&JoinResponse>,
) -> anyhow::Result<NetworkConfig> {
  let overlay_ip = mesh.overlay_ip().to_string();

  let (sql_join_target, base_domain, mut peer_multiaddrs) =
    match snapshot {
      Some(snapshot) => (
        snapshot.rqlite_join_address.clone(),
        if snapshot.base_domain.is_empty() {
          config.base_domain.clone()
        } else {
          snapshot.base_domain.clone()
        },
        snapshot.bootstrap_peers.clone(),
      ),
      None if config.is_join() => {
        // Rerun on a joined host: the previous manifest carries the
        // values the skipped handshake would have delivered.
        let manifest = load_manifest(config).context(
          "no join snapshot and no previous manifest; rerun with --force to redo the handshake",
        )?;
        (
          manifest.network.sql_join_target,
          manifest.network.base_domain,
          manifest.network.peer_multiaddrs,
        )
      }
      None => {
        (String::new(), config.base_domain.clone(), Vec::new())
      }
    };

  // Out-of-band bootstrap peers supplement whatever was discovered.
  for peer in &config.bootstrap_peers {
    if !peer_multiaddrs.contains(peer) {
      peer_multiaddrs.push(peer.clone());
    }
  }

  let network = NetworkConfig {
    node_id: identity.to_string(),
    p2p_port: ports::P2P,
    overlay_ip,
    sql_http_port: ports::SQL_HTTP,
    sql_raft_port: ports::SQL_RAFT,
    sql_join_target,
    peer_multiaddrs,
    cluster_api_port: ports::CLUSTER_API,
    object_api_port: ports::OBJECT_API,
    gateway_port: ports::GATEWAY,
    base_domain,
    https_enabled: true,
    tls_cache_dir: config.paths.tls_cache().display().to_string(),
  };

  // A SQL store must never be told to join itself.
  if !network.sql_join_target.is_empty()
    && network.sql_join_target == network.sql_raft_adv()
  {
    return Err(anyhow!(
      "computed SQL join target {} equals this host's own raft advertise address",
      network.sql_join_target
    ));
  }

  Ok(network)
}

async fn render_all(
  config: &InstallConfig,
  owner: Owner,
  network: &NetworkConfig,
) -> anyhow::Result<()> {
  let vars = template_vars(config, network)?;
  let paths = &config.paths;

  write_rendered(
    &paths.config_file("node-config.yaml"),
    &templates::render(templates::NODE_CONFIG, &vars)?,
    owner,
  )?;
  // The gateway rewrites its file at runtime, so it lives in data.
  write_rendered(
    &paths.data().join("gateway.yaml"),
    &templates::render(templates::GATEWAY_CONFIG, &vars)?,
    owner,
  )?;
  write_rendered(
    &paths.config_file("olricd.yaml"),
    &templates::render(templates::CACHE_CONFIG, &vars)?,
    owner,
  )?;
  if config.nameserver {
    write_rendered(
      &paths.config_file("Corefile"),
      &templates::render(templates::COREFILE, &vars)?,
      owner,
    )?;
  }

  let manifest = NetworkManifest {
    network: network.clone(),
    public_ip: config.vps_ip.to_string(),
    mesh_port: ports::MESH,
    host_domain: config.domain.clone(),
  };
  write_rendered(
    &paths.config_file(NETWORK_MANIFEST_FILE),
    &serde_json::to_string_pretty(&manifest)
      .context("Failed to serialize network manifest")?,
    owner,
  )?;

  Ok(())
}

fn template_vars(
  config: &InstallConfig,
  network: &NetworkConfig,
) -> anyhow::Result<BTreeMap<&'static str, String>> {
  Ok(BTreeMap::from([
    ("NodeId", network.node_id.clone()),
    ("BaseDomain", network.base_domain.clone()),
    ("GatewayPort", network.gateway_port.to_string()),
    ("HttpsEnabled", network.https_enabled.to_string()),
    ("TlsCacheDir", network.tls_cache_dir.clone()),
    ("P2pPort", network.p2p_port.to_string()),
    (
      "BootstrapPeers",
      serde_json::to_string(&network.peer_multiaddrs)
        .context("Failed to serialize bootstrap peers")?,
    ),
    ("SqlHttpPort", network.sql_http_port.to_string()),
    ("SqlRaftPort", network.sql_raft_port.to_string()),
    ("SqlJoinTarget", network.sql_join_target.clone()),
    (
      "SqlDataDir",
      config.paths.sql_store_dir().display().to_string(),
    ),
    ("ObjectApiPort", network.object_api_port.to_string()),
    ("ClusterApiPort", network.cluster_api_port.to_string()),
    ("CachePort", ports::CACHE.to_string()),
    ("OverlayIp", network.overlay_ip.clone()),
  ]))
}

/// 0644, owned by the service user.
fn write_rendered(
  path: &Path,
  contents: &str,
  owner: Owner,
) -> anyhow::Result<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("Failed to create {parent:?}"))?;
  }
  std::fs::write(path, contents)
    .with_context(|| format!("Failed to write {path:?}"))?;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
    .with_context(|| format!("Failed to set mode on {path:?}"))?;
  if let Err(e) = std::os::unix::fs::chown(
    path,
    Some(owner.uid),
    Some(owner.gid),
  ) {
    warn!("failed to chown {path:?} | {e:#}");
  }
  Ok(())
}

fn load_manifest(
  config: &InstallConfig,
) -> Option<NetworkManifest> {
  let path = config.paths.config_file(NETWORK_MANIFEST_FILE);
  let contents = std::fs::read_to_string(path).ok()?;
  serde_json::from_str(&contents).ok()
}

#[cfg(test)]
mod tests {
  use mesh::{MeshInterface, MeshKeypair};
  use orbit_client::entities::{mesh::MeshPeer, node::NodePaths};

  use super::*;
  use crate::config::{InstallConfig, JoinTarget};

  fn test_config(
    base: &Path,
    join: Option<JoinTarget>,
  ) -> InstallConfig {
    InstallConfig {
      vps_ip: "203.0.113.2".parse().unwrap(),
      domain: None,
      base_domain: "example.net".to_string(),
      branch: crate::config::Branch::Main,
      no_pull: false,
      force: false,
      dry_run: false,
      skip_checks: false,
      nameserver: false,
      join,
      cluster_secret: None,
      swarm_key: None,
      bootstrap_peers: Vec::new(),
      paths: NodePaths::new(base),
      ssh_port: 22,
      relay_or_port: 0,
      logging: Default::default(),
    }
  }

  fn join_target() -> Option<JoinTarget> {
    Some(JoinTarget {
      address: "203.0.113.1:6001".to_string(),
      token: "t-0001".to_string(),
    })
  }

  fn identity(base: &Path) -> secrets::PeerId {
    secrets::SecretStore::new(NodePaths::new(base), None)
      .ensure_node_identity()
      .unwrap()
  }

  fn mesh_config(address: &str) -> MeshConfig {
    MeshConfig {
      interface: MeshInterface {
        private_key: MeshKeypair::generate().private_key,
        address: address.to_string(),
        listen_port: 51820,
      },
      peers: vec![],
    }
  }

  fn snapshot(join_address: &str) -> JoinResponse {
    JoinResponse {
      wg_ip: "10.0.0.2".to_string(),
      wg_peers: vec![MeshPeer {
        public_key: "cGVlcg==".to_string(),
        endpoint: "203.0.113.1:51820".to_string(),
        allowed_ip: "10.0.0.1".to_string(),
      }],
      bootstrap_peers: vec![
        "/ip4/10.0.0.1/tcp/4001/p2p/QmPeer".to_string(),
      ],
      ipfs_peer: Default::default(),
      ipfs_cluster_peer: Default::default(),
      rqlite_join_address: join_address.to_string(),
      base_domain: "example.net".to_string(),
      cluster_secret: "ab".repeat(32),
      swarm_key: secrets::render_swarm_key(&"C".repeat(64)),
    }
  }

  #[test]
  fn genesis_has_empty_join_target() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), None);
    let network = build_network_config(
      &config,
      &identity(dir.path()),
      &mesh_config("10.0.0.1/24"),
      None,
    )
    .unwrap();
    assert_eq!(network.sql_join_target, "");
    assert_eq!(network.overlay_ip, "10.0.0.1");
    assert!(network.peer_multiaddrs.is_empty());
  }

  #[test]
  fn join_takes_snapshot_values() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), join_target());
    let network = build_network_config(
      &config,
      &identity(dir.path()),
      &mesh_config("10.0.0.2/24"),
      Some(&snapshot("10.0.0.1:4802")),
    )
    .unwrap();
    assert_eq!(network.sql_join_target, "10.0.0.1:4802");
    assert_eq!(network.peer_multiaddrs.len(), 1);
  }

  #[test]
  fn self_join_target_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), join_target());
    // remote hands back this host's own raft advertise address
    let res = build_network_config(
      &config,
      &identity(dir.path()),
      &mesh_config("10.0.0.2/24"),
      Some(&snapshot("10.0.0.2:4802")),
    );
    assert!(res.is_err());
  }

  #[test]
  fn out_of_band_peers_are_merged_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), join_target());
    config.bootstrap_peers = vec![
      "/ip4/10.0.0.1/tcp/4001/p2p/QmPeer".to_string(),
      "/ip4/10.0.0.3/tcp/4001/p2p/QmOther".to_string(),
    ];
    let network = build_network_config(
      &config,
      &identity(dir.path()),
      &mesh_config("10.0.0.2/24"),
      Some(&snapshot("10.0.0.1:4802")),
    )
    .unwrap();
    assert_eq!(network.peer_multiaddrs.len(), 2);
  }

  #[tokio::test]
  async fn rendering_twice_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), None);
    let owner = Owner {
      uid: current_uid(),
      gid: current_gid(),
    };
    let network = build_network_config(
      &config,
      &identity(dir.path()),
      &mesh_config("10.0.0.1/24"),
      None,
    )
    .unwrap();

    render_all(&config, owner, &network).await.unwrap();
    let first = std::fs::read_to_string(
      config.paths.config_file("node-config.yaml"),
    )
    .unwrap();
    assert!(first.contains("rqlite_join_address: \"\""));
    assert!(first.contains("http_adv: \"10.0.0.1:4801\""));

    render_all(&config, owner, &network).await.unwrap();
    let second = std::fs::read_to_string(
      config.paths.config_file("node-config.yaml"),
    )
    .unwrap();
    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn rendered_node_config_is_valid_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), join_target());
    let owner = Owner {
      uid: current_uid(),
      gid: current_gid(),
    };
    let network = build_network_config(
      &config,
      &identity(dir.path()),
      &mesh_config("10.0.0.2/24"),
      Some(&snapshot("10.0.0.1:4802")),
    )
    .unwrap();
    render_all(&config, owner, &network).await.unwrap();

    let contents = std::fs::read_to_string(
      config.paths.config_file("node-config.yaml"),
    )
    .unwrap();
    let parsed: serde_yaml_ng::Value =
      serde_yaml_ng::from_str(&contents).unwrap();
    assert_eq!(
      parsed["rqlite"]["rqlite_join_address"],
      serde_yaml_ng::Value::from("10.0.0.1:4802")
    );
    assert_eq!(
      parsed["rqlite"]["raft_adv"],
      serde_yaml_ng::Value::from("10.0.0.2:4802")
    );
    assert_eq!(
      parsed["gateway"]["port"],
      serde_yaml_ng::Value::from(6001)
    );

    let gateway = std::fs::read_to_string(
      config.paths.data().join("gateway.yaml"),
    )
    .unwrap();
    let gateway: serde_yaml_ng::Value =
      serde_yaml_ng::from_str(&gateway).unwrap();
    // internal endpoints stay on loopback
    assert_eq!(
      gateway["internal"]["rqlite_http"],
      serde_yaml_ng::Value::from("127.0.0.1:4801")
    );
  }

  // tests run unprivileged; chowning to ourselves is a no-op
  fn current_uid() -> u32 {
    std::fs::metadata("/proc/self")
      .map(|m| std::os::unix::fs::MetadataExt::uid(&m))
      .unwrap_or(0)
  }

  fn current_gid() -> u32 {
    std::fs::metadata("/proc/self")
      .map(|m| std::os::unix::fs::MetadataExt::gid(&m))
      .unwrap_or(0)
  }
}
