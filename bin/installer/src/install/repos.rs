use std::path::Path;

use anyhow::{Context, anyhow};
use command::run_command_with_env;
use orbit_client::{
  api::{JoinResponse, PeerHint},
  entities::network::NetworkConfig,
};
use serde_json::{Value, json};

use crate::{
  config::InstallConfig,
  error::InstallError,
  helpers::{chown_to_service_user, phase_done},
};

/// Coerce each downstream daemon's self-generated on-disk config to
/// the cluster's secrets, ports and topology.
///
/// The daemons' own `init` subcommands regenerate defaults that
/// disagree with the cluster; this phase patches the specific paths
/// and preserves every unknown key, so it can rerun against a live
/// installation's config without losing daemon-written state.
pub async fn run(
  config: &InstallConfig,
  network: &NetworkConfig,
  snapshot: Option<&JoinResponse>,
) -> Result<(), InstallError> {
  let store =
    secrets::SecretStore::new(config.paths.clone(), None);
  let cluster_secret = store
    .ensure_cluster_secret()
    .map_err(InstallError::identity)?;

  init_object_store(
    config,
    network,
    snapshot.map(|s| &s.ipfs_peer),
  )
  .await
  .map_err(InstallError::config)?;

  init_pin_coordinator(
    config,
    network,
    &cluster_secret,
    snapshot
      .map(|s| s.ipfs_cluster_peer.addrs.clone())
      .unwrap_or_default(),
  )
  .await?;

  init_sql_store(config).await.map_err(InstallError::config)?;

  phase_done("Initialize daemon repos");
  Ok(())
}

// ==============
//  Object store
// ==============

async fn init_object_store(
  config: &InstallConfig,
  network: &NetworkConfig,
  peering: Option<&PeerHint>,
) -> anyhow::Result<()> {
  let repo = config.paths.object_store_repo();
  let repo_env = repo.display().to_string();
  let config_path = repo.join("config");

  if !config_path.exists() {
    let output = run_command_with_env(
      "ipfs init --profile=server",
      &[("IPFS_PATH", &repo_env)],
      None,
    )
    .await;
    if !output.success() {
      return Err(anyhow!(
        "ipfs init failed | {}",
        output.combined()
      ));
    }
  }

  // The private-network marker: its presence in the repo makes the
  // daemon refuse non-member peers.
  let master_key = config.paths.swarm_key_file();
  let private_network = master_key.is_file();
  if private_network {
    let key = std::fs::read_to_string(&master_key)
      .with_context(|| format!("Failed to read {master_key:?}"))?;
    std::fs::write(repo.join("swarm.key"), key)
      .context("Failed to copy the swarm key into the repo")?;
    let output = run_command_with_env(
      "ipfs config --json AutoConf.Enabled false",
      &[("IPFS_PATH", &repo_env)],
      None,
    )
    .await;
    if !output.success() {
      return Err(anyhow!(
        "disabling AutoConf failed | {}",
        output.combined()
      ));
    }
  }

  backup_once(config, &config_path, "ipfs-config");

  let contents = std::fs::read_to_string(&config_path)
    .with_context(|| format!("Failed to read {config_path:?}"))?;
  let mut value: Value = serde_json::from_str(&contents)
    .with_context(|| format!("Failed to parse {config_path:?}"))?;
  patch_object_store_config(
    &mut value,
    network,
    private_network,
    peering,
  );
  std::fs::write(
    &config_path,
    serde_json::to_string_pretty(&value)
      .context("Failed to serialize the object store config")?,
  )
  .with_context(|| format!("Failed to write {config_path:?}"))?;

  chown_to_service_user(&repo).await;
  Ok(())
}

/// Mutate the parsed repo config in place, preserving unknown keys.
fn patch_object_store_config(
  value: &mut Value,
  network: &NetworkConfig,
  private_network: bool,
  peering: Option<&PeerHint>,
) {
  if private_network {
    // Placeholder "auto" values make the daemon refuse to start on
    // a private network. Clear all of them.
    *ensure_path(value, &["Bootstrap"]) = json!([]);
    *ensure_path(value, &["Routing", "DelegatedRouters"]) = json!([]);
    *ensure_path(value, &["Ipns", "DelegatedPublishers"]) = json!([]);
    *ensure_path(value, &["DNS", "Resolvers"]) = json!({});
  }

  // API on loopback, swarm on all interfaces v4+v6. Announce and
  // no-announce lists are daemon-managed and left untouched.
  let api = network.object_api_port;
  *ensure_path(value, &["Addresses", "API"]) =
    json!([format!("/ip4/127.0.0.1/tcp/{api}")]);
  *ensure_path(value, &["Addresses", "Gateway"]) = json!([format!(
    "/ip4/127.0.0.1/tcp/{}",
    orbit_client::entities::node::ports::OBJECT_GATEWAY
  )]);
  let p2p = network.p2p_port;
  *ensure_path(value, &["Addresses", "Swarm"]) = json!([
    format!("/ip4/0.0.0.0/tcp/{p2p}"),
    format!("/ip6/::/tcp/{p2p}"),
    format!("/ip4/0.0.0.0/udp/{p2p}/quic-v1"),
    format!("/ip6/::/udp/{p2p}/quic-v1"),
  ]);

  // Without public discovery the daemon needs one actively
  // maintained connection into the cluster.
  if let Some(hint) = peering
    && !hint.is_empty()
  {
    let peers = ensure_path(value, &["Peering", "Peers"]);
    if !peers.is_array() {
      *peers = json!([]);
    }
    if let Some(list) = peers.as_array_mut()
      && !list.iter().any(|p| p["ID"] == json!(hint.id))
    {
      list.push(json!({ "ID": hint.id, "Addrs": hint.addrs }));
    }
  }
}

// =================
//  Pin coordinator
// =================

async fn init_pin_coordinator(
  config: &InstallConfig,
  network: &NetworkConfig,
  cluster_secret: &str,
  received_addrs: Vec<String>,
) -> Result<(), InstallError> {
  let dir = config.paths.pin_coordinator_dir();
  let dir_env = dir.display().to_string();
  let service_json = dir.join("service.json");

  if !service_json.exists() {
    // CLUSTER_SECRET makes init write our secret directly.
    let output = run_command_with_env(
      "ipfs-cluster-service init --force",
      &[
        ("IPFS_CLUSTER_PATH", &dir_env),
        ("CLUSTER_SECRET", cluster_secret),
      ],
      None,
    )
    .await;
    if !output.success() {
      return Err(InstallError::config(anyhow!(
        "ipfs-cluster-service init failed | {}",
        output.combined()
      )));
    }
  }

  backup_once(config, &service_json, "service.json");

  patch_service_file(
    &service_json,
    network,
    cluster_secret,
    &received_addrs,
  )
  .map_err(InstallError::config)?;

  // Read back and assert: the secret on disk must equal ours, or the
  // coordinator would silently form its own one-node cluster.
  let reread = std::fs::read_to_string(&service_json)
    .with_context(|| format!("Failed to re-read {service_json:?}"))
    .map_err(InstallError::config)?;
  let reread: Value = serde_json::from_str(&reread)
    .with_context(|| format!("Failed to re-parse {service_json:?}"))
    .map_err(InstallError::config)?;
  if reread["cluster"]["secret"] != json!(cluster_secret) {
    return Err(InstallError::config(anyhow!(
      "cluster secret in {service_json:?} does not match the secrets file after writing"
    )));
  }

  chown_to_service_user(&dir).await;
  Ok(())
}

fn patch_service_file(
  service_json: &Path,
  network: &NetworkConfig,
  cluster_secret: &str,
  received_addrs: &[String],
) -> anyhow::Result<()> {
  let contents = std::fs::read_to_string(service_json)
    .with_context(|| format!("Failed to read {service_json:?}"))?;
  let mut value: Value = serde_json::from_str(&contents)
    .with_context(|| format!("Failed to parse {service_json:?}"))?;
  patch_service_json(
    &mut value,
    cluster_secret,
    received_addrs,
    network.object_api_port,
  );
  std::fs::write(
    service_json,
    serde_json::to_string_pretty(&value)
      .context("Failed to serialize service.json")?,
  )
  .with_context(|| format!("Failed to write {service_json:?}"))?;
  Ok(())
}

/// Mutate the parsed service.json in place, preserving unknown keys.
fn patch_service_json(
  value: &mut Value,
  cluster_secret: &str,
  received_addrs: &[String],
  object_api_port: u16,
) {
  *ensure_path(value, &["cluster", "secret"]) = json!(cluster_secret);
  *ensure_path(value, &["cluster", "listen_multiaddress"]) =
    json!(["/ip4/0.0.0.0/tcp/9100"]);

  // Merge semantics: preserve existing entries, append new ones,
  // dedupe by exact string match.
  let peer_addresses =
    ensure_path(value, &["cluster", "peer_addresses"]);
  if !peer_addresses.is_array() {
    *peer_addresses = json!([]);
  }
  if let Some(list) = peer_addresses.as_array_mut() {
    for addr in received_addrs {
      if !list.iter().any(|existing| existing == &json!(addr)) {
        list.push(json!(addr));
      }
    }
  }

  let node_multiaddress =
    format!("/ip4/127.0.0.1/tcp/{object_api_port}");
  *ensure_path(value, &["api", "ipfsproxy", "node_multiaddress"]) =
    json!(node_multiaddress);
  *ensure_path(
    value,
    &["ipfs_connector", "ipfshttp", "node_multiaddress"],
  ) = json!(node_multiaddress);
}

// ===========
//  SQL store
// ===========

/// The engine creates its own state on first start; the orchestrator
/// only guarantees the directory exists and is owned correctly.
async fn init_sql_store(
  config: &InstallConfig,
) -> anyhow::Result<()> {
  let dir = config.paths.sql_store_dir();
  std::fs::create_dir_all(&dir)
    .with_context(|| format!("Failed to create {dir:?}"))?;
  chown_to_service_user(&dir).await;
  Ok(())
}

/// Snapshot a daemon config into backups/ before the first mutation,
/// so a pre-existing installation can be restored by hand.
fn backup_once(
  config: &InstallConfig,
  source: &std::path::Path,
  name: &str,
) {
  let dest = config.paths.backups().join(name);
  if dest.exists() || !source.exists() {
    return;
  }
  if let Some(parent) = dest.parent() {
    let _ = std::fs::create_dir_all(parent);
  }
  if let Err(e) = std::fs::copy(source, &dest) {
    warn!("failed to back up {source:?} | {e:#}");
  }
}

/// Descend into nested objects, creating them as needed.
fn ensure_path<'a>(
  mut value: &'a mut Value,
  keys: &[&str],
) -> &'a mut Value {
  for key in keys {
    if !matches!(value, Value::Object(_)) {
      *value = Value::Object(serde_json::Map::new());
    }
    match value {
      Value::Object(map) => {
        value = map.entry(key.to_string()).or_insert(Value::Null);
      }
      _ => unreachable!("just replaced with an object"),
    }
  }
  value
}

#[cfg(test)]
mod tests {
  use orbit_client::entities::node::ports;

  use super::*;

  fn network() -> NetworkConfig {
    NetworkConfig {
      node_id: "12D3KooWExample".to_string(),
      p2p_port: ports::P2P,
      overlay_ip: "10.0.0.2".to_string(),
      sql_http_port: ports::SQL_HTTP,
      sql_raft_port: ports::SQL_RAFT,
      sql_join_target: String::new(),
      peer_multiaddrs: vec![],
      cluster_api_port: ports::CLUSTER_API,
      object_api_port: ports::OBJECT_API,
      gateway_port: ports::GATEWAY,
      base_domain: "example.net".to_string(),
      https_enabled: true,
      tls_cache_dir: "/tmp/tls".to_string(),
    }
  }

  fn kubo_config() -> Value {
    json!({
      "Identity": { "PeerID": "12D3KooWSelf" },
      "Bootstrap": "auto",
      "Routing": { "DelegatedRouters": "auto", "Type": "dht" },
      "Ipns": { "DelegatedPublishers": "auto" },
      "DNS": { "Resolvers": "auto" },
      "Addresses": {
        "API": ["/ip4/127.0.0.1/tcp/9999"],
        "Gateway": ["/ip4/127.0.0.1/tcp/9998"],
        "Swarm": ["/ip4/0.0.0.0/tcp/9997"],
        "Announce": ["/ip4/198.51.100.7/tcp/4001"],
        "NoAnnounce": []
      },
      "Datastore": { "StorageMax": "10GB" }
    })
  }

  #[test]
  fn private_network_clears_auto_placeholders() {
    let mut value = kubo_config();
    patch_object_store_config(&mut value, &network(), true, None);
    assert_eq!(value["Bootstrap"], json!([]));
    assert_eq!(value["Routing"]["DelegatedRouters"], json!([]));
    assert_eq!(value["Ipns"]["DelegatedPublishers"], json!([]));
    assert_eq!(value["DNS"]["Resolvers"], json!({}));
  }

  #[test]
  fn public_placeholders_survive_without_private_network() {
    let mut value = kubo_config();
    patch_object_store_config(&mut value, &network(), false, None);
    assert_eq!(value["Bootstrap"], json!("auto"));
  }

  #[test]
  fn addresses_rewritten_announce_preserved() {
    let mut value = kubo_config();
    patch_object_store_config(&mut value, &network(), true, None);
    assert_eq!(
      value["Addresses"]["API"],
      json!(["/ip4/127.0.0.1/tcp/5001"])
    );
    let swarm = value["Addresses"]["Swarm"].as_array().unwrap();
    assert!(swarm.contains(&json!("/ip4/0.0.0.0/tcp/4001")));
    assert!(swarm.contains(&json!("/ip6/::/tcp/4001")));
    // daemon-managed lists untouched
    assert_eq!(
      value["Addresses"]["Announce"],
      json!(["/ip4/198.51.100.7/tcp/4001"])
    );
    // unknown keys untouched
    assert_eq!(value["Datastore"]["StorageMax"], json!("10GB"));
    assert_eq!(value["Routing"]["Type"], json!("dht"));
  }

  #[test]
  fn peering_hint_added_once() {
    let hint = PeerHint {
      id: "12D3KooWGenesis".to_string(),
      addrs: vec!["/ip4/10.0.0.1/tcp/4001".to_string()],
    };
    let mut value = kubo_config();
    patch_object_store_config(
      &mut value,
      &network(),
      true,
      Some(&hint),
    );
    patch_object_store_config(
      &mut value,
      &network(),
      true,
      Some(&hint),
    );
    let peers = value["Peering"]["Peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["ID"], json!("12D3KooWGenesis"));
  }

  #[test]
  fn empty_peering_hint_is_ignored() {
    let mut value = kubo_config();
    patch_object_store_config(
      &mut value,
      &network(),
      true,
      Some(&PeerHint::default()),
    );
    assert!(value.get("Peering").is_none());
  }

  fn service_json() -> Value {
    json!({
      "cluster": {
        "peername": "node",
        "secret": "0000",
        "listen_multiaddress": ["/ip4/127.0.0.1/tcp/9096"],
        "peer_addresses": ["/ip4/10.0.0.9/tcp/9100/p2p/QmOld"]
      },
      "api": { "ipfsproxy": { "node_multiaddress": "/ip4/127.0.0.1/tcp/5001", "listen_multiaddress": "/ip4/127.0.0.1/tcp/9095" } },
      "ipfs_connector": { "ipfshttp": { "node_multiaddress": "/ip4/127.0.0.1/tcp/5001" } },
      "consensus": { "crdt": { "cluster_name": "ipfs-cluster" } }
    })
  }

  #[test]
  fn service_secret_and_listen_rewritten() {
    let secret = "ab".repeat(32);
    let mut value = service_json();
    patch_service_json(&mut value, &secret, &[], 5001);
    assert_eq!(value["cluster"]["secret"], json!(secret));
    assert_eq!(
      value["cluster"]["listen_multiaddress"],
      json!(["/ip4/0.0.0.0/tcp/9100"])
    );
    // unknown keys preserved
    assert_eq!(
      value["consensus"]["crdt"]["cluster_name"],
      json!("ipfs-cluster")
    );
    assert_eq!(
      value["api"]["ipfsproxy"]["listen_multiaddress"],
      json!("/ip4/127.0.0.1/tcp/9095")
    );
  }

  #[test]
  fn peer_addresses_merge_preserves_appends_dedupes() {
    let secret = "ab".repeat(32);
    let mut value = service_json();
    let received = vec![
      "/ip4/10.0.0.9/tcp/9100/p2p/QmOld".to_string(),
      "/ip4/10.0.0.1/tcp/9100/p2p/QmGenesis".to_string(),
    ];
    patch_service_json(&mut value, &secret, &received, 5001);
    let addrs = value["cluster"]["peer_addresses"].as_array().unwrap();
    assert_eq!(addrs.len(), 2);
    assert_eq!(addrs[0], json!("/ip4/10.0.0.9/tcp/9100/p2p/QmOld"));
    assert_eq!(
      addrs[1],
      json!("/ip4/10.0.0.1/tcp/9100/p2p/QmGenesis")
    );
  }

  #[test]
  fn node_multiaddresses_point_at_loopback_api() {
    let secret = "ab".repeat(32);
    let mut value = service_json();
    patch_service_json(&mut value, &secret, &[], 5001);
    let expected = json!("/ip4/127.0.0.1/tcp/5001");
    assert_eq!(
      value["api"]["ipfsproxy"]["node_multiaddress"],
      expected
    );
    assert_eq!(
      value["ipfs_connector"]["ipfshttp"]["node_multiaddress"],
      expected
    );
  }

  #[test]
  fn patched_file_reads_back_with_our_secret() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("service.json");
    // simulate a coordinator whose on-disk secret has drifted
    std::fs::write(
      &path,
      serde_json::to_string_pretty(&service_json()).unwrap(),
    )
    .unwrap();

    let secret = "cd".repeat(32);
    patch_service_file(&path, &network(), &secret, &[]).unwrap();

    let reread: Value = serde_json::from_str(
      &std::fs::read_to_string(&path).unwrap(),
    )
    .unwrap();
    assert_eq!(reread["cluster"]["secret"], json!(secret));
  }

  #[test]
  fn patching_twice_is_idempotent() {
    let secret = "ab".repeat(32);
    let received =
      vec!["/ip4/10.0.0.1/tcp/9100/p2p/QmGenesis".to_string()];
    let mut once = service_json();
    patch_service_json(&mut once, &secret, &received, 5001);
    let mut twice = once.clone();
    patch_service_json(&mut twice, &secret, &received, 5001);
    assert_eq!(once, twice);
  }
}
