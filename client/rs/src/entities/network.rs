use serde::{Deserialize, Serialize};

use super::node::ports;

/// The aggregate tuple every daemon config file and service unit is
/// derived from. Built once per install run by the config synthesizer
/// from discovered peers, local addresses and secrets.
///
/// Advertised inter-node addresses always prefer `overlay_ip`; the
/// public IP appears only in the mesh endpoint itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
  /// This node's stable peer identifier (base58).
  pub node_id: String,
  /// Object store swarm port.
  pub p2p_port: u16,
  /// This node's overlay address, without prefix.
  pub overlay_ip: String,
  /// SQL store HTTP API port.
  pub sql_http_port: u16,
  /// SQL store raft port.
  pub sql_raft_port: u16,
  /// `host:port` of the raft bind to join, empty on the genesis host.
  pub sql_join_target: String,
  /// Bootstrap multiaddrs for the p2p layer.
  pub peer_multiaddrs: Vec<String>,
  /// Pin coordinator REST API port.
  pub cluster_api_port: u16,
  /// Object store API port (loopback).
  pub object_api_port: u16,
  /// Gateway port.
  pub gateway_port: u16,
  /// Wildcard domain user deployments get subdomains under.
  pub base_domain: String,
  /// Whether the gateway terminates HTTPS itself.
  pub https_enabled: bool,
  /// Directory for ACME artifacts.
  pub tls_cache_dir: String,
}

impl NetworkConfig {
  /// The SQL store advertise addresses, on the overlay.
  pub fn sql_http_adv(&self) -> String {
    format!("{}:{}", self.overlay_ip, self.sql_http_port)
  }

  pub fn sql_raft_adv(&self) -> String {
    format!("{}:{}", self.overlay_ip, self.sql_raft_port)
  }

  /// The pin coordinator listen multiaddress, bound to the overlay.
  pub fn cluster_listen_multiaddr(&self) -> String {
    format!("/ip4/{}/tcp/{}", self.overlay_ip, ports::CLUSTER)
  }
}

/// Rendered to `configs/network.json` by the installer.
///
/// The node daemon reads it back to answer join and status requests;
/// everything else it needs (mesh peers, daemon identities, secrets)
/// is read live from the mesh config and the daemon state dirs at
/// request time, so the snapshot a joining host receives is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkManifest {
  pub network: NetworkConfig,
  /// This host's public IP, announced only as the mesh endpoint.
  pub public_ip: String,
  /// UDP port of the mesh.
  pub mesh_port: u16,
  /// This host's own fully qualified name, when the operator gave
  /// one. Used as the gateway certificate subject.
  #[serde(default)]
  pub host_domain: Option<String>,
}

/// File name of the manifest under the configs dir.
pub const NETWORK_MANIFEST_FILE: &str = "network.json";
