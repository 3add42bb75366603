//! Wire types for the node network surface.
//!
//! All string fields are UTF-8 without embedded control characters,
//! IP addresses are dotted-quad, and peer identifiers use the
//! daemon-native base58 encoding.

use serde::{Deserialize, Serialize};

use crate::entities::mesh::MeshPeer;

/// Body of `POST /v1/internal/join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
  /// Single-use invite token, validated by the serving node.
  pub token: String,
  /// The joining host's mesh public key, base64 X25519.
  pub wg_public_key: String,
  /// The joining host's public IP, used as its mesh endpoint.
  pub public_ip: String,
}

/// A daemon peer hint: identifier plus the addresses it listens on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerHint {
  pub id: String,
  pub addrs: Vec<String>,
}

impl PeerHint {
  pub fn is_empty(&self) -> bool {
    self.id.is_empty()
  }
}

/// Body of the join response: a consistent snapshot of the serving
/// node's cluster state as of the moment the response was serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
  /// The overlay address allocated to the joining host.
  pub wg_ip: String,
  /// Every mesh peer known to the serving node, itself included.
  pub wg_peers: Vec<MeshPeer>,
  /// Multiaddrs to bootstrap the p2p layer from.
  #[serde(default)]
  pub bootstrap_peers: Vec<String>,
  /// The serving node's object store daemon.
  #[serde(default)]
  pub ipfs_peer: PeerHint,
  /// The serving node's pin coordinator daemon.
  #[serde(default)]
  pub ipfs_cluster_peer: PeerHint,
  /// The serving node's raft bind, joined by the new host's SQL store.
  #[serde(default)]
  pub rqlite_join_address: String,
  /// The cluster's wildcard base domain.
  pub base_domain: String,
  /// 64 lowercase hex chars.
  pub cluster_secret: String,
  /// The full three-line swarm key file.
  pub swarm_key: String,
}

/// Body of `GET /v1/network/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatusResponse {
  /// This node's own peer identifier.
  pub peer_id: String,
  pub ipfs: ObjectStoreStatus,
  pub ipfs_cluster: PinCoordinatorStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectStoreStatus {
  pub peer_id: String,
  #[serde(default)]
  pub swarm_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinCoordinatorStatus {
  pub peer_id: String,
  #[serde(default)]
  pub addresses: Vec<String>,
}
