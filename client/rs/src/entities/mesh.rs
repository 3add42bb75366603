use serde::{Deserialize, Serialize};

/// One peer of the encrypted overlay mesh.
///
/// Within any peer list, both `public_key` and `allowed_ip` must be
/// unique. A duplicate `allowed_ip` indicates a coordination bug and
/// must fail whatever operation observed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPeer {
  /// Base64 X25519 public key.
  pub public_key: String,
  /// `host:port` the peer is reachable at over the public network.
  /// Empty for passive peers which only receive connections.
  #[serde(default)]
  pub endpoint: String,
  /// The peer's single overlay address, without the `/32` suffix.
  pub allowed_ip: String,
}

impl MeshPeer {
  /// The `AllowedIPs` value announced for this peer.
  pub fn allowed_ip_cidr(&self) -> String {
    format!("{}/32", self.allowed_ip)
  }
}
