use std::net::Ipv4Addr;

use anyhow::{Context, anyhow};

use crate::MeshConfig;

/// Host number of the genesis host within the overlay `/24`.
pub const GENESIS_HOST: u8 = 1;

/// The overlay address the first host of a cluster self-assigns.
pub fn genesis_address(subnet: Ipv4Addr) -> Ipv4Addr {
  let [a, b, c, _] = subnet.octets();
  Ipv4Addr::new(a, b, c, GENESIS_HOST)
}

/// Allocate the smallest unused host address within the `/24`.
///
/// `.1` (the genesis host), the serving host's own interface address
/// and every already-listed peer are taken. The caller must hold the
/// allocation mutex and commit the returned address to the mesh config
/// before releasing it.
pub fn next_available_ip(
  config: &MeshConfig,
) -> anyhow::Result<Ipv4Addr> {
  let own: Ipv4Addr = config
    .overlay_ip()
    .parse()
    .with_context(|| {
      format!("interface address {} is not ipv4", config.interface.address)
    })?;
  let [a, b, c, _] = own.octets();

  let mut taken = vec![GENESIS_HOST, own.octets()[3]];
  for peer in &config.peers {
    let ip: Ipv4Addr = peer.allowed_ip.parse().with_context(|| {
      format!("peer allowed address {} is not ipv4", peer.allowed_ip)
    })?;
    let octets = ip.octets();
    if octets[..3] != [a, b, c] {
      return Err(anyhow!(
        "peer {} lies outside the overlay /24",
        peer.allowed_ip
      ));
    }
    taken.push(octets[3]);
  }

  // .0 network, .255 broadcast
  (2..=254u8)
    .find(|n| !taken.contains(n))
    .map(|n| Ipv4Addr::new(a, b, c, n))
    .context("overlay /24 is exhausted")
}

#[cfg(test)]
mod tests {
  use orbit_client::entities::mesh::MeshPeer;

  use super::*;
  use crate::MeshInterface;

  fn genesis_config(peers: Vec<MeshPeer>) -> MeshConfig {
    MeshConfig {
      interface: MeshInterface {
        private_key: "cHJpdmF0ZQ==".to_string(),
        address: "10.0.0.1/24".to_string(),
        listen_port: 51820,
      },
      peers,
    }
  }

  fn peer(n: u8) -> MeshPeer {
    MeshPeer {
      public_key: format!("cGVlcg=={n}"),
      endpoint: String::new(),
      allowed_ip: format!("10.0.0.{n}"),
    }
  }

  #[test]
  fn first_join_gets_dot_two() {
    let ip = next_available_ip(&genesis_config(vec![])).unwrap();
    assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
  }

  #[test]
  fn allocations_are_disjoint_and_fill_gaps() {
    let config = genesis_config(vec![peer(2), peer(4)]);
    let ip = next_available_ip(&config).unwrap();
    assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 3));
  }

  #[test]
  fn genesis_address_is_never_allocated() {
    let config = genesis_config(vec![]);
    for _ in 0..5 {
      let ip = next_available_ip(&config).unwrap();
      assert_ne!(ip.octets()[3], GENESIS_HOST);
    }
  }

  #[test]
  fn exhausted_subnet_errors() {
    let config = genesis_config((2..=254).map(peer).collect());
    assert!(next_available_ip(&config).is_err());
  }

  #[test]
  fn foreign_subnet_peer_errors() {
    let mut config = genesis_config(vec![]);
    config.peers.push(MeshPeer {
      public_key: "Zm9yZWlnbg==".to_string(),
      endpoint: String::new(),
      allowed_ip: "192.168.9.7".to_string(),
    });
    assert!(next_available_ip(&config).is_err());
  }
}
