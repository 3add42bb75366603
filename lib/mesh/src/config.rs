use std::collections::HashSet;

use anyhow::{Context, anyhow};
use orbit_client::entities::mesh::MeshPeer;

use crate::PERSISTENT_KEEPALIVE;

/// The `[Interface]` section of the mesh config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshInterface {
  /// Base64 X25519 private key.
  pub private_key: String,
  /// This host's overlay address in CIDR form, eg `10.0.0.1/24`.
  pub address: String,
  /// UDP listen port.
  pub listen_port: u16,
}

/// In-memory form of `wg0.conf`: one interface, zero or more peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
  pub interface: MeshInterface,
  pub peers: Vec<MeshPeer>,
}

impl MeshConfig {
  /// Every peer must carry a distinct public key and a distinct
  /// allowed address. Duplicates indicate a coordination bug.
  pub fn validate(&self) -> anyhow::Result<()> {
    let mut keys = HashSet::new();
    let mut ips = HashSet::new();
    for peer in &self.peers {
      if !keys.insert(peer.public_key.as_str()) {
        return Err(anyhow!(
          "duplicate mesh peer public key: {}",
          peer.public_key
        ));
      }
      if !ips.insert(peer.allowed_ip.as_str()) {
        return Err(anyhow!(
          "duplicate mesh peer allowed address: {}",
          peer.allowed_ip
        ));
      }
    }
    Ok(())
  }

  /// Append a peer, enforcing the uniqueness invariant.
  pub fn push_peer(&mut self, peer: MeshPeer) -> anyhow::Result<()> {
    self.peers.push(peer);
    self.validate()
  }

  /// Render the wg-quick config file.
  pub fn render(&self) -> String {
    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", self.interface.private_key));
    out.push_str(&format!("Address = {}\n", self.interface.address));
    out.push_str(&format!("ListenPort = {}\n", self.interface.listen_port));
    for peer in &self.peers {
      out.push('\n');
      out.push_str("[Peer]\n");
      out.push_str(&format!("PublicKey = {}\n", peer.public_key));
      if !peer.endpoint.is_empty() {
        out.push_str(&format!("Endpoint = {}\n", peer.endpoint));
      }
      out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ip_cidr()));
      out.push_str(&format!(
        "PersistentKeepalive = {PERSISTENT_KEEPALIVE}\n"
      ));
    }
    out
  }

  /// Parse a wg-quick config file back into the model.
  pub fn parse(contents: &str) -> anyhow::Result<MeshConfig> {
    let mut private_key = None;
    let mut address = None;
    let mut listen_port = None;
    let mut peers: Vec<MeshPeer> = Vec::new();
    let mut section = Section::None;

    for (idx, line) in contents.lines().enumerate() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      match line {
        "[Interface]" => {
          section = Section::Interface;
          continue;
        }
        "[Peer]" => {
          section = Section::Peer;
          peers.push(MeshPeer {
            public_key: String::new(),
            endpoint: String::new(),
            allowed_ip: String::new(),
          });
          continue;
        }
        _ => {}
      }
      let (key, value) = line
        .split_once('=')
        .with_context(|| format!("line {}: expected 'Key = Value'", idx + 1))?;
      let (key, value) = (key.trim(), value.trim());
      match section {
        Section::Interface => match key {
          "PrivateKey" => private_key = Some(value.to_string()),
          "Address" => address = Some(value.to_string()),
          "ListenPort" => {
            listen_port = Some(value.parse().with_context(|| {
              format!("line {}: invalid ListenPort", idx + 1)
            })?)
          }
          _ => {}
        },
        Section::Peer => {
          let peer = peers
            .last_mut()
            .context("peer key before any [Peer] section")?;
          match key {
            "PublicKey" => peer.public_key = value.to_string(),
            "Endpoint" => peer.endpoint = value.to_string(),
            "AllowedIPs" => {
              peer.allowed_ip = value
                .strip_suffix("/32")
                .unwrap_or(value)
                .to_string()
            }
            _ => {}
          }
        }
        Section::None => {
          return Err(anyhow!(
            "line {}: key outside of any section",
            idx + 1
          ));
        }
      }
    }

    let config = MeshConfig {
      interface: MeshInterface {
        private_key: private_key
          .context("mesh config has no PrivateKey")?,
        address: address.context("mesh config has no Address")?,
        listen_port: listen_port
          .context("mesh config has no ListenPort")?,
      },
      peers,
    };
    config.validate()?;
    Ok(config)
  }

  /// The interface address without its prefix length.
  pub fn overlay_ip(&self) -> &str {
    self
      .interface
      .address
      .split_once('/')
      .map(|(ip, _)| ip)
      .unwrap_or(&self.interface.address)
  }
}

enum Section {
  None,
  Interface,
  Peer,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> MeshConfig {
    MeshConfig {
      interface: MeshInterface {
        private_key: "cHJpdmF0ZQ==".to_string(),
        address: "10.0.0.2/24".to_string(),
        listen_port: 51820,
      },
      peers: vec![
        MeshPeer {
          public_key: "cGVlcjE=".to_string(),
          endpoint: "203.0.113.1:51820".to_string(),
          allowed_ip: "10.0.0.1".to_string(),
        },
        MeshPeer {
          public_key: "cGVlcjM=".to_string(),
          endpoint: String::new(),
          allowed_ip: "10.0.0.3".to_string(),
        },
      ],
    }
  }

  #[test]
  fn render_parse_round_trip() {
    let config = sample();
    let rendered = config.render();
    assert_eq!(rendered.matches("[Interface]").count(), 1);
    assert_eq!(
      rendered.matches("[Peer]").count(),
      config.peers.len()
    );
    let parsed = MeshConfig::parse(&rendered).unwrap();
    assert_eq!(parsed, config);
  }

  #[test]
  fn passive_peer_has_no_endpoint_line() {
    let rendered = sample().render();
    assert_eq!(rendered.matches("Endpoint = ").count(), 1);
    assert_eq!(rendered.matches("PersistentKeepalive = 25").count(), 2);
  }

  #[test]
  fn duplicate_allowed_ip_fails_validation() {
    let mut config = sample();
    let duplicate = MeshPeer {
      public_key: "b3RoZXI=".to_string(),
      endpoint: String::new(),
      allowed_ip: "10.0.0.1".to_string(),
    };
    assert!(config.push_peer(duplicate).is_err());
  }

  #[test]
  fn duplicate_public_key_fails_validation() {
    let mut config = sample();
    let duplicate = MeshPeer {
      public_key: "cGVlcjE=".to_string(),
      endpoint: String::new(),
      allowed_ip: "10.0.0.9".to_string(),
    };
    assert!(config.push_peer(duplicate).is_err());
  }

  #[test]
  fn overlay_ip_strips_prefix() {
    assert_eq!(sample().overlay_ip(), "10.0.0.2");
  }
}
