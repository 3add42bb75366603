use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default ports of the node daemons.
///
/// Preflight verifies each of these is claimable before install, and
/// the config synthesizer bakes them into every rendered file.
pub mod ports {
  /// UDP listen port of the overlay mesh.
  pub const MESH: u16 = 51820;
  /// Object store swarm (p2p) port, all interfaces.
  pub const P2P: u16 = 4001;
  /// Object store API, loopback only.
  pub const OBJECT_API: u16 = 5001;
  /// Object store HTTP gateway, loopback only.
  pub const OBJECT_GATEWAY: u16 = 8081;
  /// Pin coordinator REST API.
  pub const CLUSTER_API: u16 = 9094;
  /// Pin coordinator cluster listen port, bound on the overlay.
  pub const CLUSTER: u16 = 9100;
  /// SQL store HTTP API.
  pub const SQL_HTTP: u16 = 4801;
  /// SQL store raft transport.
  pub const SQL_RAFT: u16 = 4802;
  /// The node daemon / gateway.
  pub const GATEWAY: u16 = 6001;
  /// The distributed cache.
  pub const CACHE: u16 = 3320;
}

/// Every port preflight must be able to claim.
pub const REQUIRED_PORTS: [u16; 9] = [
  ports::P2P,
  ports::OBJECT_API,
  ports::OBJECT_GATEWAY,
  ports::CLUSTER_API,
  ports::CLUSTER,
  ports::SQL_HTTP,
  ports::SQL_RAFT,
  ports::GATEWAY,
  ports::CACHE,
];

/// The on-disk layout under the node base directory.
///
/// ```text
/// configs/        rendered daemon configs, mode 0644
/// secrets/        cluster-secret, swarm.key   0700 dir / 0600 files
/// data/           identity.key, ipfs/repo/, ipfs-cluster/, rqlite/
/// logs/           one log file per daemon
/// tls-cache/      ACME artifacts
/// backups/        migration snapshots of pre-existing daemons
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePaths {
  pub base: PathBuf,
}

impl NodePaths {
  pub fn new(base: impl Into<PathBuf>) -> NodePaths {
    NodePaths { base: base.into() }
  }

  /// Layout rooted at the service user's home.
  pub fn for_service_user() -> NodePaths {
    NodePaths::new(
      PathBuf::from(format!("/home/{}", super::SERVICE_USER))
        .join(super::BASE_DIR_NAME),
    )
  }

  pub fn configs(&self) -> PathBuf {
    self.base.join("configs")
  }

  pub fn secrets(&self) -> PathBuf {
    self.base.join("secrets")
  }

  pub fn data(&self) -> PathBuf {
    self.base.join("data")
  }

  pub fn logs(&self) -> PathBuf {
    self.base.join("logs")
  }

  pub fn tls_cache(&self) -> PathBuf {
    self.base.join("tls-cache")
  }

  pub fn backups(&self) -> PathBuf {
    self.base.join("backups")
  }

  pub fn bin(&self) -> PathBuf {
    self.base.join("bin")
  }

  pub fn cluster_secret_file(&self) -> PathBuf {
    self.secrets().join("cluster-secret")
  }

  pub fn swarm_key_file(&self) -> PathBuf {
    self.secrets().join("swarm.key")
  }

  /// The persisted overlay private key.
  pub fn mesh_key_file(&self) -> PathBuf {
    self.secrets().join("mesh.key")
  }

  pub fn identity_key_file(&self) -> PathBuf {
    self.data().join("identity.key")
  }

  pub fn object_store_repo(&self) -> PathBuf {
    self.data().join("ipfs").join("repo")
  }

  pub fn pin_coordinator_dir(&self) -> PathBuf {
    self.data().join("ipfs-cluster")
  }

  pub fn sql_store_dir(&self) -> PathBuf {
    self.data().join("rqlite")
  }

  /// Directories created by the provisioner, parents first.
  pub fn all_dirs(&self) -> Vec<PathBuf> {
    vec![
      self.base.clone(),
      self.configs(),
      self.secrets(),
      self.data(),
      self.logs(),
      self.tls_cache(),
      self.backups(),
      self.bin(),
      self.data().join("ipfs"),
      self.object_store_repo(),
      self.pin_coordinator_dir(),
      self.sql_store_dir(),
    ]
  }

  pub fn log_file(&self, daemon: &str) -> PathBuf {
    self.logs().join(format!("{daemon}.log"))
  }

  pub fn config_file(&self, name: &str) -> PathBuf {
    self.configs().join(name)
  }
}

/// Well known system paths the orchestrator touches outside the base dir.
pub fn mesh_config_path() -> &'static Path {
  Path::new("/etc/wireguard/wg0.conf")
}

pub fn system_bin_dir() -> &'static Path {
  Path::new("/usr/local/bin")
}
