//! The node secret store.
//!
//! Three long-lived secrets live under the node base directory:
//! - the cluster secret (`secrets/cluster-secret`), 32 random bytes
//!   hex-lowercased, shared by every member of the pin coordinator's
//!   private cluster;
//! - the swarm key (`secrets/swarm.key`), the pre-shared key that gates
//!   membership of the object store's private swarm;
//! - the node identity (`data/identity.key`), an Ed25519 keypair whose
//!   public half yields the node's stable base58 peer identifier.
//!
//! Each is generated at most once per host. A populated secrets
//! directory means the host has joined a cluster, and from that point
//! the cluster secret and swarm key are read-only: the only code path
//! that writes them afterwards is [SecretStore::persist_from_join],
//! which runs strictly before the ensure calls on the join path.

use std::{
  io::Write,
  os::unix::fs::{OpenOptionsExt, PermissionsExt},
  path::Path,
};

use anyhow::{Context, anyhow};
use libp2p_identity::Keypair;
pub use libp2p_identity::PeerId;
use orbit_client::entities::node::NodePaths;
use rand::RngCore;

/// First line of the canonical swarm key file.
pub const SWARM_KEY_HEADER: &str = "/key/swarm/psk/1.0.0/";
/// Second line: the encoding marker.
pub const SWARM_KEY_BASE_MARKER: &str = "/base16/";

/// Uid/gid of the service user, resolved by the caller.
#[derive(Debug, Clone, Copy)]
pub struct Owner {
  pub uid: u32,
  pub gid: u32,
}

pub struct SecretStore {
  paths: NodePaths,
  /// When set, written files are chowned to the service user.
  /// Unset in tests and dry runs.
  owner: Option<Owner>,
}

impl SecretStore {
  pub fn new(paths: NodePaths, owner: Option<Owner>) -> SecretStore {
    SecretStore { paths, owner }
  }

  pub fn paths(&self) -> &NodePaths {
    &self.paths
  }

  /// Load the cluster secret, generating it if absent or malformed.
  ///
  /// A valid secret on disk is returned verbatim and never rewritten.
  pub fn ensure_cluster_secret(&self) -> anyhow::Result<String> {
    let path = self.paths.cluster_secret_file();
    if let Ok(contents) = std::fs::read_to_string(&path) {
      let trimmed = contents.trim();
      if is_valid_cluster_secret(trimmed) {
        return Ok(trimmed.to_string());
      }
      tracing::warn!(
        "cluster secret at {path:?} is malformed, generating a fresh one"
      );
    }
    let secret = hex::encode(random_bytes());
    self.write_secret_file(&path, &secret)?;
    Ok(secret)
  }

  /// Load the swarm key, normalizing duplicate header blocks left by a
  /// previous faulty write, or generate the canonical three-line file.
  ///
  /// Returns the full file contents. A key that carries the header but
  /// a malformed hex body is never auto-repaired; the operator gets the
  /// path to inspect.
  pub fn ensure_swarm_key(&self) -> anyhow::Result<String> {
    let path = self.paths.swarm_key_file();
    if let Ok(contents) = std::fs::read_to_string(&path)
      && contents.contains(SWARM_KEY_HEADER)
    {
      let normalized = normalize_swarm_key(&contents).ok_or_else(|| {
        anyhow!(
          "swarm key at {path:?} carries the psk header but no valid hex body. Inspect or remove the file before rerunning."
        )
      })?;
      if normalized != contents {
        self.write_secret_file(&path, &normalized)?;
      }
      return Ok(normalized);
    }
    let swarm_key = render_swarm_key(&hex::encode_upper(random_bytes()));
    self.write_secret_file(&path, &swarm_key)?;
    Ok(swarm_key)
  }

  /// Load the node identity, generating an Ed25519 keypair on first run.
  /// An existing identity file is never overwritten.
  pub fn ensure_node_identity(&self) -> anyhow::Result<PeerId> {
    Ok(self.ensure_node_keypair()?.public().to_peer_id())
  }

  /// Identity for callers that need to announce or sign,
  /// not just the derived identifier.
  pub fn ensure_node_keypair(&self) -> anyhow::Result<Keypair> {
    let path = self.paths.identity_key_file();
    if path.exists() {
      let bytes = std::fs::read(&path)
        .with_context(|| format!("Failed to read identity key at {path:?}"))?;
      return Keypair::from_protobuf_encoding(&bytes)
        .with_context(|| format!("Identity key at {path:?} is not valid. Inspect or remove the file before rerunning."));
    }
    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
      .to_protobuf_encoding()
      .context("Failed to marshal identity key")?;
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {parent:?}"))?;
    }
    let mut file = std::fs::OpenOptions::new()
      .write(true)
      .create_new(true)
      .mode(0o600)
      .open(&path)
      .with_context(|| format!("Failed to create identity key at {path:?}"))?;
    file
      .write_all(&bytes)
      .with_context(|| format!("Failed to write identity key to {path:?}"))?;
    self.chown(&path);
    Ok(keypair)
  }

  /// Write the secrets delivered by a join handshake.
  ///
  /// Runs strictly before the ensure calls, so those observe the
  /// just-persisted files and return them unchanged.
  pub fn persist_from_join(
    &self,
    cluster_secret: &str,
    swarm_key: &str,
  ) -> anyhow::Result<()> {
    let cluster_secret = cluster_secret.trim();
    if !is_valid_cluster_secret(cluster_secret) {
      return Err(anyhow!(
        "received cluster secret is not 64 hex chars"
      ));
    }
    let swarm_key = normalize_swarm_key(swarm_key)
      .ok_or_else(|| anyhow!("received swarm key is not a valid psk file"))?;
    self.write_secret_file(
      &self.paths.cluster_secret_file(),
      cluster_secret,
    )?;
    self.write_secret_file(&self.paths.swarm_key_file(), &swarm_key)?;
    Ok(())
  }

  /// Persist an additional secret under the secrets dir with the
  /// same 0700/0600 discipline (eg the overlay private key).
  pub fn write_in_secrets_dir(
    &self,
    name: &str,
    contents: &str,
  ) -> anyhow::Result<()> {
    self.write_secret_file(&self.paths.secrets().join(name), contents)
  }

  /// 0700 secrets dir, 0600 file, owned by the service user.
  fn write_secret_file(
    &self,
    path: &Path,
    contents: &str,
  ) -> anyhow::Result<()> {
    let dir = self.paths.secrets();
    std::fs::create_dir_all(&dir)
      .with_context(|| format!("Failed to create {dir:?}"))?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
      .with_context(|| format!("Failed to set mode 0700 on {dir:?}"))?;
    self.chown(&dir);
    let mut file = std::fs::OpenOptions::new()
      .write(true)
      .create(true)
      .truncate(true)
      .mode(0o600)
      .open(path)
      .with_context(|| format!("Failed to open {path:?} for writing"))?;
    file
      .write_all(contents.as_bytes())
      .with_context(|| format!("Failed to write {path:?}"))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
      .with_context(|| format!("Failed to set mode 0600 on {path:?}"))?;
    self.chown(path);
    Ok(())
  }

  fn chown(&self, path: &Path) {
    let Some(Owner { uid, gid }) = self.owner else {
      return;
    };
    if let Err(e) =
      std::os::unix::fs::chown(path, Some(uid), Some(gid))
    {
      tracing::warn!("failed to chown {path:?} to service user | {e:#}");
    }
  }
}

pub fn is_valid_cluster_secret(secret: &str) -> bool {
  secret.len() == 64 && secret.chars().all(|c| c.is_ascii_hexdigit())
}

/// The canonical three-line swarm key file.
pub fn render_swarm_key(hex_body: &str) -> String {
  format!("{SWARM_KEY_HEADER}\n{SWARM_KEY_BASE_MARKER}\n{hex_body}")
}

/// Canonicalize a swarm key file.
///
/// Duplicate header blocks inserted by a previous faulty write are
/// discarded; the hex body is the last line which is neither the
/// header nor the base16 marker. Returns None when no valid 64-char
/// hex body remains.
pub fn normalize_swarm_key(raw: &str) -> Option<String> {
  let hex_body = raw
    .lines()
    .map(str::trim)
    .filter(|line| {
      !line.is_empty()
        && *line != SWARM_KEY_HEADER
        && *line != SWARM_KEY_BASE_MARKER
    })
    .next_back()?;
  if hex_body.len() != 64
    || !hex_body.chars().all(|c| c.is_ascii_hexdigit())
  {
    return None;
  }
  Some(render_swarm_key(hex_body))
}

fn random_bytes() -> [u8; 32] {
  let mut bytes = [0u8; 32];
  rand::rngs::OsRng.fill_bytes(&mut bytes);
  bytes
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> (tempfile::TempDir, SecretStore) {
    let dir = tempfile::tempdir().unwrap();
    let store =
      SecretStore::new(NodePaths::new(dir.path().join("base")), None);
    (dir, store)
  }

  #[test]
  fn cluster_secret_generates_then_reuses() {
    let (_dir, store) = store();
    let first = store.ensure_cluster_secret().unwrap();
    assert_eq!(first.len(), 64);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(first.chars().all(|c| !c.is_ascii_uppercase()));
    let second = store.ensure_cluster_secret().unwrap();
    assert_eq!(first, second);
  }

  #[test]
  fn truncated_cluster_secret_regenerates() {
    let (_dir, store) = store();
    let first = store.ensure_cluster_secret().unwrap();
    std::fs::write(
      store.paths().cluster_secret_file(),
      &first[..60],
    )
    .unwrap();
    let second = store.ensure_cluster_secret().unwrap();
    assert_ne!(first, second);
    assert_eq!(second.len(), 64);
  }

  #[test]
  fn swarm_key_is_canonical_three_lines() {
    let (_dir, store) = store();
    let key = store.ensure_swarm_key().unwrap();
    let lines = key.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], SWARM_KEY_HEADER);
    assert_eq!(lines[1], SWARM_KEY_BASE_MARKER);
    assert_eq!(lines[2].len(), 64);
    assert!(lines[2].chars().all(|c| !c.is_ascii_lowercase()));
    // unchanged on rerun
    assert_eq!(store.ensure_swarm_key().unwrap(), key);
  }

  #[test]
  fn swarm_key_duplicate_headers_normalize_to_last_body() {
    let (_dir, store) = store();
    let hex_a = "A".repeat(64);
    let hex_b = "B".repeat(64);
    let corrupted = format!(
      "{SWARM_KEY_HEADER}\n{SWARM_KEY_BASE_MARKER}\n{hex_a}\n{SWARM_KEY_HEADER}\n{SWARM_KEY_BASE_MARKER}\n{hex_b}\n"
    );
    std::fs::create_dir_all(store.paths().secrets()).unwrap();
    std::fs::write(store.paths().swarm_key_file(), &corrupted).unwrap();
    let key = store.ensure_swarm_key().unwrap();
    assert_eq!(key, render_swarm_key(&hex_b));
    // and the normalized form was rewritten to disk
    assert_eq!(
      std::fs::read_to_string(store.paths().swarm_key_file()).unwrap(),
      key
    );
  }

  #[test]
  fn swarm_key_truncated_hex_is_an_error() {
    let (_dir, store) = store();
    let corrupted = format!(
      "{SWARM_KEY_HEADER}\n{SWARM_KEY_BASE_MARKER}\n{}",
      "A".repeat(60)
    );
    std::fs::create_dir_all(store.paths().secrets()).unwrap();
    std::fs::write(store.paths().swarm_key_file(), &corrupted).unwrap();
    assert!(store.ensure_swarm_key().is_err());
  }

  #[test]
  fn node_identity_is_stable() {
    let (_dir, store) = store();
    let first = store.ensure_node_identity().unwrap();
    let second = store.ensure_node_identity().unwrap();
    assert_eq!(first, second);
  }

  #[test]
  fn persisted_join_secrets_are_returned_by_ensure() {
    let (_dir, store) = store();
    let cluster_secret = "ab".repeat(32);
    let swarm_key = render_swarm_key(&"C".repeat(64));
    store
      .persist_from_join(&cluster_secret, &swarm_key)
      .unwrap();
    assert_eq!(store.ensure_cluster_secret().unwrap(), cluster_secret);
    assert_eq!(store.ensure_swarm_key().unwrap(), swarm_key);
  }

  #[test]
  fn secret_files_are_0600() {
    use std::os::unix::fs::MetadataExt;
    let (_dir, store) = store();
    store.ensure_cluster_secret().unwrap();
    let mode = std::fs::metadata(store.paths().cluster_secret_file())
      .unwrap()
      .mode();
    assert_eq!(mode & 0o777, 0o600);
    let dir_mode = std::fs::metadata(store.paths().secrets())
      .unwrap()
      .mode();
    assert_eq!(dir_mode & 0o777, 0o700);
  }
}
