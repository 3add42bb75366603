use std::{collections::HashSet, path::PathBuf, sync::OnceLock};

use anyhow::Context;
use orbit_client::entities::network::{
  NETWORK_MANIFEST_FILE, NetworkManifest,
};
use secrets::SecretStore;
use tokio::sync::Mutex;

use crate::config::netd_config;

/// Shared state behind the network surface.
///
/// `allocation_lock` is the cluster-wide critical section for overlay
/// address allocation: concurrent join requests on this host are
/// linearized by it, and the new peer is committed to the mesh config
/// before the lock is released.
pub struct NetState {
  pub manifest: NetworkManifest,
  pub mesh_config_path: PathBuf,
  pub allocation_lock: Mutex<()>,
  /// Remaining single-use invite tokens. None when the operator
  /// configured no token list (any non-empty token accepted).
  pub invites: Option<Mutex<HashSet<String>>>,
}

static NET_STATE: OnceLock<NetState> = OnceLock::new();

/// Load the rendered network manifest and build the state.
/// Called once at startup; the daemon cannot serve without it.
pub fn init_net_state() -> anyhow::Result<&'static NetState> {
  let config = netd_config();
  let manifest_path =
    config.paths.config_file(NETWORK_MANIFEST_FILE);
  let contents =
    std::fs::read_to_string(&manifest_path).with_context(|| {
      format!("Failed to read network manifest at {manifest_path:?}. Has the installer run on this host?")
    })?;
  let manifest: NetworkManifest = serde_json::from_str(&contents)
    .with_context(|| {
      format!("Failed to parse network manifest at {manifest_path:?}")
    })?;
  let state = NetState {
    manifest,
    mesh_config_path: config.mesh_config_path.clone(),
    allocation_lock: Mutex::new(()),
    invites: if config.join_tokens.is_empty() {
      None
    } else {
      Some(Mutex::new(
        config.join_tokens.iter().cloned().collect(),
      ))
    },
  };
  Ok(NET_STATE.get_or_init(|| state))
}

pub fn net_state() -> &'static NetState {
  NET_STATE
    .get()
    .expect("net state accessed before initialization")
}

/// Secret store over the daemon's base directory. The daemon only
/// reads; ownership fixes are the installer's job.
pub fn secret_store() -> SecretStore {
  SecretStore::new(netd_config().paths.clone(), None)
}
