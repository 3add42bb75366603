use anyhow::anyhow;
use orbit_client::api::JoinResponse;
use secrets::{Owner, SecretStore};

use crate::{
  config::InstallConfig,
  error::InstallError,
  helpers::{phase_done, warn},
};

/// Genesis path: generate (or reuse) all three secrets locally.
/// Returns the node's stable peer identifier.
pub fn run(
  config: &InstallConfig,
  owner: Owner,
) -> Result<secrets::PeerId, InstallError> {
  let store = SecretStore::new(config.paths.clone(), Some(owner));
  persist_out_of_band(config, &store)
    .map_err(InstallError::identity)?;
  let identity = ensure_all(&store)?;
  phase_done("Generate secrets");
  Ok(identity)
}

/// Join path: persist the secrets received in the handshake first,
/// so the ensure calls observe them and return them unchanged.
pub fn run_join(
  config: &InstallConfig,
  owner: Owner,
  snapshot: Option<&JoinResponse>,
) -> Result<secrets::PeerId, InstallError> {
  let store = SecretStore::new(config.paths.clone(), Some(owner));
  if let Some(snapshot) = snapshot {
    store
      .persist_from_join(&snapshot.cluster_secret, &snapshot.swarm_key)
      .map_err(InstallError::identity)?;
  }
  persist_out_of_band(config, &store)
    .map_err(InstallError::identity)?;
  let identity = ensure_all(&store)?;
  phase_done("Persist received secrets");
  Ok(identity)
}

fn ensure_all(
  store: &SecretStore,
) -> Result<secrets::PeerId, InstallError> {
  store
    .ensure_cluster_secret()
    .map_err(InstallError::identity)?;
  store.ensure_swarm_key().map_err(InstallError::identity)?;
  let identity = store
    .ensure_node_identity()
    .map_err(InstallError::identity)?;
  info!("node identity: {identity}");
  Ok(identity)
}

/// `--cluster-secret` / `--swarm-key` provide secrets out of band for
/// disaster recovery. Existing valid secrets are never overwritten
/// without --force.
fn persist_out_of_band(
  config: &InstallConfig,
  store: &SecretStore,
) -> anyhow::Result<()> {
  let (Some(cluster_secret), Some(swarm_key)) =
    (&config.cluster_secret, &config.swarm_key)
  else {
    if config.cluster_secret.is_some() || config.swarm_key.is_some() {
      return Err(anyhow!(
        "--cluster-secret and --swarm-key must be provided together"
      ));
    }
    return Ok(());
  };

  let already_populated =
    store.paths().cluster_secret_file().exists();
  if already_populated && !config.force {
    warn(
      "secrets already exist on this host; ignoring out-of-band values (use --force to overwrite)",
    );
    return Ok(());
  }

  let swarm_key = if swarm_key.contains(secrets::SWARM_KEY_HEADER) {
    swarm_key.clone()
  } else {
    // bare hex form
    secrets::render_swarm_key(&swarm_key.to_uppercase())
  };
  store.persist_from_join(cluster_secret, &swarm_key)
}
