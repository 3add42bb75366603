use anyhow::Context;
use axum::Json;
use orbit_client::api::{
  NetworkStatusResponse, ObjectStoreStatus, PinCoordinatorStatus,
};

use crate::{
  api::ApiError,
  helpers::{object_store_identity, pin_coordinator_hint},
  state::{net_state, secret_store},
};

/// Consumed by the wizard to discover a peer's identifiers before
/// invoking a join against it.
pub async fn handler()
-> Result<Json<NetworkStatusResponse>, ApiError> {
  let store = secret_store();
  let peer_id = store
    .ensure_node_identity()
    .context("this host has no node identity")?;

  let network = &net_state().manifest.network;
  let ipfs = object_store_identity(store.paths(), network);
  let cluster = pin_coordinator_hint(store.paths(), network);

  Ok(Json(NetworkStatusResponse {
    peer_id: peer_id.to_string(),
    ipfs: ObjectStoreStatus {
      peer_id: ipfs.id,
      swarm_addresses: ipfs.addrs,
    },
    ipfs_cluster: PinCoordinatorStatus {
      peer_id: cluster.id,
      addresses: cluster.addrs,
    },
  }))
}
