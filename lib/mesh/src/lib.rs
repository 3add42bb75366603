//! The encrypted overlay mesh.
//!
//! Every host carries one WireGuard interface (`wg0`) forming a full
//! mesh over the public internet; all inter-node traffic traverses it.
//! This crate owns key generation, the config file model, overlay
//! address allocation within the cluster `/24`, and the subprocess
//! edges (`wg-quick`, `wg set`, reachability probing).

mod alloc;
mod config;
mod keys;
mod ops;

pub use alloc::*;
pub use config::*;
pub use keys::*;
pub use ops::*;

/// The overlay interface name on every host.
pub const MESH_INTERFACE: &str = "wg0";

/// Seconds between keepalives announced for every peer.
pub const PERSISTENT_KEEPALIVE: u16 = 25;
