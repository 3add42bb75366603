pub mod logger;
pub mod mesh;
pub mod network;
pub mod node;

/// The unprivileged system user that owns all node files and under
/// which every long-lived daemon runs.
pub const SERVICE_USER: &str = "orbit";

/// Hidden directory under the service user's home holding all node state.
pub const BASE_DIR_NAME: &str = ".orbit";
