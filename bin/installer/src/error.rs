/// The fatal error classes of an install run.
///
/// Each class aborts the phase state machine and exits non-zero;
/// already-completed phases stay on disk and a rerun resumes. Service
/// start failures are deliberately absent: they are logged and the run
/// completes (the operator inspects journal output).
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
  /// Misuse, missing privilege, missing tool, insufficient resource.
  #[error("Preflight failed | {0:#}")]
  Preflight(anyhow::Error),

  /// A required binary could not be downloaded or built.
  #[error("Binary acquisition failed | {0:#}")]
  Acquisition(anyhow::Error),

  /// A secret exists on disk but is malformed. Never auto-repaired
  /// beyond swarm-key duplicate-header normalization.
  #[error("Existing identity unusable | {0:#}")]
  IdentityReuse(anyhow::Error),

  /// The remote node answered the join with non-2xx.
  /// Carries the remote body verbatim.
  #[error("Join handshake rejected | {0:#}")]
  HandshakeRejected(anyhow::Error),

  /// The tunnel came up but the first peer never answered.
  #[error("Mesh unreachable | {0:#}")]
  MeshUnreachable(anyhow::Error),

  /// A post-write read-back assertion on a daemon config failed.
  /// The config is left on disk for inspection.
  #[error("Config integrity check failed | {0:#}")]
  ConfigIntegrity(anyhow::Error),
}

impl InstallError {
  pub fn preflight(e: impl Into<anyhow::Error>) -> InstallError {
    InstallError::Preflight(e.into())
  }

  pub fn acquisition(e: impl Into<anyhow::Error>) -> InstallError {
    InstallError::Acquisition(e.into())
  }

  pub fn identity(e: impl Into<anyhow::Error>) -> InstallError {
    InstallError::IdentityReuse(e.into())
  }

  pub fn handshake(e: impl Into<anyhow::Error>) -> InstallError {
    InstallError::HandshakeRejected(e.into())
  }

  pub fn mesh(e: impl Into<anyhow::Error>) -> InstallError {
    InstallError::MeshUnreachable(e.into())
  }

  pub fn config(e: impl Into<anyhow::Error>) -> InstallError {
    InstallError::ConfigIntegrity(e.into())
  }
}
