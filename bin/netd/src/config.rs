use std::{path::PathBuf, sync::OnceLock};

use orbit_client::entities::{
  logger::{LogConfig, LogLevel, StdioLogMode},
  node::{NodePaths, ports},
};
use serde::Deserialize;

/// Environment overrides for the node daemon, `ORBITD_` prefixed.
#[derive(Deserialize)]
pub struct Env {
  /// Override the listen port. Default: 6001.
  pub port: Option<u16>,
  /// Override the bind address. Default: `0.0.0.0`.
  pub bind_ip: Option<String>,
  /// Disable TLS termination (behind a trusted proxy only).
  pub ssl_enabled: Option<bool>,
  /// Override the node base directory. Default: the service user's.
  pub base_dir: Option<PathBuf>,
  /// Override the mesh config path. Default: `/etc/wireguard/wg0.conf`.
  pub mesh_config_path: Option<PathBuf>,
  /// Comma separated single-use invite tokens accepted by the join
  /// endpoint. When unset, any non-empty token is accepted.
  pub join_tokens: Option<String>,
  pub log_level: Option<LogLevel>,
  pub log_json: Option<bool>,
}

pub struct NetdConfig {
  pub port: u16,
  pub bind_ip: String,
  pub ssl_enabled: bool,
  pub paths: NodePaths,
  pub mesh_config_path: PathBuf,
  pub join_tokens: Vec<String>,
  pub logging: LogConfig,
}

impl NetdConfig {
  pub fn ssl_key_file(&self) -> PathBuf {
    self.paths.tls_cache().join("self-signed").join("key.pem")
  }

  pub fn ssl_cert_file(&self) -> PathBuf {
    self.paths.tls_cache().join("self-signed").join("cert.pem")
  }
}

pub fn netd_config() -> &'static NetdConfig {
  static NETD_CONFIG: OnceLock<NetdConfig> = OnceLock::new();
  NETD_CONFIG.get_or_init(|| {
    let env: Env = envy::prefixed("ORBITD_")
      .from_env()
      .expect("failed to parse orbitd environment");
    NetdConfig {
      port: env.port.unwrap_or(ports::GATEWAY),
      bind_ip: env.bind_ip.unwrap_or_else(|| String::from("0.0.0.0")),
      ssl_enabled: env.ssl_enabled.unwrap_or(true),
      paths: env
        .base_dir
        .map(NodePaths::new)
        .unwrap_or_else(NodePaths::for_service_user),
      mesh_config_path: env.mesh_config_path.unwrap_or_else(|| {
        orbit_client::entities::node::mesh_config_path().to_path_buf()
      }),
      join_tokens: env
        .join_tokens
        .map(|tokens| {
          tokens
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
        })
        .unwrap_or_default(),
      logging: LogConfig {
        level: env.log_level.unwrap_or_default(),
        stdio: if env.log_json.unwrap_or_default() {
          StdioLogMode::Json
        } else {
          StdioLogMode::Standard
        },
        ..Default::default()
      },
    }
  })
}
