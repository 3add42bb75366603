use std::{
  net::SocketAddr,
  str::FromStr,
};

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;

use crate::config::netd_config;

#[macro_use]
extern crate tracing;

mod api;
mod config;
mod helpers;
mod state;

async fn app() -> anyhow::Result<()> {
  let config = netd_config();
  logger::init(&config.logging)?;

  info!("Orbit node daemon version: v{}", env!("CARGO_PKG_VERSION"));

  state::init_net_state()?;

  rustls::crypto::aws_lc_rs::default_provider()
    .install_default()
    .expect("Failed to install default crypto provider");

  let addr = format!("{}:{}", config.bind_ip, config.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("failed to parse listen address")?;

  let app = api::router().into_make_service();

  if config.ssl_enabled {
    helpers::ensure_ssl_certs().await?;
    info!("Orbit gateway starting on https://{socket_addr}");
    let ssl_config = RustlsConfig::from_pem_file(
      config.ssl_cert_file(),
      config.ssl_key_file(),
    )
    .await
    .context("Invalid ssl cert / key")?;
    axum_server::bind_rustls(socket_addr, ssl_config)
      .serve(app)
      .await
      .context("Server crashed")
  } else {
    info!("Orbit gateway starting on http://{socket_addr}");
    axum_server::bind(socket_addr)
      .serve(app)
      .await
      .context("Server crashed")
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;

  let app = tokio::spawn(app());

  tokio::select! {
    res = app => res?,
    _ = term_signal.recv() => {
      info!("Received terminate signal, shutting down");
      Ok(())
    },
  }
}
