//! Client for the network surface of Orbit nodes.
//!
//! Covers the two endpoints every live node exposes from its gateway:
//! - `POST /v1/internal/join`: consumed once by a host joining the cluster.
//! - `GET /v1/network/status`: consumed by tooling to discover a node's
//!   peer identifiers before a join.

use anyhow::{Context, anyhow};
use serde::Serialize;

use crate::api::{JoinRequest, JoinResponse, NetworkStatusResponse};

pub mod api;
pub mod entities;

/// Seconds before an in-flight handshake call is abandoned.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 30;

pub struct OrbitClient {
  address: String,
  client: reqwest::Client,
}

impl OrbitClient {
  /// Client for the bootstrap handshake.
  ///
  /// Certificate verification is disabled: until the first ACME issuance
  /// completes post-join, cluster gateways only hold self-signed certs.
  /// Every call after the join must go through [OrbitClient::new].
  pub fn new_insecure(address: impl Into<String>) -> anyhow::Result<OrbitClient> {
    let client = reqwest::Client::builder()
      .danger_accept_invalid_certs(true)
      .timeout(std::time::Duration::from_secs(HANDSHAKE_TIMEOUT_SECS))
      .build()
      .context("Failed to build http client for join handshake")?;
    Ok(OrbitClient {
      address: normalize_address(address.into()),
      client,
    })
  }

  /// Client with full certificate verification, for any call made
  /// after the host has joined the cluster.
  pub fn new(address: impl Into<String>) -> anyhow::Result<OrbitClient> {
    let client = reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(HANDSHAKE_TIMEOUT_SECS))
      .build()
      .context("Failed to build http client")?;
    Ok(OrbitClient {
      address: normalize_address(address.into()),
      client,
    })
  }

  /// Submit this host's mesh public key to a live node and receive the
  /// cluster snapshot (overlay address, peers, secrets, bootstrap list).
  ///
  /// A non-2xx response is returned as an error carrying the remote
  /// body verbatim, so the operator sees exactly what the server said.
  pub async fn join(&self, request: &JoinRequest) -> anyhow::Result<JoinResponse> {
    self
      .post("/v1/internal/join", request)
      .await
      .context("Join request was rejected by the remote node")
  }

  /// Fetch the remote node's peer identifiers.
  pub async fn network_status(&self) -> anyhow::Result<NetworkStatusResponse> {
    let address = format!("{}/v1/network/status", self.address);
    let res = self
      .client
      .get(&address)
      .send()
      .await
      .with_context(|| format!("Failed to reach {address}"))?;
    let status = res.status();
    if !status.is_success() {
      let body = res.text().await.unwrap_or_default();
      return Err(anyhow!("{status} | {body}"));
    }
    res
      .json()
      .await
      .context("Failed to parse network status response")
  }

  async fn post<Req: Serialize, Res: serde::de::DeserializeOwned>(
    &self,
    path: &str,
    request: &Req,
  ) -> anyhow::Result<Res> {
    let address = format!("{}{path}", self.address);
    let res = self
      .client
      .post(&address)
      .json(request)
      .send()
      .await
      .with_context(|| format!("Failed to reach {address}"))?;
    let status = res.status();
    if status.is_success() {
      res
        .json()
        .await
        .with_context(|| format!("Failed to parse response from {address}"))
    } else {
      let body = res
        .text()
        .await
        .context("Failed to read response body")?;
      Err(anyhow!("{status} | {body}"))
    }
  }
}

/// `host:port` or bare host becomes an https url, trailing slash dropped.
fn normalize_address(address: String) -> String {
  let address = address.trim().trim_end_matches('/');
  if address.starts_with("http://") || address.starts_with("https://") {
    address.to_string()
  } else {
    format!("https://{address}")
  }
}
