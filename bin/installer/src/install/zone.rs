use std::time::Duration;

use anyhow::{Context, anyhow};
use orbit_client::entities::{network::NetworkConfig, node::mesh_config_path};
use serde_json::{Value, json};

use crate::{
  config::InstallConfig,
  error::InstallError,
  helpers::phase_done,
};

const SQL_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Seed the authoritative static records for the base domain into the
/// SQL engine once it is reachable. `INSERT OR REPLACE` makes the
/// whole batch idempotent.
pub async fn run(
  config: &InstallConfig,
  network: &NetworkConfig,
) -> Result<(), InstallError> {
  let base = format!(
    "http://127.0.0.1:{}",
    network.sql_http_port
  );
  wait_for_sql(&base).await.map_err(InstallError::config)?;

  // Wildcard records point at every peer's public IP; peers are read
  // from the mesh endpoints, plus this host itself.
  let mut public_ips = vec![config.vps_ip.to_string()];
  if let Ok(Some(mesh)) = mesh::load_config(mesh_config_path()) {
    for peer in &mesh.peers {
      if let Some((host, _)) = peer.endpoint.split_once(':')
        && !public_ips.iter().any(|ip| ip == host)
      {
        public_ips.push(host.to_string());
      }
    }
  }

  let statements =
    zone_statements(&network.base_domain, &public_ips);
  let client = reqwest::Client::new();
  let res = client
    .post(format!("{base}/db/execute"))
    .json(&statements)
    .send()
    .await
    .context("Failed to post zone records to the SQL engine")
    .map_err(InstallError::config)?;
  let status = res.status();
  if !status.is_success() {
    let body = res.text().await.unwrap_or_default();
    return Err(InstallError::config(anyhow!(
      "zone seeding was rejected | {status} | {body}"
    )));
  }

  phase_done("Seed zone records");
  Ok(())
}

async fn wait_for_sql(base: &str) -> anyhow::Result<()> {
  let client = reqwest::Client::builder()
    .timeout(Duration::from_secs(2))
    .build()
    .context("Failed to build http client")?;
  let deadline = tokio::time::Instant::now() + SQL_READY_TIMEOUT;
  loop {
    if let Ok(res) =
      client.get(format!("{base}/status")).send().await
      && res.status().is_success()
    {
      return Ok(());
    }
    if tokio::time::Instant::now() >= deadline {
      return Err(anyhow!(
        "SQL engine at {base} never became reachable"
      ));
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
  }
}

/// The parameterized statement batch for the rqlite execute API.
fn zone_statements(
  base_domain: &str,
  public_ips: &[String],
) -> Value {
  const UPSERT: &str =
    "INSERT OR REPLACE INTO dns_records(name, rtype, content, ttl) VALUES(?, ?, ?, ?)";
  let ns_host = format!("ns1.{base_domain}");
  let mut statements = vec![
    json!([
      UPSERT,
      base_domain,
      "SOA",
      format!("{ns_host}. hostmaster.{base_domain}. 1 7200 3600 1209600 3600"),
      3600
    ]),
    json!([UPSERT, base_domain, "NS", ns_host, 3600]),
  ];
  for (i, ip) in public_ips.iter().enumerate() {
    // first host doubles as the glue target
    if i == 0 {
      statements.push(json!([UPSERT, ns_host, "A", ip, 3600]));
    }
    statements.push(json!([
      UPSERT,
      format!("*.{base_domain}"),
      "A",
      ip,
      300
    ]));
  }
  json!(statements)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn batch_carries_soa_ns_glue_and_wildcards() {
    let ips =
      vec!["203.0.113.1".to_string(), "203.0.113.2".to_string()];
    let batch = zone_statements("example.net", &ips);
    let rows = batch.as_array().unwrap();
    let kinds = rows
      .iter()
      .map(|row| row[2].as_str().unwrap())
      .collect::<Vec<_>>();
    assert_eq!(kinds.iter().filter(|k| **k == "SOA").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "NS").count(), 1);
    // glue + one wildcard per peer
    assert_eq!(kinds.iter().filter(|k| **k == "A").count(), 3);
    assert!(
      rows
        .iter()
        .all(|row| row[0].as_str().unwrap().starts_with("INSERT OR REPLACE"))
    );
  }

  #[test]
  fn rerunning_produces_the_same_batch() {
    let ips = vec!["203.0.113.1".to_string()];
    assert_eq!(
      zone_statements("example.net", &ips),
      zone_statements("example.net", &ips)
    );
  }
}
