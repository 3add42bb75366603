use std::collections::BTreeMap;

use anyhow::{Context, anyhow};

/// The node daemon's own config. The SQL engine section drives the
/// managed rqlited process; advertise addresses stay on the overlay.
pub const NODE_CONFIG: &str = r#"# Rendered at install time. Rerunning the installer regenerates it.
node_id: "{{.NodeId}}"
base_domain: "{{.BaseDomain}}"
gateway:
  port: { { .GatewayPort } }
  https_enabled: {{.HttpsEnabled}}
  tls_cache_dir: "{{.TlsCacheDir}}"
p2p:
  port: {{.P2pPort}}
  bootstrap_peers: {{.BootstrapPeers}}
rqlite:
  http_port: {{.SqlHttpPort}}
  raft_port: {{.SqlRaftPort}}
  http_adv: "{{.OverlayIp}}:{{.SqlHttpPort}}"
  raft_adv: "{{.OverlayIp}}:{{.SqlRaftPort}}"
  rqlite_join_address: "{{.SqlJoinTarget}}"
  data_dir: "{{.SqlDataDir}}"
ipfs:
  api_port: {{.ObjectApiPort}}
  cluster_api_port: {{.ClusterApiPort}}
"#;

/// Written to the data dir, not configs: the gateway rewrites it at
/// runtime as deployments come and go.
pub const GATEWAY_CONFIG: &str = r#"base_domain: "{{.BaseDomain}}"
listen_port: {{.GatewayPort}}
internal:
  rqlite_http: "127.0.0.1:{{.SqlHttpPort}}"
  ipfs_api: "127.0.0.1:{{.ObjectApiPort}}"
  cluster_api: "127.0.0.1:{{.ClusterApiPort}}"
  cache: "127.0.0.1:{{.CachePort}}"
deployments: []
"#;

pub const CACHE_CONFIG: &str = r#"olricd:
  bindAddr: "{{.OverlayIp}}"
  bindPort: {{.CachePort}}
logging:
  level: INFO
memberlist:
  environment: lan
  bindAddr: "{{.OverlayIp}}"
"#;

/// Authoritative zone proxy for nameserver-role hosts. Cluster
/// records are answered by the gateway's DNS backend on loopback.
pub const COREFILE: &str = r#"{{.BaseDomain}}:53 {
    forward . 127.0.0.1:5353
    errors
}
.:53 {
    forward . /etc/resolv.conf
}
"#;

/// Render a template against a variable map.
///
/// Both `{{.Var}}` and the loose `{ { .Var } }` brace form are legal;
/// loose braces are normalized away before parsing. Unknown variables
/// are an error, not an empty substitution.
pub fn render(
  template: &str,
  vars: &BTreeMap<&str, String>,
) -> anyhow::Result<String> {
  let template = normalize_braces(template);
  let mut out = String::with_capacity(template.len());
  let mut rest = template.as_str();

  while let Some(start) = rest.find("{{") {
    out.push_str(&rest[..start]);
    let after = &rest[start + 2..];
    let end = after
      .find("}}")
      .context("unterminated '{{' in template")?;
    let token = after[..end].trim();
    let name = token.strip_prefix('.').unwrap_or(token);
    let value = vars
      .get(name)
      .ok_or_else(|| anyhow!("template references unknown variable {name}"))?;
    out.push_str(value);
    rest = &after[end + 2..];
  }
  out.push_str(rest);
  Ok(out)
}

/// Collapse `{ {` / `} }` into `{{` / `}}`.
fn normalize_braces(template: &str) -> String {
  template.replace("{ {", "{{").replace("} }", "}}")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn vars() -> BTreeMap<&'static str, String> {
    BTreeMap::from([
      ("Name", "orbit".to_string()),
      ("Port", "6001".to_string()),
    ])
  }

  #[test]
  fn tight_and_loose_braces_render_identically() {
    let tight = render("name={{.Name}} port={{.Port}}", &vars()).unwrap();
    let loose =
      render("name={ { .Name } } port={ { .Port } }", &vars()).unwrap();
    assert_eq!(tight, loose);
    assert_eq!(tight, "name=orbit port=6001");
  }

  #[test]
  fn spaces_inside_tight_braces_are_fine() {
    assert_eq!(
      render("{{ .Name }}", &vars()).unwrap(),
      "orbit"
    );
  }

  #[test]
  fn unknown_variable_is_an_error() {
    assert!(render("{{.Missing}}", &vars()).is_err());
  }

  #[test]
  fn unterminated_braces_are_an_error() {
    assert!(render("{{.Name", &vars()).is_err());
  }

  #[test]
  fn embedded_templates_reference_no_unknown_vars() {
    // every variable the shipped templates use
    let all = BTreeMap::from([
      ("NodeId", String::new()),
      ("BaseDomain", String::new()),
      ("GatewayPort", String::new()),
      ("HttpsEnabled", String::new()),
      ("TlsCacheDir", String::new()),
      ("P2pPort", String::new()),
      ("BootstrapPeers", String::new()),
      ("SqlHttpPort", String::new()),
      ("SqlRaftPort", String::new()),
      ("SqlJoinTarget", String::new()),
      ("SqlDataDir", String::new()),
      ("ObjectApiPort", String::new()),
      ("ClusterApiPort", String::new()),
      ("CachePort", String::new()),
      ("OverlayIp", String::new()),
    ]);
    for template in
      [NODE_CONFIG, GATEWAY_CONFIG, CACHE_CONFIG, COREFILE]
    {
      render(template, &all).unwrap();
    }
  }
}
