use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::Context;
use command::run_standard_command;

use crate::{
  config::InstallConfig,
  error::InstallError,
  helpers::{phase_done, warn},
  install::templates,
};

const UNIT_DIR: &str = "/etc/systemd/system";

/// Every unit gets the same sandbox: the daemons only ever touch the
/// node base directory.
const UNIT_TEMPLATE: &str = r#"[Unit]
Description={{.Description}}
After=network-online.target{{.After}}
Wants=network-online.target{{.Requires}}

[Service]
User={{.User}}
Group={{.User}}
{{.Environment}}ExecStart={{.ExecStart}}
Restart=always
RestartSec=5
NoNewPrivileges=true
PrivateTmp=true
ProtectSystem=strict
ReadWritePaths={{.Base}}
StandardOutput=append:{{.LogFile}}
StandardError=append:{{.LogFile}}

[Install]
WantedBy=multi-user.target
"#;

struct ServiceSpec {
  name: &'static str,
  description: &'static str,
  exec_start: String,
  /// Unit names this one requires (and orders after).
  requires: Vec<&'static str>,
  environment: Vec<(String, String)>,
  log_name: &'static str,
}

impl ServiceSpec {
  fn unit_file(&self) -> PathBuf {
    PathBuf::from(UNIT_DIR).join(format!("{}.service", self.name))
  }

  fn render(&self, config: &InstallConfig) -> anyhow::Result<String> {
    let after = self
      .requires
      .iter()
      .map(|unit| format!(" {unit}.service"))
      .collect::<String>();
    let requires = if self.requires.is_empty() {
      String::new()
    } else {
      format!(
        "\nRequires={}",
        self
          .requires
          .iter()
          .map(|unit| format!("{unit}.service"))
          .collect::<Vec<_>>()
          .join(" ")
      )
    };
    let environment = self
      .environment
      .iter()
      .map(|(key, value)| format!("Environment={key}={value}\n"))
      .collect::<String>();
    let vars = BTreeMap::from([
      ("Description", self.description.to_string()),
      ("After", after),
      ("Requires", requires),
      ("User", orbit_client::entities::SERVICE_USER.to_string()),
      ("Environment", environment),
      ("ExecStart", self.exec_start.clone()),
      ("Base", config.paths.base.display().to_string()),
      (
        "LogFile",
        config.paths.log_file(self.log_name).display().to_string(),
      ),
    ]);
    templates::render(UNIT_TEMPLATE, &vars)
  }
}

fn units(config: &InstallConfig) -> Vec<ServiceSpec> {
  let paths = &config.paths;
  let mut units = vec![
    ServiceSpec {
      name: "orbit-ipfs",
      description: "Orbit object store (kubo)",
      exec_start: "/usr/local/bin/ipfs daemon --enable-gc".to_string(),
      requires: vec![],
      environment: vec![(
        "IPFS_PATH".to_string(),
        paths.object_store_repo().display().to_string(),
      )],
      log_name: "ipfs",
    },
    ServiceSpec {
      name: "orbit-olricd",
      description: "Orbit distributed cache",
      exec_start: format!(
        "/usr/local/bin/olricd -c {}",
        paths.config_file("olricd.yaml").display()
      ),
      requires: vec![],
      environment: vec![],
      log_name: "olricd",
    },
    ServiceSpec {
      name: "orbit-ipfs-cluster",
      description: "Orbit pin coordinator",
      exec_start: "/usr/local/bin/ipfs-cluster-service daemon"
        .to_string(),
      requires: vec!["orbit-ipfs"],
      environment: vec![(
        "IPFS_CLUSTER_PATH".to_string(),
        paths.pin_coordinator_dir().display().to_string(),
      )],
      log_name: "ipfs-cluster",
    },
    ServiceSpec {
      name: "orbitd",
      description: "Orbit node daemon and gateway",
      exec_start: paths.bin().join("orbitd").display().to_string(),
      requires: vec!["orbit-ipfs-cluster"],
      environment: vec![(
        "ORBITD_BASE_DIR".to_string(),
        paths.base.display().to_string(),
      )],
      log_name: "orbitd",
    },
  ];
  if config.nameserver {
    units.push(ServiceSpec {
      name: "orbit-coredns",
      description: "Orbit authoritative DNS proxy",
      exec_start: format!(
        "/usr/local/bin/coredns -conf {}",
        paths.config_file("Corefile").display()
      ),
      requires: vec!["orbitd"],
      environment: vec![],
      log_name: "coredns",
    });
  }
  units
}

/// Write every unit, reload the supervisor, then start in dependency
/// order. Individual start failures are logged, never fatal: the
/// operator inspects journal output.
pub async fn run(
  config: &InstallConfig,
) -> Result<(), InstallError> {
  let units = units(config);

  for unit in &units {
    let rendered =
      unit.render(config).map_err(InstallError::config)?;
    let path = unit.unit_file();
    std::fs::write(&path, rendered)
      .with_context(|| format!("Failed to write {path:?}"))
      .map_err(InstallError::config)?;
  }

  let reload =
    run_standard_command("systemctl daemon-reload", None).await;
  if !reload.success() {
    return Err(InstallError::config(anyhow::anyhow!(
      "systemctl daemon-reload failed | {}",
      reload.combined()
    )));
  }

  for unit in &units {
    let enable = run_standard_command(
      &format!("systemctl enable {}.service", unit.name),
      None,
    )
    .await;
    if !enable.success() {
      warn(format!(
        "failed to enable {} | {}",
        unit.name,
        enable.combined()
      ));
    }
  }

  // Infrastructure first, fired off without waiting.
  let mut first_wave = vec!["orbit-ipfs", "orbit-olricd"];
  if config.relay_or_port > 0 {
    first_wave.push("tor");
  }
  for name in first_wave {
    tokio::spawn(async move {
      let output = run_standard_command(
        &format!("systemctl start {name}"),
        None,
      )
      .await;
      if !output.success() {
        warn!("failed to start {name} | {}", output.combined());
      }
    });
  }

  // Let the object store's API come up before its dependents.
  tokio::time::sleep(Duration::from_secs(2)).await;

  start_logged("orbit-ipfs-cluster").await;
  start_logged("orbitd").await;
  if config.nameserver {
    start_logged("orbit-coredns").await;
  }

  phase_done("Start services");
  Ok(())
}

async fn start_logged(name: &str) {
  let output =
    run_standard_command(&format!("systemctl start {name}"), None)
      .await;
  if !output.success() {
    warn(format!(
      "failed to start {name} | {}",
      output.combined()
    ));
  }
}

#[cfg(test)]
mod tests {
  use orbit_client::entities::node::NodePaths;

  use super::*;
  use crate::config::InstallConfig;

  fn test_config(nameserver: bool) -> InstallConfig {
    InstallConfig {
      vps_ip: "203.0.113.1".parse().unwrap(),
      domain: None,
      base_domain: "example.net".to_string(),
      branch: crate::config::Branch::Main,
      no_pull: false,
      force: false,
      dry_run: false,
      skip_checks: false,
      nameserver,
      join: None,
      cluster_secret: None,
      swarm_key: None,
      bootstrap_peers: Vec::new(),
      paths: NodePaths::new("/home/orbit/.orbit"),
      ssh_port: 22,
      relay_or_port: 0,
      logging: Default::default(),
    }
  }

  #[test]
  fn pin_coordinator_requires_object_store() {
    let config = test_config(false);
    let units = units(&config);
    let cluster = units
      .iter()
      .find(|u| u.name == "orbit-ipfs-cluster")
      .unwrap();
    let rendered = cluster.render(&config).unwrap();
    assert!(rendered.contains("Requires=orbit-ipfs.service"));
    assert!(
      rendered
        .contains("After=network-online.target orbit-ipfs.service")
    );
  }

  #[test]
  fn daemon_requires_pin_coordinator() {
    let config = test_config(false);
    let units = units(&config);
    let orbitd =
      units.iter().find(|u| u.name == "orbitd").unwrap();
    let rendered = orbitd.render(&config).unwrap();
    assert!(
      rendered.contains("Requires=orbit-ipfs-cluster.service")
    );
  }

  #[test]
  fn units_carry_the_hardening_set() {
    let config = test_config(false);
    for unit in units(&config) {
      let rendered = unit.render(&config).unwrap();
      for line in [
        "NoNewPrivileges=true",
        "PrivateTmp=true",
        "ProtectSystem=strict",
        "ReadWritePaths=/home/orbit/.orbit",
        "Restart=always",
        "RestartSec=5",
        "User=orbit",
      ] {
        assert!(
          rendered.contains(line),
          "{} unit missing {line}",
          unit.name
        );
      }
    }
  }

  #[test]
  fn coredns_only_on_nameserver_hosts() {
    assert!(
      !units(&test_config(false))
        .iter()
        .any(|u| u.name == "orbit-coredns")
    );
    let with = units(&test_config(true));
    let coredns = with
      .iter()
      .find(|u| u.name == "orbit-coredns")
      .unwrap();
    assert_eq!(coredns.requires, vec!["orbitd"]);
  }

  #[test]
  fn unit_renders_log_redirection() {
    let config = test_config(false);
    let units = units(&config);
    let ipfs =
      units.iter().find(|u| u.name == "orbit-ipfs").unwrap();
    let rendered = ipfs.render(&config).unwrap();
    assert!(rendered.contains(
      "StandardOutput=append:/home/orbit/.orbit/logs/ipfs.log"
    ));
  }
}
