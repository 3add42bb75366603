use anyhow::Context;
use command::{binary_on_path, run_stage_command};
use orbit_client::entities::node::ports;

use crate::{
  config::InstallConfig,
  error::InstallError,
  helpers::{install_packages, phase_done},
};

#[derive(Debug, Clone, Copy)]
pub struct FirewallSpec {
  pub ssh_port: u16,
  pub mesh_port: u16,
  pub is_nameserver: bool,
  /// The privacy relay's OR port; 0 when the relay is disabled.
  pub relay_or_port: u16,
}

/// The complete `ufw` rule list for a host. Applying the rules in
/// order converges the firewall regardless of prior state.
pub fn firewall_rules(spec: FirewallSpec) -> Vec<String> {
  let mut rules = vec![
    "default deny incoming".to_string(),
    "default allow outgoing".to_string(),
    format!("allow {}/tcp", spec.ssh_port),
    format!("allow {}/udp", spec.mesh_port),
    "allow 80/tcp".to_string(),
    "allow 443/tcp".to_string(),
    // the overlay and anything else in private 10/8 space
    "allow from 10.0.0.0/8".to_string(),
  ];
  if spec.is_nameserver {
    rules.push("allow 53/tcp".to_string());
    rules.push("allow 53/udp".to_string());
  }
  if spec.relay_or_port > 0 {
    rules.push(format!("allow {}/tcp", spec.relay_or_port));
  }
  rules.push("--force enable".to_string());
  rules
}

pub async fn run(
  config: &InstallConfig,
) -> Result<(), InstallError> {
  if !binary_on_path("ufw").await {
    install_packages(&["ufw"])
      .await
      .context("Failed to install the firewall")
      .map_err(InstallError::acquisition)?;
  }

  let rules = firewall_rules(FirewallSpec {
    ssh_port: config.ssh_port,
    mesh_port: ports::MESH,
    is_nameserver: config.nameserver,
    relay_or_port: config.relay_or_port,
  });
  for rule in &rules {
    run_stage_command("Apply firewall rule", &format!("ufw {rule}"), None)
      .await
      .map_err(InstallError::preflight)?;
  }

  phase_done("Firewall");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base_spec() -> FirewallSpec {
    FirewallSpec {
      ssh_port: 22,
      mesh_port: 51820,
      is_nameserver: false,
      relay_or_port: 0,
    }
  }

  #[test]
  fn baseline_rules_are_complete() {
    let rules = firewall_rules(base_spec());
    for expected in [
      "default deny incoming",
      "default allow outgoing",
      "allow 22/tcp",
      "allow 51820/udp",
      "allow 80/tcp",
      "allow 443/tcp",
      "allow from 10.0.0.0/8",
      "--force enable",
    ] {
      assert!(
        rules.iter().any(|r| r == expected),
        "missing rule: {expected}"
      );
    }
    assert!(!rules.iter().any(|r| r.contains("53")));
  }

  #[test]
  fn nameserver_opens_dns_ports() {
    let rules = firewall_rules(FirewallSpec {
      is_nameserver: true,
      ..base_spec()
    });
    assert!(rules.iter().any(|r| r == "allow 53/tcp"));
    assert!(rules.iter().any(|r| r == "allow 53/udp"));
  }

  #[test]
  fn relay_or_port_only_when_positive() {
    let without = firewall_rules(base_spec());
    assert!(!without.iter().any(|r| r == "allow 9001/tcp"));
    let with = firewall_rules(FirewallSpec {
      relay_or_port: 9001,
      ..base_spec()
    });
    assert!(with.iter().any(|r| r == "allow 9001/tcp"));
  }

  #[test]
  fn custom_ssh_port_is_respected() {
    let rules = firewall_rules(FirewallSpec {
      ssh_port: 2222,
      ..base_spec()
    });
    assert!(rules.iter().any(|r| r == "allow 2222/tcp"));
    assert!(!rules.iter().any(|r| r == "allow 22/tcp"));
  }

  #[test]
  fn enable_is_last() {
    let rules = firewall_rules(base_spec());
    assert_eq!(rules.last().unwrap(), "--force enable");
  }
}
