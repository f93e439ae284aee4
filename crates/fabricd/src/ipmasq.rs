//! IP masquerade for traffic leaving the cluster network
//!
//! Four rules in the `nat` table's `POSTROUTING` chain:
//! - cluster to cluster traffic is never translated
//! - cluster traffic leaving the network is masqueraded, multicast excepted
//! - outside traffic to this host's subnet keeps its source
//! - host traffic into the cluster network is masqueraded
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Address translation at the network edge
//! - AU-12: Audit Record Generation - Log every rule change

use anyhow::{bail, Context, Result};
use fabric_types::IpPrefix;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Path to the `iptables` command.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Path to the `ip6tables` command.
pub const IP6TABLES_CMD: &str = "/sbin/ip6tables";

const NAT_TABLE: &str = "nat";
const CHAIN: &str = "POSTROUTING";

/// Masquerade rules for one cluster network and this host's subnet.
#[derive(Debug, Clone)]
pub struct IpMasq {
    command: String,
    rules: Vec<Vec<String>>,
}

impl IpMasq {
    pub fn new(network: IpPrefix, subnet: IpPrefix) -> Result<Self> {
        if network.is_ipv6() != subnet.is_ipv6() {
            bail!(
                "cluster network {} and subnet {} are of different address families",
                network,
                subnet
            );
        }
        let command = if network.is_ipv6() {
            IP6TABLES_CMD
        } else {
            IPTABLES_CMD
        };
        Ok(Self {
            command: command.to_string(),
            rules: rules(&network.network(), &subnet.network()),
        })
    }

    /// Uses `command` instead of the system iptables binary.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Appends each rule not already present.
    pub async fn setup(&self) -> Result<()> {
        for rule in &self.rules {
            if self.run("-C", rule).await?.success {
                debug!(rule = %rule.join(" "), "fabricd: Masquerade rule present");
                continue;
            }

            info!(rule = %rule.join(" "), "fabricd: Adding masquerade rule");
            let result = self.run("-A", rule).await?;
            if !result.success {
                bail!(
                    "failed to insert masquerade rule '{}': {}",
                    rule.join(" "),
                    result.stderr
                );
            }
        }
        Ok(())
    }

    /// Deletes every rule; failures are logged.
    pub async fn teardown(&self) {
        for rule in &self.rules {
            info!(rule = %rule.join(" "), "fabricd: Deleting masquerade rule");
            match self.run("-D", rule).await {
                Ok(result) if result.success => {}
                Ok(result) => {
                    warn!(rule = %rule.join(" "), stderr = %result.stderr, "fabricd: Failed to delete masquerade rule")
                }
                Err(e) => warn!(error = ?e, "fabricd: Failed to delete masquerade rule"),
            }
        }
    }

    async fn run(&self, op: &str, rule: &[String]) -> Result<Output> {
        let output = Command::new(&self.command)
            .args(["-t", NAT_TABLE, op, CHAIN])
            .args(rule)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.command))?;

        Ok(Output {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

struct Output {
    success: bool,
    stderr: String,
}

fn rules(network: &IpPrefix, subnet: &IpPrefix) -> Vec<Vec<String>> {
    let network_str = network.to_string();
    let subnet_str = subnet.to_string();
    let (n, sn) = (network_str.as_str(), subnet_str.as_str());
    let multicast = if network.is_ipv6() {
        "ff00::/8"
    } else {
        "224.0.0.0/4"
    };

    let rule = |parts: &[&str]| -> Vec<String> { parts.iter().map(|p| p.to_string()).collect() };
    vec![
        rule(&["-s", n, "-d", n, "-j", "RETURN"]),
        rule(&["-s", n, "!", "-d", multicast, "-j", "MASQUERADE"]),
        rule(&["!", "-s", n, "-d", sn, "-j", "RETURN"]),
        rule(&["!", "-s", n, "-d", n, "-j", "MASQUERADE"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rules() {
        let masq = IpMasq::new("10.5.0.0/16".parse().unwrap(), "10.5.1.0/24".parse().unwrap())
            .unwrap();
        assert_eq!(masq.command, IPTABLES_CMD);

        let rendered: Vec<String> = masq.rules.iter().map(|r| r.join(" ")).collect();
        assert_eq!(
            rendered,
            vec![
                "-s 10.5.0.0/16 -d 10.5.0.0/16 -j RETURN",
                "-s 10.5.0.0/16 ! -d 224.0.0.0/4 -j MASQUERADE",
                "! -s 10.5.0.0/16 -d 10.5.1.0/24 -j RETURN",
                "! -s 10.5.0.0/16 -d 10.5.0.0/16 -j MASQUERADE",
            ]
        );
    }

    #[test]
    fn test_ipv6_uses_ip6tables() {
        let masq = IpMasq::new("fd00:5::/48".parse().unwrap(), "fd00:5:1::/64".parse().unwrap())
            .unwrap();
        assert_eq!(masq.command, IP6TABLES_CMD);
        assert!(masq.rules[1].contains(&"ff00::/8".to_string()));
    }

    #[test]
    fn test_mixed_families_rejected() {
        assert!(IpMasq::new("10.5.0.0/16".parse().unwrap(), "fd00:5:1::/64".parse().unwrap())
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_setup_appends_missing_rules_and_teardown_deletes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let script = dir.path().join("iptables");
        // -C reports the first rule as present, the rest as missing
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> {log}\n\
                 if [ \"$3\" = \"-C\" ]; then\n  \
                   case \"$*\" in *\"-d 10.5.0.0/16 -j RETURN\"*) exit 0;; esac\n  \
                   exit 1\nfi\nexit 0\n",
                log = log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let masq = IpMasq::new("10.5.0.0/16".parse().unwrap(), "10.5.1.0/24".parse().unwrap())
            .unwrap()
            .with_command(script.to_string_lossy());
        masq.setup().await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let ops: Vec<&str> = calls
            .lines()
            .map(|l| l.split_whitespace().nth(2).unwrap())
            .collect();
        assert_eq!(ops, vec!["-C", "-C", "-A", "-C", "-A", "-C", "-A"]);

        std::fs::remove_file(&log).unwrap();
        masq.teardown().await;
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().count(), 4);
        assert!(calls.lines().all(|l| l.starts_with("-t nat -D POSTROUTING")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_setup_fails_when_append_fails() {
        let masq = IpMasq::new("10.5.0.0/16".parse().unwrap(), "10.5.1.0/24".parse().unwrap())
            .unwrap()
            .with_command("/bin/false");
        assert!(masq.setup().await.is_err());
    }
}
