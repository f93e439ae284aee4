//! Subnet environment file for the container runtime
//!
//! After init the daemon publishes this host's subnet as shell-style
//! variables, in the format the runtime's network plugin sources:
//!
//! ```text
//! FLANNEL_NETWORK=10.5.0.0/16
//! FLANNEL_SUBNET=10.5.1.1/24
//! FLANNEL_MTU=1450
//! FLANNEL_IPMASQ=false
//! ```
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Publish assigned subnet to consumers

use anyhow::{Context, Result};
use fabric_backend::SubnetDef;
use fabric_types::IpPrefix;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Default location of the subnet file.
pub const DEFAULT_SUBNET_FILE: &str = "/run/fabric/subnet.env";

/// Renders the file contents. `FLANNEL_SUBNET` carries the first host
/// address, which the runtime assigns to its bridge.
pub fn render(network: Option<IpPrefix>, subnet: &SubnetDef, ip_masq: bool) -> String {
    let mut out = String::new();
    if let Some(network) = network {
        let _ = writeln!(out, "FLANNEL_NETWORK={}", network);
    }
    let _ = writeln!(out, "FLANNEL_SUBNET={}", subnet.net.first_host());
    let _ = writeln!(out, "FLANNEL_MTU={}", subnet.mtu);
    let _ = writeln!(out, "FLANNEL_IPMASQ={}", ip_masq);
    out
}

/// Writes the subnet file through a hidden temporary file in the same
/// directory, renamed over `path` so readers never see a partial file.
pub fn write_subnet_file(
    path: &Path,
    network: Option<IpPrefix>,
    subnet: &SubnetDef,
    ip_masq: bool,
) -> Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("{} does not name a file", path.display()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new(""));

    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let mut temp_name = OsString::from(".");
    temp_name.push(file_name);
    let temp_path = dir.join(temp_name);

    fs::write(&temp_path, render(network, subnet, ip_masq))
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn subnet() -> SubnetDef {
        SubnetDef {
            net: "10.5.1.0/24".parse().unwrap(),
            mtu: 1450,
        }
    }

    #[test]
    fn test_render() {
        assert_eq!(
            render(Some("10.5.0.0/16".parse().unwrap()), &subnet(), true),
            "FLANNEL_NETWORK=10.5.0.0/16\n\
             FLANNEL_SUBNET=10.5.1.1/24\n\
             FLANNEL_MTU=1450\n\
             FLANNEL_IPMASQ=true\n"
        );
        assert_eq!(
            render(None, &subnet(), false),
            "FLANNEL_SUBNET=10.5.1.1/24\nFLANNEL_MTU=1450\nFLANNEL_IPMASQ=false\n"
        );
    }

    #[test]
    fn test_write_creates_directory_and_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("subnet.env");

        write_subnet_file(&path, None, &subnet(), false).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "FLANNEL_SUBNET=10.5.1.1/24\nFLANNEL_MTU=1450\nFLANNEL_IPMASQ=false\n"
        );

        let moved = SubnetDef {
            net: "10.5.7.0/24".parse().unwrap(),
            mtu: 1500,
        };
        write_subnet_file(&path, None, &moved, true).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("FLANNEL_SUBNET=10.5.7.1/24\n"));
        assert!(contents.contains("FLANNEL_IPMASQ=true\n"));

        // only the target remains, the temporary was renamed away
        let names: Vec<_> = fs::read_dir(dir.path().join("run"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("subnet.env")]);
    }

    #[test]
    fn test_write_rejects_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_subnet_file(&dir.path().join(".."), None, &subnet(), false).is_err());
    }
}
