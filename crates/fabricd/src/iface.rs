//! External interface discovery
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Interface index, address and MTU

use anyhow::{Context, Result};
use fabric_backend::ExternalInterface;
use fabric_types::IpAddress;
use nix::ifaddrs::{getifaddrs, InterfaceAddress};
use nix::net::if_::{if_nametoindex, InterfaceFlags};

/// Resolves `spec`, an interface name or one of an interface's addresses.
/// Without it, picks the first up non-loopback interface with an address.
pub fn resolve(spec: Option<&str>) -> Result<ExternalInterface> {
    let addrs: Vec<InterfaceAddress> = getifaddrs()
        .context("failed to list interface addresses")?
        .collect();

    let (name, iface_addr) = match spec {
        Some(spec) => match spec.parse::<IpAddress>() {
            Ok(ip) => {
                let name = owner_of(&addrs, &ip)
                    .with_context(|| format!("no interface has address {}", ip))?;
                (name, ip)
            }
            Err(_) => by_name(&addrs, spec)?,
        },
        None => default_interface(&addrs).context("no usable external interface found")?,
    };

    let index = if_nametoindex(name.as_str())
        .with_context(|| format!("failed to resolve index of {}", name))?;
    let mtu = link_mtu(&name)?;

    Ok(ExternalInterface {
        name,
        index,
        mtu,
        iface_addr,
    })
}

fn by_name(addrs: &[InterfaceAddress], name: &str) -> Result<(String, IpAddress)> {
    let candidates: Vec<&InterfaceAddress> =
        addrs.iter().filter(|a| a.interface_name == name).collect();
    let addr = preferred_address(&candidates)
        .with_context(|| format!("interface {} has no IP address", name))?;
    Ok((name.to_string(), addr))
}

fn owner_of(addrs: &[InterfaceAddress], ip: &IpAddress) -> Option<String> {
    addrs
        .iter()
        .find(|a| address_of(a).as_ref() == Some(ip))
        .map(|a| a.interface_name.clone())
}

fn address_of(addr: &InterfaceAddress) -> Option<IpAddress> {
    let sockaddr = addr.address.as_ref()?;
    sockaddr
        .as_sockaddr_in()
        .map(|sin| IpAddress::from(sin.ip()))
        .or_else(|| sockaddr.as_sockaddr_in6().map(|sin6| IpAddress::from(sin6.ip())))
}

fn default_interface(addrs: &[InterfaceAddress]) -> Option<(String, IpAddress)> {
    let mut names: Vec<&str> = Vec::new();
    for addr in addrs {
        let usable = addr.flags.contains(InterfaceFlags::IFF_UP)
            && !addr.flags.contains(InterfaceFlags::IFF_LOOPBACK);
        if usable && !names.contains(&addr.interface_name.as_str()) {
            names.push(&addr.interface_name);
        }
    }

    names.into_iter().find_map(|name| {
        let candidates: Vec<&InterfaceAddress> =
            addrs.iter().filter(|a| a.interface_name == name).collect();
        preferred_address(&candidates).map(|ip| (name.to_string(), ip))
    })
}

/// IPv4 first, then IPv6.
fn preferred_address(candidates: &[&InterfaceAddress]) -> Option<IpAddress> {
    let addrs: Vec<IpAddress> = candidates.iter().filter_map(|a| address_of(a)).collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

#[cfg(target_os = "linux")]
fn link_mtu(name: &str) -> Result<u32> {
    let path = format!("/sys/class/net/{}/mtu", name);
    let raw = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path))?;
    parse_mtu(&raw)
}

#[cfg(not(target_os = "linux"))]
fn link_mtu(_name: &str) -> Result<u32> {
    // no sysfs
    Ok(1500)
}

fn parse_mtu(raw: &str) -> Result<u32> {
    raw.trim()
        .parse()
        .with_context(|| format!("invalid MTU value {:?}", raw.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mtu() {
        assert_eq!(parse_mtu("1500\n").unwrap(), 1500);
        assert_eq!(parse_mtu("  9000 ").unwrap(), 9000);
        assert!(parse_mtu("jumbo").is_err());
        assert!(parse_mtu("").is_err());
    }

    #[test]
    fn test_unknown_interface() {
        assert!(resolve(Some("no-such-if0")).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resolve_loopback() {
        let lo = resolve(Some("lo")).unwrap();
        assert_eq!(lo.name, "lo");
        assert!(lo.index > 0);
        assert!(lo.mtu > 0);
        assert_eq!(lo.iface_addr.to_string(), "127.0.0.1");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resolve_by_address() {
        let lo = resolve(Some("127.0.0.1")).unwrap();
        assert_eq!(lo.name, "lo");
        assert_eq!(lo.iface_addr.to_string(), "127.0.0.1");
    }

    #[test]
    fn test_unknown_address() {
        let err = resolve(Some("192.0.2.254")).unwrap_err();
        assert!(err.to_string().contains("no interface has address"));
    }
}
