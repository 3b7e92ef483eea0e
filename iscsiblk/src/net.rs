use std::net::Ipv4Addr;

use anyhow::Result;
use nix::ifaddrs::getifaddrs;

use crate::IscsiError;

static PREFERRED_IFACE: &str = "eth1";

/// Resolves the address the local initiator uses to reach the target.
pub trait HostAddress {
    fn ip_to_host(&self) -> Result<String>;
}

/// Picks the host-facing IPv4 address from the local interfaces.
#[derive(Debug, Default, Clone)]
pub struct HostIp;

impl HostAddress for HostIp {
    fn ip_to_host(&self) -> Result<String> {
        let addrs = getifaddrs()?
            .filter_map(|ifa| {
                let ip = ifa.address.as_ref()?.as_sockaddr_in()?.ip();
                Some((ifa.interface_name.clone(), Ipv4Addr::from(ip)))
            })
            .collect::<Vec<(String, Ipv4Addr)>>();

        select_ip(&addrs)
            .map(|ip| ip.to_string())
            .ok_or_else(|| IscsiError::NoHostIp.into())
    }
}

/// `eth1` is usually the interface attached to the host network, otherwise
/// the first non-loopback address wins
fn select_ip(addrs: &[(String, Ipv4Addr)]) -> Option<Ipv4Addr> {
    let usable = |ip: &Ipv4Addr| !ip.is_loopback() && !ip.is_unspecified();

    addrs
        .iter()
        .find(|(name, ip)| name == PREFERRED_IFACE && usable(ip))
        .or_else(|| addrs.iter().find(|(_, ip)| usable(ip)))
        .map(|(_, ip)| *ip)
}
