//! Route reconciliation.
//!
//! Drives the kernel routing table toward the desired state: every VPN
//! destination reached through the VPN interface as a host route, the
//! default route through the primary interface, and the VPN interface's
//! own address as a local route. The diff is computed from a RIB snapshot;
//! stale routes are deleted before missing routes are added.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use crate::detect::{self, InterfaceNames};
use crate::error::{Error, Result};
use crate::metrics;
use crate::rib::{
    flag_names, Addr, Gateway, RibMessage, RouteItem, RouteKernel, RouteMessage, RTAX_DST,
    RTAX_IFA, RTF_WASCLONED, RTM_ADD, RTM_DELETE,
};

/// A network interface as the reconciler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Interface name, e.g. `en0` or `utun6`.
    pub name: String,
    /// Kernel interface index; never zero.
    pub index: u16,
    /// Primary IPv4 bound to the interface.
    pub self_ip: Ipv4Addr,
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] index={} ip={}", self.name, self.index, self.self_ip)
    }
}

/// Looks up an interface by name in the interface RIB.
///
/// Walks the link entries for a matching name, then the address entries for
/// an IPv4 bound to that link. Either step coming up empty is an
/// [`Error::InterfaceNotFound`].
pub fn find_interface(kernel: &mut dyn RouteKernel, name: &str) -> Result<Interface> {
    let messages = kernel.fetch_interface_rib()?;
    interface_from_rib(&messages, name)
}

fn interface_from_rib(messages: &[RibMessage], name: &str) -> Result<Interface> {
    let mut index = 0u16;
    for msg in messages {
        if let RibMessage::Interface(im) = msg {
            if im.name == name && im.index != 0 {
                index = im.index;
                break;
            }
        }
    }
    if index == 0 {
        return Err(Error::InterfaceNotFound(name.to_string()));
    }

    for msg in messages {
        if let RibMessage::InterfaceAddr(am) = msg {
            if am.index != index {
                continue;
            }
            if let Some(Addr::Inet4(self_ip)) = am.addrs[RTAX_IFA] {
                return Ok(Interface {
                    name: name.to_string(),
                    index,
                    self_ip,
                });
            }
        }
    }
    Err(Error::InterfaceNotFound(format!("{name}: no bound IPv4")))
}

// The desired route set: the VPN interface's self-route, the default route
// through the primary interface, and one host route per VPN destination.
fn expected_items(
    primary: &Interface,
    vpn: &Interface,
    vpn_ips: &BTreeSet<Ipv4Addr>,
) -> BTreeMap<Ipv4Addr, RouteItem> {
    let mut expected = BTreeMap::new();
    expected.insert(
        vpn.self_ip,
        RouteItem {
            dst: vpn.self_ip,
            gateway: Gateway::Ip(vpn.self_ip),
            netmask: None,
            ifa: Some(vpn.self_ip),
        },
    );
    expected.insert(
        Ipv4Addr::UNSPECIFIED,
        RouteItem {
            dst: Ipv4Addr::UNSPECIFIED,
            gateway: Gateway::Link(primary.index),
            netmask: Some(Ipv4Addr::UNSPECIFIED),
            ifa: Some(primary.self_ip),
        },
    );
    for &ip in vpn_ips {
        expected.insert(
            ip,
            RouteItem {
                dst: ip,
                gateway: Gateway::Link(vpn.index),
                netmask: None,
                ifa: Some(vpn.self_ip),
            },
        );
    }
    expected
}

/// Reconciles the kernel routing table with the desired route set.
///
/// Returns whether any messages were written. Per-message write failures
/// are logged and skipped; fetch and socket-open failures fail the cycle
/// before anything is written.
pub fn reconcile(
    kernel: &mut dyn RouteKernel,
    primary: &Interface,
    vpn: &Interface,
    vpn_ips: &BTreeSet<Ipv4Addr>,
) -> Result<bool> {
    let expected = expected_items(primary, vpn, vpn_ips);
    let mut found: BTreeSet<Ipv4Addr> = BTreeSet::new();

    // The primary interface only matters for the default route; whatever
    // else is routed there is not our concern.
    let default_item = expected[&Ipv4Addr::UNSPECIFIED];
    for rm in &kernel.fetch_route_rib(primary.index)? {
        match rm.addrs[RTAX_DST] {
            Some(Addr::Inet4(dst)) if dst == Ipv4Addr::UNSPECIFIED => {}
            _ => continue,
        }
        if !default_item.matches(rm) {
            continue;
        }
        debug!(item = %default_item, "skipping existing route");
        found.insert(Ipv4Addr::UNSPECIFIED);
        break;
    }

    let mut next_seq = 1i32;
    let mut to_write: Vec<RouteMessage> = Vec::new();
    let mut deletes = 0usize;

    for rm in &kernel.fetch_route_rib(vpn.index)? {
        if rm.flags & RTF_WASCLONED != 0 {
            // transient cloned routes come and go on their own
            debug!(flags = %flag_names(rm.flags), "skipping cloned route");
            continue;
        }
        let dst = match rm.addrs[RTAX_DST] {
            Some(Addr::Inet4(dst)) => dst,
            _ => continue,
        };
        match expected.get(&dst) {
            Some(item) if item.matches(rm) => {
                found.insert(dst);
            }
            mismatched => {
                // Delete by re-sending the kernel's own message with the
                // type flipped and a fresh sequence number.
                let mut delete = rm.clone();
                delete.msg_type = RTM_DELETE;
                delete.seq = next_seq;
                next_seq += 1;
                match mismatched {
                    Some(item) => info!(
                        seq = delete.seq,
                        item = %item,
                        "queueing DELETE: route does not match expected item"
                    ),
                    None => info!(
                        seq = delete.seq,
                        dst = %dst,
                        "queueing DELETE: no expected item for destination"
                    ),
                }
                to_write.push(delete);
                deletes += 1;
            }
        }
    }

    for (dst, item) in &expected {
        if found.contains(dst) {
            debug!(item = %item, "skipping existing route");
            continue;
        }
        info!(seq = next_seq, item = %item, "queueing ADD");
        to_write.push(item.to_message(next_seq, vpn.index, RTM_ADD));
        next_seq += 1;
    }

    if to_write.is_empty() {
        debug!("routes are correct");
        return Ok(false);
    }
    metrics::record_routes_queued(deletes, to_write.len() - deletes);

    let mut socket = kernel.open_route_socket()?;
    info!(count = to_write.len(), "writing route messages");
    for msg in &to_write {
        if let Err(err) = socket.write_message(&msg.to_wire()) {
            metrics::record_route_write_error();
            warn!(seq = msg.seq, error = %err, "error writing route message");
        }
    }
    info!(count = to_write.len(), "done writing route messages");

    Ok(true)
}

/// One full pass: resolve interface names (auto-detecting when none are
/// given), look both interfaces up in the RIB, and reconcile.
pub fn apply_routes(
    kernel: &mut dyn RouteKernel,
    interfaces: Option<&InterfaceNames>,
    vpn_ips: &BTreeSet<Ipv4Addr>,
) -> Result<bool> {
    let names = match interfaces {
        Some(names) => names.clone(),
        None => {
            debug!("auto detecting interface names");
            detect::auto_detect()?
        }
    };
    if names.primary == names.vpn {
        return Err(Error::Interfaces(format!(
            "primary and VPN interface cannot both be {}",
            names.primary
        )));
    }

    let primary = find_interface(kernel, &names.primary)?;
    debug!(interface = %primary, "primary interface");
    let vpn = find_interface(kernel, &names.vpn)?;
    debug!(interface = %vpn, "VPN interface");

    reconcile(kernel, &primary, &vpn, vpn_ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::{InterfaceAddrMessage, InterfaceMessage, RTAX_MAX};

    fn link(name: &str, index: u16) -> RibMessage {
        RibMessage::Interface(InterfaceMessage {
            index,
            name: name.to_string(),
            flags: 0,
        })
    }

    fn bound_addr(index: u16, ip: &str) -> RibMessage {
        let mut addrs: [Option<Addr>; RTAX_MAX] = Default::default();
        addrs[RTAX_IFA] = Some(Addr::Inet4(ip.parse().unwrap()));
        RibMessage::InterfaceAddr(InterfaceAddrMessage { index, addrs })
    }

    #[test]
    fn interface_lookup_finds_link_and_address() {
        let messages = vec![
            link("en0", 4),
            link("utun6", 6),
            bound_addr(4, "10.0.1.7"),
            bound_addr(6, "10.100.0.2"),
        ];
        let ifce = interface_from_rib(&messages, "utun6").unwrap();
        assert_eq!(ifce.index, 6);
        assert_eq!(ifce.self_ip, "10.100.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn interface_lookup_fails_without_link() {
        let messages = vec![link("en0", 4), bound_addr(4, "10.0.1.7")];
        assert!(matches!(
            interface_from_rib(&messages, "utun6"),
            Err(Error::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn interface_lookup_fails_without_bound_ipv4() {
        let messages = vec![link("utun6", 6)];
        assert!(matches!(
            interface_from_rib(&messages, "utun6"),
            Err(Error::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn expected_map_covers_self_default_and_destinations() {
        let primary = Interface {
            name: "en0".to_string(),
            index: 4,
            self_ip: "10.0.1.7".parse().unwrap(),
        };
        let vpn = Interface {
            name: "utun6".to_string(),
            index: 6,
            self_ip: "10.100.0.2".parse().unwrap(),
        };
        let ips: BTreeSet<Ipv4Addr> = ["8.8.8.8", "8.8.4.4"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();

        let expected = expected_items(&primary, &vpn, &ips);
        assert_eq!(expected.len(), 4);

        let self_route = &expected[&vpn.self_ip];
        assert_eq!(self_route.gateway, Gateway::Ip(vpn.self_ip));
        assert!(self_route.netmask.is_none());

        let default = &expected[&Ipv4Addr::UNSPECIFIED];
        assert_eq!(default.gateway, Gateway::Link(primary.index));
        assert_eq!(default.netmask, Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(default.ifa, Some(primary.self_ip));

        let host = &expected[&"8.8.8.8".parse::<Ipv4Addr>().unwrap()];
        assert_eq!(host.gateway, Gateway::Link(vpn.index));
        assert!(host.netmask.is_none());
        assert_eq!(host.ifa, Some(vpn.self_ip));
    }
}
