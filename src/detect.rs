//! Primary/VPN interface auto-detection.
//!
//! When no interface names are supplied, the daemon asks `scutil --nwi`
//! which interfaces carry IPv4 state. Exactly two are expected: the one
//! reporting a `VPN server` line is the VPN interface and the other is the
//! primary. When neither reports a VPN server, a `utun<N>` name breaks the
//! tie. Anything else is ambiguous and fails the cycle.

use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

const SCUTIL: &str = "/usr/sbin/scutil";
const IPV4_BLOCK_MARKER: &str = "IPv4 network interface information";
const IPV6_BLOCK_MARKER: &str = "IPv6 network interface information";

/// Names of the primary and VPN interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceNames {
    /// The physical interface carrying non-VPN traffic.
    pub primary: String,
    /// The VPN tunnel interface.
    pub vpn: String,
}

/// Detects the primary/VPN interface pair from `scutil --nwi`.
pub fn auto_detect() -> Result<InterfaceNames> {
    let output = Command::new(SCUTIL).arg("--nwi").output()?;
    if !output.status.success() {
        return Err(Error::AutoDetect(format!(
            "{SCUTIL} --nwi exited with {}",
            output.status
        )));
    }
    let interfaces = scan_interfaces(&String::from_utf8_lossy(&output.stdout))?;
    classify(&interfaces)
}

#[derive(Debug)]
struct NwiInterface {
    name: String,
    is_vpn: bool,
}

// Scans the IPv4 block of `scutil --nwi` output. An interface starts at a
// `<name> : flags : ...` line; a following `VPN server : ...` line marks it
// as a VPN until the next interface or the end of the block.
fn scan_interfaces(output: &str) -> Result<Vec<NwiInterface>> {
    let mut lines = output.lines();
    if !lines.by_ref().any(|line| line.contains(IPV4_BLOCK_MARKER)) {
        return Err(Error::AutoDetect(
            "no IPv4 interface block in scutil output".to_string(),
        ));
    }

    let mut interfaces = Vec::new();
    let mut current: Option<NwiInterface> = None;
    for line in lines {
        if line.contains(IPV6_BLOCK_MARKER) {
            break;
        }
        if let Some(name) = interface_start(line) {
            if let Some(done) = current.take() {
                interfaces.push(done);
            }
            current = Some(NwiInterface {
                name,
                is_vpn: false,
            });
        } else if line.trim_start().starts_with("VPN server") {
            if let Some(ifce) = current.as_mut() {
                ifce.is_vpn = true;
            }
        }
    }
    if let Some(done) = current.take() {
        interfaces.push(done);
    }
    Ok(interfaces)
}

// `   utun6 : flags      : 0x5 (IPv4,DNS)` introduces an interface;
// attribute lines (`address`, `reach`, ...) and the REACH summary do not.
fn interface_start(line: &str) -> Option<String> {
    let (name, rest) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return None;
    }
    rest.trim_start()
        .starts_with("flags")
        .then(|| name.to_string())
}

fn classify(interfaces: &[NwiInterface]) -> Result<InterfaceNames> {
    if interfaces.len() != 2 {
        let names: Vec<&str> = interfaces.iter().map(|i| i.name.as_str()).collect();
        return Err(Error::AutoDetect(format!(
            "expected two interfaces, found {}: {names:?}",
            interfaces.len()
        )));
    }
    let (first, second) = (&interfaces[0], &interfaces[1]);
    match (first.is_vpn, second.is_vpn) {
        (true, true) => Err(Error::AutoDetect(
            "both interfaces report a VPN server".to_string(),
        )),
        (true, false) => Ok(InterfaceNames {
            primary: second.name.clone(),
            vpn: first.name.clone(),
        }),
        (false, true) => Ok(InterfaceNames {
            primary: first.name.clone(),
            vpn: second.name.clone(),
        }),
        (false, false) => {
            debug!("no interface reports a VPN server; falling back to interface names");
            match (is_utun(&first.name), is_utun(&second.name)) {
                (true, false) => Ok(InterfaceNames {
                    primary: second.name.clone(),
                    vpn: first.name.clone(),
                }),
                (false, true) => Ok(InterfaceNames {
                    primary: first.name.clone(),
                    vpn: second.name.clone(),
                }),
                _ => Err(Error::AutoDetect(format!(
                    "no VPN server reported and names are ambiguous: {} and {}",
                    first.name, second.name
                ))),
            }
        }
    }
}

fn is_utun(name: &str) -> bool {
    name.strip_prefix("utun")
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}
