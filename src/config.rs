//! Configuration loading.
//!
//! The daemon's declarative input is a small TOML document naming the DNS
//! server to resolve against and the domains and addresses that must be
//! routed through the VPN. The document can live on the local filesystem,
//! behind an `https://` URL, or in KBFS; change detection compares the raw
//! bytes of successive reads, so "the file didn't change" means exactly
//! that.

use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// DNS server used when the config does not name one.
const DEFAULT_DNS_SERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    #[serde(rename = "DNSServer")]
    dns_server: Option<String>,
    #[serde(rename = "VPNRoutes", default)]
    vpn_routes: VpnRoutesToml,
}

#[derive(Debug, Default, Deserialize)]
struct VpnRoutesToml {
    #[serde(rename = "Domains", default)]
    domains: Vec<String>,
    #[serde(rename = "IPs", default)]
    ips: Vec<String>,
}

/// Parsed daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Server queried for A records.
    pub dns_server: Ipv4Addr,
    /// Domains whose resolved addresses route through the VPN.
    pub vpn_domains: Vec<String>,
    /// Addresses that always route through the VPN.
    pub vpn_ips: Vec<Ipv4Addr>,
}

/// Where configuration bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A filesystem path.
    File(PathBuf),
    /// An `https://` URL fetched with a plain GET.
    Https(String),
    /// A KBFS path read via `keybase fs read` as the named local user.
    Keybase {
        /// Local system username whose uid/gid run the keybase command.
        user: String,
        /// KBFS path below `keybase://`, e.g. `team/acme/vpn/config.toml`.
        path: String,
    },
}

impl ConfigSource {
    /// Parses a config path argument into one of the three source forms.
    ///
    /// `keybase@<local-username>://<team|private|public>/...` selects KBFS,
    /// `https://...` selects HTTP, anything else is a filesystem path.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.starts_with("keybase") {
            return Self::parse_keybase(spec);
        }
        if spec.starts_with("https://") {
            return Ok(Self::Https(spec.to_string()));
        }
        Ok(Self::File(PathBuf::from(spec)))
    }

    fn parse_keybase(spec: &str) -> Result<Self> {
        let bad = || {
            Error::ConfigRead(format!(
                "bad KBFS config path {spec:?}: expected \
                 keybase@<local-username>://<team|private|public>/..."
            ))
        };
        let rest = spec.strip_prefix("keybase@").ok_or_else(bad)?;
        let (user, path) = rest.split_once("://").ok_or_else(bad)?;
        let user_ok = user.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && user
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let path_ok = ["team", "private", "public"]
            .iter()
            .any(|top| path == *top || path.starts_with(&format!("{top}/")));
        if !user_ok || !path_ok {
            return Err(bad());
        }
        Ok(Self::Keybase {
            user: user.to_string(),
            path: path.to_string(),
        })
    }

    fn read_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::File(path) => {
                debug!(path = %path.display(), "reading config from filesystem");
                Ok(std::fs::read(path)?)
            }
            Self::Https(url) => {
                debug!(url = %url, "reading config over HTTPS");
                let resp = reqwest::blocking::get(url)?.error_for_status()?;
                Ok(resp.bytes()?.to_vec())
            }
            Self::Keybase { user, path } => {
                let kbfs_path = format!("keybase://{path}");
                debug!(user = %user, path = %kbfs_path, "reading config from KBFS");
                let account = nix::unistd::User::from_name(user)
                    .map_err(|e| Error::ConfigRead(format!("looking up user {user}: {e}")))?
                    .ok_or_else(|| Error::ConfigRead(format!("no such user: {user}")))?;
                let output = Command::new("keybase")
                    .args(["fs", "read", &kbfs_path])
                    .uid(account.uid.as_raw())
                    .gid(account.gid.as_raw())
                    .output()?;
                if !output.status.success() {
                    return Err(Error::ConfigRead(format!(
                        "keybase fs read exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                Ok(output.stdout)
            }
        }
    }
}

/// Parses and validates raw configuration bytes.
///
/// A missing `DNSServer` falls back to 8.8.8.8; an unparseable one is an
/// error. Entries in `IPs` that do not parse, or parse to something other
/// than an IPv4 (or IPv4-mapped) address, are dropped with a warning.
pub fn parse_config(data: &[u8]) -> Result<Config> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::ConfigRead(format!("config is not UTF-8: {e}")))?;
    let raw: ConfigToml = toml::from_str(text)?;

    let dns_server = match raw.dns_server.as_deref() {
        None | Some("") => {
            debug!("DNSServer missing; using {DEFAULT_DNS_SERVER}");
            DEFAULT_DNS_SERVER
        }
        Some(s) => s
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("{s} is not a valid IPv4 address")))?,
    };

    let mut vpn_ips = Vec::new();
    for entry in &raw.vpn_routes.ips {
        match entry.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => vpn_ips.push(ip),
            Ok(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => vpn_ips.push(v4),
                None => warn!(ip = %entry, "ignoring non-IPv4 address"),
            },
            Err(_) => warn!(ip = %entry, "ignoring invalid IP"),
        }
    }

    Ok(Config {
        dns_server,
        vpn_domains: raw.vpn_routes.domains,
        vpn_ips,
    })
}

/// Loads configuration from a [`ConfigSource`] and tracks change across
/// loads by byte equality of the raw reads.
pub struct ConfigLoader {
    source: ConfigSource,
    last_bytes: Option<Vec<u8>>,
}

impl ConfigLoader {
    /// Creates a loader; the first successful load always reports changed.
    pub fn new(source: ConfigSource) -> Self {
        Self {
            source,
            last_bytes: None,
        }
    }

    /// Reads, parses and validates the configuration.
    ///
    /// The returned flag is true when the raw bytes differ from the
    /// previous read. The bytes are recorded even when parsing fails, so a
    /// later fix of the same document is reported as a change.
    pub fn load(&mut self) -> Result<(Config, bool)> {
        let data = self.source.read_bytes()?;
        let changed = self.last_bytes.as_deref() != Some(data.as_slice());
        let parsed = parse_config(&data);
        self.last_bytes = Some(data);
        Ok((parsed?, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn full_config_parses() {
        let config = parse_config(
            br#"
DNSServer = "1.1.1.1"

[VPNRoutes]
Domains = ["example.com", "api.example"]
IPs = ["18.214.166.21", "8.8.8.8"]
"#,
        )
        .unwrap();

        assert_eq!(config.dns_server, "1.1.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(config.vpn_domains, vec!["example.com", "api.example"]);
        assert_eq!(
            config.vpn_ips,
            vec![
                "18.214.166.21".parse::<Ipv4Addr>().unwrap(),
                "8.8.8.8".parse::<Ipv4Addr>().unwrap(),
            ]
        );
    }

    #[test]
    fn missing_dns_server_defaults() {
        let config = parse_config(b"[VPNRoutes]\nIPs = [\"8.8.4.4\"]\n").unwrap();
        assert_eq!(config.dns_server, DEFAULT_DNS_SERVER);
    }

    #[test]
    fn empty_config_is_valid() {
        let config = parse_config(b"").unwrap();
        assert_eq!(config.dns_server, DEFAULT_DNS_SERVER);
        assert!(config.vpn_domains.is_empty());
        assert!(config.vpn_ips.is_empty());
    }

    #[test]
    fn unparseable_dns_server_is_fatal() {
        assert!(matches!(
            parse_config(b"DNSServer = \"not-an-ip\"\n"),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn bad_ip_entries_are_dropped() {
        let config = parse_config(
            br#"
[VPNRoutes]
IPs = ["10.0.0.1", "bogus", "fd00::1", "::ffff:192.0.2.7"]
"#,
        )
        .unwrap();
        assert_eq!(
            config.vpn_ips,
            vec![
                "10.0.0.1".parse::<Ipv4Addr>().unwrap(),
                "192.0.2.7".parse::<Ipv4Addr>().unwrap(),
            ]
        );
    }

    #[test]
    fn source_forms_parse() {
        assert_eq!(
            ConfigSource::parse("/etc/splitroutesd.toml").unwrap(),
            ConfigSource::File(PathBuf::from("/etc/splitroutesd.toml"))
        );
        assert_eq!(
            ConfigSource::parse("https://config.example.com/vpn.toml").unwrap(),
            ConfigSource::Https("https://config.example.com/vpn.toml".to_string())
        );
        assert_eq!(
            ConfigSource::parse("keybase@alice://team/acme/vpn/config.toml").unwrap(),
            ConfigSource::Keybase {
                user: "alice".to_string(),
                path: "team/acme/vpn/config.toml".to_string(),
            }
        );
    }

    #[test]
    fn malformed_keybase_paths_are_rejected() {
        for bad in [
            "keybase://team/acme/config.toml",
            "keybase@alice:/team/acme",
            "keybase@alice://secret/acme",
            "keybase@Alice://team/acme",
        ] {
            assert!(ConfigSource::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn loader_tracks_byte_identity() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "DNSServer = \"8.8.8.8\"\n").unwrap();
        file.flush().unwrap();

        let mut loader = ConfigLoader::new(ConfigSource::File(file.path().to_path_buf()));

        let (first, changed) = loader.load().unwrap();
        assert!(changed);

        let (second, changed) = loader.load().unwrap();
        assert!(!changed);
        assert_eq!(first, second);

        write!(file, "\n[VPNRoutes]\nIPs = [\"10.0.0.1\"]\n").unwrap();
        file.flush().unwrap();
        let (third, changed) = loader.load().unwrap();
        assert!(changed);
        assert_eq!(third.vpn_ips.len(), 1);
    }

    #[test]
    fn loader_records_bytes_even_when_parse_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "DNSServer = \"bogus\"\n").unwrap();
        file.flush().unwrap();

        let mut loader = ConfigLoader::new(ConfigSource::File(file.path().to_path_buf()));
        assert!(loader.load().is_err());
        assert!(loader.load().is_err());

        // Fixing the document counts as a change against the recorded
        // broken bytes.
        file.as_file().set_len(0).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        write!(file, "DNSServer = \"9.9.9.9\"\n").unwrap();
        file.flush().unwrap();
        let (_, changed) = loader.load().unwrap();
        assert!(changed);
    }
}
