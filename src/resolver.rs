//! DNS memory resolver.
//!
//! Resolves domain names to IPv4 addresses, remembering previously answered
//! records until their TTL expires. Unlike a caching resolver this is not
//! about saving traffic: when a load balancer rotates the addresses behind
//! a name, clients elsewhere on the network may keep getting the old
//! records for as long as their caches allow, so both the old and the new
//! address sets must stay routed through the VPN. TTL expiry is the only
//! bound on how long an old address is kept.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics;

const DNS_PORT: u16 = 53;

// The spec of the UDP exchange imposes no timeout of its own; this stands
// in for a resolver-library default.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Remembered addresses for one domain, keyed by address with the absolute
/// expiry instant as value.
type DomainMemory = HashMap<Ipv4Addr, Instant>;

/// Resolver with process-lifetime memory of answered A records.
///
/// One mutex guards the whole table; lookups serialize on it, including the
/// blocking UDP exchange. The driving loop is low-frequency, so contention
/// is not a concern.
pub struct MemoryResolver {
    server_port: u16,
    timeout: Duration,
    table: Mutex<HashMap<String, DomainMemory>>,
}

impl MemoryResolver {
    /// Creates an empty resolver querying port 53.
    pub fn new() -> Self {
        Self {
            server_port: DNS_PORT,
            timeout: DEFAULT_QUERY_TIMEOUT,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the server port (useful for loopback tests).
    #[must_use]
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    /// Overrides the query timeout (useful for loopback tests).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns every non-expired address ever observed for `domain`.
    ///
    /// Performs one A query against `dns_server`, folds the answers into
    /// the memory table without ever shortening a remembered expiry, purges
    /// expired entries across all domains, and returns the surviving
    /// addresses for `domain`. A failed query is logged and the remembered
    /// (possibly empty) set is returned; a transient DNS outage must not
    /// withdraw VPN routes.
    pub fn get(&self, dns_server: Ipv4Addr, domain: &str) -> Vec<Ipv4Addr> {
        let fqdn = if domain.ends_with('.') {
            domain.to_string()
        } else {
            format!("{domain}.")
        };
        let server = SocketAddr::from(SocketAddrV4::new(dns_server, self.server_port));
        debug!(server = %server, domain = %fqdn, "resolving");

        let mut table = self.table.lock();
        let now = Instant::now();
        match self.exchange(server, &fqdn) {
            Ok(answers) => {
                metrics::record_dns_lookup(true, now.elapsed());
                ingest(table.entry(fqdn.clone()).or_default(), &fqdn, &answers, now);
            }
            Err(err) => {
                metrics::record_dns_lookup(false, now.elapsed());
                warn!(
                    domain = %fqdn,
                    error = %err,
                    "DNS lookup failed; keeping remembered addresses"
                );
            }
        }
        let purged = purge_expired(&mut table, now);
        if purged > 0 {
            metrics::record_dns_purged(purged);
        }
        metrics::record_dns_remembered(table.values().map(HashMap::len).sum());

        table
            .get(&fqdn)
            .map(|memory| memory.keys().copied().collect())
            .unwrap_or_default()
    }

    // One UDP exchange: A query, recursion desired, single attempt.
    fn exchange(&self, server: SocketAddr, fqdn: &str) -> Result<Vec<(Ipv4Addr, u32)>> {
        let name = Name::from_ascii(fqdn)?;
        let mut message = Message::new();
        message.set_id(rand::random());
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(name, RecordType::A));

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_write_timeout(Some(self.timeout))?;
        socket.send_to(&message.to_vec()?, server)?;

        let mut buf = [0u8; 4096];
        let (len, _) = socket.recv_from(&mut buf)?;
        let response = Message::from_vec(&buf[..len])?;
        if response.id() != message.id() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "response id {} does not match query id {}",
                    response.id(),
                    message.id()
                ),
            )
            .into());
        }

        Ok(response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                RData::A(a) => Some((a.0, record.ttl())),
                _ => None,
            })
            .collect())
    }
}

impl Default for MemoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

// Folds answers into a domain's memory. An answer only overwrites an
// existing entry when its expiry is strictly later; a shorter remaining
// TTL never shortens what is already remembered.
fn ingest(memory: &mut DomainMemory, domain: &str, answers: &[(Ipv4Addr, u32)], now: Instant) {
    for &(ip, ttl) in answers {
        let expires_at = now + Duration::from_secs(u64::from(ttl));
        if let Some(existing) = memory.get(&ip) {
            if *existing > expires_at {
                continue;
            }
        }
        memory.insert(ip, expires_at);
        debug!(domain = %domain, ip = %ip, ttl, "remembered resolver entry");
    }
}

// Removes entries whose expiry is not after `now`, across all domains.
fn purge_expired(table: &mut HashMap<String, DomainMemory>, now: Instant) -> usize {
    let mut total = 0;
    for (domain, memory) in table.iter_mut() {
        let before = memory.len();
        memory.retain(|_, expires_at| *expires_at > now);
        let purged = before - memory.len();
        if purged > 0 {
            debug!(domain = %domain, purged, "purged expired resolver entries");
            total += purged;
        }
    }
    total
}
