//! Metrics instrumentation.
//!
//! All metrics are prefixed with `splitroutesd.`

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record the outcome of one reconciliation cycle.
pub fn record_cycle(config: &str, dns: &str, routes: &str) {
    counter!(
        "splitroutesd.cycle.count",
        "config" => config.to_string(),
        "dns" => dns.to_string(),
        "routes" => routes.to_string()
    )
    .increment(1);
}

/// Record a DNS lookup attempt.
pub fn record_dns_lookup(success: bool, duration: Duration) {
    let result = if success { "success" } else { "error" };
    counter!("splitroutesd.dns.lookup.count", "result" => result).increment(1);
    histogram!("splitroutesd.dns.lookup.duration.seconds", "result" => result)
        .record(duration.as_secs_f64());
}

/// Record the number of remembered resolver entries across all domains.
pub fn record_dns_remembered(count: usize) {
    gauge!("splitroutesd.dns.remembered").set(count as f64);
}

/// Record resolver entries dropped by a purge.
pub fn record_dns_purged(count: usize) {
    counter!("splitroutesd.dns.purged.count").increment(count as u64);
}

/// Record the deletes and adds queued by a reconciliation pass.
pub fn record_routes_queued(deletes: usize, adds: usize) {
    counter!("splitroutesd.routes.deletes.count").increment(deletes as u64);
    counter!("splitroutesd.routes.adds.count").increment(adds as u64);
}

/// Record a failed routing-socket write.
pub fn record_route_write_error() {
    counter!("splitroutesd.routes.write_errors.count").increment(1);
}

/// Record the size of the deduplicated VPN destination set.
pub fn record_vpn_ips(count: usize) {
    gauge!("splitroutesd.routes.vpn_ips").set(count as f64);
}
