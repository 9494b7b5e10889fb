//! The reconciliation driver.
//!
//! Sequences one cycle: reload configuration, resolve the configured
//! domains, merge with the configured addresses, reconcile the kernel
//! routing table. Each stage reports changed/unchanged/error; no state is
//! carried between cycles beyond the resolver's memory, the previous
//! config bytes and the previous DNS result.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, debug_span, error};

use crate::config::ConfigLoader;
use crate::detect::InterfaceNames;
use crate::metrics;
use crate::reconcile;
use crate::resolver::MemoryResolver;
use crate::rib::RouteKernel;

/// Outcome of one driver stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// The stage ran and its inputs were identical to the previous cycle.
    Unchanged,
    /// The stage ran and observed or made a change.
    Changed,
    /// The stage failed; later stages did not run.
    Error,
}

impl StageStatus {
    /// Status rendered as it appears in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "UNCHANGED",
            Self::Changed => "CHANGED",
            Self::Error => "ERR",
        }
    }

    fn from_changed(changed: bool) -> Self {
        if changed {
            Self::Changed
        } else {
            Self::Unchanged
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage outcome of one reconciliation cycle.
///
/// Stages that never ran because an earlier one failed are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Configuration load outcome.
    pub config: StageStatus,
    /// DNS resolution outcome.
    pub dns: Option<StageStatus>,
    /// Route reconciliation outcome.
    pub routes: Option<StageStatus>,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = |status: Option<StageStatus>| status.map_or("-", StageStatus::as_str);
        write!(
            f,
            "config={} dns={} routes={}",
            self.config.as_str(),
            stage(self.dns),
            stage(self.routes)
        )
    }
}

/// Drives reconciliation cycles.
///
/// Owns the configuration loader, the DNS memory resolver and the kernel
/// handle. A scheduler calls [`run_once`](Self::run_once) at startup and
/// then at a fixed interval; cycles never overlap.
pub struct Driver {
    loader: ConfigLoader,
    resolver: MemoryResolver,
    kernel: Box<dyn RouteKernel + Send>,
    interfaces: Option<InterfaceNames>,
    last_dns_ips: BTreeSet<Ipv4Addr>,
}

impl Driver {
    /// Creates a driver. `interfaces` overrides auto-detection when given.
    pub fn new(
        loader: ConfigLoader,
        resolver: MemoryResolver,
        kernel: Box<dyn RouteKernel + Send>,
        interfaces: Option<InterfaceNames>,
    ) -> Self {
        Self {
            loader,
            resolver,
            kernel,
            interfaces,
            last_dns_ips: BTreeSet::new(),
        }
    }

    /// Runs one reconciliation cycle and reports per-stage outcomes.
    pub fn run_once(&mut self) -> CycleReport {
        let _span = debug_span!("cycle").entered();

        let (config, config_changed) = match self.loader.load() {
            Ok(loaded) => loaded,
            Err(err) => {
                error!(error = %err, "loading config failed");
                let report = CycleReport {
                    config: StageStatus::Error,
                    dns: None,
                    routes: None,
                };
                record_cycle(&report);
                return report;
            }
        };
        let config_status = StageStatus::from_changed(config_changed);
        debug!(?config, "using config");

        // The union of every non-expired address for every configured
        // domain. Change is set equality against the previous cycle; a
        // reordered answer is not a change.
        let mut resolved: BTreeSet<Ipv4Addr> = BTreeSet::new();
        for domain in &config.vpn_domains {
            resolved.extend(self.resolver.get(config.dns_server, domain));
        }
        let dns_status = StageStatus::from_changed(resolved != self.last_dns_ips);
        self.last_dns_ips = resolved.clone();
        debug!(count = resolved.len(), "addresses from DNS");

        let mut vpn_ips = resolved;
        vpn_ips.extend(config.vpn_ips.iter().copied());
        metrics::record_vpn_ips(vpn_ips.len());

        let routes_status = match reconcile::apply_routes(
            self.kernel.as_mut(),
            self.interfaces.as_ref(),
            &vpn_ips,
        ) {
            Ok(changed) => StageStatus::from_changed(changed),
            Err(err) => {
                error!(error = %err, "applying routes failed");
                StageStatus::Error
            }
        };

        let report = CycleReport {
            config: config_status,
            dns: Some(dns_status),
            routes: Some(routes_status),
        };
        record_cycle(&report);
        report
    }
}

fn record_cycle(report: &CycleReport) {
    let stage = |status: Option<StageStatus>| status.map_or("-", StageStatus::as_str);
    metrics::record_cycle(
        report.config.as_str(),
        stage(report.dns),
        stage(report.routes),
    );
}
