//! splitroutesd - split-tunnel VPN route reconciliation for macOS.
//!
//! A long-running daemon that keeps the kernel's IPv4 routing table
//! converged with a declarative specification: a curated set of addresses,
//! plus every address currently or recently resolved for a curated set of
//! domains, must be reached through the VPN interface; everything else
//! goes through the primary interface.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        splitroutesd                           │
//! │                                                               │
//! │   config loader ──┐                                           │
//! │   (file/https/    │    ┌──────────────────┐                   │
//! │    keybase)       ├───▶│      driver      │ one cycle per     │
//! │                   │    │   (run_once)     │ tick              │
//! │   memory resolver ┘    └────────┬─────────┘                   │
//! │   (UDP :53, TTL-bounded         │                             │
//! │    address memory)              ▼                             │
//! │                        ┌──────────────────┐                   │
//! │                        │    reconciler    │◀── RIB via sysctl │
//! │                        │  (diff + codec)  │──▶ PF_ROUTE socket│
//! │                        └──────────────────┘                   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each cycle the driver reloads configuration, asks the resolver for the
//! current per-domain address set, deduplicates the union with the
//! configured addresses, and hands the result to the reconciler, which
//! diffs it against the kernel RIB and writes the add/delete messages that
//! converge the two. The resolver deliberately remembers addresses past
//! the most recent answer (until TTL expiry) so that routes survive load
//! balancer rotations.
//!
//! ## Example
//!
//! ```rust,ignore
//! use splitroutesd::{ConfigLoader, ConfigSource, Driver, MemoryResolver};
//! use splitroutesd::rib::DarwinKernel;
//!
//! let loader = ConfigLoader::new(ConfigSource::parse("/etc/splitroutesd.toml")?);
//! let mut driver = Driver::new(loader, MemoryResolver::new(), Box::new(DarwinKernel), None);
//! let report = driver.run_once();
//! println!("{report}");
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod detect;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod reconcile;
pub mod resolver;
pub mod rib;
pub mod telemetry;

// Re-export main types
pub use config::{Config, ConfigLoader, ConfigSource};
pub use detect::InterfaceNames;
pub use driver::{CycleReport, Driver, StageStatus};
pub use error::Error;
pub use reconcile::Interface;
pub use resolver::MemoryResolver;
