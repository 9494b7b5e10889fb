//! splitroutesd binary entry point.

use std::time::Duration;

use clap::Parser;
use splitroutesd::rib::RouteKernel;
use splitroutesd::{telemetry, ConfigLoader, ConfigSource, Driver, InterfaceNames, MemoryResolver};
use tracing::info;

/// Split-tunnel VPN route reconciliation daemon for macOS.
#[derive(Parser, Debug)]
#[command(name = "splitroutesd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the config file: a filesystem path, an https:// URL, or
    /// keybase@<local-username>://<team|private|public>/...
    #[arg(short, long)]
    config: Option<String>,

    /// Turn on debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Seconds between reconciliation cycles.
    #[arg(long, default_value_t = 60)]
    interval: u64,

    /// Primary interface name (leave empty to auto detect).
    #[arg(short = 'i', long)]
    primary_interface: Option<String>,

    /// VPN interface name (leave empty to auto detect).
    #[arg(short = 'j', long)]
    vpn_interface: Option<String>,
}

#[cfg(target_os = "macos")]
fn platform_kernel() -> std::io::Result<Box<dyn RouteKernel + Send>> {
    Ok(Box::new(splitroutesd::rib::DarwinKernel))
}

#[cfg(not(target_os = "macos"))]
fn platform_kernel() -> std::io::Result<Box<dyn RouteKernel + Send>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "the routing backend requires the Darwin routing socket",
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let interfaces = match (args.primary_interface, args.vpn_interface) {
        (Some(primary), Some(vpn)) => Some(InterfaceNames { primary, vpn }),
        (None, None) => None,
        _ => {
            eprintln!(
                "error: --primary-interface and --vpn-interface must be supplied or omitted together"
            );
            std::process::exit(1);
        }
    };
    let Some(config_path) = args.config else {
        eprintln!("error: --config is required");
        std::process::exit(1);
    };
    let source = match ConfigSource::parse(&config_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    telemetry::init(args.verbose)?;

    let kernel = match platform_kernel() {
        Ok(kernel) => kernel,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    info!(
        config = %config_path,
        interval = args.interval,
        auto_detect = interfaces.is_none(),
        "starting splitroutesd"
    );

    let mut driver = Driver::new(
        ConfigLoader::new(source),
        MemoryResolver::new(),
        kernel,
        interfaces,
    );

    // First tick fires immediately, so a cycle runs at startup.
    let mut interval = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }

        // Cycles are blocking (sysctl, routing socket, UDP) and never
        // overlap: the next tick is not consulted until this one finishes.
        let (returned, report) = tokio::task::spawn_blocking(move || {
            let mut driver = driver;
            let report = driver.run_once();
            (driver, report)
        })
        .await?;
        driver = returned;

        info!(result = %report, "cycle complete");
    }

    info!("splitroutesd shutdown complete");
    Ok(())
}
