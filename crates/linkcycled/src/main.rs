//! linkcycled - SD-WAN link watchdog
//!
//! Polls BFD session state from vManage for each configured site and
//! power-cycles the site's modem outlet on the UPS when the transport stays
//! down for `trigger.count` consecutive polls.

use anyhow::{Context, Result};
use clap::Parser;
use linkcycle_common::{Credentials, MonitorConfig, DEFAULT_CONFIG_PATH};
use linkcycled::eaton::EatonClient;
use linkcycled::logging;
use linkcycled::scheduler::Scheduler;
use linkcycled::vmanage::VManageClient;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code for configuration errors (EX_CONFIG)
const EXIT_CONFIG: i32 = 78;

#[derive(Debug, Parser)]
#[command(name = "linkcycled", version, about = "Power-cycle site modems when SD-WAN links stay down")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate configuration and credentials, then exit
    #[arg(long)]
    check_config: bool,

    /// Log filter (overrides RUST_LOG and LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    logging::init(args.log_level.as_deref())?;

    info!("[BOOT] linkcycled v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match MonitorConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("[FATAL] Failed to validate {}: {}", args.config.display(), e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let credentials = match Credentials::from_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!("[FATAL] {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if args.check_config {
        info!(
            "Configuration OK: {} site(s), interval {:?}, threshold {}",
            config.sites.len(),
            config.policy.poll_interval,
            config.policy.failure_threshold
        );
        return Ok(());
    }

    // Per-request limit: half the per-tick telemetry budget
    let telemetry = VManageClient::new(
        credentials.sdwan,
        config.site_ids(),
        config.policy.telemetry_timeout / 2,
        config.verify_tls,
    )?;
    telemetry
        .login()
        .await
        .context("Failed to authenticate to vManage")?;
    if let Err(e) = telemetry.refresh_inventory().await {
        warn!("Failed to collect device info: {:#}", e);
    }

    let remediator = EatonClient::new(credentials.ups, config.ups, config.verify_tls)?;
    let scheduler = Scheduler::new(&config, Arc::new(telemetry), Arc::new(remediator));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    info!("[READY] linkcycled monitoring {} site(s)", scheduler.site_count());
    scheduler.run(cancel).await;

    info!("Shutting down gracefully");
    Ok(())
}

/// Cancel on Ctrl-C or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C. Quitting..."),
        _ = terminate => info!("Received SIGTERM. Quitting..."),
    }
    cancel.cancel();
}
