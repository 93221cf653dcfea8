//! storctl daemon
//!
//! Loads the server configuration, builds the storage control service and
//! the engine harness, optionally formats storage, then supervises the
//! engines until interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storctl::{
    BdevClass, BdevConfig, BdevProvider, Configuration, Forwarder, ForwardingPolicy,
    ForwardingProvider, IOServerHarness, IOServerInstance, LinuxExt, ProcessRunner, ProviderSpec,
    Result, ScmProvider, StorageControlService, StorageProviderRef, SystemExtRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// storctl - storage engine supervisor and storage administration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, env = "STORCTL_CONFIG", default_value = "/etc/storctl/storctl.yml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Metrics server bind address, overriding the configuration file
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Format storage before starting the engines
    #[arg(long)]
    format: bool,

    /// Reformat storage that is already formatted
    #[arg(long, requires = "format")]
    force: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting storctl");
    info!("  Version: {}", storctl::VERSION);
    info!("  Config: {}", args.config.display());

    let config = Configuration::load(&args.config)?;
    let ext: SystemExtRef = Arc::new(LinuxExt::new());

    let policy = ForwardingPolicy::resolve(ext.as_ref());
    let forwarder = Arc::new(Forwarder::new(
        policy,
        config.helper.descriptor(),
        config.helper.timeout(),
    ));
    info!("  Privileged requests: {}", policy);

    if policy.should_forward() {
        match forwarder.ping().await {
            Ok(pong) => info!(helper = %config.helper.name, %pong, "Privileged helper reachable"),
            Err(e) => warn!(helper = %config.helper.name, error = %e, "Privileged helper unavailable"),
        }
    }

    // Start metrics server
    if let Some(metrics_addr) = args.metrics_addr.clone().or_else(|| config.metrics_addr.clone()) {
        tokio::spawn(async move {
            if let Err(e) = storctl::metrics::run_metrics_server(&metrics_addr).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let span = tracing::info_span!("storctl", system = %config.name);

    // Servers without a bdev class use every nvme device on the host
    let default_spec = BdevConfig {
        class: Some(BdevClass::Nvme),
        ..Default::default()
    };
    let default_bdev: StorageProviderRef = Arc::new(ForwardingProvider::new(
        ProviderSpec::Bdev(default_spec.clone()),
        Arc::new(BdevProvider::new(default_spec, ext.clone())?),
        forwarder.clone(),
    ));

    let svc = StorageControlService::new(
        span.clone(),
        ext.clone(),
        default_bdev,
        Arc::new(ScmProvider::new(ext.clone())),
        config.servers.clone(),
        forwarder.clone(),
    )?;

    let scan = svc.scan().await;
    for outcome in &scan.servers {
        match (&outcome.bdev, &outcome.scm) {
            (Ok(bdev), Ok(scm)) => info!(
                server = outcome.index,
                bdev_devices = bdev.devices.len(),
                scm_devices = scm.devices.len(),
                "Storage scanned"
            ),
            _ => warn!(server = outcome.index, "Storage scan incomplete"),
        }
    }

    // Build the harness
    let harness = IOServerHarness::new(span.clone());
    for server in &config.servers {
        let (bdev, scm) = svc.providers(server.index).ok_or_else(|| {
            storctl::Error::Configuration(format!("server {} has no providers", server.index))
        })?;
        let runner = Arc::new(ProcessRunner::new(server, &config.name));
        let instance = Arc::new(IOServerInstance::new(server.clone(), bdev, scm, runner));

        if args.format {
            let sb = instance.format_storage(&config.name, args.force).await?;
            info!(instance = server.index, uuid = %sb.uuid, "Storage formatted");
        } else {
            match instance.load_superblock() {
                Ok(Some(sb)) => info!(instance = server.index, uuid = %sb.uuid, "Found superblock"),
                Ok(None) => warn!(instance = server.index, "No superblock; storage not formatted"),
                Err(e) => warn!(instance = server.index, error = %e, "Unreadable superblock"),
            }
        }

        harness.add_instance(instance)?;
    }

    let cancel = CancellationToken::new();
    harness.start(cancel.clone()).await?;
    for (index, state) in harness.states() {
        info!(instance = index, %state, "Instance started");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupt received, stopping instances");
        }
        _ = harness.wait() => {
            info!("All instances exited");
        }
    }

    cancel.cancel();
    if let Err(e) = harness.stop_all().await {
        warn!("Stop failed: {}", e);
    }
    harness.wait().await;
    forwarder.shutdown().await;

    info!("storctl shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
