//! storage_admin - privileged storage helper
//!
//! Reads provider requests from stdin, one JSON object per line, executes
//! them with the host's storage tools and answers on stdout. Logs go to
//! stderr so they never mix with responses.

use anyhow::Context;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use storctl::pbin::serve;
use storctl::{HelperDispatcher, LinuxExt, SystemExt};

/// Log filter variable; the helper logs warnings only by default
const LOG_ENV: &str = "STORAGE_ADMIN_LOG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let ext = Arc::new(LinuxExt::new());
    if !ext.is_privileged() {
        warn!("Running without administrative privilege; privileged operations will fail");
    }

    let dispatcher = HelperDispatcher::new(ext);
    let served = serve(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        &dispatcher,
    )
    .await
    .context("serving privileged requests")?;

    info!(served, "Input closed, exiting");
    Ok(())
}
