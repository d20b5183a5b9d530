//! Gateway API conformance harness

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gateway_conformance::suite::BundleRegistry;
use gateway_conformance::{Cli, Harness, RunStatus};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "conformance harness failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> gateway_conformance::Result<ExitCode> {
    let config = cli.run.into_config()?;
    if !config.enabled {
        info!("conformance run disabled; pass --enabled or set CONFORMANCE_ENABLED=true");
        return Ok(ExitCode::SUCCESS);
    }

    let registry = Arc::new(BundleRegistry::load(&config.registry_dir)?);
    let harness = Harness::new(config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; tearing down");
            on_signal.cancel();
        }
    });

    match harness.run(registry, cancel).await? {
        RunStatus::Disabled => Ok(ExitCode::SUCCESS),
        RunStatus::Completed(report) => {
            info!(path = %report.path.display(), "conformance report written");
            if report.document.has_failures() {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}
