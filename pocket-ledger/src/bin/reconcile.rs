//! Ledger reconciliation binary
//!
//! ```text
//! ledger-reconcile [CONFIG.toml] [--watch] [--json]
//! ```
//!
//! Opens the store, runs one full reconciliation pass and reports it. With
//! `--watch` (or `reconcile.scheduled` in the config) the scheduled reconciler
//! keeps running until Ctrl-C.

use anyhow::Context;
use pocket_ledger::{spawn_reconciler, Config, Ledger};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut watch = false;
    let mut json = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--watch" => watch = true,
            "--json" => json = true,
            flag if flag.starts_with("--") => anyhow::bail!("Unknown flag {}", flag),
            path => config_path = Some(path.to_string()),
        }
    }

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match &config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::from_env().context("Failed to load config from environment")?,
    };
    // This process reports the pass itself
    config.reconcile.on_open = false;

    tracing::info!(data_dir = ?config.data_dir, "Starting ledger reconciliation");

    let ledger = Ledger::open(config).await.context("Failed to open ledger")?;

    let report = ledger.reconcile().await?;
    for drift in &report.drifts {
        tracing::warn!(
            ctx = %drift.ctx,
            kind = ?drift.kind,
            account = %drift.account,
            cached = %drift.cached,
            recomputed = %drift.recomputed,
            "Drift corrected"
        );
    }
    tracing::info!(
        leaves = report.leaves_checked,
        roots = report.roots_checked,
        drifts = report.drifts.len(),
        failures = report.failures.len(),
        "Reconciliation pass finished"
    );

    if watch || ledger.config().reconcile.scheduled {
        let every = Duration::from_secs(ledger.config().reconcile.interval_secs.max(1));
        let ledger = Arc::new(ledger);
        let reconciler = spawn_reconciler(Arc::clone(&ledger), every);

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down reconciler");

        let passes = reconciler.shutdown().await?;
        tracing::info!(passes, "Scheduled passes completed");

        let ledger = Arc::try_unwrap(ledger)
            .map_err(|_| anyhow::anyhow!("Ledger still in use at shutdown"))?;
        ledger.shutdown()?;
    } else {
        ledger.shutdown()?;
    }

    if !report.is_success() {
        anyhow::bail!("{} account(s) could not be reconciled", report.failures.len());
    }
    Ok(())
}
