//! Scheduled reconciliation
//!
//! A background task that runs a full reconciliation pass every interval
//! until it is told to stop. Passes go through the worker pool like any other
//! unit of work, so they interleave safely with postings.

use crate::{Ledger, ReconcileReport, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Handle to a running reconciler
#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<u64>,
}

impl ReconcilerHandle {
    /// Stop the task after any pass in flight; returns the number of passes run
    pub async fn shutdown(self) -> Result<u64> {
        // A panicked task has already dropped the receiver
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| crate::Error::Concurrency(format!("Reconciler task failed: {}", e)))
    }
}

/// Spawn the reconciler on the current runtime
///
/// The first pass runs one `every` after spawning; a pass that overruns the
/// interval delays the next tick instead of bunching them up. A pass that
/// fails to run is logged and the next tick tries again.
pub fn spawn_reconciler(ledger: Arc<Ledger>, every: Duration) -> ReconcilerHandle {
    spawn_passes(every, move || {
        let ledger = Arc::clone(&ledger);
        async move { ledger.reconcile().await }
    })
}

fn spawn_passes<F, Fut>(every: Duration, mut pass: F) -> ReconcilerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<ReconcileReport>> + Send + 'static,
{
    let (shutdown, mut stop) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let mut passes = 0u64;
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    match pass().await {
                        Ok(report) => {
                            passes += 1;
                            if !report.is_success() {
                                tracing::error!(
                                    failures = report.failures.len(),
                                    "Scheduled reconciliation incomplete"
                                );
                            } else if !report.drifts.is_empty() {
                                tracing::warn!(
                                    drifts = report.drifts.len(),
                                    "Scheduled reconciliation repaired balances"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Scheduled reconciliation failed to run");
                        }
                    }
                }
            }
        }

        tracing::info!(passes, "Reconciler stopped");
        passes
    });

    tracing::info!(interval_secs = every.as_secs_f64(), "Reconciler started");
    ReconcilerHandle { shutdown, task }
}
