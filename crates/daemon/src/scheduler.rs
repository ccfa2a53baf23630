//! Pass scheduler: runs update passes on a configurable interval and
//! supports webhook-triggered immediate passes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time;
use tracing::{info, warn};

use imagesync_core::orchestrator::{Orchestrator, PassSummary};
use imagesync_core::registry::TagSource;

/// Tracks aggregate statistics across passes.
pub struct SchedulerStats {
    pub total_passes: AtomicU64,
    pub total_updated: AtomicU64,
    pub total_failed: AtomicU64,
}

impl SchedulerStats {
    fn new() -> Self {
        Self {
            total_passes: AtomicU64::new(0),
            total_updated: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }
}

/// The pass scheduler.
///
/// Runs passes on a timer and also listens for webhook-triggered immediate
/// pass requests. If a pass is already running, the trigger is skipped
/// rather than queued.
pub struct Scheduler<S> {
    orchestrator: Arc<Orchestrator<S>>,
    poll_interval: Duration,
    trigger_rx: mpsc::Receiver<()>,
    last_summary: Arc<RwLock<Option<PassSummary>>>,
    running: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
}

impl<S: TagSource + 'static> Scheduler<S> {
    pub fn new(
        orchestrator: Arc<Orchestrator<S>>,
        poll_interval: Duration,
        trigger_rx: mpsc::Receiver<()>,
        last_summary: Arc<RwLock<Option<PassSummary>>>,
    ) -> Self {
        Self {
            orchestrator,
            poll_interval,
            trigger_rx,
            last_summary,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SchedulerStats::new()),
        }
    }

    /// Main scheduler loop; returns when `shutdown` is notified.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "scheduler started"
        );

        let mut interval = time::interval(self.poll_interval);
        // The first tick fires immediately; that is the startup pass.
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.maybe_run_pass("scheduled").await;
                }
                Some(()) = self.trigger_rx.recv() => {
                    info!("immediate pass requested via webhook");
                    self.maybe_run_pass("webhook").await;
                    // Reset the interval so we don't run again too soon.
                    interval.reset();
                }
                _ = shutdown.notified() => {
                    info!("scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// Attempt to run a pass. If one is already running, skip.
    async fn maybe_run_pass(&self, trigger: &str) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(trigger, "skipping pass: previous pass still running");
            return;
        }

        let pass_num = self.stats.total_passes.fetch_add(1, Ordering::SeqCst) + 1;
        info!(pass = pass_num, trigger, "starting pass");

        let summary = self.orchestrator.run_pass().await;
        self.stats
            .total_updated
            .fetch_add(summary.updated() as u64, Ordering::SeqCst);
        self.stats
            .total_failed
            .fetch_add(summary.failed() as u64, Ordering::SeqCst);
        info!(
            pass = pass_num,
            updated = summary.updated(),
            failed = summary.failed(),
            repositories = summary.results.len(),
            "pass completed"
        );

        *self.last_summary.write().await = Some(summary);
        self.running.store(false, Ordering::SeqCst);
    }
}
