//! Timer-driven worker that claims due jobs and feeds them to the processor.
//!
//! Jobs inside a cycle are processed one after the other, so two jobs of the
//! same user are never in flight at once on one instance. Across instances the
//! lease taken by `db::claim_due_jobs` keeps claims disjoint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{RetryPolicy, WorkerSettings};
use crate::db::{self, Pool};
use crate::outbox::{self, OutboxReport};
use crate::processor::{process_job, JobOutcome};
use crate::transport::MessageTransport;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    pub sent: usize,
    pub cancelled: usize,
    pub deferred: usize,
    pub failed: usize,
    /// Jobs whose processing hit a store or internal error.
    pub errors: usize,
    pub outbox: OutboxReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CycleResult {
    Completed(CycleReport),
    /// The worker is switched off; nothing was claimed.
    Disabled,
    /// Another cycle was still in progress.
    AlreadyRunning,
    /// Claiming failed; the next tick tries again.
    Aborted { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub running: bool,
    pub enabled: bool,
    pub timer_active: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub processed: u64,
    pub failed: u64,
}

pub struct Worker {
    pool: Pool,
    transport: Arc<dyn MessageTransport>,
    settings: WorkerSettings,
    retry: RetryPolicy,
    worker_id: String,
    enabled: AtomicBool,
    running: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    last_cycle_at: Mutex<Option<DateTime<Utc>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("settings", &self.settings)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Clears the running flag when a cycle ends, even on panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Worker {
    /// Build a worker with an explicit initial on/off state.
    pub fn new(
        pool: Pool,
        transport: Arc<dyn MessageTransport>,
        settings: WorkerSettings,
        retry: RetryPolicy,
        enabled: bool,
    ) -> Self {
        Self {
            pool,
            transport,
            settings,
            retry,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            enabled: AtomicBool::new(enabled),
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_cycle_at: Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    /// Build a worker whose on/off state comes from the persisted setting.
    pub async fn load(
        pool: Pool,
        transport: Arc<dyn MessageTransport>,
        settings: WorkerSettings,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let enabled = db::load_worker_enabled(&pool).await?;
        Ok(Self::new(pool, transport, settings, retry, enabled))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Persist the switch and apply it to this instance.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        db::store_worker_enabled(&self.pool, enabled, Utc::now()).await?;
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(worker_id = %self.worker_id, enabled, "worker switch changed");
        Ok(())
    }

    /// Start the periodic timer. Calling it twice keeps the first timer.
    pub async fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().await;
        if timer.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let worker = Arc::clone(self);
        let period = self.settings.poll_interval();
        info!(worker_id = %self.worker_id, ?period, "campaign worker started");
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                worker.tick(Utc::now()).await;
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
            info!(worker_id = %self.worker_id, "campaign worker stopped");
        }
    }

    /// Timer entry point: honours the on/off switch. A stored value is
    /// re-read first so `campaignctl enable|disable` reaches a running daemon;
    /// without one the in-memory flag stands.
    pub async fn tick(&self, now: DateTime<Utc>) -> CycleResult {
        match db::get_worker_enabled(&self.pool).await {
            Ok(Some(enabled)) => self.enabled.store(enabled, Ordering::SeqCst),
            Ok(None) => {}
            Err(err) => warn!(?err, "could not refresh worker switch; keeping last value"),
        }
        if !self.is_enabled() {
            debug!("worker disabled; skipping cycle");
            return CycleResult::Disabled;
        }
        self.run_cycle(now).await
    }

    /// Run one cycle immediately, regardless of the on/off switch.
    pub async fn run_now(&self) -> CycleResult {
        self.run_cycle(Utc::now()).await
    }

    /// One claim/process pass. Never returns an error: per-job problems are
    /// logged and counted, a failed claim aborts only this cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleResult {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("previous cycle still running");
            return CycleResult::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.running);
        *self.last_cycle_at.lock().await = Some(now);

        let jobs = match db::claim_due_jobs(
            &self.pool,
            &self.worker_id,
            self.settings.batch_size,
            now,
            self.settings.claim_ttl(),
        )
        .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(?err, "failed to claim due jobs");
                return CycleResult::Aborted {
                    error: format!("{:#}", err),
                };
            }
        };

        let mut report = CycleReport {
            claimed: jobs.len(),
            ..Default::default()
        };
        for job in &jobs {
            match process_job(&self.pool, self.transport.as_ref(), &self.retry, job, now).await {
                Ok(outcome) => {
                    match &outcome {
                        JobOutcome::Sent { .. } => report.sent += 1,
                        JobOutcome::Cancelled { .. } => report.cancelled += 1,
                        JobOutcome::Deferred { .. } => report.deferred += 1,
                        JobOutcome::Failed { .. } | JobOutcome::RetryScheduled { .. } => {
                            report.failed += 1
                        }
                        JobOutcome::Skipped => {}
                    }
                    debug!(job_id = job.id, ?outcome, "job processed");
                }
                Err(err) => {
                    error!(?err, job_id = job.id, user_id = job.user_id, "job processing errored");
                    report.errors += 1;
                }
            }
        }

        match outbox::process_pending(
            &self.pool,
            self.transport.as_ref(),
            self.settings.outbox_batch_size,
            self.settings.claim_ttl(),
            now,
        )
        .await
        {
            Ok(outbox_report) => report.outbox = outbox_report,
            Err(err) => warn!(?err, "outbox pass failed"),
        }

        let processed = (report.claimed + report.outbox.claimed) as u64;
        let failed = (report.failed + report.errors + report.outbox.failed) as u64;
        self.processed.fetch_add(processed, Ordering::SeqCst);
        self.failed.fetch_add(failed, Ordering::SeqCst);
        if processed > 0 {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                cancelled = report.cancelled,
                deferred = report.deferred,
                failed = report.failed,
                errors = report.errors,
                outbox_sent = report.outbox.sent,
                outbox_failed = report.outbox.failed,
                "campaign cycle finished"
            );
        }
        CycleResult::Completed(report)
    }

    pub async fn status(&self) -> WorkerStatus {
        let timer_active = self
            .timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        WorkerStatus {
            worker_id: self.worker_id.clone(),
            running: self.running.load(Ordering::SeqCst),
            enabled: self.is_enabled(),
            timer_active,
            last_cycle_at: *self.last_cycle_at.lock().await,
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}
