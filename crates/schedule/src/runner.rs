//! Per-entry schedule workers.
//!
//! Each `{name, cron, handler}` entry runs in its own worker task: it ticks
//! once a minute, fires the handler when the expression matches, and guards
//! against overlapping runs. Handlers run under `catch_unwind` so a
//! panicking handler surfaces as `schedule.failed`, never as a dead worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamlens_core::telemetry::{TelemetryBus, TelemetryEvent};
use beamlens_core::{Error, RunError};

use crate::cron::CronExpr;

/// What a schedule fires. Watcher mode delegates to the baseline-LLM path;
/// simple mode invokes an operator or the coordinator directly.
#[async_trait]
pub trait ScheduleHandler: Send + Sync {
    async fn run(&self) -> Result<(), Error>;
}

/// One configured schedule.
pub struct ScheduleEntry {
    pub name: String,
    pub expr: CronExpr,
    pub handler: Arc<dyn ScheduleHandler>,
}

impl ScheduleEntry {
    pub fn new(
        name: impl Into<String>,
        expr: CronExpr,
        handler: Arc<dyn ScheduleHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            expr,
            handler,
        }
    }
}

struct ScheduleWorker {
    running: Arc<AtomicBool>,
    trigger: mpsc::Sender<()>,
    _handle: JoinHandle<()>,
}

/// All schedule workers, keyed by name.
pub struct ScheduleSet {
    workers: HashMap<String, ScheduleWorker>,
    telemetry: Arc<TelemetryBus>,
    cancel: CancellationToken,
}

impl ScheduleSet {
    pub fn new(telemetry: Arc<TelemetryBus>, cancel: CancellationToken) -> Self {
        Self {
            workers: HashMap::new(),
            telemetry,
            cancel,
        }
    }

    /// Spawn a worker for an entry. Replaces any worker with the same name.
    pub fn add(&mut self, entry: ScheduleEntry) {
        let name = entry.name.clone();
        let running = Arc::new(AtomicBool::new(false));
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        let handle = spawn_worker(
            entry,
            running.clone(),
            trigger_rx,
            self.telemetry.clone(),
            self.cancel.clone(),
        );

        self.workers.insert(
            name,
            ScheduleWorker {
                running,
                trigger: trigger_tx,
                _handle: handle,
            },
        );
    }

    /// Fire a schedule immediately, unless it is already running.
    pub fn run_now(&self, name: &str) -> Result<(), Error> {
        let worker = self
            .workers
            .get(name)
            .ok_or_else(|| Error::Run(RunError::NotFound(name.to_string())))?;

        if worker.running.load(Ordering::Acquire) {
            return Err(Error::Run(RunError::AlreadyRunning));
        }
        worker
            .trigger
            .try_send(())
            .map_err(|_| Error::Run(RunError::AlreadyRunning))
    }

    /// Names of all configured schedules.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a schedule's handler is currently running.
    pub fn is_running(&self, name: &str) -> Option<bool> {
        self.workers
            .get(name)
            .map(|w| w.running.load(Ordering::Acquire))
    }
}

fn spawn_worker(
    entry: ScheduleEntry,
    running: Arc<AtomicBool>,
    mut trigger: mpsc::Receiver<()>,
    telemetry: Arc<TelemetryBus>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // First tick lands a minute from now; an immediate tick would fire
        // matching expressions at worker startup.
        let period = std::time::Duration::from_secs(60);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_fired: Option<DateTime<Utc>> = None;

        info!(schedule = %entry.name, "Schedule worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(schedule = %entry.name, "Schedule worker stopping");
                    break;
                }

                _ = interval.tick() => {
                    let now = Utc::now();
                    if !entry.expr.matches(&now) {
                        continue;
                    }
                    // Never double-fire inside the same minute
                    let same_minute = last_fired.is_some_and(|last| {
                        last.minute() == now.minute()
                            && last.hour() == now.hour()
                            && last.date_naive() == now.date_naive()
                    });
                    if same_minute {
                        continue;
                    }
                    last_fired = Some(now);
                    fire(&entry, &running, &telemetry);
                }

                Some(()) = trigger.recv() => {
                    fire(&entry, &running, &telemetry);
                }
            }
        }
    })
}

/// Fire the handler unless a previous run is still in flight.
fn fire(entry: &ScheduleEntry, running: &Arc<AtomicBool>, telemetry: &Arc<TelemetryBus>) {
    if running.swap(true, Ordering::AcqRel) {
        debug!(schedule = %entry.name, "Previous run still in flight, skipping");
        telemetry.publish(TelemetryEvent::ScheduleSkipped {
            name: entry.name.clone(),
            reason: "already_running".into(),
        });
        return;
    }

    telemetry.publish(TelemetryEvent::ScheduleTriggered {
        name: entry.name.clone(),
    });

    let name = entry.name.clone();
    let handler = entry.handler.clone();
    let running = running.clone();
    let telemetry = telemetry.clone();

    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let result = std::panic::AssertUnwindSafe(handler.run())
            .catch_unwind()
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        running.store(false, Ordering::Release);

        match result {
            Ok(Ok(())) => {
                telemetry.publish(TelemetryEvent::ScheduleCompleted { name, duration_ms });
            }
            Ok(Err(e)) => {
                warn!(schedule = %name, error = %e, "Schedule handler failed");
                telemetry.publish(TelemetryEvent::ScheduleFailed {
                    name,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(schedule = %name, "Schedule handler panicked");
                telemetry.publish(TelemetryEvent::ScheduleFailed {
                    name,
                    reason: "handler panicked".into(),
                });
            }
        }
    });
}
