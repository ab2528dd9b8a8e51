// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-printer job scheduler.
//
// One Tokio task per printer.  It wakes when a job is submitted, the device
// is released or the printer is resumed, and on a periodic tick that polls
// the driver for status.  Job processing calls blocking driver and device
// code, so each run goes through `spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use spoolwerk_core::error::{Result, SpoolwerkError};

use crate::printer::Printer;
use crate::queue::Candidate;

/// Default interval between driver status polls.
pub const STATUS_TICK: Duration = Duration::from_secs(10);

/// Predicate deciding whether a pending job can be satisfied right now.
pub type JobGate = Arc<dyn Fn(&Candidate<'_>) -> bool + Send + Sync>;

pub struct Scheduler {
    printer: Arc<Printer>,
    gate: JobGate,
    tick: Duration,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Scheduler that starts every pending job in submission order.
    pub fn new(printer: Arc<Printer>) -> Self {
        Self {
            printer,
            gate: Arc::new(|_| true),
            tick: STATUS_TICK,
            shutdown: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Only start jobs `gate` accepts; others stay pending.
    pub fn with_gate(mut self, gate: JobGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Spawn the scheduling task.  Must be called inside a Tokio runtime.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!(printer = self.printer.id(), "scheduler already running");
            return;
        }
        let printer = Arc::clone(&self.printer);
        let gate = Arc::clone(&self.gate);
        let shutdown = Arc::clone(&self.shutdown);
        let tick = self.tick;
        info!(printer = printer.id(), "scheduler started");
        self.task = Some(tokio::spawn(async move {
            Self::run(printer, gate, shutdown, tick).await;
        }));
    }

    /// Stop the task.  A job already processing runs to completion first.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.task.take() else {
            return Ok(());
        };
        self.shutdown.notify_one();
        handle
            .await
            .map_err(|e| SpoolwerkError::Listener(format!("scheduler task join: {e}")))?;
        info!(printer = self.printer.id(), "scheduler stopped");
        Ok(())
    }

    async fn run(printer: Arc<Printer>, gate: JobGate, shutdown: Arc<Notify>, tick: Duration) {
        let mut status_tick = tokio::time::interval(tick);
        status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if printer.is_deleted() {
                debug!(printer = printer.id(), "printer deleted; scheduler exiting");
                break;
            }

            while Self::run_one(&printer, &gate).await {}

            tokio::select! {
                _ = shutdown.notified() => break,
                _ = printer.wake_signal().notified() => {}
                _ = status_tick.tick() => Self::poll_status(&printer).await,
            }
        }
    }

    /// Start and process the next job.  Returns whether one ran.
    async fn run_one(printer: &Arc<Printer>, gate: &JobGate) -> bool {
        let Some(id) = printer.select_next(|c| gate(c)) else {
            return false;
        };
        let (ticket, lease) = match printer.start_job(id) {
            Ok(started) => started,
            Err(e) => {
                debug!(printer = printer.id(), job_id = %id, error = %e, "job not started");
                return false;
            }
        };

        let worker = Arc::clone(printer);
        match tokio::task::spawn_blocking(move || worker.process(ticket, lease)).await {
            Ok(outcome) => {
                debug!(printer = printer.id(), job_id = %id, ?outcome, "job run finished");
                true
            }
            Err(e) => {
                error!(printer = printer.id(), job_id = %id, error = %e, "job task failed");
                if let Err(e) = printer.abandon_job(id, format!("job task failed: {e}")) {
                    warn!(printer = printer.id(), job_id = %id, error = %e, "could not retire failed job");
                }
                true
            }
        }
    }

    async fn poll_status(printer: &Arc<Printer>) {
        let target = Arc::clone(printer);
        match tokio::task::spawn_blocking(move || target.refresh_status()).await {
            Ok(Ok(_)) | Ok(Err(SpoolwerkError::PrinterDeleted)) => {}
            Ok(Err(e)) => warn!(printer = printer.id(), error = %e, "status poll failed"),
            Err(e) => warn!(printer = printer.id(), error = %e, "status task failed"),
        }
    }
}
