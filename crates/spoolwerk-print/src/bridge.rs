// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raster driver bridge.
//
// Drives a job's document through the driver callbacks.  Raster documents go
// through the start_job / start_page / write_line / end_page / end_job state
// machine; other documents go through the whole-file callback.  The session
// tracks which brackets are open so that every successful start_page gets
// exactly one end_page and every successful start_job exactly one end_job,
// whether the run completes, fails, or is canceled.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{JobDocument, JobOutcome, RasterPage};

use crate::device::DeviceLease;
use crate::driver::{DriverCallbacks, JobContext};
use crate::printer::Printer;
use crate::queue::JobTicket;

/// Result of one processing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: JobOutcome,
    pub pages_completed: u32,
    /// The run failed because the device did.
    pub device_fault: bool,
}

impl RunReport {
    fn finished(outcome: JobOutcome, pages_completed: u32) -> Self {
        Self {
            outcome,
            pages_completed,
            device_fault: false,
        }
    }

    fn failed(error: &SpoolwerkError) -> Self {
        Self {
            outcome: JobOutcome::Aborted(error.to_string()),
            pages_completed: 0,
            device_fault: error.is_device_fault(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    JobActive,
    PageActive,
}

/// Callback state machine for one raster job.
pub struct RasterSession<'d, 'a> {
    callbacks: &'d DriverCallbacks,
    ctx: JobContext<'a>,
    phase: Phase,
    page: u32,
    pages_completed: u32,
}

impl<'d, 'a> RasterSession<'d, 'a> {
    pub fn new(callbacks: &'d DriverCallbacks, ctx: JobContext<'a>) -> Self {
        Self {
            callbacks,
            ctx,
            phase: Phase::Idle,
            page: 0,
            pages_completed: 0,
        }
    }

    pub fn pages_completed(&self) -> u32 {
        self.pages_completed
    }

    fn expect(&self, phase: Phase, step: &str) -> Result<()> {
        if self.phase != phase {
            return Err(SpoolwerkError::Driver(format!(
                "raster {step} called while {:?}",
                self.phase
            )));
        }
        Ok(())
    }

    pub fn start_job(&mut self) -> Result<()> {
        self.expect(Phase::Idle, "start_job")?;
        if let Some(cb) = &self.callbacks.raster_start_job {
            cb(&mut self.ctx)?;
        }
        self.phase = Phase::JobActive;
        Ok(())
    }

    pub fn start_page(&mut self, page: &RasterPage, number: u32) -> Result<()> {
        self.expect(Phase::JobActive, "start_page")?;
        page.check()?;
        self.ctx.header = page.header.clone();
        if let Some(cb) = &self.callbacks.raster_start_page {
            cb(&mut self.ctx, number)?;
        }
        self.page = number;
        self.phase = Phase::PageActive;
        Ok(())
    }

    pub fn write_line(&mut self, y: u32, line: &[u8]) -> Result<()> {
        self.expect(Phase::PageActive, "write_line")?;
        match &self.callbacks.raster_write_line {
            Some(cb) => cb(&mut self.ctx, y, line),
            None => Err(SpoolwerkError::NotSupported("raster printing")),
        }
    }

    /// Close the open page.  The bracket is closed even if the callback fails.
    pub fn end_page(&mut self) -> Result<()> {
        self.expect(Phase::PageActive, "end_page")?;
        self.phase = Phase::JobActive;
        if let Some(cb) = &self.callbacks.raster_end_page {
            cb(&mut self.ctx, self.page)?;
        }
        Ok(())
    }

    /// Close the open job.  The bracket is closed even if the callback fails.
    pub fn end_job(&mut self) -> Result<()> {
        self.expect(Phase::JobActive, "end_job")?;
        self.phase = Phase::Idle;
        if let Some(cb) = &self.callbacks.raster_end_job {
            cb(&mut self.ctx)?;
        }
        Ok(())
    }

    /// Close whatever brackets are still open, innermost first.
    pub fn unwind(&mut self) {
        if self.phase == Phase::PageActive {
            if let Err(e) = self.end_page() {
                warn!(job_id = %self.ctx.job_id, error = %e, "end_page failed during unwind");
            }
        }
        if self.phase == Phase::JobActive {
            if let Err(e) = self.end_job() {
                warn!(job_id = %self.ctx.job_id, error = %e, "end_job failed during unwind");
            }
        }
    }
}

impl Drop for RasterSession<'_, '_> {
    fn drop(&mut self) {
        if self.phase != Phase::Idle {
            self.unwind();
        }
    }
}

enum Stop {
    Canceled,
    Failed(SpoolwerkError),
}

impl From<SpoolwerkError> for Stop {
    fn from(e: SpoolwerkError) -> Self {
        Self::Failed(e)
    }
}

fn check_cancel(cancel: &AtomicBool) -> std::result::Result<(), Stop> {
    if cancel.load(Ordering::Acquire) {
        Err(Stop::Canceled)
    } else {
        Ok(())
    }
}

fn drive(
    session: &mut RasterSession<'_, '_>,
    pages: &[RasterPage],
    copies: u32,
    cancel: &AtomicBool,
) -> std::result::Result<(), Stop> {
    check_cancel(cancel)?;
    for page in pages {
        page.check()?;
    }
    session.start_job()?;

    let mut number = 0;
    for _ in 0..copies.max(1) {
        for page in pages {
            number += 1;
            check_cancel(cancel)?;
            session.start_page(page, number)?;
            for (y, line) in page.lines().enumerate() {
                check_cancel(cancel)?;
                session.write_line(y as u32, line)?;
            }
            check_cancel(cancel)?;
            session.end_page()?;
            session.pages_completed += 1;
        }
    }

    check_cancel(cancel)?;
    session.end_job()?;
    Ok(())
}

/// Run raster pages through the driver's raster callbacks.
pub fn run_raster(
    callbacks: &DriverCallbacks,
    ctx: JobContext<'_>,
    pages: &[RasterPage],
    cancel: &AtomicBool,
) -> RunReport {
    let job_id = ctx.job_id;
    let copies = ctx.options.copies;
    let mut session = RasterSession::new(callbacks, ctx);

    match drive(&mut session, pages, copies, cancel) {
        Ok(()) => RunReport::finished(JobOutcome::Completed, session.pages_completed()),
        Err(Stop::Canceled) => {
            debug!(job_id = %job_id, "raster run canceled");
            session.unwind();
            RunReport::finished(JobOutcome::Canceled, session.pages_completed())
        }
        Err(Stop::Failed(e)) => {
            warn!(job_id = %job_id, error = %e, "raster run aborted");
            session.unwind();
            RunReport {
                pages_completed: session.pages_completed(),
                ..RunReport::failed(&e)
            }
        }
    }
}

fn run_file(callbacks: &DriverCallbacks, ctx: &mut JobContext<'_>, path: &Path) -> Result<()> {
    match &callbacks.print_file {
        Some(cb) => cb(ctx, path),
        None => Err(SpoolwerkError::NotSupported("whole-file printing")),
    }
}

/// Process one job against its leased device.
///
/// Device failures mark the lease failed so that release closes the
/// connection and flags the printer offline.
pub fn execute(printer: &Printer, ticket: &JobTicket, lease: &mut DeviceLease) -> RunReport {
    if ticket.is_canceled() {
        return RunReport::finished(JobOutcome::Canceled, 0);
    }

    let driver = printer.driver();
    let callbacks = &driver.callbacks;

    let runnable = match ticket.document.as_ref() {
        JobDocument::Raster(_) => callbacks.supports_raster(),
        JobDocument::File { .. } => callbacks.print_file.is_some(),
        JobDocument::Stream { .. } => false,
    };
    if !runnable {
        warn!(job_id = %ticket.id, format = ticket.document.format(), "unsupported document format");
        return RunReport::finished(JobOutcome::Aborted("unsupported document format".into()), 0);
    }

    let device = match lease.device(printer.opener()) {
        Ok(device) => device,
        Err(e) => {
            warn!(job_id = %ticket.id, uri = lease.uri(), error = %e, "device open failed");
            return RunReport::failed(&e);
        }
    };

    let mut report = {
        let mut ctx = JobContext::new(ticket.id, printer, &ticket.options, device);
        match ticket.document.as_ref() {
            JobDocument::Raster(pages) => run_raster(callbacks, ctx, pages, &ticket.cancel),
            JobDocument::File { path, .. } => match run_file(callbacks, &mut ctx, path) {
                Ok(()) if ticket.is_canceled() => RunReport::finished(JobOutcome::Canceled, 0),
                Ok(()) => RunReport::finished(JobOutcome::Completed, 1),
                Err(e) => {
                    warn!(job_id = %ticket.id, error = %e, "print_file failed");
                    RunReport::failed(&e)
                }
            },
            JobDocument::Stream { .. } => {
                RunReport::finished(JobOutcome::Aborted("unsupported document format".into()), 0)
            }
        }
    };

    if let Err(e) = lease.device(printer.opener()).and_then(|d| d.flush()) {
        warn!(job_id = %ticket.id, error = %e, "device flush failed");
        if report.outcome == JobOutcome::Completed {
            report = RunReport::failed(&e);
        }
        report.device_fault = true;
    }
    if report.device_fault {
        lease.mark_failed();
    }
    report
}
