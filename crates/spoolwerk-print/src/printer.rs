// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The printer object.
//
// All mutable printer state lives in `PrinterInner` behind one `RwLock`.
// Public methods take the lock for the duration of a single read or a single
// transaction and release it before returning; nothing here re-enters the
// lock.  Long operations (driver callbacks, device I/O, presence network
// calls) run unlocked between two short critical sections, and the second
// one re-checks `is_deleted` / `is_stopped` before committing.

use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use spoolwerk_core::config::{PrinterConfig, RawListenerConfig, UsbGadgetConfig};
use spoolwerk_core::error::{BusyReason, Result, SpoolwerkError};
use spoolwerk_core::reasons::PrinterReasons;
use spoolwerk_core::types::{
    IdentifyActions, JobDocument, JobId, JobInfo, JobOutcome, JobRequest, JobState, MAX_SUPPLY,
    PrinterState, PrinterStatus, Supply, WhichJobs,
};

use crate::bridge;
use crate::device::{DeviceLease, DeviceOpener, DeviceSlot, StandardOpener};
use crate::driver::{DriverData, DriverRegistry};
use crate::presence::{PresencePublisher, PresenceSnapshot, PresenceState};
use crate::queue::{CancelEffect, Candidate, JobQueue, JobTicket, QueueLimits};
use crate::supplies::{self, SupplyDelta};

/// Minimum interval between driver status polls, in milliseconds.
const STATUS_POLL_INTERVAL_MS: i64 = 1000;

pub(crate) struct PrinterInner {
    name: String,
    dns_sd_name: Option<String>,
    location: Option<String>,
    geo_location: Option<String>,
    organization: Option<String>,
    org_unit: Option<String>,
    device_uri: String,
    device_id: Option<String>,

    state: PrinterState,
    reasons: PrinterReasons,
    is_accepting: bool,
    is_stopped: bool,
    is_deleted: bool,
    hold_new_jobs: bool,

    device: DeviceSlot,
    supplies: Vec<Supply>,
    queue: JobQueue,
    presence: PresenceState,
    impressions_completed: u32,

    raw: RawListenerConfig,
    raw_active: bool,
    usb: Option<UsbGadgetConfig>,
    usb_active: bool,

    start_time: DateTime<Utc>,
    config_time: DateTime<Utc>,
    status_time: DateTime<Utc>,
    state_time: DateTime<Utc>,
    status_polled: Option<DateTime<Utc>>,
}

impl PrinterInner {
    fn touch_config(&mut self) {
        self.config_time = Utc::now();
    }

    fn touch_status(&mut self) {
        self.status_time = Utc::now();
    }

    fn set_state_locked(&mut self, state: PrinterState) {
        if self.state != state {
            self.state = state;
            self.state_time = Utc::now();
            self.touch_status();
        }
    }

    /// State when no job is processing.
    fn settle_state_locked(&mut self) {
        let state = if self.is_stopped {
            PrinterState::Stopped
        } else {
            PrinterState::Idle
        };
        self.set_state_locked(state);
    }

    fn set_reasons_locked(&mut self, add: PrinterReasons, remove: PrinterReasons) {
        let reasons = self.reasons.apply(add, remove);
        if reasons != self.reasons {
            self.reasons = reasons;
            self.touch_status();
        }
    }

    fn recompute_supply_reasons_locked(&mut self) {
        let computed = supplies::supply_reasons(&self.supplies);
        self.set_reasons_locked(computed, PrinterReasons::SUPPLY_MASK & !computed);
    }

    fn admission_locked(&self) -> Result<()> {
        let reason = if self.is_deleted {
            BusyReason::Deleted
        } else if self.is_stopped {
            BusyReason::Stopped
        } else if !self.is_accepting {
            BusyReason::NotAccepting
        } else if self.hold_new_jobs {
            BusyReason::HoldingNewJobs
        } else {
            return Ok(());
        };
        Err(SpoolwerkError::Busy(reason))
    }

    fn acquire_device_locked(&mut self, job: JobId) -> Result<DeviceLease> {
        if self.is_deleted {
            return Err(SpoolwerkError::PrinterDeleted);
        }
        if let Some(holder) = self.device.holder() {
            debug!(job_id = %job, holder = %holder, "device in use");
            return Err(SpoolwerkError::Busy(BusyReason::DeviceInUse));
        }
        let connection = self.device.take_for(job, &self.device_uri);
        Ok(DeviceLease::new(job, self.device_uri.clone(), connection))
    }

    fn release_device_locked(&mut self, lease: DeviceLease) {
        let job = lease.job();
        if self.device.holder() != Some(job) {
            warn!(job_id = %job, holder = ?self.device.holder(), "releasing a lease the printer does not hold");
            return;
        }

        if lease.has_failed() {
            self.set_reasons_locked(PrinterReasons::OFFLINE, PrinterReasons::NONE);
        } else if lease.is_open() {
            self.set_reasons_locked(PrinterReasons::NONE, PrinterReasons::OFFLINE);
        }

        let retained = lease
            .into_retained()
            .filter(|open| !self.is_deleted && open.uri == self.device_uri);
        self.device = match retained {
            Some(open) => DeviceSlot::Open(open),
            None => DeviceSlot::Closed,
        };
    }
}

/// A virtual printer: queue, device, supplies and presence behind one lock.
pub struct Printer {
    printer_id: u32,
    uuid: Uuid,
    driver: Arc<DriverData>,
    opener: Arc<dyn DeviceOpener>,
    inner: RwLock<PrinterInner>,
    /// Signalled when there may be a job to start.
    wake: Notify,
    /// Signalled whenever the device slot is released.
    device_released: Notify,
    presence: OnceLock<Arc<PresencePublisher>>,
}

impl std::fmt::Debug for Printer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Printer")
            .field("printer_id", &self.printer_id)
            .field("driver", &self.driver.name)
            .finish_non_exhaustive()
    }
}

impl Printer {
    /// Create a printer using the built-in device schemes.
    pub fn new(config: PrinterConfig, driver: Arc<DriverData>) -> Result<Self> {
        Self::with_opener(config, driver, Arc::new(StandardOpener))
    }

    /// Restore a printer from persisted configuration, binding the driver
    /// named in it.
    pub fn from_config(config: PrinterConfig, drivers: &DriverRegistry) -> Result<Self> {
        let driver = drivers.get(&config.driver_name).ok_or_else(|| {
            SpoolwerkError::Config(format!("unknown driver {:?}", config.driver_name))
        })?;
        Self::new(config, driver)
    }

    pub fn with_opener(
        config: PrinterConfig,
        driver: Arc<DriverData>,
        opener: Arc<dyn DeviceOpener>,
    ) -> Result<Self> {
        config.validate()?;

        let mut supplies = if config.supplies.is_empty() {
            driver.default_supplies.clone()
        } else {
            config.supplies
        };
        supplies.truncate(MAX_SUPPLY);

        let limits = QueueLimits {
            max_active_jobs: config.max_active_jobs,
            max_completed_jobs: config.max_completed_jobs,
            max_preserved_jobs: config.max_preserved_jobs,
        };
        let now = Utc::now();
        let mut inner = PrinterInner {
            name: config.name,
            dns_sd_name: config.dns_sd_name,
            location: config.location,
            geo_location: config.geo_location,
            organization: config.organization,
            org_unit: config.org_unit,
            device_uri: config.device_uri,
            device_id: config.device_id,
            state: if config.is_stopped {
                PrinterState::Stopped
            } else {
                PrinterState::Idle
            },
            reasons: PrinterReasons::NONE,
            is_accepting: config.is_accepting,
            is_stopped: config.is_stopped,
            is_deleted: false,
            hold_new_jobs: false,
            device: DeviceSlot::Closed,
            supplies,
            queue: JobQueue::new(config.printer_id, config.next_job_id, limits),
            presence: PresenceState::default(),
            impressions_completed: config.impressions_completed,
            raw: config.raw,
            raw_active: false,
            usb: config.usb,
            usb_active: false,
            start_time: now,
            config_time: now,
            status_time: now,
            state_time: now,
            status_polled: None,
        };
        inner.recompute_supply_reasons_locked();

        info!(printer = config.printer_id, name = %inner.name, driver = %driver.name, "printer created");
        Ok(Self {
            printer_id: config.printer_id,
            uuid: config.uuid,
            driver,
            opener,
            inner: RwLock::new(inner),
            wake: Notify::new(),
            device_released: Notify::new(),
            presence: OnceLock::new(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, PrinterInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PrinterInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Identity / configuration -------------------------------------------

    pub fn id(&self) -> u32 {
        self.printer_id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn driver(&self) -> &DriverData {
        &self.driver
    }

    pub fn opener(&self) -> &dyn DeviceOpener {
        self.opener.as_ref()
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SpoolwerkError::Config("printer name cannot be empty".into()));
        }
        let mut inner = self.write();
        inner.name = name;
        inner.touch_config();
        Ok(())
    }

    /// Name records are advertised under, before collision renaming.
    pub fn dns_sd_name(&self) -> String {
        let inner = self.read();
        inner.dns_sd_name.clone().unwrap_or_else(|| inner.name.clone())
    }

    pub fn set_dns_sd_name(&self, name: Option<String>) {
        let mut inner = self.write();
        inner.dns_sd_name = name;
        inner.presence.serial = 1;
        inner.presence.collision = false;
        inner.touch_config();
    }

    pub fn location(&self) -> Option<String> {
        self.read().location.clone()
    }

    pub fn set_location(&self, location: Option<String>) {
        let mut inner = self.write();
        inner.location = location;
        inner.touch_config();
    }

    pub fn geo_location(&self) -> Option<String> {
        self.read().geo_location.clone()
    }

    pub fn set_geo_location(&self, geo: Option<String>) -> Result<()> {
        if let Some(g) = geo.as_deref() {
            if crate::presence::encode_loc(g).is_none() {
                return Err(SpoolwerkError::Config(format!("bad geo-location {g:?}")));
            }
        }
        let mut inner = self.write();
        inner.geo_location = geo;
        inner.touch_config();
        Ok(())
    }

    pub fn organization(&self) -> (Option<String>, Option<String>) {
        let inner = self.read();
        (inner.organization.clone(), inner.org_unit.clone())
    }

    pub fn set_organization(&self, organization: Option<String>, org_unit: Option<String>) {
        let mut inner = self.write();
        inner.organization = organization;
        inner.org_unit = org_unit;
        inner.touch_config();
    }

    pub fn device_uri(&self) -> String {
        self.read().device_uri.clone()
    }

    /// Point the printer at another device.  An idle open connection is
    /// closed now; a held one is closed when its lease is released.
    pub fn set_device_uri(&self, uri: impl Into<String>) {
        let mut inner = self.write();
        inner.device_uri = uri.into();
        if matches!(inner.device, DeviceSlot::Open(_)) {
            inner.device = DeviceSlot::Closed;
        }
        inner.touch_config();
    }

    pub fn device_id(&self) -> Option<String> {
        self.read().device_id.clone()
    }

    pub fn set_device_id(&self, device_id: Option<String>) {
        let mut inner = self.write();
        inner.device_id = device_id;
        inner.touch_config();
    }

    pub fn limits(&self) -> QueueLimits {
        self.read().queue.limits()
    }

    pub fn set_limits(&self, limits: QueueLimits) {
        let mut inner = self.write();
        inner.queue.set_limits(limits);
        inner.touch_config();
    }

    // -- Status ---------------------------------------------------------------

    pub fn state(&self) -> PrinterState {
        self.read().state
    }

    pub fn is_deleted(&self) -> bool {
        self.read().is_deleted
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.read().start_time
    }

    pub fn status(&self) -> PrinterStatus {
        let inner = self.read();
        PrinterStatus {
            printer_id: self.printer_id,
            name: inner.name.clone(),
            advertised_name: crate::presence::instance_name(
                inner.dns_sd_name.as_deref().unwrap_or(&inner.name),
                inner.presence.serial,
            ),
            state: inner.state,
            reasons: inner.reasons,
            is_accepting: inner.is_accepting,
            is_stopped: inner.is_stopped,
            is_deleted: inner.is_deleted,
            hold_new_jobs: inner.hold_new_jobs,
            processing_job: inner.queue.processing(),
            active_jobs: inner.queue.active_len(),
            completed_jobs: inner.queue.completed_len(),
            impressions_completed: inner.impressions_completed,
            config_time: inner.config_time,
            status_time: inner.status_time,
            state_time: inner.state_time,
        }
    }

    pub fn reasons(&self) -> PrinterReasons {
        self.read().reasons
    }

    /// `reasons = (reasons | add) & !remove`.
    pub fn set_reasons(&self, add: PrinterReasons, remove: PrinterReasons) {
        self.write().set_reasons_locked(add, remove);
    }

    // -- Supplies -------------------------------------------------------------

    pub fn supplies(&self) -> Vec<Supply> {
        self.read().supplies.clone()
    }

    /// Replace the supply list (at most `MAX_SUPPLY` entries are kept).
    pub fn set_supplies(&self, mut list: Vec<Supply>) {
        if list.len() > MAX_SUPPLY {
            warn!(printer = self.printer_id, count = list.len(), "truncating supply list");
            list.truncate(MAX_SUPPLY);
        }
        for supply in &mut list {
            supply.level = supply.level.clamp(0, 100);
        }
        let mut inner = self.write();
        inner.supplies = list;
        inner.recompute_supply_reasons_locked();
        inner.touch_status();
    }

    /// Apply level deltas under the driver's level policy and recompute the
    /// supply reasons.
    pub fn update_supplies(&self, deltas: &[SupplyDelta]) {
        let mut inner = self.write();
        supplies::apply_deltas(&mut inner.supplies, deltas, self.driver.level_policy);
        inner.recompute_supply_reasons_locked();
        inner.touch_status();
    }

    // -- Jobs -----------------------------------------------------------------

    /// Admit a job.  Rejected jobs are never created.
    pub fn submit(&self, request: JobRequest) -> Result<JobId> {
        let id = {
            let mut inner = self.write();
            inner.admission_locked()?;
            inner.queue.submit(request)?
        };
        self.wake.notify_one();
        Ok(id)
    }

    /// Next job the scheduler should start, if any.
    pub fn select_next(&self, gate: impl Fn(&Candidate<'_>) -> bool) -> Option<JobId> {
        let inner = self.read();
        if inner.is_deleted || inner.is_stopped || inner.device.holder().is_some() {
            return None;
        }
        inner.queue.select_next(gate)
    }

    /// Move a pending job to processing and hand it the device.
    pub fn start_job(&self, id: JobId) -> Result<(JobTicket, DeviceLease)> {
        let mut inner = self.write();
        if inner.is_deleted {
            return Err(SpoolwerkError::PrinterDeleted);
        }
        if inner.is_stopped {
            return Err(SpoolwerkError::Busy(BusyReason::Stopped));
        }
        if inner.device.holder().is_some() {
            return Err(SpoolwerkError::Busy(BusyReason::DeviceInUse));
        }
        inner.queue.check_startable(id)?;

        let ticket = inner.queue.begin(id)?;
        let lease = inner.acquire_device_locked(id)?;
        inner.set_state_locked(PrinterState::Processing);
        info!(printer = self.printer_id, job_id = %id, "job started");
        Ok((ticket, lease))
    }

    /// `start_job`, waiting up to `timeout` for the device to come free.
    pub async fn start_job_timeout(
        &self,
        id: JobId,
        timeout: Duration,
    ) -> Result<(JobTicket, DeviceLease)> {
        self.wait_for_device(timeout, || self.start_job(id)).await
    }

    /// Retire a processing job, release its device and commit impressions.
    pub fn finish_job(
        &self,
        id: JobId,
        lease: DeviceLease,
        outcome: JobOutcome,
        impressions: u32,
    ) -> Result<()> {
        let result = {
            let mut inner = self.write();
            inner.release_device_locked(lease);
            let result = inner.queue.complete(id, outcome, impressions);
            if result.is_ok() {
                inner.impressions_completed = inner.impressions_completed.saturating_add(impressions);
            }
            inner.settle_state_locked();
            result
        };
        self.device_released.notify_waiters();
        self.wake.notify_one();
        result
    }

    /// Run a started job to completion on the calling thread.
    pub fn process(&self, ticket: JobTicket, mut lease: DeviceLease) -> JobOutcome {
        let report = bridge::execute(self, &ticket, &mut lease);
        if let Err(e) = self.finish_job(ticket.id, lease, report.outcome.clone(), report.pages_completed) {
            warn!(printer = self.printer_id, job_id = %ticket.id, error = %e, "could not record job outcome");
        }
        report.outcome
    }

    /// Select, start and run the next eligible job.  Returns the job's id, or
    /// `None` when nothing could start.
    pub fn process_next(&self, gate: impl Fn(&Candidate<'_>) -> bool) -> Option<JobId> {
        let id = self.select_next(gate)?;
        match self.start_job(id) {
            Ok((ticket, lease)) => {
                self.process(ticket, lease);
                Some(id)
            }
            Err(e) => {
                debug!(printer = self.printer_id, job_id = %id, error = %e, "job not started");
                None
            }
        }
    }

    /// Retire a job that never started, e.g. when its device never came
    /// free.
    pub fn abort_job(&self, id: JobId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let mut inner = self.write();
        if inner.queue.processing() == Some(id) {
            return Err(SpoolwerkError::InvalidJobState {
                id,
                state: JobState::Processing,
                action: "abort without its device",
            });
        }
        warn!(printer = self.printer_id, job_id = %id, reason = %reason, "job aborted");
        inner.queue.complete(id, JobOutcome::Aborted(reason), 0)
    }

    /// Retire a processing job whose lease was lost with its worker.
    ///
    /// The device slot is closed if the job still holds it, so the next job
    /// opens a fresh connection.
    pub fn abandon_job(&self, id: JobId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let result = {
            let mut inner = self.write();
            if inner.device.holder() == Some(id) {
                inner.device = DeviceSlot::Closed;
            }
            error!(printer = self.printer_id, job_id = %id, reason = %reason, "job abandoned");
            let result = inner.queue.complete(id, JobOutcome::Aborted(reason), 0);
            inner.settle_state_locked();
            result
        };
        self.device_released.notify_waiters();
        self.wake.notify_one();
        result
    }

    pub fn cancel_job(&self, id: JobId) -> Result<CancelEffect> {
        let effect = self.write().queue.cancel(id)?;
        info!(printer = self.printer_id, job_id = %id, ?effect, "job cancel");
        Ok(effect)
    }

    pub fn cancel_all_jobs(&self) -> usize {
        self.write().queue.cancel_all()
    }

    pub fn job(&self, id: JobId) -> Option<JobInfo> {
        self.read().queue.info(id)
    }

    pub fn jobs(&self, which: WhichJobs) -> Vec<JobInfo> {
        self.read().queue.list(which)
    }

    // -- Device arbitration ---------------------------------------------------

    /// Take exclusive use of the device for `job`.
    pub fn acquire_device(&self, job: JobId) -> Result<DeviceLease> {
        self.write().acquire_device_locked(job)
    }

    /// `acquire_device`, waiting up to `timeout` for the device to come free.
    pub async fn acquire_device_timeout(&self, job: JobId, timeout: Duration) -> Result<DeviceLease> {
        self.wait_for_device(timeout, || self.acquire_device(job)).await
    }

    pub fn release_device(&self, lease: DeviceLease) {
        self.write().release_device_locked(lease);
        self.device_released.notify_waiters();
        self.wake.notify_one();
    }

    async fn wait_for_device<T>(
        &self,
        timeout: Duration,
        attempt: impl Fn() -> Result<T>,
    ) -> Result<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let released = self.device_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match attempt() {
                Err(SpoolwerkError::Busy(BusyReason::DeviceInUse)) => {}
                other => return other,
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(SpoolwerkError::DeviceUnavailable(format!(
                    "device still in use after {}s",
                    timeout.as_secs_f32()
                )));
            }
        }
    }

    // -- Operator controls ----------------------------------------------------

    /// Stop starting new jobs.  A processing job runs to completion.
    pub fn pause(&self) {
        let mut inner = self.write();
        inner.is_stopped = true;
        if inner.queue.processing().is_none() {
            inner.set_state_locked(PrinterState::Stopped);
        }
        inner.touch_config();
        info!(printer = self.printer_id, "printer paused");
    }

    pub fn resume(&self) {
        {
            let mut inner = self.write();
            inner.is_stopped = false;
            if inner.queue.processing().is_none() {
                inner.set_state_locked(PrinterState::Idle);
            }
            inner.touch_config();
        }
        info!(printer = self.printer_id, "printer resumed");
        self.wake.notify_one();
    }

    pub fn set_accepting(&self, accepting: bool) {
        let mut inner = self.write();
        inner.is_accepting = accepting;
        inner.touch_config();
    }

    pub fn set_hold_new_jobs(&self, hold: bool) {
        {
            let mut inner = self.write();
            inner.hold_new_jobs = hold;
            inner.touch_config();
        }
        if !hold {
            self.wake.notify_one();
        }
    }

    /// Delete the printer: cancel its jobs, close the device and withdraw
    /// its presence records.  Idempotent.
    pub fn delete(&self) {
        let records = {
            let mut inner = self.write();
            if inner.is_deleted {
                return;
            }
            inner.is_deleted = true;
            inner.is_accepting = false;
            let canceled = inner.queue.cancel_all();
            if matches!(inner.device, DeviceSlot::Open(_)) {
                inner.device = DeviceSlot::Closed;
            }
            inner.touch_config();
            info!(printer = self.printer_id, canceled, "printer deleted");
            std::mem::take(&mut inner.presence.registered)
        };
        if let Some(publisher) = self.presence.get() {
            publisher.withdraw(&records);
        }
        self.device_released.notify_waiters();
        self.wake.notify_one();
    }

    /// Ask the printer to make itself known.  `actions` are restricted to the
    /// driver's supported set; empty means the driver default.
    pub fn identify(&self, actions: IdentifyActions, message: Option<&str>) -> Result<()> {
        let callback = self
            .driver
            .callbacks
            .identify
            .clone()
            .ok_or(SpoolwerkError::NotSupported("identify"))?;
        if self.is_deleted() {
            return Err(SpoolwerkError::PrinterDeleted);
        }

        let requested = if actions.is_empty() {
            self.driver.identify_default
        } else {
            actions
        };
        let actions = requested.intersection(self.driver.identify_supported);

        self.set_reasons(PrinterReasons::IDENTIFY_PRINTER_REQUESTED, PrinterReasons::NONE);
        callback(self, actions, message);
        self.set_reasons(PrinterReasons::NONE, PrinterReasons::IDENTIFY_PRINTER_REQUESTED);
        Ok(())
    }

    /// Poll the driver for status, at most once per second.  Returns whether
    /// the driver was polled.
    pub fn refresh_status(&self) -> Result<bool> {
        let Some(callback) = self.driver.callbacks.status.clone() else {
            return Ok(false);
        };
        {
            let mut inner = self.write();
            let now = Utc::now();
            if inner.is_deleted {
                return Err(SpoolwerkError::PrinterDeleted);
            }
            if inner
                .status_polled
                .is_some_and(|last| (now - last).num_milliseconds() < STATUS_POLL_INTERVAL_MS)
            {
                return Ok(false);
            }
            inner.status_polled = Some(now);
        }
        callback(self)?;
        self.write().touch_status();
        Ok(true)
    }

    /// Queue the driver's test page.
    pub fn print_test_page(&self, username: &str) -> Result<JobId> {
        let callback = self
            .driver
            .callbacks
            .test_page
            .clone()
            .ok_or(SpoolwerkError::NotSupported("test page"))?;
        let path = callback(self)
            .ok_or_else(|| SpoolwerkError::Driver("driver produced no test page".into()))?;
        self.submit(JobRequest::new(
            "Test Page",
            username,
            JobDocument::File {
                path,
                format: self.driver.format.clone(),
            },
        ))
    }

    // -- Ingress listeners ----------------------------------------------------

    pub fn raw_config(&self) -> RawListenerConfig {
        self.read().raw.clone()
    }

    pub fn raw_port(&self) -> Result<u16> {
        self.read().raw.port_for(self.printer_id)
    }

    pub(crate) fn set_raw_active(&self, active: bool) {
        self.write().raw_active = active;
    }

    pub fn usb_config(&self) -> Option<UsbGadgetConfig> {
        self.read().usb.clone()
    }

    /// Change USB gadget settings.  Refused while the gadget is running.
    pub fn set_usb_config(&self, usb: Option<UsbGadgetConfig>) -> Result<()> {
        let mut inner = self.write();
        if inner.usb_active {
            return Err(SpoolwerkError::Listener(
                "USB gadget is running; stop it before changing its settings".into(),
            ));
        }
        inner.usb = usb;
        inner.touch_config();
        Ok(())
    }

    pub(crate) fn set_usb_active(&self, active: bool) {
        self.write().usb_active = active;
    }

    // -- Presence -------------------------------------------------------------

    /// Bind the publisher used for this printer's presence records.
    pub fn attach_presence(&self, publisher: Arc<PresencePublisher>) {
        if self.presence.set(publisher).is_err() {
            warn!(printer = self.printer_id, "presence publisher already attached");
        }
    }

    /// (Re-)register this printer's presence records.
    pub fn register_presence(&self) -> Result<()> {
        let Some(publisher) = self.presence.get() else {
            debug!(printer = self.printer_id, "no presence publisher attached");
            return Ok(());
        };

        let (previous, snapshot) = {
            let mut inner = self.write();
            if inner.is_deleted {
                return Err(SpoolwerkError::PrinterDeleted);
            }
            let previous = std::mem::take(&mut inner.presence.registered);
            (previous, self.presence_snapshot_locked(&inner))
        };
        publisher.withdraw(&previous);

        let state = publisher.publish(&snapshot)?;

        let mut inner = self.write();
        if inner.is_deleted {
            drop(inner);
            publisher.withdraw(&state.registered);
            return Err(SpoolwerkError::PrinterDeleted);
        }
        inner.presence = state;
        Ok(())
    }

    /// Withdraw all presence records.  Idempotent.
    pub fn unregister_presence(&self) {
        let records = std::mem::take(&mut self.write().presence.registered);
        if let Some(publisher) = self.presence.get() {
            publisher.withdraw(&records);
        }
    }

    pub fn presence_state(&self) -> PresenceState {
        self.read().presence.clone()
    }

    fn presence_snapshot_locked(&self, inner: &PrinterInner) -> PresenceSnapshot {
        let mut formats = vec![self.driver.format.clone()];
        for f in &self.driver.formats {
            if !formats.contains(f) {
                formats.push(f.clone());
            }
        }
        PresenceSnapshot {
            printer_id: self.printer_id,
            base_name: inner.dns_sd_name.clone().unwrap_or_else(|| inner.name.clone()),
            uuid: self.uuid,
            make_and_model: self.driver.make_and_model.clone(),
            location: inner.location.clone(),
            geo_location: inner.geo_location.clone(),
            formats,
            color: self.driver.color_supported,
            duplex: self.driver.duplex_supported,
            raw_port: inner
                .raw_active
                .then(|| inner.raw.port_for(self.printer_id).ok())
                .flatten(),
            state: inner.presence.clone(),
        }
    }

    // -- Scheduling hooks -----------------------------------------------------

    pub(crate) fn wake_signal(&self) -> &Notify {
        &self.wake
    }

    // -- Persistence ----------------------------------------------------------

    pub fn to_config(&self) -> PrinterConfig {
        let inner = self.read();
        let limits = inner.queue.limits();
        PrinterConfig {
            printer_id: self.printer_id,
            name: inner.name.clone(),
            dns_sd_name: inner.dns_sd_name.clone(),
            uuid: self.uuid,
            location: inner.location.clone(),
            geo_location: inner.geo_location.clone(),
            organization: inner.organization.clone(),
            org_unit: inner.org_unit.clone(),
            device_uri: inner.device_uri.clone(),
            device_id: inner.device_id.clone(),
            driver_name: self.driver.name.clone(),
            max_active_jobs: limits.max_active_jobs,
            max_completed_jobs: limits.max_completed_jobs,
            max_preserved_jobs: limits.max_preserved_jobs,
            supplies: inner.supplies.clone(),
            next_job_id: inner.queue.next_job_id(),
            impressions_completed: inner.impressions_completed,
            is_accepting: inner.is_accepting,
            is_stopped: inner.is_stopped,
            raw: inner.raw.clone(),
            usb: inner.usb.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use spoolwerk_core::types::{ColorSpace, RasterHeader, RasterPage, SupplyColor, SupplyType};

    use crate::device::tests::{MemoryDevice, MemoryOpener};
    use crate::driver::{DriverCallbacks, JobContext};
    use crate::presence::tests::{FakeBackend, options};

    pub(crate) fn test_driver() -> DriverData {
        DriverData::new("test", "Test Printer").with_callbacks(
            DriverCallbacks::default()
                .on_write_line(|ctx: &mut JobContext<'_>, _y, line| ctx.device.write_all(line))
                .on_print_file(|ctx: &mut JobContext<'_>, path| {
                    let bytes = std::fs::read(path)?;
                    ctx.device.write_all(&bytes)
                }),
        )
    }

    pub(crate) fn test_config() -> PrinterConfig {
        PrinterConfig {
            name: "Test".into(),
            device_uri: "mem://test".into(),
            ..Default::default()
        }
    }

    pub(crate) fn printer_with(driver: DriverData, opener: MemoryOpener) -> Printer {
        Printer::with_opener(test_config(), Arc::new(driver), Arc::new(opener)).unwrap()
    }

    pub(crate) fn test_printer() -> Printer {
        printer_with(test_driver(), MemoryOpener::default())
    }

    pub(crate) fn raster_request(pages: usize) -> JobRequest {
        let page = RasterPage {
            header: RasterHeader::packed(8, 4, 8, ColorSpace::Sgray),
            data: vec![0x11; 32],
        };
        JobRequest::new("raster", "alice", JobDocument::Raster(vec![page; pages]))
    }

    #[test]
    fn submit_refused_in_every_busy_state() {
        let p = test_printer();
        p.set_hold_new_jobs(true);
        assert!(matches!(
            p.submit(raster_request(1)),
            Err(SpoolwerkError::Busy(BusyReason::HoldingNewJobs))
        ));
        p.set_hold_new_jobs(false);
        p.set_accepting(false);
        assert!(matches!(
            p.submit(raster_request(1)),
            Err(SpoolwerkError::Busy(BusyReason::NotAccepting))
        ));
        p.set_accepting(true);
        p.pause();
        assert!(matches!(
            p.submit(raster_request(1)),
            Err(SpoolwerkError::Busy(BusyReason::Stopped))
        ));
        p.resume();
        assert_eq!(p.submit(raster_request(1)).unwrap(), JobId(1));
        p.delete();
        assert!(matches!(
            p.submit(raster_request(1)),
            Err(SpoolwerkError::Busy(BusyReason::Deleted))
        ));
        assert!(p.jobs(WhichJobs::All).iter().all(|j| j.id == JobId(1)));
    }

    #[test]
    fn processing_state_tracks_job_and_device() {
        let opener = MemoryOpener::default();
        let p = printer_with(test_driver(), opener.clone());
        let id = p.submit(raster_request(2)).unwrap();

        let (ticket, lease) = p.start_job(id).unwrap();
        let status = p.status();
        assert_eq!(status.state, PrinterState::Processing);
        assert_eq!(status.processing_job, Some(id));
        assert!(p.acquire_device(JobId(99)).is_err());

        assert_eq!(p.process(ticket, lease), JobOutcome::Completed);
        let status = p.status();
        assert_eq!(status.state, PrinterState::Idle);
        assert_eq!(status.processing_job, None);
        assert_eq!(status.impressions_completed, 2);
        assert_eq!(p.job(id).unwrap().impressions_completed, 2);
        assert_eq!(opener.device.bytes.lock().unwrap().len(), 64);
    }

    #[test]
    fn device_connection_reused_across_jobs() {
        let opener = MemoryOpener::default();
        let p = printer_with(test_driver(), opener.clone());
        p.submit(raster_request(1)).unwrap();
        p.submit(raster_request(1)).unwrap();
        assert!(p.process_next(|_| true).is_some());
        assert!(p.process_next(|_| true).is_some());
        assert_eq!(*opener.opens.lock().unwrap(), 1);

        p.set_device_uri("mem://other");
        p.submit(raster_request(1)).unwrap();
        p.process_next(|_| true);
        assert_eq!(*opener.opens.lock().unwrap(), 2);
    }

    #[test]
    fn device_failure_aborts_and_sets_offline() {
        let opener = MemoryOpener {
            refuse: true,
            ..Default::default()
        };
        let p = printer_with(test_driver(), opener);
        let id = p.submit(raster_request(1)).unwrap();
        p.process_next(|_| true);

        let job = p.job(id).unwrap();
        assert_eq!(job.state, JobState::Aborted);
        assert!(p.reasons().contains(PrinterReasons::OFFLINE));
        assert_eq!(p.state(), PrinterState::Idle);
    }

    #[test]
    fn write_failure_closes_connection() {
        let opener = MemoryOpener {
            device: MemoryDevice {
                fail_writes: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let p = printer_with(test_driver(), opener.clone());
        p.submit(raster_request(1)).unwrap();
        p.submit(raster_request(1)).unwrap();
        p.process_next(|_| true);
        p.process_next(|_| true);
        assert_eq!(*opener.opens.lock().unwrap(), 2);
        assert!(p.reasons().contains(PrinterReasons::OFFLINE));
    }

    #[test]
    fn pause_while_processing_stops_after_job() {
        let p = test_printer();
        let id = p.submit(raster_request(1)).unwrap();
        let (ticket, lease) = p.start_job(id).unwrap();
        p.pause();
        assert_eq!(p.state(), PrinterState::Processing);
        p.process(ticket, lease);
        assert_eq!(p.state(), PrinterState::Stopped);
        p.resume();
        assert_eq!(p.state(), PrinterState::Idle);
    }

    #[test]
    fn cancel_processing_job_is_cooperative() {
        let p = test_printer();
        let id = p.submit(raster_request(3)).unwrap();
        let (ticket, lease) = p.start_job(id).unwrap();
        assert_eq!(p.cancel_job(id).unwrap(), CancelEffect::Requested);
        assert_eq!(p.process(ticket, lease), JobOutcome::Canceled);
        assert_eq!(p.job(id).unwrap().state, JobState::Canceled);
    }

    #[test]
    fn supply_update_preserves_foreign_reasons() {
        let p = test_printer();
        p.set_supplies(vec![Supply::new(
            SupplyColor::Black,
            "Black Ink",
            true,
            5,
            SupplyType::Ink,
        )]);
        assert!(p.reasons().contains(PrinterReasons::MARKER_SUPPLY_LOW));
        p.set_reasons(PrinterReasons::MEDIA_EMPTY, PrinterReasons::NONE);

        p.update_supplies(&[SupplyDelta::new(0, -8)]);
        assert_eq!(p.supplies()[0].level, 0);
        let reasons = p.reasons();
        assert!(reasons.contains(PrinterReasons::MARKER_SUPPLY_EMPTY));
        assert!(!reasons.contains(PrinterReasons::MARKER_SUPPLY_LOW));
        assert!(reasons.contains(PrinterReasons::MEDIA_EMPTY));
    }

    #[test]
    fn device_never_held_twice() {
        let p = Arc::new(test_printer());
        let holders = Arc::new(AtomicUsize::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let p = p.clone();
                let holders = holders.clone();
                let acquired = acquired.clone();
                std::thread::spawn(move || {
                    for n in 0..50 {
                        if let Ok(lease) = p.acquire_device(JobId(i * 100 + n)) {
                            assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                            acquired.fetch_add(1, Ordering::SeqCst);
                            std::thread::yield_now();
                            holders.fetch_sub(1, Ordering::SeqCst);
                            p.release_device(lease);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(acquired.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn printer_with_open_device_crosses_threads() {
        fn shareable<T: Send + Sync>() {}
        shareable::<Printer>();

        let opener = MemoryOpener::default();
        let p = Arc::new(printer_with(test_driver(), opener.clone()));
        p.submit(raster_request(1)).unwrap();
        p.process_next(|_| true);

        // The slot now holds the retained connection.
        let worker = p.clone();
        let second = std::thread::spawn(move || {
            let id = worker.submit(raster_request(1)).unwrap();
            worker.process_next(|_| true);
            id
        })
        .join()
        .unwrap();

        assert_eq!(p.job(second).unwrap().state, JobState::Completed);
        assert_eq!(*opener.opens.lock().unwrap(), 1);
        assert_eq!(opener.device.bytes.lock().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let p = Arc::new(test_printer());
        let lease = p.acquire_device(JobId(1)).unwrap();

        let releaser = p.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser.release_device(lease);
        });

        let lease = p
            .acquire_device_timeout(JobId(2), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(lease.job(), JobId(2));

        let err = p
            .acquire_device_timeout(JobId(3), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SpoolwerkError::DeviceUnavailable(_)));
    }

    #[test]
    fn identify_brackets_reason_and_filters_actions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let mut driver = test_driver();
        driver.identify_supported = IdentifyActions::DISPLAY | IdentifyActions::SOUND;
        driver.identify_default = IdentifyActions::SOUND;
        driver.callbacks = driver.callbacks.on_identify(move |printer: &Printer, actions, msg| {
            let flagged = printer
                .reasons()
                .contains(PrinterReasons::IDENTIFY_PRINTER_REQUESTED);
            record
                .lock()
                .unwrap()
                .push((actions, msg.map(str::to_string), flagged));
        });
        let p = printer_with(driver, MemoryOpener::default());

        p.identify(IdentifyActions::DISPLAY | IdentifyActions::FLASH, Some("hi"))
            .unwrap();
        p.identify(IdentifyActions::NONE, None).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (IdentifyActions::DISPLAY, Some("hi".into()), true));
        assert_eq!(seen[1].0, IdentifyActions::SOUND);
        assert!(!p.reasons().contains(PrinterReasons::IDENTIFY_PRINTER_REQUESTED));

        assert!(matches!(
            test_printer().identify(IdentifyActions::DISPLAY, None),
            Err(SpoolwerkError::NotSupported(_))
        ));
    }

    #[test]
    fn status_poll_is_rate_limited() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut driver = test_driver();
        driver.callbacks = driver.callbacks.on_status(move |_printer: &Printer| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let p = printer_with(driver, MemoryOpener::default());
        assert!(p.refresh_status().unwrap());
        assert!(!p.refresh_status().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_page_is_queued_as_file_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pwg");
        std::fs::write(&path, b"TESTPAGE").unwrap();

        let opener = MemoryOpener::default();
        let mut driver = test_driver();
        let page = path.clone();
        driver.callbacks = driver
            .callbacks
            .on_test_page(move |_printer: &Printer| Some(page.clone()));
        let p = printer_with(driver, opener.clone());

        let id = p.print_test_page("admin").unwrap();
        p.process_next(|_| true);
        assert_eq!(p.job(id).unwrap().state, JobState::Completed);
        assert_eq!(&*opener.device.bytes.lock().unwrap(), b"TESTPAGE");
    }

    #[test]
    fn config_roundtrip_keeps_job_counter() {
        let p = test_printer();
        p.submit(raster_request(1)).unwrap();
        p.submit(raster_request(1)).unwrap();
        let cfg = p.to_config();
        assert_eq!(cfg.next_job_id, 3);

        let restored =
            Printer::with_opener(cfg, Arc::new(test_driver()), Arc::new(MemoryOpener::default()))
                .unwrap();
        assert_eq!(restored.submit(raster_request(1)).unwrap(), JobId(3));
        assert_eq!(restored.uuid(), p.uuid());
    }

    #[test]
    fn presence_follows_printer_lifecycle() {
        let backend = Arc::new(FakeBackend::taking(&["Test"]));
        let p = test_printer();
        p.attach_presence(Arc::new(PresencePublisher::new(backend.clone(), options())));

        p.register_presence().unwrap();
        let state = p.presence_state();
        assert_eq!(state.serial, 2);
        assert_eq!(p.status().advertised_name, "Test (2)");
        let count = state.registered.len();

        p.delete();
        assert_eq!(backend.removed.lock().unwrap().len(), count);
        assert!(matches!(
            p.register_presence(),
            Err(SpoolwerkError::PrinterDeleted)
        ));
    }

    #[test]
    fn usb_settings_locked_while_active() {
        let p = test_printer();
        p.set_usb_active(true);
        assert!(p.set_usb_config(Some(UsbGadgetConfig::default())).is_err());
        p.set_usb_active(false);
        p.set_usb_config(Some(UsbGadgetConfig::default())).unwrap();
        assert!(p.usb_config().is_some());
    }
}
