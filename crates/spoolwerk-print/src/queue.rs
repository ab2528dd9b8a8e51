// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-printer job queue.
//
// The queue keeps every job the printer still remembers in three views:
// `jobs` (all, keyed by id), `active` (pending or processing, submission
// order) and `completed` (terminal, oldest first).  It has no lock of its own;
// it lives inside the printer's guarded state and every method runs inside
// the printer's lock, so admission and retirement are atomic with respect to
// the rest of the printer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use spoolwerk_core::error::{BusyReason, Result, SpoolwerkError};
use spoolwerk_core::types::{
    JobDocument, JobId, JobInfo, JobOutcome, JobRequest, JobState, PrintOptions, WhichJobs,
};

/// Operator limits on the queue.  Zero means no limit for active and
/// completed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_active_jobs: usize,
    pub max_completed_jobs: usize,
    /// Newest completed jobs that keep their document and survive trimming.
    pub max_preserved_jobs: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_active_jobs: 0,
            max_completed_jobs: 100,
            max_preserved_jobs: 0,
        }
    }
}

/// View of a pending job offered to the selection gate.
#[derive(Debug)]
pub struct Candidate<'a> {
    pub id: JobId,
    pub format: &'a str,
    pub options: &'a PrintOptions,
}

/// What a processing run needs from a job, detached from the queue.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub id: JobId,
    pub document: Arc<JobDocument>,
    pub options: PrintOptions,
    pub cancel: Arc<AtomicBool>,
}

impl JobTicket {
    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// Effect of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelEffect {
    /// The job was pending and is now canceled.
    Canceled,
    /// The job is processing; it stops at the next callback boundary.
    Requested,
}

#[derive(Debug)]
struct JobRecord {
    id: JobId,
    name: String,
    username: String,
    format: String,
    document: Option<Arc<JobDocument>>,
    options: PrintOptions,
    state: JobState,
    state_message: Option<String>,
    created_at: DateTime<Utc>,
    processing_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    impressions: u32,
    impressions_completed: u32,
    cancel: Arc<AtomicBool>,
}

impl JobRecord {
    fn info(&self, printer_id: u32) -> JobInfo {
        JobInfo {
            id: self.id,
            printer_id,
            name: self.name.clone(),
            username: self.username.clone(),
            format: self.format.clone(),
            state: self.state,
            state_message: self.state_message.clone(),
            created_at: self.created_at,
            processing_at: self.processing_at,
            completed_at: self.completed_at,
            impressions: self.impressions,
            impressions_completed: self.impressions_completed,
            document_retained: self.document.is_some(),
        }
    }
}

#[derive(Debug)]
pub struct JobQueue {
    printer_id: u32,
    next_job_id: u32,
    limits: QueueLimits,
    jobs: BTreeMap<JobId, JobRecord>,
    active: Vec<JobId>,
    completed: VecDeque<JobId>,
    processing: Option<JobId>,
}

impl JobQueue {
    pub fn new(printer_id: u32, next_job_id: u32, limits: QueueLimits) -> Self {
        Self {
            printer_id,
            next_job_id: next_job_id.max(1),
            limits,
            jobs: BTreeMap::new(),
            active: Vec::new(),
            completed: VecDeque::new(),
            processing: None,
        }
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    /// Change the limits and re-apply retention.
    pub fn set_limits(&mut self, limits: QueueLimits) {
        self.limits = limits;
        self.trim();
    }

    /// Id the next submitted job will receive.
    pub fn next_job_id(&self) -> u32 {
        self.next_job_id
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn processing(&self) -> Option<JobId> {
        self.processing
    }

    /// Admit a job.  On rejection nothing is created and no id is consumed.
    #[instrument(skip(self, request), fields(printer = self.printer_id, name = %request.name))]
    pub fn submit(&mut self, request: JobRequest) -> Result<JobId> {
        let max = self.limits.max_active_jobs;
        if max > 0 && self.active.len() >= max {
            debug!(active = self.active.len(), max, "rejecting job: queue full");
            return Err(SpoolwerkError::Busy(BusyReason::QueueFull {
                max_active_jobs: max,
            }));
        }

        let Some(following) = self.next_job_id.checked_add(1) else {
            warn!(next_job_id = self.next_job_id, "rejecting job: job ids exhausted");
            return Err(SpoolwerkError::Busy(BusyReason::JobIdsExhausted));
        };
        let impressions = request
            .document
            .page_count()
            .checked_mul(request.options.copies.max(1))
            .ok_or_else(|| {
                SpoolwerkError::InvalidDocument(format!(
                    "{} pages times {} copies is too many impressions",
                    request.document.page_count(),
                    request.options.copies
                ))
            })?;

        let id = JobId(self.next_job_id);
        self.next_job_id = following;

        let format = request.document.format().to_string();
        self.jobs.insert(
            id,
            JobRecord {
                id,
                name: request.name,
                username: request.username,
                format,
                document: Some(Arc::new(request.document)),
                options: request.options,
                state: JobState::Pending,
                state_message: None,
                created_at: Utc::now(),
                processing_at: None,
                completed_at: None,
                impressions,
                impressions_completed: 0,
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
        self.active.push(id);
        info!(job_id = %id, "job queued");
        Ok(id)
    }

    /// First pending job, in submission order, that `gate` accepts.
    ///
    /// Stream documents are fed by their ingress listener and never selected.
    pub fn select_next(&self, gate: impl Fn(&Candidate<'_>) -> bool) -> Option<JobId> {
        if self.processing.is_some() {
            return None;
        }
        self.active
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|job| job.state == JobState::Pending)
            .filter(|job| {
                !matches!(job.document.as_deref(), Some(JobDocument::Stream { .. }) | None)
            })
            .find(|job| {
                gate(&Candidate {
                    id: job.id,
                    format: &job.format,
                    options: &job.options,
                })
            })
            .map(|job| job.id)
    }

    /// Check that `id` could start processing now.
    pub fn check_startable(&self, id: JobId) -> Result<()> {
        let job = self.jobs.get(&id).ok_or(SpoolwerkError::JobNotFound(id))?;
        if job.state != JobState::Pending {
            return Err(SpoolwerkError::InvalidJobState {
                id,
                state: job.state,
                action: "start",
            });
        }
        if job.cancel.load(Ordering::Acquire) {
            return Err(SpoolwerkError::InvalidJobState {
                id,
                state: JobState::Canceled,
                action: "start",
            });
        }
        if let Some(current) = self.processing {
            return Err(SpoolwerkError::InvalidJobState {
                id: current,
                state: JobState::Processing,
                action: "start another job",
            });
        }
        Ok(())
    }

    /// Move a pending job to processing.
    pub fn begin(&mut self, id: JobId) -> Result<JobTicket> {
        self.check_startable(id)?;
        let job = self.jobs.get_mut(&id).ok_or(SpoolwerkError::JobNotFound(id))?;
        let document = job
            .document
            .clone()
            .ok_or_else(|| SpoolwerkError::Driver(format!("job {id} has no document")))?;
        job.state = JobState::Processing;
        job.processing_at = Some(Utc::now());
        self.processing = Some(id);
        debug!(job_id = %id, "job processing");
        Ok(JobTicket {
            id,
            document,
            options: job.options.clone(),
            cancel: Arc::clone(&job.cancel),
        })
    }

    /// Retire an active job with its terminal outcome, then trim.
    #[instrument(skip(self), fields(printer = self.printer_id))]
    pub fn complete(&mut self, id: JobId, outcome: JobOutcome, impressions: u32) -> Result<()> {
        let job = self.jobs.get_mut(&id).ok_or(SpoolwerkError::JobNotFound(id))?;
        if job.state.is_terminal() {
            return Err(SpoolwerkError::InvalidJobState {
                id,
                state: job.state,
                action: "complete",
            });
        }
        job.state = outcome.state();
        job.state_message = outcome.message().map(str::to_string);
        job.completed_at = Some(Utc::now());
        job.impressions_completed = impressions;

        self.active.retain(|a| *a != id);
        self.completed.push_back(id);
        if self.processing == Some(id) {
            self.processing = None;
        }
        info!(job_id = %id, state = ?job.state, "job finished");
        self.trim();
        Ok(())
    }

    /// Cancel a job.  Pending jobs retire immediately; a processing job is
    /// flagged and retires when its run stops.
    pub fn cancel(&mut self, id: JobId) -> Result<CancelEffect> {
        let (state, cancel) = {
            let job = self.jobs.get(&id).ok_or(SpoolwerkError::JobNotFound(id))?;
            (job.state, Arc::clone(&job.cancel))
        };
        match state {
            JobState::Pending => {
                cancel.store(true, Ordering::Release);
                self.complete(id, JobOutcome::Canceled, 0)?;
                Ok(CancelEffect::Canceled)
            }
            JobState::Processing => {
                cancel.store(true, Ordering::Release);
                info!(job_id = %id, "cancel requested for processing job");
                Ok(CancelEffect::Requested)
            }
            state => Err(SpoolwerkError::InvalidJobState {
                id,
                state,
                action: "cancel",
            }),
        }
    }

    /// Cancel every active job.  Returns how many were affected.
    pub fn cancel_all(&mut self) -> usize {
        let ids = self.active.clone();
        ids.into_iter()
            .filter(|id| self.cancel(*id).is_ok())
            .count()
    }

    pub fn info(&self, id: JobId) -> Option<JobInfo> {
        self.jobs.get(&id).map(|j| j.info(self.printer_id))
    }

    /// Snapshots of the chosen collection, oldest first.
    pub fn list(&self, which: WhichJobs) -> Vec<JobInfo> {
        let ids: Vec<JobId> = match which {
            WhichJobs::Active => self.active.clone(),
            WhichJobs::Completed => self.completed.iter().copied().collect(),
            WhichJobs::All => self.jobs.keys().copied().collect(),
        };
        ids.iter()
            .filter_map(|id| self.jobs.get(id))
            .map(|j| j.info(self.printer_id))
            .collect()
    }

    /// Evict the oldest non-preserved completed jobs until the completed
    /// count is within its limit, and drop documents that are not preserved.
    fn trim(&mut self) {
        let max = self.limits.max_completed_jobs;
        let preserved = self.limits.max_preserved_jobs;

        while max > 0 && self.completed.len() > max && self.completed.len() > preserved {
            if let Some(evicted) = self.completed.pop_front() {
                self.jobs.remove(&evicted);
                debug!(job_id = %evicted, "completed job evicted");
            }
        }

        let keep_from = self.completed.len().saturating_sub(preserved);
        for id in self.completed.iter().take(keep_from) {
            if let Some(job) = self.jobs.get_mut(id) {
                job.document = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoolwerk_core::types::{ColorSpace, RasterHeader, RasterPage};

    fn request(name: &str) -> JobRequest {
        JobRequest::new(
            name,
            "alice",
            JobDocument::File {
                path: "/tmp/doc.pdf".into(),
                format: "application/pdf".into(),
            },
        )
    }

    fn queue(max_active: usize, max_completed: usize, max_preserved: usize) -> JobQueue {
        JobQueue::new(
            1,
            1,
            QueueLimits {
                max_active_jobs: max_active,
                max_completed_jobs: max_completed,
                max_preserved_jobs: max_preserved,
            },
        )
    }

    #[test]
    fn third_submit_rejected_when_two_active_allowed() {
        let mut q = queue(2, 0, 0);
        assert_eq!(q.submit(request("a")).unwrap(), JobId(1));
        assert_eq!(q.submit(request("b")).unwrap(), JobId(2));
        let err = q.submit(request("c")).unwrap_err();
        assert!(matches!(
            err,
            SpoolwerkError::Busy(BusyReason::QueueFull { max_active_jobs: 2 })
        ));
        assert_eq!(q.active_len(), 2);
        assert_eq!(q.list(WhichJobs::All).len(), 2);
        assert_eq!(q.next_job_id(), 3);
    }

    #[test]
    fn oversized_copy_count_is_rejected() {
        let mut q = queue(0, 0, 0);
        let page = RasterPage {
            header: RasterHeader::packed(1, 1, 8, ColorSpace::Sgray),
            data: vec![0],
        };
        let mut req = JobRequest::new("big", "alice", JobDocument::Raster(vec![page; 2]));
        req.options.copies = u32::MAX;
        let err = q.submit(req).unwrap_err();
        assert!(matches!(err, SpoolwerkError::InvalidDocument(_)));
        assert_eq!(q.active_len(), 0);
        assert_eq!(q.next_job_id(), 1);
    }

    #[test]
    fn submits_refused_once_ids_run_out() {
        let mut q = JobQueue::new(1, u32::MAX - 1, QueueLimits::default());
        assert_eq!(q.submit(request("last")).unwrap(), JobId(u32::MAX - 1));
        let err = q.submit(request("over")).unwrap_err();
        assert!(matches!(err, SpoolwerkError::Busy(BusyReason::JobIdsExhausted)));
        assert_eq!(q.list(WhichJobs::All).len(), 1);
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let mut q = queue(0, 2, 0);
        let mut last = 0;
        for _ in 0..10 {
            let id = q.submit(request("x")).unwrap();
            assert!(id.0 > last);
            last = id.0;
            q.complete(id, JobOutcome::Completed, 1).unwrap();
        }
    }

    #[test]
    fn retention_trims_oldest_completed() {
        let mut q = queue(0, 3, 0);
        for _ in 0..5 {
            let id = q.submit(request("x")).unwrap();
            q.complete(id, JobOutcome::Completed, 1).unwrap();
        }
        let kept: Vec<u32> = q.list(WhichJobs::Completed).iter().map(|j| j.id.0).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert!(q.info(JobId(1)).is_none());
    }

    #[test]
    fn preserved_jobs_keep_documents_and_survive() {
        let mut q = queue(0, 1, 2);
        for _ in 0..4 {
            let id = q.submit(request("x")).unwrap();
            q.complete(id, JobOutcome::Completed, 1).unwrap();
        }
        let kept = q.list(WhichJobs::Completed);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|j| j.document_retained));
    }

    #[test]
    fn unpreserved_completed_jobs_drop_documents() {
        let mut q = queue(0, 10, 1);
        let a = q.submit(request("a")).unwrap();
        q.complete(a, JobOutcome::Completed, 1).unwrap();
        let b = q.submit(request("b")).unwrap();
        q.complete(b, JobOutcome::Completed, 1).unwrap();
        assert!(!q.info(a).unwrap().document_retained);
        assert!(q.info(b).unwrap().document_retained);
    }

    #[test]
    fn select_next_is_fifo_and_honours_gate() {
        let mut q = queue(0, 10, 0);
        let a = q.submit(request("a")).unwrap();
        let b = q.submit(request("b")).unwrap();
        assert_eq!(q.select_next(|_| true), Some(a));
        assert_eq!(q.select_next(|c| c.id != a), Some(b));
        assert_eq!(q.select_next(|_| false), None);

        q.begin(a).unwrap();
        assert_eq!(q.select_next(|_| true), None);
    }

    #[test]
    fn stream_jobs_are_never_selected() {
        let mut q = queue(0, 10, 0);
        q.submit(JobRequest::new(
            "raw",
            "guest",
            JobDocument::Stream {
                format: "application/octet-stream".into(),
            },
        ))
        .unwrap();
        assert_eq!(q.select_next(|_| true), None);
    }

    #[test]
    fn cancel_pending_retires_and_processing_flags() {
        let mut q = queue(0, 10, 0);
        let a = q.submit(request("a")).unwrap();
        let b = q.submit(request("b")).unwrap();

        let ticket = q.begin(a).unwrap();
        assert_eq!(q.cancel(a).unwrap(), CancelEffect::Requested);
        assert!(ticket.is_canceled());
        assert_eq!(q.info(a).unwrap().state, JobState::Processing);

        assert_eq!(q.cancel(b).unwrap(), CancelEffect::Canceled);
        assert_eq!(q.info(b).unwrap().state, JobState::Canceled);
        assert!(matches!(
            q.cancel(b),
            Err(SpoolwerkError::InvalidJobState { .. })
        ));
    }

    #[test]
    fn complete_records_outcome_message() {
        let mut q = queue(0, 10, 0);
        let a = q.submit(request("a")).unwrap();
        q.begin(a).unwrap();
        q.complete(a, JobOutcome::Aborted("paper jam".into()), 0)
            .unwrap();
        let info = q.info(a).unwrap();
        assert_eq!(info.state, JobState::Aborted);
        assert_eq!(info.state_message.as_deref(), Some("paper jam"));
        assert_eq!(q.processing(), None);
        assert_eq!(q.active_len(), 0);
    }
}
