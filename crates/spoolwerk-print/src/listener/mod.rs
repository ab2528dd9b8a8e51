// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ingress listeners: raw socket (AppSocket/JetDirect) and USB printer gadget.
//
// Both turn an incoming byte stream into one `JobDocument::Stream` job that
// holds the printer's device while the bytes are copied through.

pub mod raw;
pub mod usb;

pub use raw::RawListener;
pub use usb::{GadgetConfig, UsbListener};

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{JobDocument, JobId, JobOutcome, JobRequest};

use crate::device::DeviceLease;
use crate::printer::Printer;
use crate::queue::JobTicket;

/// Document format recorded for raw ingress jobs.
pub const RAW_FORMAT: &str = "application/octet-stream";

/// Read buffer size for ingress streams.
pub(crate) const READ_CHUNK: usize = 8192;

/// Chunks buffered between the reader and the device writer.
const WRITE_QUEUE: usize = 8;

/// Submit a stream job and wait for the device.
pub(crate) async fn open_stream_job(
    printer: &Arc<Printer>,
    name: String,
    username: &str,
    device_wait: Duration,
) -> Result<(JobTicket, DeviceLease)> {
    let request = JobRequest::new(
        name,
        username,
        JobDocument::Stream {
            format: RAW_FORMAT.into(),
        },
    );
    let id = printer.submit(request)?;
    match printer.start_job_timeout(id, device_wait).await {
        Ok(started) => Ok(started),
        Err(e) => {
            if let Err(abort) = printer.abort_job(id, e.to_string()) {
                debug!(job_id = %id, error = %abort, "stream job already retired");
            }
            Err(e)
        }
    }
}

/// Outcome of the reading side of a stream job.
#[derive(Debug)]
pub(crate) enum ReadEnd {
    /// Sender closed the stream.
    Eof,
    /// No data arrived within the idle timeout.
    Idle(Duration),
    /// The job was canceled while streaming.
    Canceled,
    Failed(String),
}

/// Copy bytes from `chunks` to the leased device on a blocking thread.
///
/// Returns the lease (marked failed on device errors), the number of bytes
/// written and the first device error.
pub(crate) fn spawn_device_writer(
    printer: Arc<Printer>,
    mut lease: DeviceLease,
) -> (
    mpsc::Sender<Vec<u8>>,
    tokio::task::JoinHandle<(DeviceLease, u64, Option<SpoolwerkError>)>,
) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE);
    let handle = tokio::task::spawn_blocking(move || {
        let mut written = 0u64;
        let error = pump(&printer, &mut lease, &mut rx, &mut written).err();
        if error.is_some() {
            lease.mark_failed();
        }
        (lease, written, error)
    });
    (tx, handle)
}

fn pump(
    printer: &Printer,
    lease: &mut DeviceLease,
    rx: &mut mpsc::Receiver<Vec<u8>>,
    written: &mut u64,
) -> Result<()> {
    let device = lease.device(printer.opener())?;
    while let Some(chunk) = rx.blocking_recv() {
        device.write_all(&chunk)?;
        *written += chunk.len() as u64;
    }
    device.flush()
}

/// Read `source` into the device writer until EOF, an idle timeout, a
/// cancel request or a failure.
pub(crate) async fn copy_stream<R: AsyncRead + Unpin>(
    source: &mut R,
    ticket: &JobTicket,
    tx: mpsc::Sender<Vec<u8>>,
    idle: Duration,
    digest: &mut Sha256,
) -> ReadEnd {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if ticket.is_canceled() {
            return ReadEnd::Canceled;
        }
        let n = match tokio::time::timeout(idle, source.read(&mut buf)).await {
            Err(_) => return ReadEnd::Idle(idle),
            Ok(Err(e)) => return ReadEnd::Failed(format!("read: {e}")),
            Ok(Ok(0)) => return ReadEnd::Eof,
            Ok(Ok(n)) => n,
        };
        digest.update(&buf[..n]);
        if tx.send(buf[..n].to_vec()).await.is_err() {
            return ReadEnd::Failed("device writer stopped".into());
        }
    }
}

/// Finish a stream job: join the writer, pick the outcome and retire it.
pub(crate) async fn finish_stream_job(
    printer: &Printer,
    id: JobId,
    end: ReadEnd,
    digest: Sha256,
    writer: tokio::task::JoinHandle<(DeviceLease, u64, Option<SpoolwerkError>)>,
) -> Result<JobOutcome> {
    let (lease, written, device_error) = match writer.await {
        Ok(done) => done,
        Err(e) => {
            let reason = format!("device writer task failed: {e}");
            printer.abandon_job(id, reason.clone())?;
            return Ok(JobOutcome::Aborted(reason));
        }
    };

    let outcome = match (device_error, end) {
        (Some(e), _) => JobOutcome::Aborted(e.to_string()),
        (None, ReadEnd::Eof) => JobOutcome::Completed,
        (None, ReadEnd::Canceled) => JobOutcome::Canceled,
        (None, ReadEnd::Idle(after)) => {
            JobOutcome::Aborted(format!("no data received for {}s", after.as_secs()))
        }
        (None, ReadEnd::Failed(reason)) => JobOutcome::Aborted(reason),
    };

    let sha256 = hex::encode(digest.finalize());
    match &outcome {
        JobOutcome::Completed => info!(job_id = %id, bytes = written, sha256 = %sha256, "stream job received"),
        other => warn!(job_id = %id, bytes = written, sha256 = %sha256, outcome = ?other, "stream job ended early"),
    }

    printer.finish_job(id, lease, outcome.clone(), 0)?;
    Ok(outcome)
}
