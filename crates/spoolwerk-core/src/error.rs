// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Spoolwerk.

use std::fmt;

use thiserror::Error;

use crate::types::{JobId, JobState};

/// Why a printer refused to admit a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    /// The printer has been deleted.
    Deleted,
    /// The printer is stopped (paused by the operator).
    Stopped,
    /// The printer is not accepting jobs.
    NotAccepting,
    /// New jobs are being held by the operator.
    HoldingNewJobs,
    /// The active-job limit has been reached.
    QueueFull { max_active_jobs: usize },
    /// The output device is held by another job.
    DeviceInUse,
    /// Every job id has been handed out.
    JobIdsExhausted,
}

impl fmt::Display for BusyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deleted => write!(f, "printer deleted"),
            Self::Stopped => write!(f, "printer stopped"),
            Self::NotAccepting => write!(f, "printer not accepting jobs"),
            Self::HoldingNewJobs => write!(f, "printer is holding new jobs"),
            Self::QueueFull { max_active_jobs } => {
                write!(f, "too many active jobs (limit {max_active_jobs})")
            }
            Self::DeviceInUse => write!(f, "device in use"),
            Self::JobIdsExhausted => write!(f, "no job ids left"),
        }
    }
}

/// Top-level error type for all Spoolwerk operations.
#[derive(Debug, Error)]
pub enum SpoolwerkError {
    // -- Admission / scheduling --
    #[error("printer busy: {0}")]
    Busy(BusyReason),

    #[error("printer has been deleted")]
    PrinterDeleted,

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {id} is {state:?}, cannot {action}")]
    InvalidJobState {
        id: JobId,
        state: JobState,
        action: &'static str,
    },

    // -- Device / driver --
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("device I/O failed: {0}")]
    Device(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("not supported by driver: {0}")]
    NotSupported(&'static str),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    // -- Presence / ingress --
    #[error("service discovery failed: {0}")]
    Discovery(String),

    #[error("listener error: {0}")]
    Listener(String),

    // -- Configuration / persistence --
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SpoolwerkError {
    /// Whether this error means the device should be treated as offline.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            Self::Device(_) | Self::DeviceUnavailable(_) | Self::Io(_)
        )
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SpoolwerkError>;
