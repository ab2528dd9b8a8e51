// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolwerk: core types, reason flags, configuration and error definitions
// shared across all crates.

pub mod config;
pub mod error;
pub mod reasons;
pub mod types;

pub use config::{PrinterConfig, ServerConfig};
pub use error::{BusyReason, SpoolwerkError};
pub use reasons::PrinterReasons;
pub use types::*;
