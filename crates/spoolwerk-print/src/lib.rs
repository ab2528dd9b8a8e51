// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolwerk Print: the printer runtime.  Virtual printers with their job
// queue and device arbitration, the raster driver bridge, supply tracking,
// DNS-SD presence, raw socket and USB gadget ingress, and the per-printer
// scheduler.  Printer configuration is persisted through `StateStore`.

pub mod bridge;
pub mod device;
pub mod driver;
pub mod listener;
pub mod presence;
pub mod printer;
pub mod queue;
pub mod retry;
pub mod sample_driver;
pub mod scheduler;
pub mod store;
pub mod supplies;

pub use device::{Device, DeviceLease, DeviceOpener, StandardOpener};
pub use driver::{DriverCallbacks, DriverData, DriverRegistry, JobContext};
pub use listener::{RawListener, UsbListener};
pub use presence::{MdnsBackend, PresenceOptions, PresencePublisher};
pub use printer::Printer;
pub use queue::{CancelEffect, QueueLimits};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use store::StateStore;
pub use supplies::{LevelPolicy, SupplyDelta};
