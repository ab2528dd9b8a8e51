// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Output devices and the exclusive-use device slot.
//
// A printer owns exactly one device slot.  The slot is either closed, holding
// a connection left open by a previous job, or handed out to a job as a
// `DeviceLease`.  The lease owns the connection while the job runs so that
// device I/O happens without the printer lock; releasing the lease puts a
// healthy connection back into the slot for reuse by the next job.
//
// Built-in URI schemes:
//   - `file:///path`          append to a local file or character device
//   - `socket://host[:port]`  raw TCP (AppSocket/JetDirect, default 9100)

use std::fs::OpenOptions;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::JobId;

/// Default raw TCP port (HP JetDirect).
pub const RAW_PORT: u16 = 9100;

/// Timeout for socket connect and write operations.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Writes are split into chunks of this size for progress logging.
const CHUNK_SIZE: usize = 8192;

/// A byte sink connected to the physical printer.
///
/// Devices live inside the printer's lock while idle, so they must be
/// `Sync` for the printer to be shared between tasks.
pub trait Device: Send + Sync {
    /// Write all of `buf` to the device.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Flush buffered output.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens device connections from URIs.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn Device>>;
}

/// Opener for the built-in `file://` and `socket://` schemes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardOpener;

impl DeviceOpener for StandardOpener {
    fn open(&self, uri: &str) -> Result<Box<dyn Device>> {
        if let Some(path) = uri.strip_prefix("file://") {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| SpoolwerkError::DeviceUnavailable(format!("open {uri}: {e}")))?;
            info!(uri, "file device opened");
            return Ok(Box::new(StreamDevice::new(file)));
        }

        if let Some(rest) = uri.strip_prefix("socket://") {
            let authority = rest.split('/').next().unwrap_or(rest);
            let addr = if authority.contains(':') {
                authority.to_string()
            } else {
                format!("{authority}:{RAW_PORT}")
            };
            let sock_addr = addr
                .to_socket_addrs()
                .map_err(|e| SpoolwerkError::DeviceUnavailable(format!("resolve {addr}: {e}")))?
                .next()
                .ok_or_else(|| SpoolwerkError::DeviceUnavailable(format!("no address for {addr}")))?;
            let stream = TcpStream::connect_timeout(&sock_addr, SOCKET_TIMEOUT).map_err(|e| {
                SpoolwerkError::DeviceUnavailable(format!("raw TCP connect to {addr}: {e}"))
            })?;
            stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;
            info!(addr = %addr, "socket device connected");
            return Ok(Box::new(StreamDevice::new(stream)));
        }

        Err(SpoolwerkError::DeviceUnavailable(format!(
            "unsupported device URI scheme: {uri}"
        )))
    }
}

/// Device backed by any `std::io::Write`.
pub struct StreamDevice<W> {
    inner: W,
    written: u64,
}

impl<W: Write + Send + Sync> StreamDevice<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Total bytes written through this device.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl<W: Write + Send + Sync> Device for StreamDevice<W> {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(CHUNK_SIZE) {
            self.inner.write_all(chunk).map_err(|e| {
                SpoolwerkError::Device(format!("write failed at byte {}: {e}", self.written))
            })?;
            self.written += chunk.len() as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner
            .flush()
            .map_err(|e| SpoolwerkError::Device(format!("flush: {e}")))
    }
}

/// An open device connection tagged with the URI it was opened from.
pub struct OpenDevice {
    pub uri: String,
    pub device: Box<dyn Device>,
}

/// State of the connection carried by a lease.
pub enum Connection {
    /// Nothing open yet; opened on first use.
    Unopened,
    /// Still open from a prior job on the same URI.
    Reused(OpenDevice),
    /// Opened for this lease.
    Opened(OpenDevice),
}

/// Contents of a printer's device slot.
pub(crate) enum DeviceSlot {
    Closed,
    Open(OpenDevice),
    InUse(JobId),
}

impl DeviceSlot {
    pub(crate) fn holder(&self) -> Option<JobId> {
        match self {
            Self::InUse(job) => Some(*job),
            _ => None,
        }
    }

    /// Hand the slot's connection to a new lease, marking the slot in use.
    /// The caller checks `holder()` first.
    pub(crate) fn take_for(&mut self, job: JobId, uri: &str) -> Connection {
        match std::mem::replace(self, Self::InUse(job)) {
            Self::Open(open) if open.uri == uri => Connection::Reused(open),
            Self::Open(stale) => {
                debug!(uri = %stale.uri, "closing connection opened for a different URI");
                Connection::Unopened
            }
            Self::InUse(holder) => {
                debug!(holder = %holder, job_id = %job, "device slot reassigned");
                Connection::Unopened
            }
            Self::Closed => Connection::Unopened,
        }
    }
}

/// Exclusive, owned access to a printer's device for one job.
pub struct DeviceLease {
    job: JobId,
    uri: String,
    connection: Connection,
    failed: bool,
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease")
            .field("job", &self.job)
            .field("uri", &self.uri)
            .field("reused", &self.is_reused())
            .field("failed", &self.failed)
            .finish()
    }
}

impl DeviceLease {
    pub(crate) fn new(job: JobId, uri: String, connection: Connection) -> Self {
        Self {
            job,
            uri,
            connection,
            failed: false,
        }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether the connection was carried over from a previous job.
    pub fn is_reused(&self) -> bool {
        matches!(self.connection, Connection::Reused(_))
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.connection, Connection::Unopened)
    }

    /// Open the connection if needed and return the device.
    pub fn device(&mut self, opener: &dyn DeviceOpener) -> Result<&mut dyn Device> {
        if matches!(self.connection, Connection::Unopened) {
            match opener.open(&self.uri) {
                Ok(device) => {
                    self.connection = Connection::Opened(OpenDevice {
                        uri: self.uri.clone(),
                        device,
                    });
                }
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }
        match &mut self.connection {
            Connection::Reused(open) | Connection::Opened(open) => Ok(open.device.as_mut()),
            Connection::Unopened => Err(SpoolwerkError::DeviceUnavailable(self.uri.clone())),
        }
    }

    /// Mark the connection unusable so release closes it.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Connection to keep in the slot after release, if any.
    pub(crate) fn into_retained(self) -> Option<OpenDevice> {
        if self.failed {
            return None;
        }
        match self.connection {
            Connection::Reused(open) | Connection::Opened(open) => Some(open),
            Connection::Unopened => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory device shared with the test for inspection.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryDevice {
        pub(crate) bytes: Arc<Mutex<Vec<u8>>>,
        pub(crate) fail_writes: bool,
    }

    impl Device for MemoryDevice {
        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            if self.fail_writes {
                return Err(SpoolwerkError::Device("simulated write failure".into()));
            }
            self.bytes.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }
    }

    /// Opener that always returns clones of the same memory device and
    /// counts how many times it was asked to open.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryOpener {
        pub(crate) device: MemoryDevice,
        pub(crate) opens: Arc<Mutex<u32>>,
        pub(crate) refuse: bool,
    }

    impl DeviceOpener for MemoryOpener {
        fn open(&self, uri: &str) -> Result<Box<dyn Device>> {
            if self.refuse {
                return Err(SpoolwerkError::DeviceUnavailable(format!("{uri} refused")));
            }
            *self.opens.lock().unwrap() += 1;
            Ok(Box::new(self.device.clone()))
        }
    }

    #[test]
    fn slot_reuses_connection_for_same_uri() {
        let opener = MemoryOpener::default();
        let mut slot = DeviceSlot::Closed;

        let conn = slot.take_for(JobId(1), "mem://a");
        let mut lease = DeviceLease::new(JobId(1), "mem://a".into(), conn);
        lease.device(&opener).unwrap().write_all(b"x").unwrap();
        assert!(!lease.is_reused());
        slot = lease.into_retained().map_or(DeviceSlot::Closed, DeviceSlot::Open);

        let conn = slot.take_for(JobId(2), "mem://a");
        let lease = DeviceLease::new(JobId(2), "mem://a".into(), conn);
        assert!(lease.is_reused());
        assert_eq!(*opener.opens.lock().unwrap(), 1);
    }

    #[test]
    fn slot_drops_connection_for_other_uri() {
        let mut slot = DeviceSlot::Open(OpenDevice {
            uri: "mem://a".into(),
            device: Box::new(MemoryDevice::default()),
        });
        assert!(matches!(slot.take_for(JobId(1), "mem://b"), Connection::Unopened));
        assert_eq!(slot.holder(), Some(JobId(1)));
    }

    #[test]
    fn failed_lease_is_not_retained() {
        let opener = MemoryOpener {
            refuse: true,
            ..Default::default()
        };
        let mut lease = DeviceLease::new(JobId(1), "mem://a".into(), Connection::Unopened);
        assert!(lease.device(&opener).is_err());
        assert!(lease.has_failed());
        assert!(lease.into_retained().is_none());
    }

    #[test]
    fn file_device_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.prn");
        let uri = format!("file://{}", path.display());

        let mut dev = StandardOpener.open(&uri).unwrap();
        dev.write_all(b"hello ").unwrap();
        dev.flush().unwrap();
        let mut dev = StandardOpener.open(&uri).unwrap();
        dev.write_all(b"world").unwrap();
        dev.flush().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn unknown_scheme_is_unavailable() {
        assert!(matches!(
            StandardOpener.open("usb://HP/LaserJet"),
            Err(SpoolwerkError::DeviceUnavailable(_))
        ));
    }
}
