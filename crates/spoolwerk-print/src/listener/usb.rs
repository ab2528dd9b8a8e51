// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// USB printer gadget ingress.
//
// On a device with a USB device controller the printer can present itself
// to a host as a USB printer (plus optional ethernet, serial and mass-storage
// functions).  The gadget is described through Linux configfs; the printer
// function shows up as a character device that yields whatever the host
// prints.  A job starts when data arrives and ends once the host has been
// quiet for the idle timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use spoolwerk_core::config::UsbGadgetConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};

use super::{ReadEnd, READ_CHUNK, copy_stream, finish_stream_job, open_stream_job, spawn_device_writer};
use crate::printer::Printer;

/// How long a USB job waits for the printer's device.
const DEVICE_WAIT: Duration = Duration::from_secs(60);

/// Poll interval while the host has nothing to send.
const QUIET_POLL: Duration = Duration::from_millis(100);

/// US English string table.
const LANG: &str = "0x409";

const CONFIG_DIR: &str = "configs/c.1";

/// A gadget definition ready to be written to configfs.
#[derive(Debug, Clone)]
pub struct GadgetConfig {
    /// Directory name under `usb_gadget/`.
    pub name: String,
    pub usb: UsbGadgetConfig,
    /// IEEE 1284 device ID reported to the host.
    pub pnp_string: String,
}

impl GadgetConfig {
    /// Gadget for `printer`, which must have USB settings.
    pub fn for_printer(printer: &Printer) -> Result<Self> {
        let usb = printer
            .usb_config()
            .ok_or_else(|| SpoolwerkError::Config("printer has no USB gadget settings".into()))?;
        let pnp_string = printer.device_id().unwrap_or_else(|| {
            format!(
                "MFG:{};MDL:{};CMD:{};",
                usb.manufacturer,
                usb.product,
                printer.driver().format
            )
        });
        Ok(Self {
            name: format!("spoolwerk{}", printer.id()),
            usb,
            pnp_string,
        })
    }

    /// Gadget directory under `configfs_root`.
    pub fn gadget_dir(&self, configfs_root: &Path) -> PathBuf {
        configfs_root.join("usb_gadget").join(&self.name)
    }

    /// Functions this gadget exposes, as `(configfs name, attributes)`.
    fn functions(&self) -> Vec<(&'static str, Vec<(&'static str, String)>)> {
        let opts = self.usb.options;
        let mut functions = vec![(
            "printer.g_printer0",
            vec![("pnp_string", self.pnp_string.clone()), ("q_len", "10".into())],
        )];
        if opts.ethernet {
            functions.push(("ecm.usb0", Vec::new()));
        }
        if opts.serial {
            functions.push(("acm.ttyGS0", Vec::new()));
        }
        if opts.storage {
            let file = self
                .usb
                .storage_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            functions.push((
                "mass_storage.0",
                vec![
                    ("lun.0/file", file),
                    ("lun.0/ro", u8::from(opts.storage_readonly).to_string()),
                    ("lun.0/removable", u8::from(opts.storage_removable).to_string()),
                ],
            ));
        }
        functions
    }

    /// Write the gadget tree and bind it to `udc` when given.
    pub fn apply(&self, configfs_root: &Path, udc: Option<&str>) -> Result<PathBuf> {
        let dir = self.gadget_dir(configfs_root);
        std::fs::create_dir_all(&dir)?;

        write_attr(&dir, "idVendor", &format!("0x{:04x}", self.usb.vendor_id))?;
        write_attr(&dir, "idProduct", &format!("0x{:04x}", self.usb.product_id))?;
        write_attr(&dir, "bcdUSB", "0x0200")?;

        let strings = Path::new("strings").join(LANG);
        write_attr(&dir, strings.join("manufacturer"), &self.usb.manufacturer)?;
        write_attr(&dir, strings.join("product"), &self.usb.product)?;
        write_attr(&dir, strings.join("serialnumber"), &self.usb.serial_number)?;

        let config = Path::new(CONFIG_DIR);
        write_attr(&dir, config.join("strings").join(LANG).join("configuration"), "Printer")?;
        write_attr(&dir, config.join("MaxPower"), "120")?;

        for (function, attrs) in self.functions() {
            let fdir = dir.join("functions").join(function);
            std::fs::create_dir_all(&fdir)?;
            for (attr, value) in attrs {
                write_attr(&fdir, attr, &value)?;
            }
            link_function(&fdir, &dir.join(CONFIG_DIR).join(function))?;
        }

        if let Some(udc) = udc {
            write_attr(&dir, "UDC", udc)?;
        }
        info!(gadget = %self.name, vendor = self.usb.vendor_id, product = self.usb.product_id, "USB gadget configured");
        Ok(dir)
    }

    /// Unbind the gadget and remove its function links.
    pub fn remove(&self, configfs_root: &Path) -> Result<()> {
        let dir = self.gadget_dir(configfs_root);
        if !dir.exists() {
            return Ok(());
        }
        if dir.join("UDC").exists() {
            write_attr(&dir, "UDC", "")?;
        }
        for (function, _) in self.functions() {
            let link = dir.join(CONFIG_DIR).join(function);
            if link.symlink_metadata().is_ok() {
                std::fs::remove_file(&link)?;
            }
        }
        debug!(gadget = %self.name, "USB gadget unbound");
        Ok(())
    }
}

fn write_attr(dir: &Path, attr: impl AsRef<Path>, value: &str) -> Result<()> {
    let path = dir.join(attr);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, format!("{value}\n"))
        .map_err(|e| SpoolwerkError::Listener(format!("write {}: {e}", path.display())))
}

#[cfg(unix)]
fn link_function(function: &Path, link: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        return Ok(());
    }
    std::os::unix::fs::symlink(function, link)
        .map_err(|e| SpoolwerkError::Listener(format!("link {}: {e}", link.display())))
}

#[cfg(not(unix))]
fn link_function(_function: &Path, _link: &Path) -> Result<()> {
    Err(SpoolwerkError::NotSupported("USB gadget configuration"))
}

/// USB printer gadget listener for one printer.
pub struct UsbListener {
    printer: Arc<Printer>,
    configfs_root: Option<PathBuf>,
    udc: Option<String>,
    gadget: Option<GadgetConfig>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl UsbListener {
    /// Listener that reads an already configured gadget device.
    pub fn new(printer: Arc<Printer>) -> Self {
        Self {
            printer,
            configfs_root: None,
            udc: None,
            gadget: None,
            shutdown: None,
            task: None,
        }
    }

    /// Also write the gadget to configfs on start, binding it to `udc`.
    pub fn with_configfs(mut self, root: impl Into<PathBuf>, udc: Option<String>) -> Self {
        self.configfs_root = Some(root.into());
        self.udc = udc;
        self
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let usb = self
            .printer
            .usb_config()
            .ok_or_else(|| SpoolwerkError::Config("printer has no USB gadget settings".into()))?;

        if let Some(root) = self.configfs_root.clone() {
            let gadget = GadgetConfig::for_printer(&self.printer)?;
            let udc = self.udc.clone();
            let applied = gadget.clone();
            tokio::task::spawn_blocking(move || applied.apply(&root, udc.as_deref()))
                .await
                .map_err(|e| SpoolwerkError::Listener(format!("gadget setup task: {e}")))??;
            self.gadget = Some(gadget);
        }

        let device = match tokio::fs::File::open(&usb.device_path).await {
            Ok(file) => file,
            Err(e) => {
                error!(printer = self.printer.id(), path = %usb.device_path.display(), error = %e, "USB gadget device not available");
                self.remove_gadget().await;
                return Err(SpoolwerkError::Listener(format!(
                    "open {}: {e}",
                    usb.device_path.display()
                )));
            }
        };

        let (tx, rx) = watch::channel(false);
        let printer = Arc::clone(&self.printer);
        let idle = Duration::from_secs(usb.idle_timeout_secs.max(1));
        self.task = Some(tokio::spawn(async move {
            Self::read_loop(device, rx, printer, idle).await;
        }));
        self.shutdown = Some(tx);
        self.printer.set_usb_active(true);
        info!(printer = self.printer.id(), path = %usb.device_path.display(), "USB gadget listener started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        let Some(shutdown) = self.shutdown.take() else {
            return Ok(());
        };
        let _ = shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| SpoolwerkError::Listener(format!("USB listener task join: {e}")))?;
        }
        if let (Some(gadget), Some(root)) = (self.gadget.take(), self.configfs_root.clone()) {
            tokio::task::spawn_blocking(move || gadget.remove(&root))
                .await
                .map_err(|e| SpoolwerkError::Listener(format!("gadget teardown task: {e}")))??;
        }
        self.printer.set_usb_active(false);
        info!(printer = self.printer.id(), "USB gadget listener stopped");
        Ok(())
    }

    /// Tear down a gadget written by `start`, logging any failure.
    async fn remove_gadget(&mut self) {
        let (Some(gadget), Some(root)) = (self.gadget.take(), self.configfs_root.clone()) else {
            return;
        };
        match tokio::task::spawn_blocking(move || gadget.remove(&root)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(printer = self.printer.id(), error = %e, "USB gadget teardown failed"),
            Err(e) => warn!(printer = self.printer.id(), error = %e, "USB gadget teardown task failed"),
        }
    }

    async fn read_loop(
        mut device: tokio::fs::File,
        mut shutdown: watch::Receiver<bool>,
        printer: Arc<Printer>,
        idle: Duration,
    ) {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if printer.is_deleted() {
                break;
            }
            let n = tokio::select! {
                _ = shutdown.changed() => break,
                read = device.read(&mut buf) => match read {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(printer = printer.id(), error = %e, "USB gadget read failed");
                        0
                    }
                },
            };
            if n == 0 {
                // No host attached or nothing to print.
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(QUIET_POLL) => continue,
                }
            }
            if let Err(e) = Self::run_job(&mut device, &buf[..n], &printer, idle).await {
                warn!(printer = printer.id(), error = %e, "USB print job failed");
            }
        }
    }

    async fn run_job(
        device: &mut tokio::fs::File,
        first: &[u8],
        printer: &Arc<Printer>,
        idle: Duration,
    ) -> Result<()> {
        let (ticket, lease) =
            open_stream_job(printer, "USB print".into(), "usb", DEVICE_WAIT).await?;
        let (tx, writer) = spawn_device_writer(Arc::clone(printer), lease);

        let mut digest = Sha256::new();
        digest.update(first);
        let end = if tx.send(first.to_vec()).await.is_err() {
            ReadEnd::Failed("device writer stopped".into())
        } else {
            match copy_stream(device, &ticket, tx, idle, &mut digest).await {
                // A quiet host means the document is complete.
                ReadEnd::Idle(_) => ReadEnd::Eof,
                other => other,
            }
        };
        finish_stream_job(printer, ticket.id, end, digest, writer).await?;
        Ok(())
    }
}
