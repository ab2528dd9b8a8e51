// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Server and per-printer configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SpoolwerkError};
use crate::types::{MAX_SUPPLY, Supply};

/// Default port for the IPP endpoint advertised via presence.
pub const DEFAULT_IPP_PORT: u16 = 631;

/// Base port for raw (AppSocket) listeners; printer N listens on base + N - 1.
pub const DEFAULT_RAW_BASE_PORT: u16 = 9100;

/// Top-level settings for a Spoolwerk server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name advertised in presence records; `None` uses the system name.
    pub hostname: Option<String>,
    /// Directory holding the state database and spool files.
    pub data_dir: PathBuf,
    /// Port the (external) IPP endpoint listens on.
    pub ipp_port: u16,
    /// Whether the IPP endpoint is also served over TLS (`_ipps._tcp`).
    pub tls_enabled: bool,
    /// Port of the (external) web admin UI, advertised as `_http._tcp`.
    pub admin_port: Option<u16>,
    /// Presence publisher tuning.
    pub presence: PresenceSettings,
    /// Printers created at startup when the state database is empty.
    pub printers: Vec<PrinterConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            data_dir: PathBuf::from("/var/lib/spoolwerk"),
            ipp_port: DEFAULT_IPP_PORT,
            tls_enabled: false,
            admin_port: None,
            presence: PresenceSettings::default(),
            printers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write settings to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for printer in &self.printers {
            printer.validate()?;
        }
        let mut ids: Vec<u32> = self.printers.iter().map(|p| p.printer_id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(SpoolwerkError::Config("duplicate printer_id".into()));
        }
        Ok(())
    }
}

/// Presence publisher retry and probing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub enabled: bool,
    /// First retry delay after a collision, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Give up after this many attempts per record; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// How long to listen for a conflicting instance before announcing.
    pub probe_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
            max_attempts: None,
            probe_ms: 750,
        }
    }
}

/// Raw socket (AppSocket/JetDirect) ingress settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawListenerConfig {
    pub enabled: bool,
    /// Explicit port; `None` derives it from the printer id.
    pub port: Option<u16>,
    /// Abort the job when no bytes arrive for this long.
    pub idle_timeout_secs: u64,
    /// Give up waiting for the device after this long.
    pub device_wait_secs: u64,
}

impl RawListenerConfig {
    /// Listening port for the given printer.  Without an explicit port,
    /// printer N listens on 9100 + (N - 1).
    pub fn port_for(&self, printer_id: u32) -> Result<u16> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        u16::try_from(printer_id.saturating_sub(1))
            .ok()
            .and_then(|offset| DEFAULT_RAW_BASE_PORT.checked_add(offset))
            .ok_or_else(|| {
                SpoolwerkError::Config(format!(
                    "printer {printer_id} has no default raw port; set raw.port"
                ))
            })
    }
}

impl Default for RawListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: None,
            idle_timeout_secs: 30,
            device_wait_secs: 60,
        }
    }
}

/// Extra USB gadget functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbOptions {
    pub ethernet: bool,
    pub serial: bool,
    pub storage: bool,
    pub storage_readonly: bool,
    pub storage_removable: bool,
}

/// USB printer gadget settings.  Changing any of these requires restarting
/// the gadget listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbGadgetConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub options: UsbOptions,
    /// Backing file for the mass-storage function.
    pub storage_file: Option<PathBuf>,
    /// Printer function character device.
    pub device_path: PathBuf,
    /// End the current job after this long without data.
    pub idle_timeout_secs: u64,
}

impl Default for UsbGadgetConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x1209,
            product_id: 0x8011,
            manufacturer: "Spoolwerk".into(),
            product: "Virtual Printer".into(),
            serial_number: "0".into(),
            options: UsbOptions::default(),
            storage_file: None,
            device_path: PathBuf::from("/dev/g_printer0"),
            idle_timeout_secs: 5,
        }
    }
}

/// Persisted configuration for one printer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    pub printer_id: u32,
    pub name: String,
    /// Advertised service name; defaults to `name`.
    pub dns_sd_name: Option<String>,
    pub uuid: Uuid,
    pub location: Option<String>,
    /// `geo:` URI, e.g. `geo:46.4707,-80.9961,150`.
    pub geo_location: Option<String>,
    pub organization: Option<String>,
    pub org_unit: Option<String>,
    pub device_uri: String,
    pub device_id: Option<String>,
    pub driver_name: String,
    /// 0 means no limit.
    pub max_active_jobs: usize,
    /// 0 means no limit.
    pub max_completed_jobs: usize,
    pub max_preserved_jobs: usize,
    pub supplies: Vec<Supply>,
    pub next_job_id: u32,
    pub impressions_completed: u32,
    pub is_accepting: bool,
    pub is_stopped: bool,
    pub raw: RawListenerConfig,
    pub usb: Option<UsbGadgetConfig>,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            printer_id: 1,
            name: "Spoolwerk Printer".into(),
            dns_sd_name: None,
            uuid: Uuid::new_v4(),
            location: None,
            geo_location: None,
            organization: None,
            org_unit: None,
            device_uri: "file:///dev/null".into(),
            device_id: None,
            driver_name: "sample".into(),
            max_active_jobs: 0,
            max_completed_jobs: 100,
            max_preserved_jobs: 0,
            supplies: Vec::new(),
            next_job_id: 1,
            impressions_completed: 0,
            is_accepting: true,
            is_stopped: false,
            raw: RawListenerConfig::default(),
            usb: None,
        }
    }
}

impl PrinterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SpoolwerkError::Config("printer name cannot be empty".into()));
        }
        if self.printer_id == 0 {
            return Err(SpoolwerkError::Config("printer_id must be positive".into()));
        }
        if self.next_job_id == 0 {
            return Err(SpoolwerkError::Config("next_job_id must be positive".into()));
        }
        if self.supplies.len() > MAX_SUPPLY {
            return Err(SpoolwerkError::Config(format!(
                "at most {MAX_SUPPLY} supplies are supported"
            )));
        }
        if self.raw.enabled {
            self.raw_port()?;
        }
        Ok(())
    }

    /// Port for the raw listener.
    pub fn raw_port(&self) -> Result<u16> {
        self.raw.port_for(self.printer_id)
    }

    /// Name used for presence records before any collision renaming.
    pub fn advertised_name(&self) -> &str {
        self.dns_sd_name.as_deref().unwrap_or(&self.name)
    }
}
