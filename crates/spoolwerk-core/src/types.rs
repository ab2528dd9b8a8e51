// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Spoolwerk printer runtime.

use std::ops::BitOr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpoolwerkError};
use crate::reasons::PrinterReasons;

/// Maximum number of supplies a printer tracks.
pub const MAX_SUPPLY: usize = 32;

/// Per-printer job identifier ("job-id").  Monotonic, starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u32);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Printer lifecycle states ("printer-state").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterState {
    Idle,
    Processing,
    Stopped,
}

impl PrinterState {
    /// IPP `printer-state` enum value (RFC 8011 §5.4.11).
    pub fn ipp_enum_value(&self) -> i32 {
        match self {
            Self::Idle => 3,
            Self::Processing => 4,
            Self::Stopped => 5,
        }
    }
}

/// Lifecycle states of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Queued, waiting for the device.
    Pending,
    /// Driver callbacks are running against the device.
    Processing,
    /// Printed successfully.
    Completed,
    /// Failed -- see the job's state message.
    Aborted,
    /// Cancelled by a user or the operator.
    Canceled,
}

impl JobState {
    /// Whether the job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Canceled)
    }

    /// IPP `job-state` enum value (RFC 8011 §5.3.7).
    pub fn ipp_enum_value(&self) -> i32 {
        match self {
            Self::Pending => 3,
            Self::Processing => 5,
            Self::Canceled => 7,
            Self::Aborted => 8,
            Self::Completed => 9,
        }
    }
}

/// Terminal outcome handed to the queue when a job retires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Aborted(String),
    Canceled,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            Self::Completed => JobState::Completed,
            Self::Aborted(_) => JobState::Aborted,
            Self::Canceled => JobState::Canceled,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Aborted(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Which job collection to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhichJobs {
    Active,
    Completed,
    All,
}

// ---------------------------------------------------------------------------
// Supplies
// ---------------------------------------------------------------------------

/// Supply colour ("printer-supply" color keyword).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupplyColor {
    NoColor,
    Black,
    Cyan,
    Gray,
    Green,
    LightCyan,
    LightGray,
    LightMagenta,
    Magenta,
    Orange,
    Violet,
    Yellow,
    MultiColor,
}

impl SupplyColor {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::NoColor => "no-color",
            Self::Black => "black",
            Self::Cyan => "cyan",
            Self::Gray => "gray",
            Self::Green => "green",
            Self::LightCyan => "light-cyan",
            Self::LightGray => "light-gray",
            Self::LightMagenta => "light-magenta",
            Self::Magenta => "magenta",
            Self::Orange => "orange",
            Self::Violet => "violet",
            Self::Yellow => "yellow",
            Self::MultiColor => "multi-color",
        }
    }

    /// `marker-colors` value.
    pub fn marker_color(&self) -> &'static str {
        match self {
            Self::NoColor => "#777777",
            Self::Black => "#000000",
            Self::Cyan => "#00FFFF",
            Self::Gray => "#777777",
            Self::Green => "#00CC00",
            Self::LightCyan => "#77FFFF",
            Self::LightGray => "#CCCCCC",
            Self::LightMagenta => "#FFCCFF",
            Self::Magenta => "#FF00FF",
            Self::Orange => "#FF7700",
            Self::Violet => "#770077",
            Self::Yellow => "#FFFF00",
            Self::MultiColor => "#00FFFF#FF00FF#FFFF00",
        }
    }
}

/// Supply kind ("printer-supply" type keyword).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupplyType {
    Developer,
    Fuser,
    Ink,
    InkCartridge,
    InkRibbon,
    Opc,
    Staples,
    Toner,
    TonerCartridge,
    WasteInk,
    WastePaper,
    WasteToner,
    WasteWater,
    WasteWax,
    Water,
    Other,
    Unknown,
}

impl SupplyType {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Developer => "developer",
            Self::Fuser => "fuser",
            Self::Ink => "ink",
            Self::InkCartridge => "inkCartridge",
            Self::InkRibbon => "inkRibbon",
            Self::Opc => "opc",
            Self::Staples => "staples",
            Self::Toner => "toner",
            Self::TonerCartridge => "tonerCartridge",
            Self::WasteInk => "wasteInk",
            Self::WastePaper => "wastePaper",
            Self::WasteToner => "wasteToner",
            Self::WasteWater => "wasteWater",
            Self::WasteWax => "wasteWax",
            Self::Water => "water",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }

    /// Accumulating supplies fill up instead of running out.
    pub fn is_waste(&self) -> bool {
        matches!(
            self,
            Self::WasteInk | Self::WastePaper | Self::WasteToner | Self::WasteWater | Self::WasteWax
        )
    }
}

/// A consumable or accumulating printer supply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supply {
    pub color: SupplyColor,
    pub name: String,
    pub is_consumable: bool,
    /// Percentage, always within 0..=100.
    pub level: i32,
    pub kind: SupplyType,
}

impl Supply {
    pub fn new(
        color: SupplyColor,
        name: impl Into<String>,
        is_consumable: bool,
        level: i32,
        kind: SupplyType,
    ) -> Self {
        Self {
            color,
            name: name.into(),
            is_consumable,
            level: level.clamp(0, 100),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Raster / job options
// ---------------------------------------------------------------------------

/// Colour space of raster data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    /// Black, 1 or 8 bits.
    Black,
    /// Luminance (device gray).
    White,
    /// sGray.
    Sgray,
    Rgb,
    Srgb,
    AdobeRgb,
    Cmyk,
}

/// Negotiated raster page header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterHeader {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub bytes_per_line: u32,
    pub color_space: ColorSpace,
    pub resolution: (u32, u32),
}

impl RasterHeader {
    /// Header for packed pixels with no row padding.
    pub fn packed(width: u32, height: u32, bits_per_pixel: u32, color_space: ColorSpace) -> Self {
        Self {
            width,
            height,
            bits_per_pixel,
            bytes_per_line: (width * bits_per_pixel).div_ceil(8),
            color_space,
            resolution: (300, 300),
        }
    }
}

/// One page of raster data: `header.height` scanlines of
/// `header.bytes_per_line` bytes each, top to bottom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterPage {
    pub header: RasterHeader,
    pub data: Vec<u8>,
}

impl RasterPage {
    /// Check that the data holds every scanline the header promises.
    pub fn check(&self) -> Result<()> {
        let header = &self.header;
        if header.height > 0 && header.bytes_per_line == 0 {
            return Err(SpoolwerkError::InvalidDocument(format!(
                "raster page of height {} has zero bytes per line",
                header.height
            )));
        }
        let needed = u64::from(header.bytes_per_line) * u64::from(header.height);
        if (self.data.len() as u64) < needed {
            return Err(SpoolwerkError::InvalidDocument(format!(
                "truncated raster page: {} of {needed} bytes",
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Iterate scanlines top to bottom.  Call [`RasterPage::check`] first;
    /// on a truncated page the iterator stops at the last complete line.
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        let bpl = (self.header.bytes_per_line as usize).max(1);
        self.data
            .chunks_exact(bpl)
            .take(self.header.height as usize)
    }
}

/// Requested colour mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorMode {
    Auto,
    Monochrome,
    Color,
    BiLevel,
}

/// Duplex printing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sides {
    OneSided,
    TwoSidedLongEdge,
    TwoSidedShortEdge,
}

impl Sides {
    /// IPP `sides` keyword (RFC 8011 §5.2.8).
    pub fn ipp_keyword(&self) -> &'static str {
        match self {
            Self::OneSided => "one-sided",
            Self::TwoSidedLongEdge => "two-sided-long-edge",
            Self::TwoSidedShortEdge => "two-sided-short-edge",
        }
    }
}

/// Options negotiated by the attribute layer for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintOptions {
    pub copies: u32,
    /// PWG self-describing media name, e.g. `na_letter_8.5x11in`.
    pub media: String,
    pub color_mode: ColorMode,
    pub sides: Sides,
    pub header: RasterHeader,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self {
            copies: 1,
            media: "na_letter_8.5x11in".into(),
            color_mode: ColorMode::Auto,
            sides: Sides::OneSided,
            header: RasterHeader::packed(2550, 3300, 8, ColorSpace::Sgray),
        }
    }
}

/// Document attached to a job.
#[derive(Debug, Clone)]
pub enum JobDocument {
    /// Pre-rendered raster pages driven through the raster callbacks.
    Raster(Vec<RasterPage>),
    /// A spooled file handed to the driver's whole-file callback.
    File { path: PathBuf, format: String },
    /// Bytes arriving from an ingress listener, streamed by that listener.
    Stream { format: String },
}

impl JobDocument {
    pub fn format(&self) -> &str {
        match self {
            Self::Raster(_) => "image/pwg-raster",
            Self::File { format, .. } | Self::Stream { format } => format,
        }
    }

    pub fn page_count(&self) -> u32 {
        match self {
            Self::Raster(pages) => u32::try_from(pages.len()).unwrap_or(u32::MAX),
            _ => 0,
        }
    }
}

/// Job submission from the attribute layer or an ingress listener.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub name: String,
    pub username: String,
    pub document: JobDocument,
    pub options: PrintOptions,
}

impl JobRequest {
    pub fn new(name: impl Into<String>, username: impl Into<String>, document: JobDocument) -> Self {
        Self {
            name: name.into(),
            username: username.into(),
            document,
            options: PrintOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PrintOptions) -> Self {
        self.options = options;
        self
    }
}

/// Read-only snapshot of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub printer_id: u32,
    pub name: String,
    pub username: String,
    pub format: String,
    pub state: JobState,
    pub state_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub impressions: u32,
    pub impressions_completed: u32,
    /// Whether the document payload is still retained for reprint.
    pub document_retained: bool,
}

/// Read-only snapshot of printer status for the attribute layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub printer_id: u32,
    pub name: String,
    pub advertised_name: String,
    pub state: PrinterState,
    pub reasons: PrinterReasons,
    pub is_accepting: bool,
    pub is_stopped: bool,
    pub is_deleted: bool,
    pub hold_new_jobs: bool,
    pub processing_job: Option<JobId>,
    pub active_jobs: usize,
    pub completed_jobs: usize,
    pub impressions_completed: u32,
    pub config_time: DateTime<Utc>,
    pub status_time: DateTime<Utc>,
    pub state_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Identify
// ---------------------------------------------------------------------------

/// "identify-actions" bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentifyActions(u8);

impl IdentifyActions {
    pub const NONE: Self = Self(0);
    pub const DISPLAY: Self = Self(1 << 0);
    pub const FLASH: Self = Self(1 << 1);
    pub const SOUND: Self = Self(1 << 2);
    pub const SPEAK: Self = Self(1 << 3);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Restrict `self` to the actions in `supported`.
    #[must_use]
    pub const fn intersection(self, supported: Self) -> Self {
        Self(self.0 & supported.0)
    }
}

impl BitOr for IdentifyActions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_header_rounds_bytes_per_line_up() {
        let h = RasterHeader::packed(9, 2, 1, ColorSpace::Black);
        assert_eq!(h.bytes_per_line, 2);
        let h = RasterHeader::packed(10, 2, 24, ColorSpace::Srgb);
        assert_eq!(h.bytes_per_line, 30);
    }

    #[test]
    fn raster_page_lines_are_fixed_width() {
        let page = RasterPage {
            header: RasterHeader::packed(4, 3, 8, ColorSpace::Sgray),
            data: (0u8..12).collect(),
        };
        let lines: Vec<&[u8]> = page.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], &[8, 9, 10, 11]);
        assert!(page.check().is_ok());
    }

    #[test]
    fn short_raster_data_fails_check() {
        let page = RasterPage {
            header: RasterHeader::packed(8, 4, 8, ColorSpace::Sgray),
            data: vec![0; 20],
        };
        assert!(matches!(page.check(), Err(SpoolwerkError::InvalidDocument(_))));

        let empty_lines = RasterPage {
            header: RasterHeader::packed(0, 2, 8, ColorSpace::Sgray),
            data: Vec::new(),
        };
        assert!(empty_lines.check().is_err());
    }

    #[test]
    fn supply_new_clamps_level() {
        let s = Supply::new(SupplyColor::Cyan, "Cyan Ink", true, 140, SupplyType::Ink);
        assert_eq!(s.level, 100);
        let s = Supply::new(SupplyColor::Cyan, "Cyan Ink", true, -3, SupplyType::Ink);
        assert_eq!(s.level, 0);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Aborted.is_terminal());
        assert_eq!(JobOutcome::Aborted("x".into()).state(), JobState::Aborted);
    }

    #[test]
    fn waste_types_accumulate() {
        assert!(SupplyType::WasteInk.is_waste());
        assert!(!SupplyType::Ink.is_waste());
    }
}
