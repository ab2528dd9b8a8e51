// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Sample ink-simulation raster driver.
//
// Raster lines are passed through to the device unchanged.  While they go by
// the driver totals the colorant each line would have used, and at the end of
// every page converts that coverage into ink and waste-tank level changes:
// roughly 100 pages at 10% coverage empty the black ink, 50 pages the colour
// inks and 200 pages fill the waste tank.  Empty inks refill and a full tank
// is replaced, so the simulation runs forever.

use std::path::PathBuf;

use tracing::{debug, info};

use spoolwerk_core::types::{
    ColorSpace, IdentifyActions, RasterHeader, Supply, SupplyColor, SupplyType,
};

use crate::driver::{DriverCallbacks, DriverData, DriverRegistry, JobContext};
use crate::printer::Printer;
use crate::supplies::{LevelPolicy, SupplyDelta};

/// Registered driver name.
pub const NAME: &str = "sample";

/// Supplies the simulation drives, in index order.
const CYAN: usize = 0;
const MAGENTA: usize = 1;
const YELLOW: usize = 2;
const BLACK: usize = 3;
const WASTE: usize = 4;
const SUPPLY_COUNT: usize = 5;

/// Coverage divisors per supply (higher lasts longer).
const CMY_DIVISOR: u64 = 5;
const BLACK_DIVISOR: u64 = 10;
const WASTE_DIVISOR: u64 = 20;

/// Default supplies: four full inks and an empty waste tank.
pub fn default_supplies() -> Vec<Supply> {
    vec![
        Supply::new(SupplyColor::Cyan, "Cyan Ink", true, 100, SupplyType::Ink),
        Supply::new(SupplyColor::Magenta, "Magenta Ink", true, 100, SupplyType::Ink),
        Supply::new(SupplyColor::Yellow, "Yellow Ink", true, 100, SupplyType::Ink),
        Supply::new(SupplyColor::Black, "Black Ink", true, 100, SupplyType::Ink),
        Supply::new(SupplyColor::NoColor, "Waste Ink Tank", true, 0, SupplyType::WasteInk),
    ]
}

/// Colorant totals for the page being printed, indexed C, M, Y, K.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Coverage([u64; 4]);

impl Coverage {
    pub fn totals(&self) -> [u64; 4] {
        self.0
    }

    /// Add one scanline's worth of colorant.
    pub fn add_line(&mut self, header: &RasterHeader, line: &[u8]) {
        let line = &line[..line.len().min(header.bytes_per_line as usize)];
        match header.color_space {
            ColorSpace::Black if header.bits_per_pixel == 1 => {
                self.0[BLACK] += line.iter().map(|b| u64::from(b.count_ones()) * 255).sum::<u64>();
            }
            ColorSpace::Black => {
                self.0[BLACK] += line.iter().map(|&b| u64::from(b)).sum::<u64>();
            }
            ColorSpace::White | ColorSpace::Sgray => {
                self.0[BLACK] += line.iter().map(|&b| u64::from(255 - b)).sum::<u64>();
            }
            ColorSpace::Rgb | ColorSpace::Srgb | ColorSpace::AdobeRgb => {
                for px in line.chunks_exact(3) {
                    let (c, m, y) = (255 - px[0], 255 - px[1], 255 - px[2]);
                    let k = c.min(m).min(y);
                    self.0[CYAN] += u64::from(c - k);
                    self.0[MAGENTA] += u64::from(m - k);
                    self.0[YELLOW] += u64::from(y - k);
                    self.0[BLACK] += u64::from(k);
                }
            }
            ColorSpace::Cmyk => {
                for px in line.chunks_exact(4) {
                    for (total, &v) in self.0.iter_mut().zip(px) {
                        *total += u64::from(v);
                    }
                }
            }
        }
    }

    /// Level changes for a page of `header`'s dimensions.
    pub fn deltas(&self, header: &RasterHeader) -> Vec<SupplyDelta> {
        let area = u64::from(header.width) * u64::from(header.height);
        if area == 0 {
            return Vec::new();
        }
        let used = |total: u64, divisor: u64| -> i32 {
            i32::try_from(total / area / divisor).unwrap_or(i32::MAX)
        };
        let [c, m, y, k] = self.0;
        vec![
            SupplyDelta::new(CYAN, -used(c, CMY_DIVISOR)),
            SupplyDelta::new(MAGENTA, -used(m, CMY_DIVISOR)),
            SupplyDelta::new(YELLOW, -used(y, CMY_DIVISOR)),
            SupplyDelta::new(BLACK, -used(k, BLACK_DIVISOR)),
            SupplyDelta::new(WASTE, used(c + m + y + k, WASTE_DIVISOR)),
        ]
    }
}

/// The sample driver.  `test_page` is the file queued by
/// `Printer::print_test_page`, if any.
pub fn driver(test_page: Option<PathBuf>) -> DriverData {
    let callbacks = DriverCallbacks::default()
        .on_identify(|printer: &Printer, actions, message| {
            info!(printer = printer.id(), ?actions, text = ?message, "identify requested");
        })
        .on_print_file(|ctx: &mut JobContext<'_>, path| {
            let bytes = std::fs::read(path)?;
            debug!(job_id = %ctx.job_id, bytes = bytes.len(), "copying file to device");
            ctx.device.write_all(&bytes)
        })
        .on_start_job(|ctx: &mut JobContext<'_>| {
            ctx.data.set(Coverage::default());
            Ok(())
        })
        .on_start_page(|ctx: &mut JobContext<'_>, _page| {
            ctx.data.set(Coverage::default());
            Ok(())
        })
        .on_write_line(|ctx: &mut JobContext<'_>, _y, line| {
            if let Some(coverage) = ctx.data.get_mut::<Coverage>() {
                coverage.add_line(&ctx.header, line);
            }
            ctx.device.write_all(line)
        })
        .on_end_page(|ctx: &mut JobContext<'_>, page| {
            let Some(coverage) = ctx.data.get_mut::<Coverage>().copied() else {
                return Ok(());
            };
            if ctx.printer.supplies().len() < SUPPLY_COUNT {
                return Ok(());
            }
            debug!(job_id = %ctx.job_id, page, totals = ?coverage.totals(), "calculating ink usage");
            ctx.printer.update_supplies(&coverage.deltas(&ctx.header));
            Ok(())
        })
        .on_end_job(|ctx: &mut JobContext<'_>| {
            ctx.data.take::<Coverage>();
            Ok(())
        })
        .on_status(|printer: &Printer| {
            if printer.supplies().is_empty() {
                debug!(printer = printer.id(), "seeding default supplies");
                printer.set_supplies(default_supplies());
            }
            Ok(())
        })
        .on_test_page(move |_printer: &Printer| test_page.clone());

    DriverData {
        formats: vec!["image/pwg-raster".into()],
        identify_supported: IdentifyActions::DISPLAY | IdentifyActions::SOUND,
        identify_default: IdentifyActions::SOUND,
        raster_types: vec![
            "black_1".into(),
            "sgray_8".into(),
            "srgb_8".into(),
            "cmyk_8".into(),
        ],
        resolutions: vec![(300, 300), (600, 600)],
        color_supported: true,
        duplex_supported: true,
        default_supplies: default_supplies(),
        level_policy: LevelPolicy::Wrap,
        ..DriverData::new(NAME, "Spoolwerk Sample Inkjet")
    }
    .with_callbacks(callbacks)
}

/// Register the sample driver without a test page.
pub fn register(registry: &mut DriverRegistry) {
    registry.register(driver(None));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use spoolwerk_core::reasons::PrinterReasons;
    use spoolwerk_core::types::{JobDocument, JobOutcome, JobRequest, RasterPage};

    use crate::device::tests::MemoryOpener;
    use crate::printer::tests::test_config;

    fn sample_printer(opener: MemoryOpener) -> Printer {
        Printer::with_opener(test_config(), Arc::new(driver(None)), Arc::new(opener)).unwrap()
    }

    fn page(header: RasterHeader, fill: u8) -> RasterPage {
        let len = (header.bytes_per_line * header.height) as usize;
        RasterPage {
            header,
            data: vec![fill; len],
        }
    }

    fn print(printer: &Printer, pages: Vec<RasterPage>) -> JobOutcome {
        let id = printer
            .submit(JobRequest::new("page", "alice", JobDocument::Raster(pages)))
            .unwrap();
        let (ticket, lease) = printer.start_job(id).unwrap();
        printer.process(ticket, lease)
    }

    #[test]
    fn one_bit_black_counts_set_pixels() {
        let header = RasterHeader::packed(16, 1, 1, ColorSpace::Black);
        let mut coverage = Coverage::default();
        coverage.add_line(&header, &[0b1010_0000, 0xff]);
        assert_eq!(coverage.totals(), [0, 0, 0, 10 * 255]);
    }

    #[test]
    fn gray_and_rgb_convert_to_ink() {
        let gray = RasterHeader::packed(2, 1, 8, ColorSpace::Sgray);
        let mut coverage = Coverage::default();
        coverage.add_line(&gray, &[255, 55]);
        assert_eq!(coverage.totals(), [0, 0, 0, 200]);

        let rgb = RasterHeader::packed(1, 1, 24, ColorSpace::Srgb);
        let mut coverage = Coverage::default();
        // Dark red: some black plus magenta and yellow.
        coverage.add_line(&rgb, &[200, 0, 0]);
        assert_eq!(coverage.totals(), [0, 200, 200, 55]);
    }

    #[test]
    fn full_black_page_uses_black_and_fills_waste() {
        let header = RasterHeader::packed(4, 4, 8, ColorSpace::Black);
        let mut coverage = Coverage::default();
        for _ in 0..4 {
            coverage.add_line(&header, &[255; 4]);
        }
        let deltas = coverage.deltas(&header);
        assert_eq!(deltas[BLACK], SupplyDelta::new(BLACK, -25));
        assert_eq!(deltas[CYAN], SupplyDelta::new(CYAN, 0));
        assert_eq!(deltas[WASTE], SupplyDelta::new(WASTE, 12));
    }

    #[test]
    fn zero_sized_page_changes_nothing() {
        let header = RasterHeader::packed(0, 0, 8, ColorSpace::Black);
        assert!(Coverage::default().deltas(&header).is_empty());
    }

    #[test]
    fn printing_drains_ink_and_passes_lines_through() {
        let opener = MemoryOpener::default();
        let printer = sample_printer(opener.clone());
        assert_eq!(printer.supplies().len(), SUPPLY_COUNT);

        let black = page(RasterHeader::packed(4, 4, 8, ColorSpace::Black), 255);
        assert_eq!(print(&printer, vec![black.clone(), black]), JobOutcome::Completed);

        let supplies = printer.supplies();
        assert_eq!(supplies[BLACK].level, 50);
        assert_eq!(supplies[WASTE].level, 24);
        assert_eq!(supplies[CYAN].level, 100);
        assert_eq!(opener.device.bytes.lock().unwrap().len(), 32);
    }

    #[test]
    fn coverage_resets_every_page() {
        let printer = sample_printer(MemoryOpener::default());
        let blank = page(RasterHeader::packed(4, 4, 8, ColorSpace::Sgray), 255);
        let dark = page(RasterHeader::packed(4, 4, 8, ColorSpace::Sgray), 0);
        print(&printer, vec![dark, blank.clone(), blank]);
        assert_eq!(printer.supplies()[BLACK].level, 75);
    }

    #[test]
    fn empty_ink_refills_and_reports_low_on_the_way() {
        let printer = sample_printer(MemoryOpener::default());
        let mut supplies = default_supplies();
        supplies[BLACK].level = 30;
        printer.set_supplies(supplies);

        let black = page(RasterHeader::packed(4, 4, 8, ColorSpace::Black), 255);
        print(&printer, vec![black.clone()]);
        assert_eq!(printer.supplies()[BLACK].level, 5);
        assert!(printer.reasons().contains(PrinterReasons::MARKER_SUPPLY_LOW));

        print(&printer, vec![black]);
        assert_eq!(printer.supplies()[BLACK].level, 100);
        assert!(!printer.reasons().contains(PrinterReasons::MARKER_SUPPLY_LOW));
    }

    #[test]
    fn status_seeds_missing_supplies() {
        let printer = sample_printer(MemoryOpener::default());
        printer.set_supplies(Vec::new());
        assert!(printer.refresh_status().unwrap());
        assert_eq!(printer.supplies(), default_supplies());
    }

    #[test]
    fn test_page_uses_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-page.pwg");
        std::fs::write(&path, b"test page").unwrap();

        let opener = MemoryOpener::default();
        let printer = Printer::with_opener(
            test_config(),
            Arc::new(driver(Some(path))),
            Arc::new(opener.clone()),
        )
        .unwrap();
        let id = printer.print_test_page("admin").unwrap();
        let (ticket, lease) = printer.start_job(id).unwrap();
        assert_eq!(printer.process(ticket, lease), JobOutcome::Completed);
        assert_eq!(&*opener.device.bytes.lock().unwrap(), b"test page");
    }

    #[test]
    fn registers_under_its_name() {
        let mut registry = DriverRegistry::new();
        register(&mut registry);
        let driver = registry.get(NAME).unwrap();
        assert!(driver.accepts_format("image/pwg-raster"));
        assert!(driver.identify_supported.contains(IdentifyActions::SOUND));
    }
}
