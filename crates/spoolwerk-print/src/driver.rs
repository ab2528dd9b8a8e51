// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Driver capability contract.
//
// A driver is described by an immutable `DriverData` bound to a printer at
// creation.  Behaviour is supplied through optional callback slots; an empty
// slot disables that feature class (no identify, no whole-file printing, no
// raster printing, no status polling, no test page).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use spoolwerk_core::error::Result;
use spoolwerk_core::types::{IdentifyActions, JobId, PrintOptions, RasterHeader, Supply};

use crate::device::Device;
use crate::printer::Printer;
use crate::supplies::LevelPolicy;

pub type IdentifyFn = Arc<dyn Fn(&Printer, IdentifyActions, Option<&str>) + Send + Sync>;
pub type PrintFileFn = Arc<dyn Fn(&mut JobContext<'_>, &Path) -> Result<()> + Send + Sync>;
pub type RasterJobFn = Arc<dyn Fn(&mut JobContext<'_>) -> Result<()> + Send + Sync>;
pub type RasterPageFn = Arc<dyn Fn(&mut JobContext<'_>, u32) -> Result<()> + Send + Sync>;
pub type WriteLineFn = Arc<dyn Fn(&mut JobContext<'_>, u32, &[u8]) -> Result<()> + Send + Sync>;
pub type StatusFn = Arc<dyn Fn(&Printer) -> Result<()> + Send + Sync>;
pub type TestPageFn = Arc<dyn Fn(&Printer) -> Option<PathBuf> + Send + Sync>;

/// Optional driver callbacks.  Build with the `on_*` methods.
#[derive(Clone, Default)]
pub struct DriverCallbacks {
    pub identify: Option<IdentifyFn>,
    pub print_file: Option<PrintFileFn>,
    pub raster_start_job: Option<RasterJobFn>,
    pub raster_start_page: Option<RasterPageFn>,
    pub raster_write_line: Option<WriteLineFn>,
    pub raster_end_page: Option<RasterPageFn>,
    pub raster_end_job: Option<RasterJobFn>,
    pub status: Option<StatusFn>,
    pub test_page: Option<TestPageFn>,
}

impl DriverCallbacks {
    pub fn on_identify(
        mut self,
        f: impl Fn(&Printer, IdentifyActions, Option<&str>) + Send + Sync + 'static,
    ) -> Self {
        self.identify = Some(Arc::new(f));
        self
    }

    pub fn on_print_file(
        mut self,
        f: impl Fn(&mut JobContext<'_>, &Path) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.print_file = Some(Arc::new(f));
        self
    }

    pub fn on_start_job(
        mut self,
        f: impl Fn(&mut JobContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.raster_start_job = Some(Arc::new(f));
        self
    }

    pub fn on_start_page(
        mut self,
        f: impl Fn(&mut JobContext<'_>, u32) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.raster_start_page = Some(Arc::new(f));
        self
    }

    pub fn on_write_line(
        mut self,
        f: impl Fn(&mut JobContext<'_>, u32, &[u8]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.raster_write_line = Some(Arc::new(f));
        self
    }

    pub fn on_end_page(
        mut self,
        f: impl Fn(&mut JobContext<'_>, u32) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.raster_end_page = Some(Arc::new(f));
        self
    }

    pub fn on_end_job(
        mut self,
        f: impl Fn(&mut JobContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.raster_end_job = Some(Arc::new(f));
        self
    }

    pub fn on_status(mut self, f: impl Fn(&Printer) -> Result<()> + Send + Sync + 'static) -> Self {
        self.status = Some(Arc::new(f));
        self
    }

    pub fn on_test_page(
        mut self,
        f: impl Fn(&Printer) -> Option<PathBuf> + Send + Sync + 'static,
    ) -> Self {
        self.test_page = Some(Arc::new(f));
        self
    }

    /// Raster printing needs at least a line writer.
    pub fn supports_raster(&self) -> bool {
        self.raster_write_line.is_some()
    }
}

impl fmt::Debug for DriverCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverCallbacks")
            .field("identify", &self.identify.is_some())
            .field("print_file", &self.print_file.is_some())
            .field("raster", &self.supports_raster())
            .field("status", &self.status.is_some())
            .field("test_page", &self.test_page.is_some())
            .finish()
    }
}

/// Immutable capability descriptor for a driver.
#[derive(Debug, Clone)]
pub struct DriverData {
    pub name: String,
    pub make_and_model: String,
    /// Native format written to the device.
    pub format: String,
    /// Document formats accepted through `print_file`.
    pub formats: Vec<String>,
    pub identify_supported: IdentifyActions,
    pub identify_default: IdentifyActions,
    /// PWG raster types, e.g. `sgray_8`, `srgb_8`.
    pub raster_types: Vec<String>,
    pub resolutions: Vec<(u32, u32)>,
    pub color_supported: bool,
    pub duplex_supported: bool,
    /// Supplies installed when the printer is first created.
    pub default_supplies: Vec<Supply>,
    pub level_policy: LevelPolicy,
    pub callbacks: DriverCallbacks,
}

impl DriverData {
    pub fn new(name: impl Into<String>, make_and_model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            make_and_model: make_and_model.into(),
            format: "image/pwg-raster".into(),
            formats: Vec::new(),
            identify_supported: IdentifyActions::NONE,
            identify_default: IdentifyActions::NONE,
            raster_types: vec!["sgray_8".into()],
            resolutions: vec![(300, 300)],
            color_supported: false,
            duplex_supported: false,
            default_supplies: Vec::new(),
            level_policy: LevelPolicy::Clamp,
            callbacks: DriverCallbacks::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: DriverCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Whether `format` can be printed, either as raster or as a whole file.
    pub fn accepts_format(&self, format: &str) -> bool {
        (format == "image/pwg-raster" && self.callbacks.supports_raster())
            || (self.callbacks.print_file.is_some()
                && (format == self.format || self.formats.iter().any(|f| f == format)))
    }
}

/// Drivers available to printers, keyed by driver name.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<DriverData>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: DriverData) {
        self.drivers.insert(driver.name.clone(), Arc::new(driver));
    }

    pub fn get(&self, name: &str) -> Option<Arc<DriverData>> {
        self.drivers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }
}

/// Opaque per-job driver state.
#[derive(Default)]
pub struct JobData(Option<Box<dyn Any + Send>>);

impl JobData {
    pub fn set<T: Any + Send>(&mut self, value: T) {
        self.0 = Some(Box::new(value));
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.as_mut().and_then(|b| b.downcast_mut::<T>())
    }

    pub fn take<T: Any>(&mut self) -> Option<T> {
        match self.0.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.0 = Some(other);
                None
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

/// Everything a job callback may touch while the job is processing.
///
/// The context lives exactly as long as the processing run, so driver data
/// stored in it is dropped on every exit path.
pub struct JobContext<'a> {
    pub job_id: JobId,
    pub printer: &'a Printer,
    pub options: &'a PrintOptions,
    /// Header of the page being rasterized.
    pub header: RasterHeader,
    pub device: &'a mut dyn Device,
    pub data: JobData,
}

impl<'a> JobContext<'a> {
    pub fn new(
        job_id: JobId,
        printer: &'a Printer,
        options: &'a PrintOptions,
        device: &'a mut dyn Device,
    ) -> Self {
        Self {
            job_id,
            printer,
            options,
            header: options.header.clone(),
            device,
            data: JobData::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_data_downcasts() {
        let mut data = JobData::default();
        data.set(41u32);
        *data.get_mut::<u32>().unwrap() += 1;
        assert!(data.get_mut::<String>().is_none());
        assert_eq!(data.take::<String>(), None);
        assert_eq!(data.take::<u32>(), Some(42));
        assert!(!data.is_set());
    }

    #[test]
    fn accepts_format_follows_callbacks() {
        let driver = DriverData::new("t", "Test");
        assert!(!driver.accepts_format("image/pwg-raster"));

        let driver = DriverData::new("t", "Test").with_callbacks(
            DriverCallbacks::default().on_write_line(|_ctx: &mut JobContext<'_>, _y, _line| Ok(())),
        );
        assert!(driver.accepts_format("image/pwg-raster"));
        assert!(!driver.accepts_format("application/pdf"));
    }

    #[test]
    fn registry_lookup() {
        let mut registry = DriverRegistry::new();
        registry.register(DriverData::new("inkjet", "Generic Inkjet"));
        assert_eq!(registry.get("inkjet").unwrap().make_and_model, "Generic Inkjet");
        assert!(registry.get("missing").is_none());
    }
}
