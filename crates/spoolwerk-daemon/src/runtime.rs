// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Server runtime: restores printers from the state database and runs their
// schedulers, ingress listeners and presence records until shutdown.

use std::sync::Arc;
use std::time::Duration;

use spoolwerk_core::config::{PrinterConfig, ServerConfig};
use spoolwerk_core::error::Result;
use spoolwerk_print::{
    DriverRegistry, MdnsBackend, PresenceOptions, PresencePublisher, Printer, RawListener,
    Scheduler, StateStore, UsbListener, sample_driver,
};
use tracing::{error, info, warn};

/// Everything running for one printer.
struct PrinterRuntime {
    printer: Arc<Printer>,
    scheduler: Scheduler,
    raw: Option<RawListener>,
    usb: Option<UsbListener>,
}

pub struct Runtime {
    store: StateStore,
    printers: Vec<PrinterRuntime>,
    mdns: Option<Arc<MdnsBackend>>,
}

impl Runtime {
    /// Drivers compiled into the server.
    pub fn drivers() -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        sample_driver::register(&mut registry);
        registry
    }

    /// Open the state database, restore printers and start them.
    ///
    /// Printers stored in the database win over those in `config`; the
    /// configured ones only seed an empty database.  A printer that fails to
    /// restore or start a listener is logged and the rest carry on.
    pub async fn start(config: &ServerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = StateStore::open(config.data_dir.join("state.db"))?;

        let mut configs = store.load_printers()?;
        if configs.is_empty() {
            for printer in &config.printers {
                store.save_printer(printer)?;
            }
            configs = config.printers.clone();
        }

        let mdns = if config.presence.enabled {
            let options = PresenceOptions::from_config(config);
            match MdnsBackend::new(&options.hostname, Duration::from_millis(config.presence.probe_ms)) {
                Ok(backend) => Some((Arc::new(backend), options)),
                Err(e) => {
                    warn!(error = %e, "mDNS unavailable; printers will not be advertised");
                    None
                }
            }
        } else {
            None
        };

        let drivers = Self::drivers();
        let mut printers = Vec::with_capacity(configs.len());
        for printer_config in configs {
            let id = printer_config.printer_id;
            match Self::start_printer(printer_config, &drivers, mdns.as_ref()).await {
                Ok(runtime) => printers.push(runtime),
                Err(e) => error!(printer = id, error = %e, "printer not started"),
            }
        }

        info!(printers = printers.len(), "runtime started");
        Ok(Self {
            store,
            printers,
            mdns: mdns.map(|(backend, _)| backend),
        })
    }

    async fn start_printer(
        config: PrinterConfig,
        drivers: &DriverRegistry,
        mdns: Option<&(Arc<MdnsBackend>, PresenceOptions)>,
    ) -> Result<PrinterRuntime> {
        let printer = Arc::new(Printer::from_config(config, drivers)?);

        let mut scheduler = Scheduler::new(Arc::clone(&printer));
        scheduler.start();

        let raw = if printer.raw_config().enabled {
            let mut listener = RawListener::new(Arc::clone(&printer));
            match listener.start().await {
                Ok(_) => Some(listener),
                Err(e) => {
                    warn!(printer = printer.id(), error = %e, "raw listener not started");
                    None
                }
            }
        } else {
            None
        };

        let usb = if printer.usb_config().is_some() {
            let mut listener = UsbListener::new(Arc::clone(&printer));
            match listener.start().await {
                Ok(()) => Some(listener),
                Err(e) => {
                    warn!(printer = printer.id(), error = %e, "USB gadget listener not started");
                    None
                }
            }
        } else {
            None
        };

        if let Some((backend, options)) = mdns {
            printer.attach_presence(Arc::new(PresencePublisher::new(
                backend.clone(),
                options.clone(),
            )));
            let target = Arc::clone(&printer);
            match tokio::task::spawn_blocking(move || target.register_presence()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(printer = printer.id(), error = %e, "presence registration failed"),
                Err(e) => warn!(printer = printer.id(), error = %e, "presence task failed"),
            }
        }

        info!(printer = printer.id(), name = %printer.name(), "printer started");
        Ok(PrinterRuntime {
            printer,
            scheduler,
            raw,
            usb,
        })
    }

    pub fn printers(&self) -> impl Iterator<Item = &Arc<Printer>> {
        self.printers.iter().map(|p| &p.printer)
    }

    /// Stop every printer and persist its state.
    pub async fn shutdown(mut self) -> Result<()> {
        for mut runtime in self.printers.drain(..) {
            let id = runtime.printer.id();
            if let Some(mut raw) = runtime.raw.take() {
                if let Err(e) = raw.stop().await {
                    warn!(printer = id, error = %e, "raw listener stop failed");
                }
            }
            if let Some(mut usb) = runtime.usb.take() {
                if let Err(e) = usb.stop().await {
                    warn!(printer = id, error = %e, "USB listener stop failed");
                }
            }
            if let Err(e) = runtime.scheduler.stop().await {
                warn!(printer = id, error = %e, "scheduler stop failed");
            }
            runtime.printer.unregister_presence();
            self.store.save_printer(&runtime.printer.to_config())?;
        }
        if let Some(backend) = self.mdns.take() {
            backend.shutdown();
        }
        info!("runtime stopped");
        Ok(())
    }
}
