// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw socket ingress (AppSocket / HP JetDirect).
//
// Listens on the IPv4 and IPv6 wildcard addresses at the printer's raw port.
// Each accepted connection is one job: the bytes received are passed through
// to the printer's device unchanged.  Connections are serviced one at a time
// per printer; later ones wait their turn in the accept backlog.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use spoolwerk_core::config::RawListenerConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};

use super::{copy_stream, finish_stream_job, open_stream_job, spawn_device_writer};
use crate::printer::Printer;

/// Raw socket listener for one printer.
pub struct RawListener {
    printer: Arc<Printer>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    port: Option<u16>,
}

impl RawListener {
    pub fn new(printer: Arc<Printer>) -> Self {
        Self {
            printer,
            shutdown: None,
            tasks: Vec::new(),
            port: None,
        }
    }

    /// Bound port while running.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Bind the listening sockets and spawn their accept loops.  Returns the
    /// bound port.
    ///
    /// # Errors
    ///
    /// Fails when neither the IPv4 nor the IPv6 socket can be bound.
    pub async fn start(&mut self) -> Result<u16> {
        if let Some(port) = self.port.filter(|_| self.is_running()) {
            debug!(printer = self.printer.id(), port, "raw listener already running");
            return Ok(port);
        }

        let config = self.printer.raw_config();
        let requested = self.printer.raw_port()?;

        let v4 = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, requested)).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(printer = self.printer.id(), port = requested, error = %e, "IPv4 raw socket not bound");
                None
            }
        };
        // An ephemeral request binds IPv6 on whatever port IPv4 got.
        let port = v4
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map_or(requested, |a| a.port());
        let v6 = match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                // Dual-stack hosts already cover IPv6 through the IPv4 socket.
                debug!(printer = self.printer.id(), port, error = %e, "IPv6 raw socket not bound");
                None
            }
        };

        let listeners: Vec<TcpListener> = v4.into_iter().chain(v6).collect();
        let Some(first) = listeners.first() else {
            error!(printer = self.printer.id(), port = requested, "raw listener failed to bind");
            return Err(SpoolwerkError::Listener(format!(
                "unable to bind raw port {requested}"
            )));
        };
        let port = first.local_addr().map_or(port, |a| a.port());

        let (tx, rx) = watch::channel(false);
        let turn = Arc::new(Mutex::new(()));
        for listener in listeners {
            let printer = Arc::clone(&self.printer);
            let shutdown = rx.clone();
            let turn = Arc::clone(&turn);
            let config = config.clone();
            self.tasks.push(tokio::spawn(async move {
                Self::accept_loop(listener, shutdown, printer, turn, config).await;
            }));
        }

        self.shutdown = Some(tx);
        self.port = Some(port);
        self.printer.set_raw_active(true);
        info!(printer = self.printer.id(), port, "raw listener started");
        Ok(port)
    }

    /// Stop accepting.  A connection being serviced finishes first; the idle
    /// timeout bounds how long that takes.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(shutdown) = self.shutdown.take() else {
            return Ok(());
        };
        let _ = shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.await
                .map_err(|e| SpoolwerkError::Listener(format!("raw listener task join: {e}")))?;
        }
        self.printer.set_raw_active(false);
        info!(printer = self.printer.id(), port = ?self.port.take(), "raw listener stopped");
        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
        printer: Arc<Printer>,
        turn: Arc<Mutex<()>>,
        config: RawListenerConfig,
    ) {
        loop {
            if printer.is_deleted() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(printer = printer.id(), "raw accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _turn = turn.lock().await;
                        if let Err(e) = Self::handle_connection(stream, peer, &printer, &config).await {
                            warn!(printer = printer.id(), peer = %peer, error = %e, "raw connection failed");
                        }
                    }
                    Err(e) => error!(printer = printer.id(), error = %e, "failed to accept raw connection"),
                },
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        printer: &Arc<Printer>,
        config: &RawListenerConfig,
    ) -> Result<()> {
        info!(printer = printer.id(), peer = %peer, "raw connection accepted");
        let device_wait = Duration::from_secs(config.device_wait_secs);
        let idle = Duration::from_secs(config.idle_timeout_secs.max(1));

        let (ticket, lease) = open_stream_job(
            printer,
            format!("Raw print from {}", peer.ip()),
            &peer.ip().to_string(),
            device_wait,
        )
        .await?;
        let (tx, writer) = spawn_device_writer(Arc::clone(printer), lease);

        let mut digest = Sha256::new();
        let end = copy_stream(&mut stream, &ticket, tx, idle, &mut digest).await;
        finish_stream_job(printer, ticket.id, end, digest, writer).await?;
        Ok(())
    }
}
