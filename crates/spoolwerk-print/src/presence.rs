// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// DNS-SD presence publishing.
//
// A printer advertises one service record per protocol it speaks:
//   - `_ipp._tcp`             IPP endpoint
//   - `_ipps._tcp`            IPP over TLS, when TLS is enabled
//   - `_http._tcp`            web admin UI, when an admin port is set
//   - `_printer._tcp`         LPD placeholder on port 0 ("no LPD here")
//   - `_pdl-datastream._tcp`  raw socket ingress, when it is running
//
// When another host already owns the instance name, the record is renamed
// "<name> (<serial>)" with an increasing serial and registered again under
// the retry policy.  The network substrate sits behind `DiscoveryBackend`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};
use uuid::Uuid;

use spoolwerk_core::config::ServerConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};

use crate::retry::RetryPolicy;

/// Kinds of service record a printer can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Ipp,
    Ipps,
    Http,
    Printer,
    PdlDatastream,
}

impl ServiceKind {
    pub fn service_type(&self) -> &'static str {
        match self {
            Self::Ipp => "_ipp._tcp.local.",
            Self::Ipps => "_ipps._tcp.local.",
            Self::Http => "_http._tcp.local.",
            Self::Printer => "_printer._tcp.local.",
            Self::PdlDatastream => "_pdl-datastream._tcp.local.",
        }
    }
}

/// One record handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub kind: ServiceKind,
    pub instance: String,
    pub port: u16,
    pub txt: Vec<(String, String)>,
}

impl ServiceRecord {
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.instance, self.kind.service_type())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered { fullname: String },
    /// Another host owns this instance name.
    Collision,
}

/// Network substrate for presence records.
pub trait DiscoveryBackend: Send + Sync {
    fn register(&self, record: &ServiceRecord) -> Result<RegisterOutcome>;
    fn unregister(&self, fullname: &str) -> Result<()>;
    fn publish_location(&self, instance: &str, loc: &[u8; 16]) -> Result<()>;
}

/// A record currently registered on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRecord {
    pub kind: ServiceKind,
    pub fullname: String,
}

/// Presence bookkeeping kept inside the printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceState {
    /// Disambiguator; names carry a " (serial)" suffix once it exceeds 1.
    pub serial: u32,
    /// Whether any registration has collided.
    pub collision: bool,
    pub registered: Vec<ActiveRecord>,
    /// Last LOC record sent, to avoid resending an unchanged one.
    pub loc_sent: Option<[u8; 16]>,
}

impl Default for PresenceState {
    fn default() -> Self {
        Self {
            serial: 1,
            collision: false,
            registered: Vec::new(),
            loc_sent: None,
        }
    }
}

/// What the publisher needs to know about a printer, copied out under the
/// printer's read lock.
#[derive(Debug, Clone)]
pub struct PresenceSnapshot {
    pub printer_id: u32,
    pub base_name: String,
    pub uuid: Uuid,
    pub make_and_model: String,
    pub location: Option<String>,
    pub geo_location: Option<String>,
    pub formats: Vec<String>,
    pub color: bool,
    pub duplex: bool,
    /// Port of the raw listener, when it is running.
    pub raw_port: Option<u16>,
    pub state: PresenceState,
}

/// Server-wide presence settings.
#[derive(Debug, Clone)]
pub struct PresenceOptions {
    pub hostname: String,
    pub ipp_port: u16,
    pub tls_enabled: bool,
    pub admin_port: Option<u16>,
    pub retry: RetryPolicy,
}

impl PresenceOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        let hostname = config
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "spoolwerk".into());
        Self {
            hostname,
            ipp_port: config.ipp_port,
            tls_enabled: config.tls_enabled,
            admin_port: config.admin_port,
            retry: RetryPolicy::from(&config.presence),
        }
    }
}

/// Instance name for a given serial.
pub fn instance_name(base: &str, serial: u32) -> String {
    if serial > 1 {
        format!("{base} ({serial})")
    } else {
        base.to_string()
    }
}

/// Registers and withdraws a printer's records with collision handling.
pub struct PresencePublisher {
    backend: Arc<dyn DiscoveryBackend>,
    options: PresenceOptions,
}

impl PresencePublisher {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, options: PresenceOptions) -> Self {
        Self { backend, options }
    }

    pub fn options(&self) -> &PresenceOptions {
        &self.options
    }

    /// Register every record the snapshot calls for.
    ///
    /// Blocks for probing and retry delays; call without holding the printer
    /// lock.  On failure, records registered so far are withdrawn.
    pub fn publish(&self, snapshot: &PresenceSnapshot) -> Result<PresenceState> {
        let mut state = PresenceState {
            registered: Vec::new(),
            ..snapshot.state.clone()
        };

        for kind in self.kinds(snapshot) {
            match self.register_one(snapshot, kind, &mut state) {
                Ok(Some(active)) => state.registered.push(active),
                Ok(None) => {}
                Err(e) => {
                    self.withdraw(&state.registered);
                    return Err(e);
                }
            }
        }

        if let Some(geo) = snapshot.geo_location.as_deref() {
            match encode_loc(geo) {
                Some(loc) if state.loc_sent != Some(loc) => {
                    let instance = instance_name(&snapshot.base_name, state.serial);
                    match self.backend.publish_location(&instance, &loc) {
                        Ok(()) => state.loc_sent = Some(loc),
                        Err(e) => warn!(printer = snapshot.printer_id, error = %e, "LOC record not published"),
                    }
                }
                Some(_) => {}
                None => warn!(printer = snapshot.printer_id, geo, "ignoring malformed geo-location"),
            }
        }

        info!(
            printer = snapshot.printer_id,
            name = %instance_name(&snapshot.base_name, state.serial),
            records = state.registered.len(),
            "presence registered"
        );
        Ok(state)
    }

    /// Remove records.  Unknown or already-removed records are ignored.
    pub fn withdraw(&self, records: &[ActiveRecord]) {
        for record in records {
            match self.backend.unregister(&record.fullname) {
                Ok(()) => debug!(name = %record.fullname, "presence record removed"),
                Err(e) => warn!(name = %record.fullname, error = %e, "failed to remove presence record"),
            }
        }
    }

    fn kinds(&self, snapshot: &PresenceSnapshot) -> Vec<ServiceKind> {
        let mut kinds = vec![ServiceKind::Ipp];
        if self.options.tls_enabled {
            kinds.push(ServiceKind::Ipps);
        }
        if self.options.admin_port.is_some() {
            kinds.push(ServiceKind::Http);
        }
        kinds.push(ServiceKind::Printer);
        if snapshot.raw_port.is_some() {
            kinds.push(ServiceKind::PdlDatastream);
        }
        kinds
    }

    /// Register one record, renaming on collision until it sticks.
    /// Returns `None` when the backend failed for a reason other than a
    /// collision; that record is skipped.
    fn register_one(
        &self,
        snapshot: &PresenceSnapshot,
        kind: ServiceKind,
        state: &mut PresenceState,
    ) -> Result<Option<ActiveRecord>> {
        let mut attempt = 0;
        loop {
            let record = self.record(snapshot, kind, &instance_name(&snapshot.base_name, state.serial));
            match self.backend.register(&record) {
                Ok(RegisterOutcome::Registered { fullname }) => {
                    return Ok(Some(ActiveRecord { kind, fullname }));
                }
                Ok(RegisterOutcome::Collision) => {
                    state.collision = true;
                    state.serial += 1;
                    warn!(
                        printer = snapshot.printer_id,
                        name = %record.instance,
                        renamed = %instance_name(&snapshot.base_name, state.serial),
                        "presence name collision"
                    );
                    let Some(delay) = self.options.retry.next_delay(attempt) else {
                        return Err(SpoolwerkError::Discovery(format!(
                            "gave up registering {} after {} collisions",
                            kind.service_type(),
                            attempt + 1
                        )));
                    };
                    attempt += 1;
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Err(e) => {
                    warn!(printer = snapshot.printer_id, service = kind.service_type(), error = %e, "presence registration failed");
                    return Ok(None);
                }
            }
        }
    }

    fn record(&self, snapshot: &PresenceSnapshot, kind: ServiceKind, instance: &str) -> ServiceRecord {
        let port = match kind {
            ServiceKind::Ipp | ServiceKind::Ipps => self.options.ipp_port,
            ServiceKind::Http => self.options.admin_port.unwrap_or(80),
            ServiceKind::Printer => 0,
            ServiceKind::PdlDatastream => snapshot.raw_port.unwrap_or(0),
        };
        let txt = match kind {
            ServiceKind::Http => vec![("path".into(), "/".into())],
            ServiceKind::Printer => Vec::new(),
            _ => self.printer_txt(snapshot),
        };
        ServiceRecord {
            kind,
            instance: instance.to_string(),
            port,
            txt,
        }
    }

    fn printer_txt(&self, snapshot: &PresenceSnapshot) -> Vec<(String, String)> {
        let flag = |b: bool| if b { "T" } else { "F" };
        let mut txt = vec![
            ("txtvers".to_string(), "1".to_string()),
            ("qtotal".into(), "1".into()),
            ("priority".into(), "0".into()),
            ("rp".into(), "ipp/print".into()),
            ("ty".into(), snapshot.make_and_model.clone()),
            ("note".into(), snapshot.location.clone().unwrap_or_default()),
            ("pdl".into(), snapshot.formats.join(",")),
            ("UUID".into(), snapshot.uuid.to_string()),
            ("Color".into(), flag(snapshot.color).into()),
            ("Duplex".into(), flag(snapshot.duplex).into()),
        ];
        if self.options.tls_enabled {
            txt.push(("TLS".into(), "1.2".into()));
        }
        if let Some(port) = self.options.admin_port {
            txt.push((
                "adminurl".into(),
                format!("http://{}.local.:{port}/", self.options.hostname),
            ));
        }
        txt
    }
}

// ---------------------------------------------------------------------------
// LOC record
// ---------------------------------------------------------------------------

/// Encode a `geo:lat,lon[,alt]` URI as an RFC 1876 LOC record.
///
/// Size and both precisions are fixed at 50 cm.
pub fn encode_loc(geo: &str) -> Option<[u8; 16]> {
    let coords = geo.strip_prefix("geo:")?.split(';').next()?;
    let mut parts = coords.split(',').map(|p| p.trim().parse::<f64>());
    let lat = parts.next()?.ok()?;
    let lon = parts.next()?.ok()?;
    let alt = match parts.next() {
        Some(v) => v.ok()?,
        None => 0.0,
    };
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }

    // Thousandths of an arc second offset from 2^31; altitude in cm above
    // -100 km.
    let lat_raw = (0x8000_0000_i64 + (lat * 3_600_000.0).round() as i64) as u32;
    let lon_raw = (0x8000_0000_i64 + (lon * 3_600_000.0).round() as i64) as u32;
    let alt_raw = ((alt + 100_000.0) * 100.0).round().clamp(0.0, u32::MAX as f64) as u32;

    let mut loc = [0u8; 16];
    loc[0] = 0; // version
    loc[1] = 0x51; // size
    loc[2] = 0x51; // horizontal precision
    loc[3] = 0x51; // vertical precision
    loc[4..8].copy_from_slice(&lat_raw.to_be_bytes());
    loc[8..12].copy_from_slice(&lon_raw.to_be_bytes());
    loc[12..16].copy_from_slice(&alt_raw.to_be_bytes());
    Some(loc)
}

// ---------------------------------------------------------------------------
// mDNS backend
// ---------------------------------------------------------------------------

/// `mdns-sd` backed presence substrate.
///
/// Before announcing a record the backend browses the service type for
/// `probe` and reports a collision if another host answers for the same
/// full name.
pub struct MdnsBackend {
    daemon: ServiceDaemon,
    hostname: String,
    probe: Duration,
}

impl MdnsBackend {
    pub fn new(hostname: impl Into<String>, probe: Duration) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| SpoolwerkError::Discovery(format!("mDNS daemon init: {e}")))?;
        Ok(Self {
            daemon,
            hostname: hostname.into(),
            probe,
        })
    }

    fn host_fqdn(&self) -> String {
        format!("{}.local.", self.hostname)
    }

    /// Whether another host already answers for `fullname`.
    fn name_taken(&self, service_type: &str, fullname: &str) -> Result<bool> {
        let receiver = self
            .daemon
            .browse(service_type)
            .map_err(|e| SpoolwerkError::Discovery(format!("browse {service_type}: {e}")))?;

        let deadline = Instant::now() + self.probe;
        let mut taken = false;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match receiver.recv_timeout(remaining) {
                Ok(ServiceEvent::ServiceResolved(info)) if info.get_fullname() == fullname => {
                    if info.get_hostname() != self.host_fqdn() {
                        debug!(name = %fullname, host = info.get_hostname(), "instance name in use");
                        taken = true;
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        if let Err(e) = self.daemon.stop_browse(service_type) {
            debug!(service = service_type, error = %e, "stop browse failed");
        }
        Ok(taken)
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "failed to shut down mDNS daemon");
        }
    }
}

impl DiscoveryBackend for MdnsBackend {
    fn register(&self, record: &ServiceRecord) -> Result<RegisterOutcome> {
        let service_type = record.kind.service_type();
        let fullname = record.fullname();
        if self.name_taken(service_type, &fullname)? {
            return Ok(RegisterOutcome::Collision);
        }

        let properties: HashMap<String, String> = record.txt.iter().cloned().collect();
        let info = ServiceInfo::new(
            service_type,
            &record.instance,
            &self.host_fqdn(),
            "",
            record.port,
            properties,
        )
        .map_err(|e| SpoolwerkError::Discovery(format!("service info for {fullname}: {e}")))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_owned();
        self.daemon
            .register(info)
            .map_err(|e| SpoolwerkError::Discovery(format!("register {fullname}: {e}")))?;
        info!(service_type, name = %record.instance, port = record.port, "mDNS service registered");
        Ok(RegisterOutcome::Registered { fullname })
    }

    fn unregister(&self, fullname: &str) -> Result<()> {
        self.daemon
            .unregister(fullname)
            .map(|_| ())
            .map_err(|e| SpoolwerkError::Discovery(format!("unregister {fullname}: {e}")))
    }

    fn publish_location(&self, instance: &str, _loc: &[u8; 16]) -> Result<()> {
        // The responder only serves PTR/SRV/TXT/A/AAAA.
        debug!(name = %instance, "LOC record not supported by mDNS responder");
        Err(SpoolwerkError::NotSupported("mDNS LOC records"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Backend that collides on a fixed set of instance names.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub(crate) taken: Mutex<HashSet<String>>,
        pub(crate) registered: Mutex<Vec<ServiceRecord>>,
        pub(crate) attempts: Mutex<Vec<String>>,
        pub(crate) removed: Mutex<Vec<String>>,
        pub(crate) locations: Mutex<Vec<[u8; 16]>>,
        pub(crate) refuse_location: bool,
    }

    impl FakeBackend {
        pub(crate) fn taking(names: &[&str]) -> Self {
            let backend = Self::default();
            backend
                .taken
                .lock()
                .unwrap()
                .extend(names.iter().map(|n| n.to_string()));
            backend
        }
    }

    impl DiscoveryBackend for FakeBackend {
        fn register(&self, record: &ServiceRecord) -> Result<RegisterOutcome> {
            self.attempts.lock().unwrap().push(record.instance.clone());
            if self.taken.lock().unwrap().contains(&record.instance) {
                return Ok(RegisterOutcome::Collision);
            }
            self.registered.lock().unwrap().push(record.clone());
            Ok(RegisterOutcome::Registered {
                fullname: record.fullname(),
            })
        }

        fn unregister(&self, fullname: &str) -> Result<()> {
            self.removed.lock().unwrap().push(fullname.to_string());
            Ok(())
        }

        fn publish_location(&self, _instance: &str, loc: &[u8; 16]) -> Result<()> {
            if self.refuse_location {
                return Err(SpoolwerkError::NotSupported("LOC records"));
            }
            self.locations.lock().unwrap().push(*loc);
            Ok(())
        }
    }

    pub(crate) fn options() -> PresenceOptions {
        PresenceOptions {
            hostname: "testhost".into(),
            ipp_port: 8631,
            tls_enabled: false,
            admin_port: None,
            retry: RetryPolicy::immediate(),
        }
    }

    fn snapshot(name: &str) -> PresenceSnapshot {
        PresenceSnapshot {
            printer_id: 1,
            base_name: name.into(),
            uuid: Uuid::nil(),
            make_and_model: "Test Printer".into(),
            location: Some("Lab".into()),
            geo_location: None,
            formats: vec!["image/pwg-raster".into()],
            color: true,
            duplex: false,
            raw_port: None,
            state: PresenceState::default(),
        }
    }

    #[test]
    fn collisions_rename_with_increasing_serial() {
        let backend = Arc::new(FakeBackend::taking(&["Office", "Office (2)"]));
        let publisher = PresencePublisher::new(backend.clone(), options());

        let state = publisher.publish(&snapshot("Office")).unwrap();
        assert!(state.collision);
        assert_eq!(state.serial, 3);

        let attempts = backend.attempts.lock().unwrap();
        assert_eq!(attempts[..3], ["Office", "Office (2)", "Office (3)"]);
        let registered = backend.registered.lock().unwrap();
        assert!(registered.iter().all(|r| r.instance == "Office (3)"));
    }

    #[test]
    fn record_set_follows_options() {
        let backend = Arc::new(FakeBackend::default());
        let publisher = PresencePublisher::new(
            backend.clone(),
            PresenceOptions {
                tls_enabled: true,
                admin_port: Some(8080),
                ..options()
            },
        );
        let mut snap = snapshot("Lab");
        snap.raw_port = Some(9100);
        let state = publisher.publish(&snap).unwrap();

        let kinds: Vec<ServiceKind> = state.registered.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [
                ServiceKind::Ipp,
                ServiceKind::Ipps,
                ServiceKind::Http,
                ServiceKind::Printer,
                ServiceKind::PdlDatastream
            ]
        );
        let registered = backend.registered.lock().unwrap();
        let lpd = registered.iter().find(|r| r.kind == ServiceKind::Printer).unwrap();
        assert_eq!(lpd.port, 0);
        let ipp = registered.iter().find(|r| r.kind == ServiceKind::Ipp).unwrap();
        assert!(ipp.txt.contains(&("TLS".into(), "1.2".into())));
        assert!(ipp.txt.contains(&("adminurl".into(), "http://testhost.local.:8080/".into())));
    }

    #[test]
    fn bounded_retry_gives_up_and_withdraws() {
        let backend = Arc::new(FakeBackend::taking(&["Busy", "Busy (2)", "Busy (3)"]));
        let publisher = PresencePublisher::new(
            backend.clone(),
            PresenceOptions {
                retry: RetryPolicy {
                    max_attempts: Some(2),
                    ..RetryPolicy::immediate()
                },
                ..options()
            },
        );
        let err = publisher.publish(&snapshot("Busy")).unwrap_err();
        assert!(matches!(err, SpoolwerkError::Discovery(_)));
        assert!(backend.registered.lock().unwrap().is_empty());
    }

    #[test]
    fn location_sent_only_when_changed() {
        let backend = Arc::new(FakeBackend::default());
        let publisher = PresencePublisher::new(backend.clone(), options());
        let mut snap = snapshot("Geo");
        snap.geo_location = Some("geo:46.4707,-80.9961,150".into());

        let state = publisher.publish(&snap).unwrap();
        snap.state = state;
        publisher.publish(&snap).unwrap();
        assert_eq!(backend.locations.lock().unwrap().len(), 1);

        snap.geo_location = Some("geo:0,0".into());
        publisher.publish(&snap).unwrap();
        assert_eq!(backend.locations.lock().unwrap().len(), 2);
    }

    #[test]
    fn refused_location_is_not_recorded() {
        let backend = Arc::new(FakeBackend {
            refuse_location: true,
            ..Default::default()
        });
        let publisher = PresencePublisher::new(backend.clone(), options());
        let mut snap = snapshot("Geo");
        snap.geo_location = Some("geo:46.4707,-80.9961,150".into());

        let state = publisher.publish(&snap).unwrap();
        assert_eq!(state.loc_sent, None);
        assert!(!state.registered.is_empty());
        assert!(backend.locations.lock().unwrap().is_empty());
    }

    #[test]
    fn loc_encoding_matches_rfc1876_layout() {
        let loc = encode_loc("geo:0,0").unwrap();
        assert_eq!(&loc[..4], &[0, 0x51, 0x51, 0x51]);
        assert_eq!(&loc[4..8], &0x8000_0000u32.to_be_bytes());
        assert_eq!(&loc[8..12], &0x8000_0000u32.to_be_bytes());
        assert_eq!(&loc[12..16], &10_000_000u32.to_be_bytes());

        let loc = encode_loc("geo:1,-1,10;u=35").unwrap();
        assert_eq!(&loc[4..8], &(0x8000_0000u32 + 3_600_000).to_be_bytes());
        assert_eq!(&loc[8..12], &(0x8000_0000u32 - 3_600_000).to_be_bytes());
        assert_eq!(&loc[12..16], &10_001_000u32.to_be_bytes());

        assert!(encode_loc("geo:91,0").is_none());
        assert!(encode_loc("46.4,-80.9").is_none());
    }

    #[test]
    fn instance_names() {
        assert_eq!(instance_name("Lab", 1), "Lab");
        assert_eq!(instance_name("Lab", 2), "Lab (2)");
    }
}
