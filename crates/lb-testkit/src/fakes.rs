//! Fakes for the daemon's external collaborators

use byteorder::{BigEndian, ByteOrder};
use lb_common::{
    AppInfo, ConnInfo, ConnKey, DbError, DbResult, DestInfo, DestKey, KeyedStore, MemStore,
    ServiceInfo, ServiceKey,
};
use lbsyncd::state_sync::{CONN_RECORD_SIZE, FRAME_HEADER_SIZE};
use lbsyncd::{
    ControlSource, DestAttrs, ExitController, LbsyncError, PeerTransport, RawEvent, ServiceAttrs,
    Tables,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Observable side of a [`ScriptedControlSource`] after it was moved into
/// the daemon.
#[derive(Debug, Clone, Default)]
pub struct SourceProbe {
    unregistered: Arc<AtomicBool>,
    delivered: Arc<AtomicUsize>,
    dest_dumps: Arc<Mutex<Vec<ServiceKey>>>,
}

impl SourceProbe {
    pub fn unregistered(&self) -> bool {
        self.unregistered.load(Ordering::SeqCst)
    }

    /// Number of events handed out by `recv_event`.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Services whose destinations were dumped, in request order.
    pub fn dest_dumps(&self) -> Vec<ServiceKey> {
        self.dest_dumps.lock().clone()
    }
}

/// Control source replaying a fixed dump and event script.
#[derive(Debug, Default)]
pub struct ScriptedControlSource {
    services: Vec<ServiceAttrs>,
    dests: HashMap<ServiceKey, Vec<DestAttrs>>,
    events: VecDeque<RawEvent>,
    fail_service_dump: bool,
    fail_dest_dump: Option<ServiceKey>,
    shutdown_when_drained: Option<ExitController>,
    probe: SourceProbe,
}

impl ScriptedControlSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: ServiceAttrs) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_dest(mut self, service: ServiceKey, dest: DestAttrs) -> Self {
        self.dests.entry(service).or_default().push(dest);
        self
    }

    pub fn with_event(mut self, event: RawEvent) -> Self {
        self.events.push_back(event);
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = RawEvent>) -> Self {
        self.events.extend(events);
        self
    }

    pub fn failing_service_dump(mut self) -> Self {
        self.fail_service_dump = true;
        self
    }

    pub fn failing_dest_dump(mut self, service: ServiceKey) -> Self {
        self.fail_dest_dump = Some(service);
        self
    }

    /// Requests an orderly shutdown once every scripted event was delivered.
    pub fn shutdown_when_drained(mut self, exit: ExitController) -> Self {
        self.shutdown_when_drained = Some(exit);
        self
    }

    pub fn probe(&self) -> SourceProbe {
        self.probe.clone()
    }
}

impl ControlSource for ScriptedControlSource {
    fn get_all_services(&mut self) -> lbsyncd::Result<Vec<ServiceAttrs>> {
        if self.fail_service_dump {
            return Err(LbsyncError::Control("service dump unavailable".to_string()));
        }
        Ok(self.services.clone())
    }

    fn get_all_destinations(&mut self, service: &ServiceKey) -> lbsyncd::Result<Vec<DestAttrs>> {
        self.probe.dest_dumps.lock().push(*service);
        if self.fail_dest_dump == Some(*service) {
            return Err(LbsyncError::Control(format!(
                "destination dump of {} unavailable",
                service
            )));
        }
        Ok(self.dests.get(service).cloned().unwrap_or_default())
    }

    fn recv_event(&mut self, _timeout: Duration) -> lbsyncd::Result<Option<RawEvent>> {
        match self.events.pop_front() {
            Some(event) => {
                self.probe.delivered.fetch_add(1, Ordering::SeqCst);
                Ok(Some(event))
            }
            None => {
                if let Some(exit) = &self.shutdown_when_drained {
                    exit.shutdown();
                }
                Ok(None)
            }
        }
    }

    fn unregister(&mut self) {
        self.probe.unregistered.store(true, Ordering::SeqCst);
    }
}

/// Table operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Insert,
    Modify,
    Delete,
    Lookup,
    ClearAll,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    error: DbError,
    remaining: Option<usize>,
}

/// Shared handle for arming faults on a [`FaultStore`].
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    faults: Arc<Mutex<Vec<Fault>>>,
    triggered: Arc<AtomicUsize>,
}

impl FaultInjector {
    /// Fails every `op` with `error`.
    pub fn fail_always(&self, op: StoreOp, error: DbError) {
        self.faults.lock().push(Fault {
            op,
            error,
            remaining: None,
        });
    }

    /// Fails the next `op` only.
    pub fn fail_once(&self, op: StoreOp, error: DbError) {
        self.faults.lock().push(Fault {
            op,
            error,
            remaining: Some(1),
        });
    }

    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    /// Number of operations that were failed.
    pub fn triggered(&self) -> usize {
        self.triggered.load(Ordering::SeqCst)
    }

    fn check(&self, op: StoreOp) -> DbResult<()> {
        let mut faults = self.faults.lock();
        let Some(pos) = faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };

        let error = faults[pos].error.clone();
        if let Some(remaining) = faults[pos].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(pos);
            }
        }
        self.triggered.fetch_add(1, Ordering::SeqCst);
        debug!(?op, %error, "Injected table fault");
        Err(error)
    }
}

/// [`MemStore`] wrapper that fails armed operations.
pub struct FaultStore<K, V>
where
    K: Eq + Hash,
{
    inner: MemStore<K, V>,
    injector: FaultInjector,
}

impl<K, V> FaultStore<K, V>
where
    K: Eq + Hash,
{
    pub fn new(name: &str, max_entries: usize) -> (Self, FaultInjector) {
        let injector = FaultInjector::default();
        let store = Self {
            inner: MemStore::new(name, max_entries),
            injector: injector.clone(),
        };
        (store, injector)
    }
}

impl<K, V> KeyedStore<K, V> for FaultStore<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn insert(&self, key: K, value: V) -> DbResult<()> {
        self.injector.check(StoreOp::Insert)?;
        self.inner.insert(key, value)
    }

    fn modify(&self, key: &K, value: V) -> DbResult<()> {
        self.injector.check(StoreOp::Modify)?;
        self.inner.modify(key, value)
    }

    fn delete(&self, key: &K) -> DbResult<()> {
        self.injector.check(StoreOp::Delete)?;
        self.inner.delete(key)
    }

    fn lookup(&self, key: &K) -> DbResult<V> {
        self.injector.check(StoreOp::Lookup)?;
        self.inner.lookup(key)
    }

    fn clear_all(&self) -> DbResult<()> {
        self.injector.check(StoreOp::ClearAll)?;
        self.inner.clear_all()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Fault injectors for every table of [`faulty_tables`].
#[derive(Debug, Clone)]
pub struct TableFaults {
    pub services: FaultInjector,
    pub dests: FaultInjector,
    pub conn_class: FaultInjector,
    pub conn_info: FaultInjector,
    pub app_info: FaultInjector,
}

/// Tables backed by [`FaultStore`]s.
pub fn faulty_tables(max_conns: u32) -> (Arc<Tables>, TableFaults) {
    let (services, services_faults) = FaultStore::<ServiceKey, ServiceInfo>::new("service", 16);
    let (dests, dests_faults) = FaultStore::<DestKey, DestInfo>::new("destination", 64);
    let (conn_class, conn_class_faults) = FaultStore::<ConnKey, u32>::new("conn_classification", max_conns as usize);
    let (conn_info, conn_info_faults) = FaultStore::<u32, ConnInfo>::new("conn_info", max_conns as usize);
    let (app_info, app_info_faults) = FaultStore::<u8, AppInfo>::new("application_info", 1);

    let tables = Tables::from_stores(
        Box::new(services),
        Box::new(dests),
        Box::new(conn_class),
        Box::new(conn_info),
        Box::new(app_info),
        max_conns,
    );
    let faults = TableFaults {
        services: services_faults,
        dests: dests_faults,
        conn_class: conn_class_faults,
        conn_info: conn_info_faults,
        app_info: app_info_faults,
    };
    (Arc::new(tables), faults)
}

/// One IPv4 connection record decoded from a sync frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRecord {
    pub protocol: u8,
    pub flags: u32,
    pub state: u16,
    pub client_port: u16,
    pub virtual_port: u16,
    pub server_port: u16,
    pub timeout: u32,
    pub client_ip: Ipv4Addr,
    pub virtual_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
}

/// Decoded frame header plus records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFrame {
    pub source_ip: Ipv4Addr,
    pub sync_id: u8,
    pub size: u16,
    pub count: u8,
    pub version: u8,
    pub records: Vec<SyncRecord>,
}

impl SyncFrame {
    /// Parses a frame; panics on malformed input.
    pub fn parse(source_ip: Ipv4Addr, bytes: &[u8]) -> Self {
        assert!(bytes.len() >= FRAME_HEADER_SIZE, "frame shorter than its header");
        let count = bytes[4];
        let records = bytes[FRAME_HEADER_SIZE..]
            .chunks(CONN_RECORD_SIZE)
            .map(|r| {
                assert_eq!(r.len(), CONN_RECORD_SIZE, "truncated connection record");
                SyncRecord {
                    protocol: r[1],
                    flags: BigEndian::read_u32(&r[4..8]),
                    state: BigEndian::read_u16(&r[8..10]),
                    client_port: BigEndian::read_u16(&r[10..12]),
                    virtual_port: BigEndian::read_u16(&r[12..14]),
                    server_port: BigEndian::read_u16(&r[14..16]),
                    timeout: BigEndian::read_u32(&r[20..24]),
                    client_ip: Ipv4Addr::from(BigEndian::read_u32(&r[24..28])),
                    virtual_ip: Ipv4Addr::from(BigEndian::read_u32(&r[28..32])),
                    server_ip: Ipv4Addr::from(BigEndian::read_u32(&r[32..36])),
                }
            })
            .collect::<Vec<_>>();
        assert_eq!(records.len(), count as usize, "record count mismatch");

        Self {
            source_ip,
            sync_id: bytes[1],
            size: BigEndian::read_u16(&bytes[2..4]),
            count,
            version: bytes[5],
            records,
        }
    }
}

/// Peer transport that keeps every frame it is given.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<(Ipv4Addr, Vec<u8>)>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes subsequent sends fail (frames are still recorded).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn frames(&self) -> Vec<SyncFrame> {
        self.frames
            .lock()
            .iter()
            .map(|(src, bytes)| SyncFrame::parse(*src, bytes))
            .collect()
    }

    /// Client ports of every record sent, in send order.
    pub fn client_ports(&self) -> Vec<u16> {
        self.frames()
            .iter()
            .flat_map(|f| f.records.iter().map(|r| r.client_port))
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

impl PeerTransport for RecordingTransport {
    fn send_frame(&self, source_ip: Ipv4Addr, frame: &[u8]) -> io::Result<()> {
        self.frames.lock().push((source_ip, frame.to_vec()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "peer down"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_once_disarms() {
        let (store, injector): (FaultStore<u32, u32>, _) = FaultStore::new("t", 4);
        injector.fail_once(StoreOp::Insert, DbError::backend("busy"));
        assert!(store.insert(1, 1).is_err());
        assert!(store.insert(1, 1).is_ok());
        assert_eq!(injector.triggered(), 1);
    }

    #[test]
    fn test_fail_always() {
        let (store, injector): (FaultStore<u32, u32>, _) = FaultStore::new("t", 4);
        injector.fail_always(StoreOp::Lookup, DbError::internal("corrupt"));
        assert!(store.lookup(&1).unwrap_err().is_fatal());
        assert!(store.lookup(&1).unwrap_err().is_fatal());
        injector.clear();
        assert_eq!(store.lookup(&1), Err(DbError::NotFound));
    }
}
