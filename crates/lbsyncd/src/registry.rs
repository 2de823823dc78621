//! Registry sync engine
//!
//! Applies service and destination configuration to the shared tables.
//! Events come from a single control source and are applied strictly in
//! arrival order; the forwarding path only reads these tables.
//!
//! Error policy:
//! - decode failures skip the event
//! - not-found, not-supported and recoverable backend errors are logged
//! - internal and hardware errors go through the exit controller; a
//!   flush only escalates internal errors

use crate::control::{
    decode_dump_dest, decode_dump_service, decode_event, ControlEvent, ControlSource, DaemonState,
    DestIdentity, DestRecord, RawEvent, ServiceRecord,
};
use crate::exit::{ExitController, FatalError};
use crate::tables::{Tables, APP_INFO_KEY};
use lb_common::{DbError, DbResult, DestInfo, DestKey, ServiceInfo, ServiceKey};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Hands out stable service slots.
#[derive(Debug)]
struct IndexAllocator {
    next: u32,
    free: Vec<u32>,
    capacity: u32,
}

impl IndexAllocator {
    fn new(capacity: u32) -> Self {
        Self {
            next: 0,
            free: Vec::new(),
            capacity,
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        if self.next >= self.capacity {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(index)
    }

    fn release(&mut self, index: u32) {
        if index < self.next && !self.free.contains(&index) {
            self.free.push(index);
        }
    }

    fn reset(&mut self) {
        self.next = 0;
        self.free.clear();
    }
}

/// Counters for incremental events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Result of handling one control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Event failed validation and was dropped
    Skipped,
    /// Non-fatal table error, logged
    Failed(DbError),
    /// Exit controller was invoked; stop processing
    Fatal(FatalError),
}

/// Summary of a completed bootstrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub services: usize,
    pub dests: usize,
    /// Records that failed with a non-fatal error
    pub failed: usize,
}

pub struct RegistrySync {
    tables: Arc<Tables>,
    supported_schedulers: Vec<String>,
    indices: IndexAllocator,
    stats: EventStats,
}

impl RegistrySync {
    pub fn new(tables: Arc<Tables>, supported_schedulers: Vec<String>, max_services: usize) -> Self {
        let capacity = u32::try_from(max_services).unwrap_or(u32::MAX);
        Self {
            tables,
            supported_schedulers,
            indices: IndexAllocator::new(capacity),
            stats: EventStats::default(),
        }
    }

    pub fn tables(&self) -> &Arc<Tables> {
        &self.tables
    }

    pub fn stats(&self) -> EventStats {
        self.stats
    }

    fn check_scheduler(&self, sched_name: &str) -> DbResult<()> {
        if self.supported_schedulers.iter().any(|s| s == sched_name) {
            Ok(())
        } else {
            Err(DbError::not_supported(format!(
                "scheduler {} is not supported",
                sched_name
            )))
        }
    }

    /// Adds a service, or updates it in place if it already exists.
    #[instrument(skip(self, svc), fields(service = %svc.key))]
    pub fn apply_new_service(&mut self, svc: &ServiceRecord) -> DbResult<()> {
        self.check_scheduler(&svc.sched_name)?;

        let existing = match self.tables.services.lookup(&svc.key) {
            Ok(info) => Some(info),
            Err(DbError::NotFound) => None,
            Err(e) => return Err(e),
        };

        match existing {
            Some(current) => {
                debug!("Service exists, updating in place");
                let info = service_info(svc, current.index, svc.flags.merge(current.flags), current.dest_count);
                self.tables.services.insert(svc.key, info)
            }
            None => {
                let index = self.indices.allocate().ok_or_else(|| {
                    DbError::backend(format!("no free service index for {}", svc.key))
                })?;
                let info = service_info(svc, index, svc.flags.apply_to_zero(), 0);
                match self.tables.services.insert(svc.key, info) {
                    Ok(()) => {
                        info!(index, sched = %svc.sched_name, "Service added");
                        Ok(())
                    }
                    Err(e) => {
                        self.indices.release(index);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Updates an existing service; only masked flag bits change.
    #[instrument(skip(self, svc), fields(service = %svc.key))]
    pub fn apply_modify_service(&mut self, svc: &ServiceRecord) -> DbResult<()> {
        self.check_scheduler(&svc.sched_name)?;

        let current = self.tables.services.lookup(&svc.key)?;
        let info = service_info(svc, current.index, svc.flags.merge(current.flags), current.dest_count);
        self.tables.services.modify(&svc.key, info)?;
        debug!(flags = format_args!("{:#x}", svc.flags.merge(current.flags)), "Service modified");
        Ok(())
    }

    /// Removes a service.
    ///
    /// Destinations still bound to the service are not removed; the
    /// control source deletes them first.
    #[instrument(skip(self))]
    pub fn apply_delete_service(&mut self, key: &ServiceKey) -> DbResult<()> {
        let current = self.tables.services.lookup(key)?;
        self.tables.services.delete(key)?;
        self.indices.release(current.index);

        if current.dest_count > 0 {
            error!(
                dests = current.dest_count,
                "Service deleted with destinations still bound, leaving them in place"
            );
        } else {
            info!(index = current.index, "Service deleted");
        }
        Ok(())
    }

    /// Adds a destination, or updates it in place if it already exists.
    #[instrument(skip(self, dest), fields(dest = %dest.addr, port = dest.port))]
    pub fn apply_new_dest(&mut self, service: &ServiceKey, dest: &DestRecord) -> DbResult<()> {
        let svc = self.tables.services.lookup(service)?;
        let key = dest_key(service, dest.addr, dest.port);

        match self.tables.dests.lookup(&key) {
            Ok(_) => {
                debug!("Destination exists, updating in place");
                self.tables.dests.insert(key, dest_info(dest))
            }
            Err(DbError::NotFound) => {
                self.tables.dests.insert(key, dest_info(dest))?;
                let updated = ServiceInfo {
                    dest_count: svc.dest_count + 1,
                    ..svc
                };
                self.tables.services.modify(service, updated)?;
                info!(weight = dest.weight, "Destination added");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Updates an existing destination; reported counters are kept.
    #[instrument(skip(self, dest), fields(dest = %dest.addr, port = dest.port))]
    pub fn apply_modify_dest(&mut self, service: &ServiceKey, dest: &DestRecord) -> DbResult<()> {
        let key = dest_key(service, dest.addr, dest.port);
        let current = self.tables.dests.lookup(&key)?;
        let updated = DestInfo {
            active_conns: current.active_conns,
            inactive_conns: current.inactive_conns,
            persist_conns: current.persist_conns,
            ..dest_info(dest)
        };
        self.tables.dests.modify(&key, updated)?;
        debug!(weight = dest.weight, "Destination modified");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn apply_delete_dest(&mut self, service: &ServiceKey, dest: &DestIdentity) -> DbResult<()> {
        let key = dest_key(service, dest.addr, dest.port);
        self.tables.dests.delete(&key)?;

        match self.tables.services.lookup(service) {
            Ok(svc) => {
                let updated = ServiceInfo {
                    dest_count: svc.dest_count.saturating_sub(1),
                    ..svc
                };
                self.tables.services.modify(service, updated)?;
            }
            Err(DbError::NotFound) => {
                warn!("Deleted destination of an unknown service");
            }
            Err(e) => return Err(e),
        }
        info!("Destination deleted");
        Ok(())
    }

    /// Clears every service and destination.
    #[instrument(skip(self))]
    pub fn apply_flush(&mut self) -> DbResult<()> {
        let result = self.tables.clear_registry();
        self.indices.reset();
        match &result {
            Ok(()) => info!("Registry flushed"),
            Err(e) => error!(error = %e, "Registry flush failed"),
        }
        result
    }

    /// Records that a state sync daemon started on this node.
    #[instrument(skip(self))]
    pub fn apply_new_daemon(
        &mut self,
        state: DaemonState,
        sync_id: u8,
        source_ip: Option<Ipv4Addr>,
    ) -> DbResult<()> {
        let mut app = match self.tables.app_info() {
            Ok(app) => app,
            Err(DbError::NotFound) => Default::default(),
            Err(e) => return Err(e),
        };

        match state {
            DaemonState::Master => {
                app.master_bit = true;
                app.m_sync_id = sync_id;
            }
            DaemonState::Backup => {
                app.backup_bit = true;
                app.b_sync_id = sync_id;
            }
        }
        if source_ip.is_some() {
            app.source_ip = source_ip;
        }

        self.tables.app_info.insert(APP_INFO_KEY, app)?;
        info!("State sync daemon started");
        Ok(())
    }

    /// Records that a state sync daemon stopped.
    #[instrument(skip(self))]
    pub fn apply_del_daemon(&mut self, state: DaemonState) -> DbResult<()> {
        let mut app = self.tables.app_info()?;
        match state {
            DaemonState::Master => {
                app.master_bit = false;
                app.m_sync_id = 0;
            }
            DaemonState::Backup => {
                app.backup_bit = false;
                app.b_sync_id = 0;
            }
        }
        self.tables.app_info.modify(&APP_INFO_KEY, app)?;
        info!("State sync daemon stopped");
        Ok(())
    }

    fn dispatch(&mut self, event: &ControlEvent) -> DbResult<()> {
        match event {
            ControlEvent::NewService(svc) => self.apply_new_service(svc),
            ControlEvent::ModifyService(svc) => self.apply_modify_service(svc),
            ControlEvent::DeleteService(key) => self.apply_delete_service(key),
            ControlEvent::NewDest(svc, dest) => self.apply_new_dest(svc, dest),
            ControlEvent::ModifyDest(svc, dest) => self.apply_modify_dest(svc, dest),
            ControlEvent::DeleteDest(svc, dest) => self.apply_delete_dest(svc, dest),
            ControlEvent::Flush => self.apply_flush(),
            ControlEvent::NewDaemon {
                state,
                sync_id,
                source_ip,
            } => self.apply_new_daemon(*state, *sync_id, *source_ip),
            ControlEvent::DeleteDaemon(state) => self.apply_del_daemon(*state),
        }
    }

    /// Decodes, applies and classifies one incremental event.
    pub fn handle_event(&mut self, raw: &RawEvent, exit: &ExitController) -> EventOutcome {
        let cmd = raw.cmd.as_str();
        let event = match decode_event(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(cmd, error = %e, "Skipping invalid control event");
                self.stats.skipped += 1;
                return EventOutcome::Skipped;
            }
        };

        let result = self.dispatch(&event);
        match result {
            Ok(()) => {
                self.stats.applied += 1;
                EventOutcome::Applied
            }
            // a flush tolerates backend failures but never internal ones
            Err(e) if e.is_internal() || (e.is_fatal() && !matches!(event, ControlEvent::Flush)) => {
                self.stats.failed += 1;
                EventOutcome::Fatal(exit.fatal(format!("{} failed: {}", cmd, e)))
            }
            Err(e) => {
                match &e {
                    DbError::NotFound | DbError::NotSupported(_) => {
                        info!(cmd, status = %e.kind(), error = %e, "Control event not applied")
                    }
                    _ => error!(cmd, status = %e.kind(), error = %e, "Control event failed"),
                }
                self.stats.failed += 1;
                EventOutcome::Failed(e)
            }
        }
    }

    /// Loads the full service and destination dumps.
    ///
    /// Every service is inserted before any destination. Failing to
    /// obtain or parse a dump, or an internal table error, is fatal; other
    /// per-record failures are logged and the bootstrap continues.
    #[instrument(skip_all)]
    pub fn bootstrap(
        &mut self,
        source: &mut dyn ControlSource,
        exit: &ExitController,
    ) -> std::result::Result<BootstrapReport, FatalError> {
        info!("Loading services from control source");
        let mut report = BootstrapReport::default();

        let dumped = source
            .get_all_services()
            .map_err(|e| exit.fatal(format!("failed to dump services: {}", e)))?;

        let mut services = Vec::with_capacity(dumped.len());
        for attrs in &dumped {
            let svc = decode_dump_service(attrs)
                .map_err(|e| exit.fatal(format!("invalid service in dump: {}", e)))?;
            let result = self.apply_new_service(&svc);
            if record_bootstrap(exit, &mut report, result, || format!("adding service {}", svc.key))? {
                report.services += 1;
            }
            services.push(svc.key);
        }

        for key in &services {
            let dests = source
                .get_all_destinations(key)
                .map_err(|e| exit.fatal(format!("failed to dump destinations of {}: {}", key, e)))?;
            for attrs in &dests {
                let dest = decode_dump_dest(attrs).map_err(|e| {
                    exit.fatal(format!("invalid destination of {} in dump: {}", key, e))
                })?;
                let result = self.apply_new_dest(key, &dest);
                if record_bootstrap(exit, &mut report, result, || {
                    format!("adding destination {}:{} to {}", dest.addr, dest.port, key)
                })? {
                    report.dests += 1;
                }
            }
        }

        info!(
            services = report.services,
            dests = report.dests,
            failed = report.failed,
            "Bootstrap complete"
        );
        Ok(report)
    }
}

/// Returns whether the record was applied; fatal errors are escalated.
fn record_bootstrap(
    exit: &ExitController,
    report: &mut BootstrapReport,
    result: DbResult<()>,
    what: impl FnOnce() -> String,
) -> std::result::Result<bool, FatalError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_fatal() => Err(exit.fatal(format!("{}: {}", what(), e))),
        Err(e) => {
            error!(status = %e.kind(), error = %e, "Bootstrap {} failed", what());
            report.failed += 1;
            Ok(false)
        }
    }
}

fn service_info(svc: &ServiceRecord, index: u32, flags: u32, dest_count: u32) -> ServiceInfo {
    ServiceInfo {
        index,
        sched_name: svc.sched_name.clone(),
        pe_name: svc.pe_name.clone(),
        flags,
        timeout: svc.timeout,
        netmask: svc.netmask,
        dest_count,
    }
}

fn dest_key(service: &ServiceKey, addr: Ipv4Addr, port: u16) -> DestKey {
    DestKey {
        service: *service,
        addr,
        port,
    }
}

fn dest_info(dest: &DestRecord) -> DestInfo {
    DestInfo {
        fwd_method: dest.fwd_method,
        weight: dest.weight,
        u_threshold: dest.u_threshold,
        l_threshold: dest.l_threshold,
        active_conns: dest.active_conns,
        inactive_conns: dest.inactive_conns,
        persist_conns: dest.persist_conns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TablesConfig;
    use crate::control::{Command, DestAttrs, ServiceAttrs, AF_INET};
    use lb_common::service_flags::{HASHED, PERSISTENT};
    use lb_common::{FlagUpdate, FwdMethod, Protocol};
    use pretty_assertions::assert_eq;

    fn registry() -> RegistrySync {
        let tables = Arc::new(Tables::prepare(&TablesConfig {
            max_services: 2,
            max_dests: 8,
            max_conns: 8,
        }));
        RegistrySync::new(tables, vec!["rr".to_string(), "wrr".to_string()], 2)
    }

    fn key(port: u16) -> ServiceKey {
        ServiceKey::addr(Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), port)
    }

    fn svc(port: u16, flags: FlagUpdate) -> ServiceRecord {
        ServiceRecord {
            key: key(port),
            sched_name: "rr".to_string(),
            pe_name: String::new(),
            flags,
            timeout: 0,
            netmask: 0xffff_ffff,
        }
    }

    fn dest(last: u8) -> DestRecord {
        DestRecord {
            addr: Ipv4Addr::new(10, 0, 0, last),
            port: 8080,
            fwd_method: FwdMethod::Masq,
            weight: 1,
            u_threshold: 0,
            l_threshold: 0,
            active_conns: 0,
            inactive_conns: 0,
            persist_conns: 0,
        }
    }

    #[test]
    fn test_index_allocator_reuses_released() {
        let mut alloc = IndexAllocator::new(2);
        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), None);
        alloc.release(0);
        alloc.release(0);
        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn test_new_service_is_idempotent() {
        let mut reg = registry();
        reg.apply_new_service(&svc(80, FlagUpdate::full(HASHED))).unwrap();
        reg.apply_new_service(&svc(80, FlagUpdate::full(HASHED))).unwrap();

        let info = reg.tables().services.lookup(&key(80)).unwrap();
        assert_eq!(info.index, 0);
        assert_eq!(info.flags, HASHED);
        assert_eq!(reg.tables().services.len(), 1);
    }

    #[test]
    fn test_modify_preserves_unmasked_flags() {
        let mut reg = registry();
        reg.apply_new_service(&svc(80, FlagUpdate::full(HASHED))).unwrap();
        reg.apply_new_dest(&key(80), &dest(2)).unwrap();

        let update = svc(80, FlagUpdate::new(PERSISTENT, PERSISTENT));
        reg.apply_modify_service(&update).unwrap();
        reg.apply_modify_service(&update).unwrap();

        let info = reg.tables().services.lookup(&key(80)).unwrap();
        assert_eq!(info.flags, PERSISTENT | HASHED);
        assert_eq!(info.dest_count, 1);
        assert_eq!(info.sched_name, "rr");
    }

    #[test]
    fn test_modify_unknown_service_not_found() {
        let mut reg = registry();
        assert_eq!(
            reg.apply_modify_service(&svc(81, FlagUpdate::default())),
            Err(DbError::NotFound)
        );
    }

    #[test]
    fn test_unsupported_scheduler() {
        let mut reg = registry();
        let mut lc = svc(80, FlagUpdate::default());
        lc.sched_name = "lc".to_string();
        assert!(matches!(
            reg.apply_new_service(&lc),
            Err(DbError::NotSupported(_))
        ));
        assert!(reg.tables().services.is_empty());
    }

    #[test]
    fn test_service_index_exhaustion_is_backend_error() {
        let mut reg = registry();
        reg.apply_new_service(&svc(80, FlagUpdate::default())).unwrap();
        reg.apply_new_service(&svc(81, FlagUpdate::default())).unwrap();
        let err = reg.apply_new_service(&svc(82, FlagUpdate::default())).unwrap_err();
        assert!(matches!(err, DbError::Backend(_)));
        assert!(!err.is_fatal());

        reg.apply_delete_service(&key(80)).unwrap();
        reg.apply_new_service(&svc(82, FlagUpdate::default())).unwrap();
        assert_eq!(reg.tables().services.lookup(&key(82)).unwrap().index, 0);
    }

    #[test]
    fn test_dest_count_tracking() {
        let mut reg = registry();
        reg.apply_new_service(&svc(80, FlagUpdate::default())).unwrap();
        reg.apply_new_dest(&key(80), &dest(2)).unwrap();
        reg.apply_new_dest(&key(80), &dest(3)).unwrap();
        reg.apply_new_dest(&key(80), &dest(3)).unwrap();
        assert_eq!(reg.tables().services.lookup(&key(80)).unwrap().dest_count, 2);

        let id = DestIdentity {
            addr: Ipv4Addr::new(10, 0, 0, 2),
            port: 8080,
        };
        reg.apply_delete_dest(&key(80), &id).unwrap();
        assert_eq!(reg.tables().services.lookup(&key(80)).unwrap().dest_count, 1);
        assert_eq!(reg.apply_delete_dest(&key(80), &id), Err(DbError::NotFound));
    }

    #[test]
    fn test_dest_of_unknown_service() {
        let mut reg = registry();
        assert_eq!(reg.apply_new_dest(&key(80), &dest(2)), Err(DbError::NotFound));
    }

    #[test]
    fn test_delete_service_leaves_dests() {
        let mut reg = registry();
        reg.apply_new_service(&svc(80, FlagUpdate::default())).unwrap();
        reg.apply_new_dest(&key(80), &dest(2)).unwrap();
        reg.apply_delete_service(&key(80)).unwrap();

        assert!(reg.tables().services.is_empty());
        assert_eq!(reg.tables().dests.len(), 1);
    }

    #[test]
    fn test_flush_clears_registry() {
        let mut reg = registry();
        reg.apply_new_service(&svc(80, FlagUpdate::default())).unwrap();
        reg.apply_new_dest(&key(80), &dest(2)).unwrap();
        reg.apply_flush().unwrap();
        assert!(reg.tables().services.is_empty());
        assert!(reg.tables().dests.is_empty());

        reg.apply_new_service(&svc(81, FlagUpdate::default())).unwrap();
        assert_eq!(reg.tables().services.lookup(&key(81)).unwrap().index, 0);
    }

    #[test]
    fn test_daemon_roles() {
        let mut reg = registry();
        assert_eq!(reg.apply_del_daemon(DaemonState::Master), Err(DbError::NotFound));

        let src = Ipv4Addr::new(10, 0, 0, 254);
        reg.apply_new_daemon(DaemonState::Master, 5, Some(src)).unwrap();
        reg.apply_new_daemon(DaemonState::Backup, 6, None).unwrap();
        let app = reg.tables().app_info().unwrap();
        assert!(app.master_bit && app.backup_bit);
        assert_eq!((app.m_sync_id, app.b_sync_id), (5, 6));
        assert_eq!(app.source_ip, Some(src));

        reg.apply_del_daemon(DaemonState::Master).unwrap();
        let app = reg.tables().app_info().unwrap();
        assert!(!app.master_bit);
        assert!(app.backup_bit);
    }

    #[test]
    fn test_handle_event_outcomes() {
        let mut reg = registry();
        let exit = ExitController::new();

        let invalid = RawEvent::new(Command::NewService).with_service(ServiceAttrs {
            af: Some(AF_INET),
            port: Some(80),
            ..ServiceAttrs::default()
        });
        assert_eq!(reg.handle_event(&invalid, &exit), EventOutcome::Skipped);

        let del = RawEvent::new(Command::DelDest)
            .with_service(ServiceAttrs::identity(&key(80)))
            .with_dest(DestAttrs {
                addr: Some("10.0.0.2".parse().unwrap()),
                port: Some(8080),
                ..DestAttrs::default()
            });
        assert_eq!(
            reg.handle_event(&del, &exit),
            EventOutcome::Failed(DbError::NotFound)
        );

        assert_eq!(
            reg.handle_event(&RawEvent::new(Command::Flush), &exit),
            EventOutcome::Applied
        );

        assert_eq!(
            reg.stats(),
            EventStats {
                applied: 1,
                skipped: 1,
                failed: 1
            }
        );
        assert!(!exit.is_cancelled());
    }
}
