//! Connection aging.
//!
//! The connection table is split into fixed-size scan windows. A periodic
//! trigger hands the engine a monotonically increasing job id; each job
//! scans exactly one window, and `jobs_per_iteration` consecutive jobs
//! make up one sweep over the whole table:
//!
//! ```text
//! window        = job_id % jobs_per_iteration
//! slots         = [window * N, window * N + N)
//! iteration_num = job_id / jobs_per_iteration
//! ```
//!
//! Every occupied slot goes through exactly one branch per visit: forced
//! delete, age-out of a recently active entry, or expiry of an idle one.

use crate::config::AgingConfig;
use crate::metrics::MetricsCollector;
use crate::state_sync::{PeerTransport, SyncAggregator, SyncStats};
use crate::tables::Tables;
use lb_common::{AppInfo, ConnInfo, ConnState, DbError, DbResult, TimeoutClass};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, instrument, trace};

/// Per-state timeout expressed in sweep iterations.
pub trait ConnIterations: Send + Sync {
    /// Number of sweeps an idle connection in `state` survives.
    fn iterations_for(&self, state: ConnState) -> u32;

    /// Timeout in seconds, written into sync records.
    fn timeout_secs(&self, state: ConnState) -> u32;

    /// The iteration stamp at which an idle connection expires.
    fn expected_iteration(&self, iteration_num: u32, state: ConnState) -> u32 {
        expected_iteration(iteration_num, self.iterations_for(state))
    }
}

/// `iteration_num mod iterations`, with zero iterations treated as one.
#[inline]
pub fn expected_iteration(iteration_num: u32, iterations: u32) -> u32 {
    iteration_num % iterations.max(1)
}

/// Iteration counts derived from the configured timeouts.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutIterations {
    iteration_secs: u64,
    tcp_secs: u64,
    tcp_fin_secs: u64,
    udp_secs: u64,
}

impl TimeoutIterations {
    pub fn from_config(config: &AgingConfig) -> Self {
        Self {
            iteration_secs: config.iteration_secs.max(1),
            tcp_secs: config.tcp_timeout_secs,
            tcp_fin_secs: config.tcp_fin_timeout_secs,
            udp_secs: config.udp_timeout_secs,
        }
    }

    fn class_secs(&self, state: ConnState) -> u64 {
        match state.timeout_class() {
            TimeoutClass::Tcp => self.tcp_secs,
            TimeoutClass::TcpFin => self.tcp_fin_secs,
            TimeoutClass::Udp => self.udp_secs,
        }
    }
}

impl ConnIterations for TimeoutIterations {
    fn iterations_for(&self, state: ConnState) -> u32 {
        let iterations = self.class_secs(state).div_ceil(self.iteration_secs).max(1);
        u32::try_from(iterations).unwrap_or(u32::MAX)
    }

    fn timeout_secs(&self, state: ConnState) -> u32 {
        u32::try_from(self.class_secs(state)).unwrap_or(u32::MAX)
    }
}

/// Age-out step for a connection that saw traffic since the last visit.
///
/// `Ok` means the connection is still active and should be replicated.
pub trait AgeOut: Send + Sync {
    fn age_out(&self, index: u32, conn: &ConnInfo, iteration_num: u32) -> DbResult<()>;
}

/// Clears the aging bit and stamps the iteration at which the entry
/// expires if it stays idle.
pub struct RefreshAgeOut {
    tables: Arc<Tables>,
    iterations: Arc<dyn ConnIterations>,
}

impl RefreshAgeOut {
    pub fn new(tables: Arc<Tables>, iterations: Arc<dyn ConnIterations>) -> Self {
        Self { tables, iterations }
    }
}

impl AgeOut for RefreshAgeOut {
    fn age_out(&self, index: u32, conn: &ConnInfo, iteration_num: u32) -> DbResult<()> {
        let refreshed = ConnInfo {
            aging_bit: false,
            age_iteration: self.iterations.expected_iteration(iteration_num, conn.conn_state),
            ..conn.clone()
        };
        self.tables.conn_info.modify(&index, refreshed)
    }
}

/// Source of this node's state sync role.
pub trait AppInfoLookup: Send + Sync {
    fn app_info(&self) -> DbResult<AppInfo>;
}

impl AppInfoLookup for Tables {
    fn app_info(&self) -> DbResult<AppInfo> {
        Tables::app_info(self)
    }
}

/// Outcome of one aging job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub job_id: u64,
    pub iteration_num: u32,
    pub first_slot: u32,
    /// Occupied slots visited
    pub visited: u32,
    /// Removed because the delete bit was set
    pub deleted_forced: u32,
    /// Aged out and still active
    pub aged_out: u32,
    /// Removed because the idle timeout elapsed
    pub expired: u32,
    /// Table operations that failed
    pub errors: u32,
    pub sync: SyncStats,
}

/// Scans connection windows and reclaims expired entries.
pub struct AgingEngine {
    tables: Arc<Tables>,
    app_info: Arc<dyn AppInfoLookup>,
    age_out: Arc<dyn AgeOut>,
    iterations: Arc<dyn ConnIterations>,
    transport: Arc<dyn PeerTransport>,
    scan_entries_per_job: u32,
    jobs_per_iteration: u32,
    max_frame_size: usize,
    metrics: Option<MetricsCollector>,
}

impl AgingEngine {
    /// Builds an engine with the default collaborators: timeout-based
    /// iterations, refresh-style age-out and the tables' app info record.
    pub fn new(
        tables: Arc<Tables>,
        config: &AgingConfig,
        transport: Arc<dyn PeerTransport>,
        max_frame_size: usize,
    ) -> Self {
        let iterations: Arc<dyn ConnIterations> = Arc::new(TimeoutIterations::from_config(config));
        let age_out = Arc::new(RefreshAgeOut::new(tables.clone(), iterations.clone()));
        Self::with_collaborators(
            tables.clone(),
            config,
            tables,
            age_out,
            iterations,
            transport,
            max_frame_size,
        )
    }

    pub fn with_collaborators(
        tables: Arc<Tables>,
        config: &AgingConfig,
        app_info: Arc<dyn AppInfoLookup>,
        age_out: Arc<dyn AgeOut>,
        iterations: Arc<dyn ConnIterations>,
        transport: Arc<dyn PeerTransport>,
        max_frame_size: usize,
    ) -> Self {
        let jobs_per_iteration = config.jobs_per_iteration(tables.max_conns() as usize);
        Self {
            tables,
            app_info,
            age_out,
            iterations,
            transport,
            scan_entries_per_job: config.scan_entries_per_job.max(1),
            jobs_per_iteration,
            max_frame_size,
            metrics: None,
        }
    }

    /// Records every sweep into `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn jobs_per_iteration(&self) -> u32 {
        self.jobs_per_iteration
    }

    pub fn scan_entries_per_job(&self) -> u32 {
        self.scan_entries_per_job
    }

    /// Slot range scanned by `job_id`, clipped to the table size.
    pub fn window(&self, job_id: u64) -> std::ops::Range<u32> {
        let window = (job_id % u64::from(self.jobs_per_iteration)) as u32;
        let start = window.saturating_mul(self.scan_entries_per_job);
        let end = start
            .saturating_add(self.scan_entries_per_job)
            .min(self.tables.max_conns());
        start.min(end)..end
    }

    /// Sweep iteration that `job_id` belongs to.
    pub fn iteration_num(&self, job_id: u64) -> u32 {
        (job_id / u64::from(self.jobs_per_iteration)) as u32
    }

    /// Returns the sync source and id when this node is the current master.
    fn sync_role(&self) -> Option<(Ipv4Addr, u8)> {
        match self.app_info.app_info() {
            Ok(info) if info.master_bit => Some((
                info.source_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
                info.m_sync_id,
            )),
            Ok(_) | Err(DbError::NotFound) => None,
            Err(e) => {
                debug!(error = %e, "Application info lookup failed, sync not needed");
                None
            }
        }
    }

    /// Handles one aging trigger.
    #[instrument(skip(self))]
    pub fn handle_aging_event(&self, job_id: u64) -> SweepReport {
        let iteration_num = self.iteration_num(job_id);
        let slots = self.window(job_id);
        let mut report = SweepReport {
            job_id,
            iteration_num,
            first_slot: slots.start,
            ..SweepReport::default()
        };

        let mut aggregator = SyncAggregator::new(self.transport.clone(), self.max_frame_size);
        if let Some((source_ip, sync_id)) = self.sync_role() {
            aggregator.reset_for_sweep(source_ip, sync_id);
        }

        for index in slots {
            let conn = match self.tables.conn_info.lookup(&index) {
                Ok(conn) => conn,
                Err(DbError::NotFound) => continue,
                Err(e) => {
                    error!(index, error = %e, "Connection lookup failed");
                    report.errors += 1;
                    continue;
                }
            };
            report.visited += 1;

            if conn.delete_bit {
                debug!(index, conn = %conn.key, "(Aging delete_bit) deleting connection");
                if self.delete(index, &conn) {
                    report.deleted_forced += 1;
                } else {
                    report.errors += 1;
                }
                continue;
            }

            if conn.aging_bit {
                trace!(index, conn = %conn.key, "(Aging aging_bit=1) aging connection");
                match self.age_out.age_out(index, &conn, iteration_num) {
                    Ok(()) => {
                        report.aged_out += 1;
                        aggregator.aggregate(&conn, self.iterations.timeout_secs(conn.conn_state));
                    }
                    Err(DbError::NotFound) => {
                        trace!(index, "Connection removed concurrently");
                    }
                    Err(e) => {
                        error!(index, error = %e, "Connection age-out failed");
                        report.errors += 1;
                    }
                }
                continue;
            }

            if conn.age_iteration == self.iterations.expected_iteration(iteration_num, conn.conn_state) {
                debug!(index, conn = %conn.key, "(Aging aging_bit=0) deleting connection");
                if self.delete(index, &conn) {
                    report.expired += 1;
                } else {
                    report.errors += 1;
                }
            }
        }

        report.sync = aggregator.finish_sweep();
        if report.visited > 0 {
            debug!(
                visited = report.visited,
                deleted = report.deleted_forced + report.expired,
                synced = report.sync.conn_count,
                "Aging job done"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_sweep(&report);
        }
        report
    }

    fn delete(&self, index: u32, conn: &ConnInfo) -> bool {
        match self.tables.delete_conn(index, &conn.key) {
            Ok(()) | Err(DbError::NotFound) => true,
            Err(e) => {
                error!(index, conn = %conn.key, error = %e, "Failed to delete connection");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TablesConfig;
    use parking_lot::Mutex;
    use std::io;

    #[derive(Default)]
    struct Capture {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl PeerTransport for Capture {
        fn send_frame(&self, _source_ip: Ipv4Addr, frame: &[u8]) -> io::Result<()> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn aging(scan: u32) -> AgingConfig {
        AgingConfig {
            scan_entries_per_job: scan,
            iteration_secs: 10,
            tcp_timeout_secs: 900,
            tcp_fin_timeout_secs: 120,
            udp_timeout_secs: 300,
        }
    }

    fn tables(max_conns: usize) -> Arc<Tables> {
        Arc::new(Tables::prepare(&TablesConfig {
            max_services: 4,
            max_dests: 4,
            max_conns,
        }))
    }

    #[test]
    fn test_timeout_iterations() {
        let it = TimeoutIterations::from_config(&aging(4));
        assert_eq!(it.iterations_for(ConnState::Established), 90);
        assert_eq!(it.iterations_for(ConnState::TimeWait), 12);
        assert_eq!(it.iterations_for(ConnState::Udp), 30);
        assert_eq!(it.timeout_secs(ConnState::Udp), 300);

        let odd = TimeoutIterations::from_config(&AgingConfig {
            iteration_secs: 16,
            ..aging(4)
        });
        assert_eq!(odd.iterations_for(ConnState::TimeWait), 8);
        assert_eq!(odd.iterations_for(ConnState::Established), 57);
    }

    #[test]
    fn test_expected_iteration_wraps() {
        assert_eq!(expected_iteration(3, 90), 3);
        assert_eq!(expected_iteration(93, 90), 3);
        assert_eq!(expected_iteration(5, 0), 0);
    }

    #[test]
    fn test_window_clipped_to_table() {
        let engine = AgingEngine::new(tables(10), &aging(4), Arc::new(Capture::default()), 1472);
        assert_eq!(engine.jobs_per_iteration(), 3);
        assert_eq!(engine.window(0), 0..4);
        assert_eq!(engine.window(1), 4..8);
        assert_eq!(engine.window(2), 8..10);
        assert_eq!(engine.window(3), 0..4);
        assert_eq!(engine.iteration_num(2), 0);
        assert_eq!(engine.iteration_num(3), 1);
    }

    #[test]
    fn test_empty_window() {
        let engine = AgingEngine::new(tables(8), &aging(4), Arc::new(Capture::default()), 1472);
        let report = engine.handle_aging_event(1);
        assert_eq!(report.visited, 0);
        assert_eq!(report.first_slot, 4);
        assert_eq!(report.sync.amount_buffers, 0);
    }
}
