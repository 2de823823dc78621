//! Prometheus metrics collection for lbsyncd
//!
//! Counters for control events, aging sweeps and state sync frames. The
//! registry is rendered in the text exposition format on demand.

use crate::aging::SweepReport;
use crate::registry::EventOutcome;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics shared by the control loop and the aging timer.
#[derive(Clone)]
pub struct MetricsCollector {
    // Control events
    pub events_applied_total: Counter,
    pub events_skipped_total: Counter,
    pub events_failed_total: Counter,
    pub fatal_events_total: Counter,

    // Aging
    pub aging_jobs_total: Counter,
    pub conns_deleted_forced_total: Counter,
    pub conns_aged_out_total: Counter,
    pub conns_expired_total: Counter,
    pub aging_errors_total: Counter,

    // State sync
    pub sync_conns_total: Counter,
    pub sync_frames_total: Counter,
    pub sync_send_failures_total: Counter,

    /// Last aging iteration that ran
    pub aging_iteration: Gauge,

    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    let counter = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_applied_total = counter(
            &registry,
            "lbsyncd_events_applied_total",
            "Total number of control events applied",
        )?;
        let events_skipped_total = counter(
            &registry,
            "lbsyncd_events_skipped_total",
            "Total number of control events dropped by validation",
        )?;
        let events_failed_total = counter(
            &registry,
            "lbsyncd_events_failed_total",
            "Total number of control events that failed with a table error",
        )?;
        let fatal_events_total = counter(
            &registry,
            "lbsyncd_fatal_events_total",
            "Total number of control events that stopped the daemon",
        )?;

        let aging_jobs_total = counter(
            &registry,
            "lbsyncd_aging_jobs_total",
            "Total number of aging jobs run",
        )?;
        let conns_deleted_forced_total = counter(
            &registry,
            "lbsyncd_conns_deleted_forced_total",
            "Total number of connections removed because of the delete bit",
        )?;
        let conns_aged_out_total = counter(
            &registry,
            "lbsyncd_conns_aged_out_total",
            "Total number of active connections aged out",
        )?;
        let conns_expired_total = counter(
            &registry,
            "lbsyncd_conns_expired_total",
            "Total number of idle connections removed",
        )?;
        let aging_errors_total = counter(
            &registry,
            "lbsyncd_aging_errors_total",
            "Total number of failed table operations during aging",
        )?;

        let sync_conns_total = counter(
            &registry,
            "lbsyncd_sync_conns_total",
            "Total number of connections packed into sync frames",
        )?;
        let sync_frames_total = counter(
            &registry,
            "lbsyncd_sync_frames_total",
            "Total number of sync frames handed to the transport",
        )?;
        let sync_send_failures_total = counter(
            &registry,
            "lbsyncd_sync_send_failures_total",
            "Total number of sync frames the transport rejected",
        )?;

        let aging_iteration = Gauge::with_opts(Opts::new(
            "lbsyncd_aging_iteration",
            "Iteration number of the last aging job",
        ))?;
        registry.register(Box::new(aging_iteration.clone()))?;

        Ok(Self {
            events_applied_total,
            events_skipped_total,
            events_failed_total,
            fatal_events_total,
            aging_jobs_total,
            conns_deleted_forced_total,
            conns_aged_out_total,
            conns_expired_total,
            aging_errors_total,
            sync_conns_total,
            sync_frames_total,
            sync_send_failures_total,
            aging_iteration,
            registry: Arc::new(registry),
        })
    }

    /// Record the outcome of one control event
    pub fn record_event(&self, outcome: &EventOutcome) {
        match outcome {
            EventOutcome::Applied => self.events_applied_total.inc(),
            EventOutcome::Skipped => self.events_skipped_total.inc(),
            EventOutcome::Failed(_) => self.events_failed_total.inc(),
            EventOutcome::Fatal(_) => self.fatal_events_total.inc(),
        }
    }

    /// Record one aging job and the frames it sent
    pub fn record_sweep(&self, report: &SweepReport) {
        self.aging_jobs_total.inc();
        self.aging_iteration.set(f64::from(report.iteration_num));
        self.conns_deleted_forced_total
            .inc_by(f64::from(report.deleted_forced));
        self.conns_aged_out_total.inc_by(f64::from(report.aged_out));
        self.conns_expired_total.inc_by(f64::from(report.expired));
        self.aging_errors_total.inc_by(f64::from(report.errors));
        self.sync_conns_total.inc_by(f64::from(report.sync.conn_count));
        self.sync_frames_total
            .inc_by(f64::from(report.sync.amount_buffers));
        self.sync_send_failures_total
            .inc_by(f64::from(report.sync.send_failures));
    }

    /// Render every registered metric in the text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
