//! Daemon supervisor
//!
//! Owns the control loop: bootstrap from the control source, then apply
//! incremental events until cancellation, then tear down. The aging timer
//! runs as a separate tokio task sharing the same tables and token.

use crate::aging::{AgingEngine, SweepReport};
use crate::config::LbsyncConfig;
use crate::control::ControlSource;
use crate::error::{LbsyncError, Result};
use crate::exit::ExitController;
use crate::metrics::MetricsCollector;
use crate::registry::{BootstrapReport, EventOutcome, RegistrySync};
use crate::tables::Tables;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub struct Daemon {
    registry: RegistrySync,
    source: Box<dyn ControlSource>,
    exit: ExitController,
    recv_timeout: Duration,
    metrics: Option<MetricsCollector>,
    torn_down: bool,
}

impl Daemon {
    pub fn new(
        config: &LbsyncConfig,
        tables: Arc<Tables>,
        source: Box<dyn ControlSource>,
        exit: ExitController,
    ) -> Self {
        let registry = RegistrySync::new(
            tables,
            config.registry.supported_schedulers.clone(),
            config.tables.max_services,
        );
        Self {
            registry,
            source,
            exit,
            recv_timeout: config.control.recv_timeout(),
            metrics: None,
            torn_down: false,
        }
    }

    /// Records every control event outcome into `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &RegistrySync {
        &self.registry
    }

    pub fn exit(&self) -> &ExitController {
        &self.exit
    }

    /// Loads the initial configuration. Any failure here is fatal.
    pub fn bootstrap(&mut self) -> Result<BootstrapReport> {
        let report = self.registry.bootstrap(self.source.as_mut(), &self.exit)?;
        Ok(report)
    }

    /// Receives and applies events until cancellation.
    ///
    /// Cancellation is checked once per iteration; the receive timeout
    /// bounds how long that takes without traffic. Returns the fatal
    /// error if one stopped the loop.
    #[instrument(skip(self))]
    pub fn run_control_loop(&mut self) -> Result<()> {
        info!("Listening to control events");

        while !self.exit.is_cancelled() {
            let raw = match self.source.recv_event(self.recv_timeout) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to receive control event");
                    continue;
                }
            };

            debug!(cmd = raw.cmd.as_str(), "Received control event");
            let outcome = self.registry.handle_event(&raw, &self.exit);
            if let Some(metrics) = &self.metrics {
                metrics.record_event(&outcome);
            }
            if let EventOutcome::Fatal(e) = outcome {
                return Err(e.into());
            }
        }

        info!("Control loop cancelled");
        Ok(())
    }

    /// Releases the control source registration and clears every table.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.source.unregister();
        if let Err(e) = self.registry.tables().destroy() {
            error!(error = %e, "Failed to clear tables during teardown");
        }
        info!("Daemon torn down");
    }

    /// Bootstrap, control loop and teardown.
    ///
    /// Teardown always runs; the first fatal error, if any, is returned.
    pub fn run(mut self) -> Result<()> {
        let result = self.bootstrap().and_then(|_| self.run_control_loop());

        // make sure the aging timer stops before the tables go away
        self.exit.shutdown();
        self.teardown();

        match (result, self.exit.fatal_reason()) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(reason)) => Err(LbsyncError::Fatal(crate::exit::FatalError::new(reason))),
            (Ok(()), None) => Ok(()),
        }
    }
}

/// Issues aging job ids on a fixed period until `token` is cancelled.
///
/// Job ids start at zero and increase by one per tick, so a full sweep
/// takes `jobs_per_iteration` ticks. Returns the number of jobs run.
pub fn spawn_aging_timer(
    engine: Arc<AgingEngine>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut job_id: u64 = 0;

        info!(
            period_ms = period.as_millis() as u64,
            jobs_per_iteration = engine.jobs_per_iteration(),
            "Aging timer started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let report: SweepReport = engine.handle_aging_event(job_id);
                    if report.errors > 0 {
                        warn!(job_id, errors = report.errors, "Aging job had failures");
                    }
                    job_id += 1;
                }
            }
        }

        info!(jobs = job_id, "Aging timer stopped");
        job_id
    })
}
