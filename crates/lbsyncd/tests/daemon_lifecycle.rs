//! Daemon lifecycle tests: bootstrap, control loop, fatal shutdown and the
//! aging timer.

use lb_common::DbError;
use lb_testkit::{
    faulty_tables, flush_event, master_daemon_event, small_tables, ConnFixture, DestFixture,
    RecordingTransport, ScriptedControlSource, ServiceFixture, StoreOp,
};
use lbsyncd::config::AgingConfig;
use lbsyncd::{
    spawn_aging_timer, AgingEngine, Daemon, ExitController, LbsyncConfig, LbsyncError,
    MetricsCollector,
};
use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

fn config() -> LbsyncConfig {
    let mut config = LbsyncConfig::default();
    config.control.recv_timeout_ms = 10;
    config
}

fn web() -> ServiceFixture {
    ServiceFixture::tcp(Ipv4Addr::new(10, 0, 0, 1), 80)
}

#[test]
fn test_bootstrap_then_events_then_teardown() {
    let exit = ExitController::new();
    let backend = DestFixture::new(Ipv4Addr::new(10, 0, 0, 2), 8080);
    let api = ServiceFixture::tcp(Ipv4Addr::new(10, 0, 0, 1), 443);

    let source = ScriptedControlSource::new()
        .with_service(web().attrs())
        .with_dest(web().key(), backend.dump_attrs())
        .with_events([
            api.new_event(),
            backend.new_event(&api),
            master_daemon_event(3, Ipv4Addr::new(10, 1, 1, 1)),
        ])
        .shutdown_when_drained(exit.clone());
    let probe = source.probe();

    let tables = small_tables(16);
    let mut daemon = Daemon::new(&config(), tables.clone(), Box::new(source), exit.clone());

    let report = daemon.bootstrap().unwrap();
    assert_eq!(report.services, 1);
    assert_eq!(report.dests, 1);

    daemon.run_control_loop().unwrap();
    assert_eq!(probe.delivered(), 3);
    assert_eq!(daemon.registry().stats().applied, 3);
    assert_eq!(tables.services.len(), 2);
    assert_eq!(tables.dests.len(), 2);
    let app = tables.app_info().unwrap();
    assert!(app.master_bit);
    assert_eq!(app.m_sync_id, 3);

    daemon.teardown();
    assert!(probe.unregistered());
    assert!(tables.services.is_empty());
    assert!(tables.dests.is_empty());
    assert_eq!(tables.app_info(), Err(DbError::NotFound));
    assert!(exit.fatal_reason().is_none());

    // second teardown is a no-op
    daemon.teardown();
}

#[test]
fn test_fatal_event_stops_control_loop() {
    let (tables, faults) = faulty_tables(16);
    faults
        .services
        .fail_always(StoreOp::Insert, DbError::internal("service table corrupted"));

    let exit = ExitController::new();
    let source = ScriptedControlSource::new().with_events([
        web().new_event(),
        flush_event(),
        ServiceFixture::fwmark(5).new_event(),
    ]);
    let probe = source.probe();

    let mut daemon = Daemon::new(&config(), tables, Box::new(source), exit.clone());
    daemon.bootstrap().unwrap();

    let err = daemon.run_control_loop().unwrap_err();
    assert!(matches!(err, LbsyncError::Fatal(_)));
    assert_eq!(probe.delivered(), 1);
    assert_eq!(exit.fatal_count(), 1);
    assert!(exit.is_cancelled());
}

#[test]
fn test_control_loop_records_event_metrics() {
    let (tables, faults) = faulty_tables(16);
    faults
        .dests
        .fail_once(StoreOp::Insert, DbError::backend("dest insert timed out"));
    let backend = DestFixture::new(Ipv4Addr::new(10, 0, 0, 2), 8080);

    let exit = ExitController::new();
    let source = ScriptedControlSource::new()
        .with_events([
            web().new_event(),
            backend.new_event(&web()),
            flush_event(),
        ])
        .shutdown_when_drained(exit.clone());

    let metrics = MetricsCollector::new().unwrap();
    let mut daemon = Daemon::new(&config(), tables, Box::new(source), exit.clone())
        .with_metrics(metrics.clone());
    daemon.bootstrap().unwrap();
    daemon.run_control_loop().unwrap();

    let stats = daemon.registry().stats();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(metrics.events_applied_total.get(), 2.0);
    assert_eq!(metrics.events_failed_total.get(), 1.0);
    assert_eq!(metrics.events_skipped_total.get(), 0.0);
    assert_eq!(metrics.fatal_events_total.get(), 0.0);
}

#[test]
fn test_run_returns_bootstrap_failure_after_teardown() {
    let exit = ExitController::new();
    let source = ScriptedControlSource::new().failing_service_dump();
    let probe = source.probe();

    let daemon = Daemon::new(&config(), small_tables(16), Box::new(source), exit.clone());
    let err = daemon.run().unwrap_err();

    assert!(matches!(err, LbsyncError::Fatal(_)));
    assert!(probe.unregistered());
    assert!(exit.fatal_reason().unwrap().contains("failed to dump services"));
}

#[test]
fn test_run_clean_shutdown() {
    let exit = ExitController::new();
    let source = ScriptedControlSource::new()
        .with_event(web().new_event())
        .shutdown_when_drained(exit.clone());
    let probe = source.probe();
    let tables = small_tables(16);

    let daemon = Daemon::new(&config(), tables.clone(), Box::new(source), exit.clone());
    daemon.run().unwrap();

    assert_eq!(probe.delivered(), 1);
    assert!(probe.unregistered());
    assert!(tables.services.is_empty());
    assert_eq!(exit.fatal_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_aging_timer_runs_until_cancelled() {
    let tables = small_tables(8);
    tables
        .insert_conn(0, ConnFixture::tcp(1000).doomed().build())
        .unwrap();
    tables
        .insert_conn(6, ConnFixture::tcp(1006).doomed().build())
        .unwrap();

    let aging = AgingConfig {
        scan_entries_per_job: 4,
        ..AgingConfig::default()
    };
    let engine = Arc::new(AgingEngine::new(
        tables.clone(),
        &aging,
        RecordingTransport::new(),
        1472,
    ));
    assert_eq!(engine.jobs_per_iteration(), 2);

    let exit = ExitController::new();
    let handle = spawn_aging_timer(engine, Duration::from_millis(10), exit.token());

    tokio::time::sleep(Duration::from_millis(25)).await;
    exit.shutdown();
    let jobs = handle.await.unwrap();

    // both windows were visited
    assert!(jobs >= 2);
    assert!(tables.conn_info.is_empty());
}
