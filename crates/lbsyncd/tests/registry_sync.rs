//! Registry sync integration tests: bootstrap, incremental events and the
//! fatal-error policy.

use lb_common::service_flags::{HASHED, ONEPACKET, PERSISTENT};
use lb_common::{DbError, DestKey, ServiceKey};
use lb_testkit::{
    faulty_tables, flush_event, small_tables, DestFixture, ScriptedControlSource, ServiceFixture,
    StoreOp,
};
use lbsyncd::{EventOutcome, ExitController, RegistrySync, Tables};
use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use std::sync::Arc;

fn registry(tables: Arc<Tables>) -> RegistrySync {
    RegistrySync::new(
        tables,
        vec!["rr".to_string(), "wrr".to_string(), "sh".to_string()],
        16,
    )
}

fn web() -> ServiceFixture {
    ServiceFixture::tcp(Ipv4Addr::new(10, 0, 0, 1), 80)
}

fn dns() -> ServiceFixture {
    ServiceFixture::udp(Ipv4Addr::new(10, 0, 0, 1), 53)
}

fn backend(last: u8) -> DestFixture {
    DestFixture::new(Ipv4Addr::new(10, 0, 0, last), 8080)
}

fn dest_key(service: &ServiceFixture, dest: &DestFixture) -> DestKey {
    let attrs = dest.identity();
    let addr = match attrs.addr {
        Some(std::net::IpAddr::V4(v4)) => v4,
        other => panic!("unexpected address {:?}", other),
    };
    DestKey {
        service: service.key(),
        addr,
        port: attrs.port.unwrap(),
    }
}

#[test]
fn test_bootstrap_loads_every_service_and_destination() {
    let mark = ServiceFixture::fwmark(7).sched("wrr");
    let mut source = ScriptedControlSource::new()
        .with_service(web().attrs())
        .with_service(mark.attrs())
        .with_service(dns().attrs())
        .with_dest(web().key(), backend(2).dump_attrs())
        .with_dest(web().key(), backend(3).active_conns(12).dump_attrs())
        .with_dest(mark.key(), backend(4).dump_attrs());
    let probe = source.probe();

    let tables = small_tables(64);
    let mut reg = registry(tables.clone());
    let exit = ExitController::new();
    let report = reg.bootstrap(&mut source, &exit).unwrap();

    assert_eq!(report.services, 3);
    assert_eq!(report.dests, 3);
    assert_eq!(report.failed, 0);
    assert!(!exit.is_cancelled());

    // every service is inserted before any destination dump is requested
    assert_eq!(probe.dest_dumps(), vec![web().key(), mark.key(), dns().key()]);

    assert_eq!(tables.services.len(), 3);
    assert_eq!(tables.dests.len(), 3);
    assert_eq!(tables.services.lookup(&web().key()).unwrap().dest_count, 2);
    assert_eq!(tables.services.lookup(&mark.key()).unwrap().dest_count, 1);
    assert_eq!(tables.services.lookup(&dns().key()).unwrap().dest_count, 0);
    assert_eq!(tables.services.lookup(&mark.key()).unwrap().sched_name, "wrr");

    let counters = tables.dests.lookup(&dest_key(&web(), &backend(3))).unwrap();
    assert_eq!(counters.active_conns, 12);
}

#[test]
fn test_bootstrap_stores_masked_dump_flags() {
    let svc = web().flags(PERSISTENT | HASHED, PERSISTENT);
    let mut source = ScriptedControlSource::new().with_service(svc.attrs());

    let tables = small_tables(8);
    let mut reg = registry(tables.clone());
    reg.bootstrap(&mut source, &ExitController::new()).unwrap();

    assert_eq!(tables.services.lookup(&svc.key()).unwrap().flags, PERSISTENT);
}

#[test]
fn test_bootstrap_service_dump_failure_is_fatal() {
    let mut source = ScriptedControlSource::new().failing_service_dump();
    let mut reg = registry(small_tables(8));
    let exit = ExitController::new();

    let err = reg.bootstrap(&mut source, &exit).unwrap_err();
    assert!(err.reason.contains("failed to dump services"));
    assert!(exit.is_cancelled());
    assert_eq!(exit.fatal_count(), 1);
}

#[test]
fn test_bootstrap_dest_dump_failure_is_fatal() {
    let mut source = ScriptedControlSource::new()
        .with_service(web().attrs())
        .with_service(dns().attrs())
        .failing_dest_dump(web().key());
    let probe = source.probe();
    let mut reg = registry(small_tables(8));
    let exit = ExitController::new();

    assert!(reg.bootstrap(&mut source, &exit).is_err());
    assert_eq!(exit.fatal_count(), 1);
    // nothing after the failed dump is requested
    assert_eq!(probe.dest_dumps(), vec![web().key()]);
}

#[test]
fn test_bootstrap_invalid_record_is_fatal() {
    let mut broken = web().attrs();
    broken.netmask = None;
    let mut source = ScriptedControlSource::new().with_service(broken);
    let exit = ExitController::new();

    assert!(registry(small_tables(8)).bootstrap(&mut source, &exit).is_err());
    assert!(exit.is_cancelled());
}

#[test]
fn test_bootstrap_backend_error_skips_record() {
    let (tables, faults) = faulty_tables(8);
    faults
        .services
        .fail_once(StoreOp::Insert, DbError::backend("tcam busy"));

    let mut source = ScriptedControlSource::new()
        .with_service(dns().attrs())
        .with_service(web().attrs())
        .with_dest(web().key(), backend(2).dump_attrs());
    let mut reg = registry(tables.clone());
    let exit = ExitController::new();

    let report = reg.bootstrap(&mut source, &exit).unwrap();
    assert_eq!(report.services, 1);
    assert_eq!(report.dests, 1);
    assert_eq!(report.failed, 1);
    assert!(!exit.is_cancelled());

    assert_eq!(tables.services.lookup(&dns().key()), Err(DbError::NotFound));
    assert_eq!(tables.services.lookup(&web().key()).unwrap().dest_count, 1);
}

#[test]
fn test_bootstrap_internal_error_is_fatal() {
    let (tables, faults) = faulty_tables(8);
    faults
        .dests
        .fail_always(StoreOp::Insert, DbError::internal("table handle lost"));

    let mut source = ScriptedControlSource::new()
        .with_service(web().attrs())
        .with_dest(web().key(), backend(2).dump_attrs())
        .with_dest(web().key(), backend(3).dump_attrs());
    let exit = ExitController::new();

    let err = registry(tables).bootstrap(&mut source, &exit).unwrap_err();
    assert!(err.reason.contains("table handle lost"));
    assert_eq!(exit.fatal_count(), 1);
    assert_eq!(faults.dests.triggered(), 1);
}

#[test]
fn test_modify_service_merges_masked_flags() {
    let tables = small_tables(8);
    let mut reg = registry(tables.clone());
    let exit = ExitController::new();

    let base = web().flags(HASHED | ONEPACKET, u32::MAX);
    assert_eq!(reg.handle_event(&base.new_event(), &exit), EventOutcome::Applied);
    assert_eq!(
        reg.handle_event(&backend(2).new_event(&base), &exit),
        EventOutcome::Applied
    );

    let persistent = web().flags(PERSISTENT, PERSISTENT);
    for _ in 0..2 {
        assert_eq!(
            reg.handle_event(&persistent.modify_event(), &exit),
            EventOutcome::Applied
        );
        let info = tables.services.lookup(&web().key()).unwrap();
        assert_eq!(info.flags, PERSISTENT | HASHED | ONEPACKET);
        assert_eq!(info.dest_count, 1);
        assert_eq!(info.sched_name, "rr");
    }

    let clear_hashed = web().flags(0, HASHED);
    reg.handle_event(&clear_hashed.modify_event(), &exit);
    assert_eq!(
        tables.services.lookup(&web().key()).unwrap().flags,
        PERSISTENT | ONEPACKET
    );
}

#[test]
fn test_unsupported_scheduler_is_not_applied() {
    let tables = small_tables(8);
    let mut reg = registry(tables.clone());
    let exit = ExitController::new();

    let outcome = reg.handle_event(&web().sched("lc").new_event(), &exit);
    assert!(matches!(
        outcome,
        EventOutcome::Failed(DbError::NotSupported(_))
    ));
    assert!(tables.services.is_empty());
    assert!(!exit.is_cancelled());
}

#[test]
fn test_delete_requires_identity_only() {
    let tables = small_tables(8);
    let mut reg = registry(tables.clone());
    let exit = ExitController::new();

    reg.handle_event(&web().new_event(), &exit);
    reg.handle_event(&backend(2).new_event(&web()), &exit);

    assert_eq!(
        reg.handle_event(&backend(2).delete_event(&web()), &exit),
        EventOutcome::Applied
    );
    assert_eq!(
        reg.handle_event(&web().delete_event(), &exit),
        EventOutcome::Applied
    );
    assert!(tables.services.is_empty());
    assert!(tables.dests.is_empty());
}

#[test]
fn test_service_delete_leaves_stale_destinations() {
    let tables = small_tables(8);
    let mut reg = registry(tables.clone());
    let exit = ExitController::new();

    reg.handle_event(&web().new_event(), &exit);
    reg.handle_event(&backend(2).new_event(&web()), &exit);
    reg.handle_event(&web().delete_event(), &exit);

    assert!(tables.services.is_empty());
    assert!(tables.dests.lookup(&dest_key(&web(), &backend(2))).is_ok());
    assert!(!exit.is_cancelled());
}

#[test]
fn test_invalid_event_is_skipped() {
    let mut reg = registry(small_tables(8));
    let exit = ExitController::new();

    let mut event = web().new_event();
    if let Some(service) = event.service.as_mut() {
        service.addr = None;
        service.fwmark = None;
    }
    assert_eq!(reg.handle_event(&event, &exit), EventOutcome::Skipped);
    assert_eq!(reg.stats().skipped, 1);
}

#[test]
fn test_internal_error_escalates_once() {
    let (tables, faults) = faulty_tables(8);
    let mut reg = registry(tables);
    let exit = ExitController::new();

    reg.handle_event(&web().new_event(), &exit);
    faults
        .dests
        .fail_once(StoreOp::Insert, DbError::internal("lookup engine reset"));

    let outcome = reg.handle_event(&backend(2).new_event(&web()), &exit);
    assert!(matches!(outcome, EventOutcome::Fatal(_)));
    assert!(exit.is_cancelled());
    assert_eq!(exit.fatal_count(), 1);
    assert_eq!(
        exit.fatal_reason().unwrap(),
        "NEW_DEST failed: internal error: lookup engine reset"
    );
}

#[test]
fn test_hardware_error_is_fatal_backend_error_is_not() {
    let (tables, faults) = faulty_tables(8);
    let mut reg = registry(tables);
    let exit = ExitController::new();

    faults
        .services
        .fail_once(StoreOp::Insert, DbError::backend("table full"));
    assert!(matches!(
        reg.handle_event(&web().new_event(), &exit),
        EventOutcome::Failed(DbError::Backend(_))
    ));
    assert!(!exit.is_cancelled());

    faults
        .services
        .fail_once(StoreOp::Insert, DbError::hardware("search engine fault"));
    assert!(matches!(
        reg.handle_event(&web().new_event(), &exit),
        EventOutcome::Fatal(_)
    ));
    assert_eq!(exit.fatal_count(), 1);
}

#[test]
fn test_flush_errors_are_not_escalated() {
    let (tables, faults) = faulty_tables(8);
    let mut reg = registry(tables.clone());
    let exit = ExitController::new();

    reg.handle_event(&web().new_event(), &exit);
    faults
        .services
        .fail_once(StoreOp::ClearAll, DbError::hardware("clear failed"));

    assert!(matches!(
        reg.handle_event(&flush_event(), &exit),
        EventOutcome::Failed(DbError::Hardware(_))
    ));
    assert!(!exit.is_cancelled());

    assert_eq!(reg.handle_event(&flush_event(), &exit), EventOutcome::Applied);
    assert!(tables.services.is_empty());
}

#[test]
fn test_flush_internal_error_is_fatal() {
    let (tables, faults) = faulty_tables(8);
    let mut reg = registry(tables);
    let exit = ExitController::new();

    reg.handle_event(&web().new_event(), &exit);
    faults
        .services
        .fail_once(StoreOp::ClearAll, DbError::internal("clear failed"));

    assert!(matches!(
        reg.handle_event(&flush_event(), &exit),
        EventOutcome::Fatal(_)
    ));
    assert!(exit.is_cancelled());
    assert_eq!(exit.fatal_count(), 1);
    assert_eq!(
        exit.fatal_reason().unwrap(),
        "FLUSH failed: internal error: clear failed"
    );
}

#[test]
fn test_fwmark_service_lifecycle() {
    let tables = small_tables(8);
    let mut reg = registry(tables.clone());
    let exit = ExitController::new();
    let mark = ServiceFixture::fwmark(100);

    reg.handle_event(&mark.new_event(), &exit);
    reg.handle_event(&backend(5).weight(3).new_event(&mark), &exit);
    reg.handle_event(&backend(5).weight(7).modify_event(&mark), &exit);

    let key = ServiceKey::Fwmark(100);
    assert_eq!(tables.services.lookup(&key).unwrap().dest_count, 1);
    assert_eq!(
        tables.dests.lookup(&dest_key(&mark, &backend(5))).unwrap().weight,
        7
    );
}
