//! Test fixtures for services, destinations and connections

use lb_common::{ConnInfo, ConnKey, ConnState, FlagUpdate, Protocol, ServiceKey};
use lbsyncd::config::TablesConfig;
use lbsyncd::{Command, DaemonAttrs, DaemonState, DestAttrs, RawEvent, ServiceAttrs, Tables};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Builder for a fully populated service.
#[derive(Debug, Clone)]
pub struct ServiceFixture {
    key: ServiceKey,
    sched_name: String,
    flags: FlagUpdate,
    timeout: u32,
    netmask: u32,
}

impl ServiceFixture {
    /// TCP service on `addr:port`, round robin, no flags.
    pub fn tcp(addr: Ipv4Addr, port: u16) -> Self {
        Self::with_key(ServiceKey::addr(Protocol::Tcp, addr, port))
    }

    pub fn udp(addr: Ipv4Addr, port: u16) -> Self {
        Self::with_key(ServiceKey::addr(Protocol::Udp, addr, port))
    }

    pub fn fwmark(mark: u32) -> Self {
        Self::with_key(ServiceKey::Fwmark(mark))
    }

    fn with_key(key: ServiceKey) -> Self {
        Self {
            key,
            sched_name: "rr".to_string(),
            flags: FlagUpdate::full(0),
            timeout: 0,
            netmask: 0xffff_ffff,
        }
    }

    pub fn sched(mut self, name: &str) -> Self {
        self.sched_name = name.to_string();
        self
    }

    pub fn flags(mut self, flags: u32, mask: u32) -> Self {
        self.flags = FlagUpdate::new(flags, mask);
        self
    }

    pub fn timeout(mut self, timeout: u32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn key(&self) -> ServiceKey {
        self.key
    }

    /// Identity attributes only.
    pub fn identity(&self) -> ServiceAttrs {
        ServiceAttrs::identity(&self.key)
    }

    /// Full attributes, as sent with new/modify events and dumps.
    pub fn attrs(&self) -> ServiceAttrs {
        ServiceAttrs {
            sched_name: Some(self.sched_name.clone()),
            pe_name: Some(String::new()),
            flags: Some(self.flags),
            timeout: Some(self.timeout),
            netmask: Some(self.netmask),
            ..self.identity()
        }
    }

    pub fn new_event(&self) -> RawEvent {
        RawEvent::new(Command::NewService).with_service(self.attrs())
    }

    pub fn modify_event(&self) -> RawEvent {
        RawEvent::new(Command::SetService).with_service(self.attrs())
    }

    pub fn delete_event(&self) -> RawEvent {
        RawEvent::new(Command::DelService).with_service(self.identity())
    }
}

/// Builder for a destination.
#[derive(Debug, Clone)]
pub struct DestFixture {
    addr: Ipv4Addr,
    port: u16,
    fwd_method: u32,
    weight: u32,
    active_conns: u32,
}

impl DestFixture {
    /// Masquerading destination with weight 1.
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr,
            port,
            fwd_method: 0,
            weight: 1,
            active_conns: 0,
        }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn fwd_method(mut self, fwd_method: u32) -> Self {
        self.fwd_method = fwd_method;
        self
    }

    pub fn active_conns(mut self, active: u32) -> Self {
        self.active_conns = active;
        self
    }

    pub fn identity(&self) -> DestAttrs {
        DestAttrs {
            addr: Some(IpAddr::V4(self.addr)),
            port: Some(self.port),
            ..DestAttrs::default()
        }
    }

    pub fn attrs(&self) -> DestAttrs {
        DestAttrs {
            fwd_method: Some(self.fwd_method),
            weight: Some(self.weight),
            u_threshold: Some(0),
            l_threshold: Some(0),
            ..self.identity()
        }
    }

    /// Attributes as returned by a dump, counters included.
    pub fn dump_attrs(&self) -> DestAttrs {
        DestAttrs {
            active_conns: Some(self.active_conns),
            inactive_conns: Some(0),
            persist_conns: Some(0),
            ..self.attrs()
        }
    }

    pub fn new_event(&self, service: &ServiceFixture) -> RawEvent {
        RawEvent::new(Command::NewDest)
            .with_service(service.identity())
            .with_dest(self.attrs())
    }

    pub fn modify_event(&self, service: &ServiceFixture) -> RawEvent {
        RawEvent::new(Command::SetDest)
            .with_service(service.identity())
            .with_dest(self.attrs())
    }

    pub fn delete_event(&self, service: &ServiceFixture) -> RawEvent {
        RawEvent::new(Command::DelDest)
            .with_service(service.identity())
            .with_dest(self.identity())
    }
}

pub fn flush_event() -> RawEvent {
    RawEvent::new(Command::Flush)
}

/// Starts the master sync daemon with `sync_id`, sourcing frames from `source_ip`.
pub fn master_daemon_event(sync_id: u8, source_ip: Ipv4Addr) -> RawEvent {
    RawEvent::new(Command::NewDaemon).with_daemon(DaemonAttrs {
        state: Some(DaemonState::Master),
        sync_id: Some(sync_id),
        source_ip: Some(source_ip),
    })
}

/// Builder for a connection table entry.
#[derive(Debug, Clone)]
pub struct ConnFixture {
    info: ConnInfo,
}

impl ConnFixture {
    /// Established TCP connection from `192.168.0.1:client_port` to `10.0.0.1:80`.
    pub fn tcp(client_port: u16) -> Self {
        Self {
            info: ConnInfo {
                key: ConnKey {
                    client_ip: Ipv4Addr::new(192, 168, 0, 1),
                    client_port,
                    virtual_ip: Ipv4Addr::new(10, 0, 0, 1),
                    virtual_port: 80,
                    protocol: Protocol::Tcp,
                },
                server_addr: Ipv4Addr::new(10, 0, 0, 2),
                server_port: 8080,
                conn_flags: 0,
                conn_state: ConnState::Established,
                age_iteration: 0,
                aging_bit: false,
                delete_bit: false,
            },
        }
    }

    pub fn udp(client_port: u16) -> Self {
        let mut fixture = Self::tcp(client_port);
        fixture.info.key.protocol = Protocol::Udp;
        fixture.info.conn_state = ConnState::Udp;
        fixture
    }

    pub fn state(mut self, state: ConnState) -> Self {
        self.info.conn_state = state;
        self
    }

    pub fn age_iteration(mut self, iteration: u32) -> Self {
        self.info.age_iteration = iteration;
        self
    }

    /// Marks the connection as having seen traffic.
    pub fn active(mut self) -> Self {
        self.info.aging_bit = true;
        self
    }

    pub fn doomed(mut self) -> Self {
        self.info.delete_bit = true;
        self
    }

    pub fn build(self) -> ConnInfo {
        self.info
    }
}

/// Tables with small, test-friendly capacities.
pub fn small_tables(max_conns: usize) -> Arc<Tables> {
    Arc::new(Tables::prepare(&TablesConfig {
        max_services: 16,
        max_dests: 64,
        max_conns,
    }))
}
