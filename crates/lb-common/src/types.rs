//! Service, destination and connection records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Forwarding method bits inside a destination's connection flags.
pub const FWD_MASK: u32 = 0x0007;

/// Transport protocol of a service or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 6,
    Udp = 17,
    Sctp = 132,
}

impl Protocol {
    /// Creates a Protocol from an IP protocol number.
    pub fn from_raw(proto: u16) -> Option<Self> {
        match proto {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            132 => Some(Self::Sctp),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        };
        write!(f, "{}", s)
    }
}

/// Identity of a virtual service.
///
/// The two identity modes are mutually exclusive: a service is either
/// matched on its `(protocol, address, port)` triple or on a firewall mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKey {
    Addr {
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    },
    Fwmark(u32),
}

impl ServiceKey {
    pub fn addr(protocol: Protocol, addr: Ipv4Addr, port: u16) -> Self {
        ServiceKey::Addr {
            protocol,
            addr,
            port,
        }
    }

    /// Returns the firewall mark, or 0 for address-identified services.
    pub fn fwmark(&self) -> u32 {
        match self {
            ServiceKey::Fwmark(mark) => *mark,
            ServiceKey::Addr { .. } => 0,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKey::Addr {
                protocol,
                addr,
                port,
            } => write!(f, "{}:{}:{}", protocol, addr, port),
            ServiceKey::Fwmark(mark) => write!(f, "fwmark:{}", mark),
        }
    }
}

/// Service table result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Slot in the service info table, stable for the service's lifetime
    pub index: u32,
    pub sched_name: String,
    /// Persistence engine name (empty when none)
    pub pe_name: String,
    pub flags: u32,
    pub timeout: u32,
    pub netmask: u32,
    /// Number of destinations currently bound to the service
    pub dest_count: u32,
}

/// Destination forwarding method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum FwdMethod {
    Masq = 0,
    Local = 1,
    Tunnel = 2,
    DirectRoute = 3,
    Bypass = 4,
}

impl FwdMethod {
    /// Decodes the forwarding method from destination connection flags.
    pub fn from_conn_flags(flags: u32) -> Option<Self> {
        match flags & FWD_MASK {
            0 => Some(Self::Masq),
            1 => Some(Self::Local),
            2 => Some(Self::Tunnel),
            3 => Some(Self::DirectRoute),
            4 => Some(Self::Bypass),
            _ => None,
        }
    }
}

/// Destination identity, scoped to its parent service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestKey {
    pub service: ServiceKey,
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for DestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}:{}", self.service, self.addr, self.port)
    }
}

/// Destination table result.
///
/// The connection counters mirror what the control source reported and are
/// informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestInfo {
    pub fwd_method: FwdMethod,
    pub weight: u32,
    pub u_threshold: u32,
    pub l_threshold: u32,
    pub active_conns: u32,
    pub inactive_conns: u32,
    pub persist_conns: u32,
}

/// Connection classification key (client 5-tuple towards the virtual service).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnKey {
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub virtual_ip: Ipv4Addr,
    pub virtual_port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} --> {}:{} ({})",
            self.client_ip, self.client_port, self.virtual_ip, self.virtual_port, self.protocol
        )
    }
}

/// Timeout class used to map a connection state onto an aging period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutClass {
    Tcp,
    TcpFin,
    Udp,
}

/// Protocol-specific connection state.
///
/// TCP values follow the kernel IPVS numbering; that is also what is
/// written into state sync records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ConnState {
    None = 0,
    Established = 1,
    SynSent = 2,
    SynRecv = 3,
    FinWait = 4,
    TimeWait = 5,
    Close = 6,
    CloseWait = 7,
    LastAck = 8,
    Listen = 9,
    SynAck = 10,
    /// UDP has a single state
    Udp = 0x100,
}

impl ConnState {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the timeout class for this state.
    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            ConnState::Udp => TimeoutClass::Udp,
            ConnState::FinWait
            | ConnState::TimeWait
            | ConnState::Close
            | ConnState::CloseWait
            | ConnState::LastAck => TimeoutClass::TcpFin,
            _ => TimeoutClass::Tcp,
        }
    }

    /// Returns the value written into state sync records.
    ///
    /// UDP connections are replicated with state 0.
    pub fn sync_value(&self) -> u16 {
        match self {
            ConnState::Udp => 0,
            other => other.as_u16(),
        }
    }
}

/// Connection info table result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnInfo {
    pub key: ConnKey,
    pub server_addr: Ipv4Addr,
    pub server_port: u16,
    /// Destination connection flags (forwarding method and friends)
    pub conn_flags: u32,
    pub conn_state: ConnState,
    /// Sweep iteration the entry was last stamped with
    pub age_iteration: u32,
    /// Set by the forwarding path when the entry saw traffic
    pub aging_bit: bool,
    /// Set to force reclamation on the next sweep visit
    pub delete_bit: bool,
}

/// State sync application record for this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppInfo {
    pub master_bit: bool,
    pub backup_bit: bool,
    /// Address used as the source of state sync frames
    pub source_ip: Option<Ipv4Addr>,
    pub m_sync_id: u8,
    pub b_sync_id: u8,
}
