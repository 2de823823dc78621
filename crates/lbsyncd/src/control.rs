//! Control source interface and event decoding.
//!
//! Events arrive as raw, partially-optional attribute sets. Identity fields
//! are always expected; descriptive fields only for the "full" variants
//! (new/modify). Every raw event is decoded into a typed [`ControlEvent`]
//! before dispatch, and a record that fails validation never reaches the
//! registry.

use crate::error::Result;
use lb_common::{FlagUpdate, FwdMethod, Protocol, ServiceKey};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Address family value for IPv4 (AF_INET).
pub const AF_INET: u16 = 2;

/// Control command carried by a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    NewService,
    SetService,
    DelService,
    NewDest,
    SetDest,
    DelDest,
    Flush,
    NewDaemon,
    DelDaemon,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::NewService => "NEW_SERVICE",
            Command::SetService => "SET_SERVICE",
            Command::DelService => "DEL_SERVICE",
            Command::NewDest => "NEW_DEST",
            Command::SetDest => "SET_DEST",
            Command::DelDest => "DEL_DEST",
            Command::Flush => "FLUSH",
            Command::NewDaemon => "NEW_DAEMON",
            Command::DelDaemon => "DEL_DAEMON",
        }
    }
}

/// Service attributes as sent by the control source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAttrs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub af: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fwmark: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sched_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pe_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<FlagUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<u32>,
}

impl ServiceAttrs {
    /// Identity-only attributes for `key`.
    pub fn identity(key: &ServiceKey) -> Self {
        match key {
            ServiceKey::Addr {
                protocol,
                addr,
                port,
            } => Self {
                af: Some(AF_INET),
                protocol: Some(protocol.as_u8() as u16),
                addr: Some(IpAddr::V4(*addr)),
                port: Some(*port),
                ..Self::default()
            },
            ServiceKey::Fwmark(mark) => Self {
                af: Some(AF_INET),
                fwmark: Some(*mark),
                ..Self::default()
            },
        }
    }
}

/// Destination attributes as sent by the control source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestAttrs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fwd_method: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub u_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_conns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactive_conns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_conns: Option<u32>,
}

/// State sync daemon role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Master,
    Backup,
}

/// State sync daemon attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonAttrs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<DaemonState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<Ipv4Addr>,
}

/// One control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub cmd: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceAttrs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<DestAttrs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonAttrs>,
}

impl RawEvent {
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            service: None,
            dest: None,
            daemon: None,
        }
    }

    pub fn with_service(mut self, service: ServiceAttrs) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_dest(mut self, dest: DestAttrs) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn with_daemon(mut self, daemon: DaemonAttrs) -> Self {
        self.daemon = Some(daemon);
        self
    }
}

/// A fully validated service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub sched_name: String,
    pub pe_name: String,
    pub flags: FlagUpdate,
    pub timeout: u32,
    pub netmask: u32,
}

/// A validated destination record.
///
/// Counters are zero unless the record came from a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestRecord {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub fwd_method: FwdMethod,
    pub weight: u32,
    pub u_threshold: u32,
    pub l_threshold: u32,
    pub active_conns: u32,
    pub inactive_conns: u32,
    pub persist_conns: u32,
}

/// Destination identity within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestIdentity {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// A decoded, validated control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    NewService(ServiceRecord),
    ModifyService(ServiceRecord),
    DeleteService(ServiceKey),
    NewDest(ServiceKey, DestRecord),
    ModifyDest(ServiceKey, DestRecord),
    DeleteDest(ServiceKey, DestIdentity),
    Flush,
    NewDaemon {
        state: DaemonState,
        sync_id: u8,
        source_ip: Option<Ipv4Addr>,
    },
    DeleteDaemon(DaemonState),
}

/// Validation failures. The offending event is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("missing {record} attribute: {attr}")]
    MissingAttribute {
        record: &'static str,
        attr: &'static str,
    },

    #[error("service needs a fwmark or protocol, address and port")]
    MissingServiceIdentity,

    #[error("address family {0} is not IPv4")]
    NotIpv4(u16),

    #[error("{0} address is not IPv4")]
    Ipv6Address(&'static str),

    #[error("unknown protocol {0}")]
    UnknownProtocol(u16),

    #[error("invalid forwarding method {0:#x}")]
    InvalidFwdMethod(u32),
}

fn require<T: Copy>(value: Option<T>, record: &'static str, attr: &'static str) -> std::result::Result<T, DecodeError> {
    value.ok_or(DecodeError::MissingAttribute { record, attr })
}

fn require_v4(addr: Option<IpAddr>, record: &'static str) -> std::result::Result<Ipv4Addr, DecodeError> {
    match addr {
        Some(IpAddr::V4(v4)) => Ok(v4),
        Some(IpAddr::V6(_)) => Err(DecodeError::Ipv6Address(record)),
        None => Err(DecodeError::MissingAttribute {
            record,
            attr: "addr",
        }),
    }
}

/// Decodes the identity of a service.
///
/// A fwmark takes precedence over the address triple and implies TCP.
pub fn decode_service_key(attrs: &ServiceAttrs) -> std::result::Result<ServiceKey, DecodeError> {
    let af = attrs.af.ok_or(DecodeError::MissingServiceIdentity)?;
    let has_triple = attrs.protocol.is_some() && attrs.addr.is_some() && attrs.port.is_some();
    if attrs.fwmark.is_none() && !has_triple {
        return Err(DecodeError::MissingServiceIdentity);
    }
    if af != AF_INET {
        return Err(DecodeError::NotIpv4(af));
    }

    if let Some(mark) = attrs.fwmark {
        return Ok(ServiceKey::Fwmark(mark));
    }

    let raw_proto = require(attrs.protocol, "service", "protocol")?;
    let protocol = Protocol::from_raw(raw_proto).ok_or(DecodeError::UnknownProtocol(raw_proto))?;
    let addr = require_v4(attrs.addr, "service")?;
    let port = require(attrs.port, "service", "port")?;
    Ok(ServiceKey::addr(protocol, addr, port))
}

/// Decodes a service that must carry full detail.
pub fn decode_service(attrs: &ServiceAttrs) -> std::result::Result<ServiceRecord, DecodeError> {
    let key = decode_service_key(attrs)?;
    let sched_name = attrs.sched_name.clone().ok_or(DecodeError::MissingAttribute {
        record: "service",
        attr: "sched_name",
    })?;
    let flags = require(attrs.flags, "service", "flags")?;
    let timeout = require(attrs.timeout, "service", "timeout")?;
    let netmask = require(attrs.netmask, "service", "netmask")?;

    Ok(ServiceRecord {
        key,
        sched_name,
        pe_name: attrs.pe_name.clone().unwrap_or_default(),
        flags,
        timeout,
        netmask,
    })
}

/// Decodes a service returned by a full dump.
///
/// Dumped flags carry the complete current value: only `flags & mask`
/// is kept.
pub fn decode_dump_service(attrs: &ServiceAttrs) -> std::result::Result<ServiceRecord, DecodeError> {
    let mut record = decode_service(attrs)?;
    record.flags = FlagUpdate::full(record.flags.flags & record.flags.mask);
    Ok(record)
}

/// Decodes a destination identity.
pub fn decode_dest_identity(attrs: &DestAttrs) -> std::result::Result<DestIdentity, DecodeError> {
    let port = require(attrs.port, "dest", "port")?;
    let addr = require_v4(attrs.addr, "dest")?;
    Ok(DestIdentity { addr, port })
}

/// Decodes a destination that must carry full detail.
pub fn decode_dest(attrs: &DestAttrs) -> std::result::Result<DestRecord, DecodeError> {
    let id = decode_dest_identity(attrs)?;
    let raw_fwd = require(attrs.fwd_method, "dest", "fwd_method")?;
    let fwd_method =
        FwdMethod::from_conn_flags(raw_fwd).ok_or(DecodeError::InvalidFwdMethod(raw_fwd))?;

    Ok(DestRecord {
        addr: id.addr,
        port: id.port,
        fwd_method,
        weight: require(attrs.weight, "dest", "weight")?,
        u_threshold: require(attrs.u_threshold, "dest", "u_threshold")?,
        l_threshold: require(attrs.l_threshold, "dest", "l_threshold")?,
        active_conns: 0,
        inactive_conns: 0,
        persist_conns: 0,
    })
}

/// Decodes a destination returned by a full dump, counters included.
pub fn decode_dump_dest(attrs: &DestAttrs) -> std::result::Result<DestRecord, DecodeError> {
    let mut record = decode_dest(attrs)?;
    record.active_conns = require(attrs.active_conns, "dest", "active_conns")?;
    record.inactive_conns = require(attrs.inactive_conns, "dest", "inactive_conns")?;
    record.persist_conns = require(attrs.persist_conns, "dest", "persist_conns")?;
    Ok(record)
}

fn service_attrs(raw: &RawEvent) -> std::result::Result<&ServiceAttrs, DecodeError> {
    raw.service.as_ref().ok_or(DecodeError::MissingAttribute {
        record: "event",
        attr: "service",
    })
}

fn dest_attrs(raw: &RawEvent) -> std::result::Result<&DestAttrs, DecodeError> {
    raw.dest.as_ref().ok_or(DecodeError::MissingAttribute {
        record: "event",
        attr: "dest",
    })
}

fn daemon_attrs(raw: &RawEvent) -> std::result::Result<&DaemonAttrs, DecodeError> {
    raw.daemon.as_ref().ok_or(DecodeError::MissingAttribute {
        record: "event",
        attr: "daemon",
    })
}

/// Decodes and validates one raw event.
pub fn decode_event(raw: &RawEvent) -> std::result::Result<ControlEvent, DecodeError> {
    let event = match raw.cmd {
        Command::Flush => ControlEvent::Flush,
        Command::NewService => ControlEvent::NewService(decode_service(service_attrs(raw)?)?),
        Command::SetService => ControlEvent::ModifyService(decode_service(service_attrs(raw)?)?),
        Command::DelService => ControlEvent::DeleteService(decode_service_key(service_attrs(raw)?)?),
        Command::NewDest => ControlEvent::NewDest(
            decode_service_key(service_attrs(raw)?)?,
            decode_dest(dest_attrs(raw)?)?,
        ),
        Command::SetDest => ControlEvent::ModifyDest(
            decode_service_key(service_attrs(raw)?)?,
            decode_dest(dest_attrs(raw)?)?,
        ),
        Command::DelDest => ControlEvent::DeleteDest(
            decode_service_key(service_attrs(raw)?)?,
            decode_dest_identity(dest_attrs(raw)?)?,
        ),
        Command::NewDaemon => {
            let daemon = daemon_attrs(raw)?;
            ControlEvent::NewDaemon {
                state: require(daemon.state, "daemon", "state")?,
                sync_id: require(daemon.sync_id, "daemon", "sync_id")?,
                source_ip: daemon.source_ip,
            }
        }
        Command::DelDaemon => {
            ControlEvent::DeleteDaemon(require(daemon_attrs(raw)?.state, "daemon", "state")?)
        }
    };
    Ok(event)
}

/// The external configuration authority.
///
/// Delivery is assumed reliable and ordered, from a single source.
pub trait ControlSource: Send {
    /// Full dump of every configured service.
    fn get_all_services(&mut self) -> Result<Vec<ServiceAttrs>>;

    /// Full dump of the destinations bound to `service`.
    fn get_all_destinations(&mut self, service: &ServiceKey) -> Result<Vec<DestAttrs>>;

    /// Waits up to `timeout` for the next event.
    ///
    /// `Ok(None)` means the timeout elapsed without traffic.
    fn recv_event(&mut self, timeout: Duration) -> Result<Option<RawEvent>>;

    /// Releases the registration with the authority.
    fn unregister(&mut self) {}
}
