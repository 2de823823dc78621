//! Unix datagram control source.
//!
//! The configuration authority and the daemon exchange JSON datagrams.
//! Requests from the daemon:
//!
//! ```json
//! {"op":"register"}
//! {"op":"get_services"}
//! {"op":"get_dests","service":{"af":2,"fwmark":7}}
//! {"op":"unregister"}
//! ```
//!
//! Messages from the authority are one of `{"event":{..}}`,
//! `{"services":[..]}`, `{"dests":[..]}` or `{"error":".."}`. Events that
//! arrive while a dump reply is awaited are queued and delivered in order.
//!
//! This protocol is local to lbsyncd; no existing authority speaks it. An
//! IPVS generic netlink source would implement [`ControlSource`] directly
//! and replace this adapter.

use crate::config::ControlConfig;
use crate::control::{ControlSource, DestAttrs, RawEvent, ServiceAttrs};
use crate::error::{LbsyncError, Result};
use lb_common::ServiceKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Register,
    GetServices,
    GetDests { service: ServiceAttrs },
    Unregister,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inbound {
    Event(RawEvent),
    Services(Vec<ServiceAttrs>),
    Dests(Vec<DestAttrs>),
    Error(String),
}

pub struct UnixControlSource {
    socket: UnixDatagram,
    socket_path: PathBuf,
    authority_path: PathBuf,
    buffer: Vec<u8>,
    pending: VecDeque<RawEvent>,
    dump_timeout: Duration,
    registered: bool,
}

impl UnixControlSource {
    /// Binds the control socket and registers with the authority.
    pub fn connect(config: &ControlConfig) -> Result<Self> {
        remove_stale(&config.socket_path)?;
        let socket = UnixDatagram::bind(&config.socket_path).map_err(|e| {
            LbsyncError::Control(format!(
                "failed to bind {}: {}",
                config.socket_path.display(),
                e
            ))
        })?;
        info!(path = %config.socket_path.display(), "Control socket bound");

        let mut source = Self {
            socket,
            socket_path: config.socket_path.clone(),
            authority_path: config.authority_path.clone(),
            buffer: vec![0u8; config.max_msg_size],
            pending: VecDeque::new(),
            dump_timeout: config.dump_timeout(),
            registered: false,
        };
        source.send(&Request::Register)?;
        source.registered = true;
        Ok(source)
    }

    fn send(&self, request: &Request) -> Result<()> {
        let bytes = serde_json::to_vec(request)?;
        self.socket
            .send_to(&bytes, &self.authority_path)
            .map_err(|e| LbsyncError::Control(format!("failed to send request: {}", e)))?;
        Ok(())
    }

    /// Receives one message, or `None` on timeout.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Inbound>> {
        self.socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let len = match self.socket.recv(&mut self.buffer) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let message = serde_json::from_slice(&self.buffer[..len])?;
        Ok(Some(message))
    }

    /// Sends `request` and waits for the dump reply, queueing events.
    fn dump(&mut self, request: &Request) -> Result<Inbound> {
        self.send(request)?;
        let deadline = Instant::now() + self.dump_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LbsyncError::Control("dump reply timed out".to_string()));
            }
            match self.recv(remaining)? {
                Some(Inbound::Event(event)) => self.pending.push_back(event),
                Some(Inbound::Error(reason)) => {
                    return Err(LbsyncError::Control(format!("dump refused: {}", reason)))
                }
                Some(reply) => return Ok(reply),
                None => {}
            }
        }
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed stale control socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl ControlSource for UnixControlSource {
    fn get_all_services(&mut self) -> Result<Vec<ServiceAttrs>> {
        match self.dump(&Request::GetServices)? {
            Inbound::Services(services) => Ok(services),
            other => Err(LbsyncError::Control(format!(
                "unexpected reply to service dump: {:?}",
                other
            ))),
        }
    }

    fn get_all_destinations(&mut self, service: &ServiceKey) -> Result<Vec<DestAttrs>> {
        let request = Request::GetDests {
            service: ServiceAttrs::identity(service),
        };
        match self.dump(&request)? {
            Inbound::Dests(dests) => Ok(dests),
            other => Err(LbsyncError::Control(format!(
                "unexpected reply to destination dump: {:?}",
                other
            ))),
        }
    }

    fn recv_event(&mut self, timeout: Duration) -> Result<Option<RawEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        match self.recv(timeout)? {
            Some(Inbound::Event(event)) => Ok(Some(event)),
            Some(other) => {
                warn!(message = ?other, "Ignoring unsolicited control message");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        if let Err(e) = self.send(&Request::Unregister) {
            warn!(error = %e, "Failed to unregister from control authority");
        }
        let _ = std::fs::remove_file(&self.socket_path);
        info!("Unregistered from control authority");
    }
}

impl Drop for UnixControlSource {
    fn drop(&mut self) {
        self.unregister();
    }
}
