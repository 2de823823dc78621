//! State sync aggregation.
//!
//! Active connections found during an aging sweep are packed into sync
//! frames and sent to the backup node. Frames use the IPVS sync protocol
//! version 1 layout (network byte order): an 8-byte header followed by
//! fixed-size IPv4 connection records.
//!
//! ```text
//! header:  reserved:u8 sync_id:u8 size:u16 count:u8 version:u8 spare:u16
//! record:  type:u8 protocol:u8 ver_size:u16 flags:u32 state:u16
//!          cport:u16 vport:u16 dport:u16 fwmark:u32 timeout:u32
//!          caddr:u32 vaddr:u32 daddr:u32
//! ```
//!
//! Transmission is best effort. A failed send is logged and the sweep
//! carries on.

use byteorder::{BigEndian, ByteOrder};
use lb_common::ConnInfo;
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub const SYNC_PROTO_VERSION: u8 = 1;
pub const FRAME_HEADER_SIZE: usize = 8;
pub const CONN_RECORD_SIZE: usize = 36;
/// Smallest frame that can carry one connection
pub const MIN_FRAME_SIZE: usize = FRAME_HEADER_SIZE + CONN_RECORD_SIZE;
/// The header's count field is a single byte
pub const MAX_CONNS_PER_FRAME: usize = u8::MAX as usize;

/// Sends finished frames to the backup peer.
pub trait PeerTransport: Send + Sync {
    fn send_frame(&self, source_ip: Ipv4Addr, frame: &[u8]) -> io::Result<()>;
}

impl<T: PeerTransport + ?Sized> PeerTransport for Arc<T> {
    fn send_frame(&self, source_ip: Ipv4Addr, frame: &[u8]) -> io::Result<()> {
        (**self).send_frame(source_ip, frame)
    }
}

/// UDP transport towards a fixed peer (unicast or multicast group).
///
/// The socket is bound to the sync source address and rebound when that
/// address changes. Sends never block: `WouldBlock` is reported like any
/// other send failure.
#[derive(Debug)]
pub struct UdpPeerTransport {
    peer: SocketAddr,
    socket: Mutex<Option<(Ipv4Addr, UdpSocket)>>,
}

impl UdpPeerTransport {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            socket: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl PeerTransport for UdpPeerTransport {
    fn send_frame(&self, source_ip: Ipv4Addr, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.socket.lock();
        let stale = !matches!(&*guard, Some((bound, _)) if *bound == source_ip);
        if stale {
            let socket = UdpSocket::bind((source_ip, 0))?;
            // sends must not stall the aging sweep
            socket.set_nonblocking(true)?;
            debug!(source = %source_ip, peer = %self.peer, "Bound state sync socket");
            *guard = Some((source_ip, socket));
        }

        match &*guard {
            Some((_, socket)) => socket.send_to(frame, self.peer).map(|_| ()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "sync socket not bound")),
        }
    }
}

/// Whether the current sweep replicates connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    Needed,
    #[default]
    NotNeeded,
}

/// Aggregation bookkeeping for one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStats {
    /// Connections packed since the last reset
    pub conn_count: u32,
    /// Frames handed to the transport
    pub amount_buffers: u32,
    /// Frames the transport rejected
    pub send_failures: u32,
    /// Write cursor into the current frame
    pub current_len: usize,
}

/// Packs connection descriptors into sync frames.
pub struct SyncAggregator {
    transport: Arc<dyn PeerTransport>,
    max_frame_size: usize,
    conns_per_frame: usize,
    status: SyncStatus,
    source_ip: Ipv4Addr,
    sync_id: u8,
    frame: Vec<u8>,
    frame_conns: u8,
    stats: SyncStats,
}

impl SyncAggregator {
    /// `max_frame_size` is clamped to [`MIN_FRAME_SIZE`].
    pub fn new(transport: Arc<dyn PeerTransport>, max_frame_size: usize) -> Self {
        let max_frame_size = max_frame_size.max(MIN_FRAME_SIZE);
        let conns_per_frame =
            ((max_frame_size - FRAME_HEADER_SIZE) / CONN_RECORD_SIZE).min(MAX_CONNS_PER_FRAME);
        Self {
            transport,
            max_frame_size,
            conns_per_frame,
            status: SyncStatus::NotNeeded,
            source_ip: Ipv4Addr::UNSPECIFIED,
            sync_id: 0,
            frame: Vec::with_capacity(max_frame_size),
            frame_conns: 0,
            stats: SyncStats::default(),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn conns_per_frame(&self) -> usize {
        self.conns_per_frame
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            current_len: self.frame.len(),
            ..self.stats
        }
    }

    /// True when the current frame holds at least one connection.
    pub fn has_pending(&self) -> bool {
        self.frame_conns > 0
    }

    /// Starts a sweep that replicates connections.
    pub fn reset_for_sweep(&mut self, source_ip: Ipv4Addr, sync_id: u8) {
        self.status = SyncStatus::Needed;
        self.source_ip = source_ip;
        self.sync_id = sync_id;
        self.stats = SyncStats::default();
        self.start_frame();
    }

    /// Drops any buffered state and stops replicating.
    pub fn reset(&mut self) {
        self.status = SyncStatus::NotNeeded;
        self.frame.clear();
        self.frame_conns = 0;
    }

    /// Packs one active connection.
    ///
    /// Returns false when the sweep does not replicate. A full frame is
    /// sent immediately and a new one started.
    pub fn aggregate(&mut self, conn: &ConnInfo, timeout_secs: u32) -> bool {
        if self.status != SyncStatus::Needed {
            trace!(conn = %conn.key, "Sync not needed, connection not packed");
            return false;
        }

        if self.frame.is_empty() {
            self.start_frame();
        }
        self.frame
            .extend_from_slice(&encode_conn_record(conn, timeout_secs));
        self.frame_conns += 1;
        self.stats.conn_count += 1;

        if self.frame_conns as usize >= self.conns_per_frame {
            self.send_current();
        }
        true
    }

    /// Sends the current frame if it holds any connection.
    pub fn flush(&mut self) {
        if self.has_pending() {
            self.send_current();
        }
    }

    /// Flushes leftovers and stops replicating until the next reset.
    pub fn finish_sweep(&mut self) -> SyncStats {
        self.flush();
        let stats = self.stats();
        self.reset();
        stats
    }

    fn start_frame(&mut self) {
        self.frame.clear();
        self.frame_conns = 0;
        // Header is completed when the frame is sent
        self.frame.extend_from_slice(&[0u8; FRAME_HEADER_SIZE]);
    }

    fn send_current(&mut self) {
        let size = self.frame.len() as u16;
        write_header(&mut self.frame[..FRAME_HEADER_SIZE], self.sync_id, size, self.frame_conns);
        self.stats.amount_buffers += 1;

        match self.transport.send_frame(self.source_ip, &self.frame) {
            Ok(()) => {
                debug!(
                    conns = self.frame_conns,
                    size = size,
                    sync_id = self.sync_id,
                    "Sent state sync frame"
                );
            }
            Err(e) => {
                self.stats.send_failures += 1;
                warn!(
                    error = %e,
                    conns = self.frame_conns,
                    sync_id = self.sync_id,
                    "Failed to send state sync frame"
                );
            }
        }

        self.start_frame();
    }
}

fn write_header(buf: &mut [u8], sync_id: u8, size: u16, count: u8) {
    buf[0] = 0;
    buf[1] = sync_id;
    BigEndian::write_u16(&mut buf[2..4], size);
    buf[4] = count;
    buf[5] = SYNC_PROTO_VERSION;
    BigEndian::write_u16(&mut buf[6..8], 0);
}

fn encode_conn_record(conn: &ConnInfo, timeout_secs: u32) -> [u8; CONN_RECORD_SIZE] {
    let mut rec = [0u8; CONN_RECORD_SIZE];
    rec[1] = conn.key.protocol.as_u8();
    BigEndian::write_u16(&mut rec[2..4], CONN_RECORD_SIZE as u16);
    BigEndian::write_u32(&mut rec[4..8], conn.conn_flags);
    BigEndian::write_u16(&mut rec[8..10], conn.conn_state.sync_value());
    BigEndian::write_u16(&mut rec[10..12], conn.key.client_port);
    BigEndian::write_u16(&mut rec[12..14], conn.key.virtual_port);
    BigEndian::write_u16(&mut rec[14..16], conn.server_port);
    // fwmark stays zero
    BigEndian::write_u32(&mut rec[20..24], timeout_secs);
    BigEndian::write_u32(&mut rec[24..28], u32::from(conn.key.client_ip));
    BigEndian::write_u32(&mut rec[28..32], u32::from(conn.key.virtual_ip));
    BigEndian::write_u32(&mut rec[32..36], u32::from(conn.server_addr));
    rec
}
