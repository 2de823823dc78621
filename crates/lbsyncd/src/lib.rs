//! Load Balancer Sync Daemon
//!
//! Keeps the forwarding path's service and destination tables in sync with
//! an external configuration authority, ages out idle connections, and
//! replicates still-active connections to a backup node.
//!
//! Components:
//! - [`registry`]: applies control events and the bootstrap dump
//! - [`aging`]: windowed sweep over the connection table
//! - [`state_sync`]: packs active connections into sync frames
//! - [`exit`]: cooperative fatal-error path
//! - [`daemon`]: control loop supervisor and aging timer
//! - [`metrics`]: Prometheus counters for events, sweeps and sync frames

pub mod aging;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod exit;
pub mod metrics;
pub mod registry;
pub mod state_sync;
pub mod tables;
pub mod transport;

pub use aging::{AgeOut, AgingEngine, AppInfoLookup, ConnIterations, RefreshAgeOut, SweepReport, TimeoutIterations};
pub use config::{LbsyncConfig, DEFAULT_CONFIG_PATH};
pub use control::{
    decode_event, Command, ControlEvent, ControlSource, DaemonAttrs, DaemonState, DecodeError,
    DestAttrs, RawEvent, ServiceAttrs,
};
pub use daemon::{spawn_aging_timer, Daemon};
pub use error::{LbsyncError, Result};
pub use exit::{ExitController, FatalError};
pub use metrics::MetricsCollector;
pub use registry::{BootstrapReport, EventOutcome, EventStats, RegistrySync};
pub use state_sync::{PeerTransport, SyncAggregator, SyncStats, SyncStatus, UdpPeerTransport};
pub use tables::Tables;
pub use transport::UnixControlSource;
