//! Configuration file support for lbsyncd
//!
//! Loads and validates lbsyncd configuration from TOML files.
//! Default location: /etc/lbsyncd/lbsyncd.toml

use crate::error::{LbsyncError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lbsyncd/lbsyncd.toml";

/// Control source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Unix datagram socket this daemon binds to receive events
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Unix datagram socket of the configuration authority (dump requests)
    #[serde(default = "default_authority_path")]
    pub authority_path: PathBuf,

    /// Receive timeout; bounds how long a cancellation can go unnoticed
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// Largest control message accepted
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: usize,

    /// How long to wait for a dump reply
    #[serde(default = "default_dump_timeout_ms")]
    pub dump_timeout_ms: u64,
}

/// Table sizing, applied once when the tables are prepared
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablesConfig {
    #[serde(default = "default_max_services")]
    pub max_services: usize,

    #[serde(default = "default_max_dests")]
    pub max_dests: usize,

    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
}

/// Registry sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Scheduler names the forwarding path implements
    #[serde(default = "default_supported_schedulers")]
    pub supported_schedulers: Vec<String>,
}

/// Connection aging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgingConfig {
    /// Connection slots scanned by one timer job
    #[serde(default = "default_scan_entries_per_job")]
    pub scan_entries_per_job: u32,

    /// Wall-clock length of one full sweep over the connection table
    #[serde(default = "default_iteration_secs")]
    pub iteration_secs: u64,

    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,

    #[serde(default = "default_tcp_fin_timeout")]
    pub tcp_fin_timeout_secs: u64,

    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,
}

/// Connection state sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncConfig {
    /// Backup node (or multicast group) receiving sync frames
    #[serde(default = "default_peer_addr")]
    pub peer_addr: SocketAddr,

    /// Upper bound for one sync frame, header included
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Complete lbsyncd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LbsyncConfig {
    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub tables: TablesConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub aging: AgingConfig,

    #[serde(default)]
    pub state_sync: StateSyncConfig,
}

// Default functions
fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/lbsyncd/control.sock")
}

fn default_authority_path() -> PathBuf {
    PathBuf::from("/var/run/lbsyncd/authority.sock")
}

fn default_recv_timeout_ms() -> u64 {
    1000
}

fn default_max_msg_size() -> usize {
    0x8000
}

fn default_dump_timeout_ms() -> u64 {
    5000
}

fn default_max_services() -> usize {
    256
}

fn default_max_dests() -> usize {
    16 * 1024
}

fn default_max_conns() -> usize {
    1 << 20
}

fn default_supported_schedulers() -> Vec<String> {
    vec!["rr".to_string(), "wrr".to_string(), "sh".to_string()]
}

fn default_scan_entries_per_job() -> u32 {
    4096
}

fn default_iteration_secs() -> u64 {
    16
}

fn default_tcp_timeout() -> u64 {
    900
}

fn default_tcp_fin_timeout() -> u64 {
    120
}

fn default_udp_timeout() -> u64 {
    300
}

fn default_peer_addr() -> SocketAddr {
    SocketAddr::from(([224, 0, 0, 81], 8848))
}

fn default_max_frame_size() -> usize {
    1472
}

// Default implementations
impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            authority_path: default_authority_path(),
            recv_timeout_ms: default_recv_timeout_ms(),
            max_msg_size: default_max_msg_size(),
            dump_timeout_ms: default_dump_timeout_ms(),
        }
    }
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            max_services: default_max_services(),
            max_dests: default_max_dests(),
            max_conns: default_max_conns(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            supported_schedulers: default_supported_schedulers(),
        }
    }
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            scan_entries_per_job: default_scan_entries_per_job(),
            iteration_secs: default_iteration_secs(),
            tcp_timeout_secs: default_tcp_timeout(),
            tcp_fin_timeout_secs: default_tcp_fin_timeout(),
            udp_timeout_secs: default_udp_timeout(),
        }
    }
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            peer_addr: default_peer_addr(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ControlConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn dump_timeout(&self) -> Duration {
        Duration::from_millis(self.dump_timeout_ms)
    }
}

impl AgingConfig {
    /// Number of timer jobs needed to cover a table of `max_conns` slots.
    pub fn jobs_per_iteration(&self, max_conns: usize) -> u32 {
        let per_job = self.scan_entries_per_job.max(1) as usize;
        max_conns.div_ceil(per_job).max(1) as u32
    }

    /// Interval between two consecutive timer jobs.
    pub fn job_interval(&self, max_conns: usize) -> Duration {
        Duration::from_secs(self.iteration_secs) / self.jobs_per_iteration(max_conns)
    }
}

impl LbsyncConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config = toml::from_str(&content).map_err(|e| {
                    LbsyncError::Config(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(LbsyncError::Io(e)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.control.recv_timeout_ms == 0 {
            return Err(LbsyncError::Config(
                "recv_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.control.dump_timeout_ms == 0 || self.control.max_msg_size == 0 {
            return Err(LbsyncError::Config(
                "dump_timeout_ms and max_msg_size must be > 0".to_string(),
            ));
        }

        if self.tables.max_services == 0 || self.tables.max_dests == 0 || self.tables.max_conns == 0
        {
            return Err(LbsyncError::Config(
                "table sizes must be > 0".to_string(),
            ));
        }

        if self.tables.max_conns > u32::MAX as usize {
            return Err(LbsyncError::Config(
                "max_conns must fit a 32-bit slot index".to_string(),
            ));
        }

        if self.aging.scan_entries_per_job == 0 {
            return Err(LbsyncError::Config(
                "scan_entries_per_job must be > 0".to_string(),
            ));
        }

        if self.aging.iteration_secs == 0 {
            return Err(LbsyncError::Config(
                "iteration_secs must be > 0".to_string(),
            ));
        }

        if self.aging.job_interval(self.tables.max_conns).is_zero() {
            return Err(LbsyncError::Config(format!(
                "iteration_secs {} is too short for {} aging jobs per iteration",
                self.aging.iteration_secs,
                self.aging.jobs_per_iteration(self.tables.max_conns)
            )));
        }

        if self.state_sync.max_frame_size < crate::state_sync::MIN_FRAME_SIZE {
            return Err(LbsyncError::Config(format!(
                "max_frame_size must be >= {}",
                crate::state_sync::MIN_FRAME_SIZE
            )));
        }

        if self.registry.supported_schedulers.is_empty() {
            return Err(LbsyncError::Config(
                "supported_schedulers must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
