//! Common abstractions for the load balancer control plane.
//!
//! This crate provides the types shared by the registry sync engine, the
//! connection aging engine and the state sync aggregator:
//!
//! - [`KeyedStore`]: Fixed key/result table capability (software or hardware backed)
//! - [`MemStore`]: Bounded in-memory [`KeyedStore`] backend
//! - [`DbError`]: Result classification for every table operation
//! - [`FlagUpdate`]: Masked flag update with a defined merge operation
//! - Service, destination and connection records
//!
//! # Architecture
//!
//! ```text
//! control events ──▶ registry sync ──▶ service / dest tables ──▶ forwarding path
//!                                                                   │
//!                        state sync ◀── aging sweep ◀── connection tables
//! ```
//!
//! Tables are always passed by handle; nothing in this crate is global.

mod flags;
mod status;
mod store;
mod types;

pub use flags::{service_flags, FlagUpdate};
pub use status::{DbError, DbResult, StatusKind};
pub use store::{KeyedStore, MemStore};
pub use types::{
    AppInfo, ConnInfo, ConnKey, ConnState, DestInfo, DestKey, FwdMethod, Protocol, ServiceInfo,
    ServiceKey, TimeoutClass, FWD_MASK,
};
