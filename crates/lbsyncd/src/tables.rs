//! Lookup tables shared with the forwarding path.
//!
//! [`Tables::prepare`] is called once at startup, before any traffic is
//! processed. The resulting handle is wrapped in an `Arc` and passed to the
//! registry engine, the aging engine and the forwarding path; nothing here
//! is global.

use crate::config::TablesConfig;
use lb_common::{
    AppInfo, ConnInfo, ConnKey, DbError, DbResult, DestInfo, DestKey, KeyedStore, MemStore,
    ServiceInfo, ServiceKey,
};
use tracing::{debug, info};

/// Key of the single application info record.
pub const APP_INFO_KEY: u8 = 0;

/// Every table the core reads or writes.
pub struct Tables {
    pub services: Box<dyn KeyedStore<ServiceKey, ServiceInfo>>,
    pub dests: Box<dyn KeyedStore<DestKey, DestInfo>>,
    /// Connection classification: 5-tuple to connection slot
    pub conn_class: Box<dyn KeyedStore<ConnKey, u32>>,
    /// Connection info, indexed by slot
    pub conn_info: Box<dyn KeyedStore<u32, ConnInfo>>,
    pub app_info: Box<dyn KeyedStore<u8, AppInfo>>,
    max_conns: u32,
}

impl Tables {
    /// Creates the in-memory tables sized from configuration.
    pub fn prepare(config: &TablesConfig) -> Self {
        debug!(max = config.max_services, "Creating service table");
        let services = MemStore::new("service", config.max_services);
        debug!(max = config.max_dests, "Creating destination table");
        let dests = MemStore::new("destination", config.max_dests);
        debug!(max = config.max_conns, "Creating connection tables");
        let conn_class = MemStore::new("conn_classification", config.max_conns);
        let conn_info = MemStore::new("conn_info", config.max_conns);
        let app_info = MemStore::new("application_info", 1);

        info!(
            max_services = config.max_services,
            max_dests = config.max_dests,
            max_conns = config.max_conns,
            "Tables prepared"
        );

        Self::from_stores(
            Box::new(services),
            Box::new(dests),
            Box::new(conn_class),
            Box::new(conn_info),
            Box::new(app_info),
            config.max_conns as u32,
        )
    }

    /// Assembles tables from arbitrary backends.
    pub fn from_stores(
        services: Box<dyn KeyedStore<ServiceKey, ServiceInfo>>,
        dests: Box<dyn KeyedStore<DestKey, DestInfo>>,
        conn_class: Box<dyn KeyedStore<ConnKey, u32>>,
        conn_info: Box<dyn KeyedStore<u32, ConnInfo>>,
        app_info: Box<dyn KeyedStore<u8, AppInfo>>,
        max_conns: u32,
    ) -> Self {
        Self {
            services,
            dests,
            conn_class,
            conn_info,
            app_info,
            max_conns,
        }
    }

    /// Number of connection slots.
    pub fn max_conns(&self) -> u32 {
        self.max_conns
    }

    /// Inserts a connection into both connection tables.
    ///
    /// This is the forwarding path's admission step; the core only uses it
    /// from tests and tooling.
    pub fn insert_conn(&self, index: u32, info: ConnInfo) -> DbResult<()> {
        if index >= self.max_conns {
            return Err(DbError::internal(format!(
                "connection slot {} out of range",
                index
            )));
        }
        self.conn_class.insert(info.key, index)?;
        self.conn_info.insert(index, info)
    }

    /// Removes a connection from the classification and info tables.
    pub fn delete_conn(&self, index: u32, key: &ConnKey) -> DbResult<()> {
        match self.conn_class.delete(key) {
            Ok(()) | Err(DbError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.conn_info.delete(&index)
    }

    /// Clears the service and destination tables.
    pub fn clear_registry(&self) -> DbResult<()> {
        let dests = self.dests.clear_all();
        let services = self.services.clear_all();
        dests.and(services)
    }

    /// Clears every table. Used during teardown.
    pub fn destroy(&self) -> DbResult<()> {
        let registry = self.clear_registry();
        let conn_class = self.conn_class.clear_all();
        let conn_info = self.conn_info.clear_all();
        let app_info = self.app_info.clear_all();
        registry.and(conn_class).and(conn_info).and(app_info)
    }

    /// Returns the application info record, if one was written.
    pub fn app_info(&self) -> DbResult<AppInfo> {
        self.app_info.lookup(&APP_INFO_KEY)
    }
}
