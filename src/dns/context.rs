//! The `ServerContext` holds configuration and statistics shared across the server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use derive_more::{Display, Error, From};

use crate::dns::auth::{CnameOwnershipValidator, OwnershipValidator};
use crate::dns::kvstore::KvBackend;
use crate::dns::protocol::NUP_DEFAULT_PORT;
use crate::dns::proximity::{GeoLookup, MaxmindGeoLookup, ProximityResolver, TableGeoLookup};
use crate::dns::store::{Backend, StoreError, DEFAULT_SUFFIX_BASE};

#[derive(Debug, Display, From, Error)]
pub enum ContextError {
    Store(StoreError),
    Io(std::io::Error),
    Geo(maxminddb::MaxMindDBError),
}

type Result<T> = std::result::Result<T, ContextError>;

pub struct ServerStatistics {
    pub update_packet_count: AtomicUsize,
    pub dropped_packet_count: AtomicUsize,
}

impl ServerStatistics {
    pub fn get_update_packet_count(&self) -> usize {
        self.update_packet_count.load(Ordering::Acquire)
    }

    pub fn get_dropped_packet_count(&self) -> usize {
        self.dropped_packet_count.load(Ordering::Acquire)
    }
}

/// Configuration and runtime state for the update service.
pub struct ServerContext {
    /// Addresses the update listener binds.
    pub listen_addrs: Vec<SocketAddr>,
    /// Host and port of the replicated key/value store peer.
    pub store_host: String,
    pub store_port: u16,
    /// Base under which fresh accounts publish (`<keyhash>.<base>`).
    pub suffix_base: String,
    /// Maximum concurrently active packet handlers; excess datagrams are
    /// dropped rather than queued.
    pub handler_ceiling: usize,
    /// Strict sequence-number equality checking.
    pub enforce_sequence: bool,
    /// Address answers returned per query.
    pub max_records: usize,
    /// Larger answer size for measurement platforms, and the name suffixes
    /// that qualify for it.
    pub measurement_max: usize,
    pub measurement_suffixes: Vec<String>,
    /// Path to a MaxMind city database. Without one, answers are returned
    /// unranked.
    pub geoip_db: Option<String>,
    pub statistics: ServerStatistics,
}

impl Default for ServerContext {
    fn default() -> Self {
        ServerContext::new()
    }
}

impl ServerContext {
    pub fn new() -> ServerContext {
        ServerContext {
            listen_addrs: vec![SocketAddr::from(([0, 0, 0, 0], NUP_DEFAULT_PORT))],
            store_host: "localhost".to_string(),
            store_port: 2727,
            suffix_base: DEFAULT_SUFFIX_BASE.to_string(),
            handler_ceiling: 100,
            enforce_sequence: false,
            max_records: 1,
            measurement_max: 3,
            measurement_suffixes: vec!["measurement-lab.org".to_string()],
            geoip_db: None,
            statistics: ServerStatistics {
                update_packet_count: AtomicUsize::new(0),
                dropped_packet_count: AtomicUsize::new(0),
            },
        }
    }

    /// Connect the configured storage adapter.
    pub fn create_backend(&self) -> Result<Arc<dyn Backend>> {
        let backend = KvBackend::connect(&self.store_host, self.store_port, &self.suffix_base)?;
        Ok(Arc::new(backend))
    }

    pub fn create_ownership_validator(&self) -> Result<Arc<dyn OwnershipValidator>> {
        Ok(Arc::new(CnameOwnershipValidator::new(&self.suffix_base)?))
    }

    /// Build the answer-ranking resolver. Falls back to an empty coordinate
    /// table when no geo database is configured, which leaves every answer
    /// an unranked bounded prefix.
    pub fn create_proximity_resolver(&self) -> Result<ProximityResolver> {
        let geo: Box<dyn GeoLookup> = match &self.geoip_db {
            Some(path) => Box::new(MaxmindGeoLookup::open(path)?),
            None => Box::new(TableGeoLookup::new()),
        };
        Ok(ProximityResolver::new(geo, self.max_records)
            .with_measurement_domains(self.measurement_suffixes.clone(), self.measurement_max))
    }
}
