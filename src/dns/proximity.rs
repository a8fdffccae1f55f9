//! Proximity ranking of address answers
//!
//! Address answers are ordered by great-circle distance between the
//! requesting client and each record's target, so the closest published
//! replica is handed out first. Targets at the same distance are shuffled so
//! co-located replicas share the load, and the answer is truncated to a
//! configured count. Everything that is not an A record passes through
//! untouched.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::dns::store::{AnswerRecord, Backend, StoreError};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Jitter added to every computed distance, in km. Breaks exact ties fairly
/// without reordering targets that are meaningfully apart.
const DISTANCE_JITTER_KM: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// External geo-IP collaborator. `None` means the address cannot be located.
pub trait GeoLookup: Send + Sync {
    fn locate(&self, ip: IpAddr) -> Option<Coordinates>;
}

/// GeoLookup backed by a MaxMind city database file.
pub struct MaxmindGeoLookup {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxmindGeoLookup {
    pub fn open(path: &str) -> std::result::Result<MaxmindGeoLookup, maxminddb::MaxMindDBError> {
        let reader = maxminddb::Reader::open_readfile(path)?;
        Ok(MaxmindGeoLookup { reader })
    }
}

impl GeoLookup for MaxmindGeoLookup {
    fn locate(&self, ip: IpAddr) -> Option<Coordinates> {
        let city: maxminddb::geoip2::City = self.reader.lookup(ip).ok()?;
        let location = city.location?;
        match (location.latitude, location.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

/// Fixed coordinate table. Useful as a small override set and as a test
/// double for the MaxMind reader.
#[derive(Default)]
pub struct TableGeoLookup {
    entries: HashMap<IpAddr, Coordinates>,
}

impl TableGeoLookup {
    pub fn new() -> TableGeoLookup {
        TableGeoLookup {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, ip: IpAddr, latitude: f64, longitude: f64) {
        self.entries.insert(
            ip,
            Coordinates {
                latitude,
                longitude,
            },
        );
    }
}

impl GeoLookup for TableGeoLookup {
    fn locate(&self, ip: IpAddr) -> Option<Coordinates> {
        self.entries.get(&ip).copied()
    }
}

pub fn haversine_distance_km(a: Coordinates, b: Coordinates) -> f64 {
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

pub struct ProximityResolver {
    geo: Box<dyn GeoLookup>,
    max_records: usize,
    measurement_max: usize,
    measurement_suffixes: Vec<String>,
}

impl ProximityResolver {
    pub fn new(geo: Box<dyn GeoLookup>, max_records: usize) -> ProximityResolver {
        ProximityResolver {
            geo,
            max_records,
            measurement_max: max_records,
            measurement_suffixes: Vec::new(),
        }
    }

    /// Names under these suffixes get a larger answer, for measurement
    /// platforms that want several vantage points per query.
    pub fn with_measurement_domains(
        mut self,
        suffixes: Vec<String>,
        measurement_max: usize,
    ) -> ProximityResolver {
        self.measurement_suffixes = suffixes;
        self.measurement_max = measurement_max;
        self
    }

    fn max_for(&self, qname: &str) -> usize {
        if self
            .measurement_suffixes
            .iter()
            .any(|suffix| qname.ends_with(suffix.as_str()))
        {
            self.measurement_max
        } else {
            self.max_records
        }
    }

    /// Read path entry point: fetch the records for a query from the store
    /// and rank the address answers by client proximity.
    pub fn resolve(
        &self,
        backend: &dyn Backend,
        qname: &str,
        qclass: &str,
        qtype: &str,
        client_ip: &str,
    ) -> std::result::Result<Vec<AnswerRecord>, StoreError> {
        let records = backend.answer_query(qname, qclass, qtype)?;
        Ok(self.rank(qname, qtype, client_ip, records))
    }

    /// Order and truncate an answer set for one client. Ranking only applies
    /// to address queries; everything else is returned as-is.
    pub fn rank(
        &self,
        qname: &str,
        qtype: &str,
        client_ip: &str,
        records: Vec<AnswerRecord>,
    ) -> Vec<AnswerRecord> {
        if qtype != "A" && qtype != "ANY" {
            return records;
        }

        let max = self.max_for(qname);

        let client = client_ip
            .parse::<IpAddr>()
            .ok()
            .and_then(|ip| self.geo.locate(ip));
        let client = match client {
            Some(coordinates) => coordinates,
            None => {
                // No vantage point to rank from; bound the answer and move on
                log::debug!("client {} not geolocatable, returning prefix", client_ip);
                let mut out = records;
                out.truncate(max);
                return out;
            }
        };

        let mut out = Vec::new();
        let mut ranked: Vec<(f64, AnswerRecord)> = Vec::new();
        let mut rng = rand::thread_rng();

        for record in records {
            if record.rtype != "A" {
                out.push(record);
                continue;
            }
            let distance = record
                .content
                .parse::<Ipv4Addr>()
                .ok()
                .and_then(|ip| self.geo.locate(IpAddr::V4(ip)))
                .map(|target| {
                    haversine_distance_km(client, target) + rng.gen::<f64>() * DISTANCE_JITTER_KM
                })
                .unwrap_or(f64::INFINITY);
            ranked.push((distance, record));
        }

        ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        // Walk ascending groups of equal distance, shuffling within each so
        // co-located targets are picked in random order
        let mut added = 0;
        let mut index = 0;
        while index < ranked.len() && added < max {
            let mut end = index + 1;
            while end < ranked.len() && ranked[end].0 == ranked[index].0 {
                end += 1;
            }
            let mut group: Vec<AnswerRecord> =
                ranked[index..end].iter().map(|(_, r)| r.clone()).collect();
            group.shuffle(&mut rng);
            for record in group {
                if added >= max {
                    break;
                }
                out.push(record);
                added += 1;
            }
            index = end;
        }

        out
    }
}
