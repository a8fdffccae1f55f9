//! Typed attributes attached to published records
//!
//! An attribute is a small tagged value carried alongside a record: a relative
//! TTL, a traffic split proportion, a bandwidth cap, and so on. The variant
//! set is closed (integer, double, double-list); the numeric type id selects
//! the meaning. Attributes travel in two encodings: the compact wire form
//! inside update packets (u16 type, u16 length) and the persisted form used
//! between the request processor and the store (i32 type, i32 length).

use crate::dns::buffer::{BufferError, PacketBuffer};

/// Relative TTL in seconds, converted to `ATTR_EXPIRATION_TIME` at ingest.
pub const ATTR_RELATIVE_TTL: u16 = 1;
pub const ATTR_LATITUDE: u16 = 2;
pub const ATTR_LONGITUDE: u16 = 3;
pub const ATTR_SPLIT_PROPORTION: u16 = 4;
pub const ATTR_SPLIT_EPSILON: u16 = 5;
pub const ATTR_BANDWIDTH_CAP: u16 = 6;
/// Absolute expiration time, seconds since the epoch.
pub const ATTR_EXPIRATION_TIME: u16 = 7;
pub const ATTR_BIDIR_STATIC_MAP: u16 = 8;
pub const ATTR_ONEWAY_STATIC_MAP: u16 = 9;
pub const ATTR_DIST_ADJUSTMENT: u16 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum AttrData {
    Integer(i32),
    Double(f64),
    DoubleList(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordAttribute {
    pub type_id: u16,
    pub data: AttrData,
}

fn integer_from(payload: &[u8]) -> Option<i32> {
    if payload.len() != 4 {
        return None;
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(payload);
    Some(i32::from_be_bytes(raw))
}

fn double_from(payload: &[u8]) -> Option<f64> {
    if payload.len() != 8 {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(payload);
    Some(f64::from_bits(u64::from_be_bytes(raw)))
}

fn double_list_from(payload: &[u8]) -> Option<Vec<f64>> {
    if payload.is_empty() || payload.len() % 8 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(payload.len() / 8);
    for chunk in payload.chunks(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        out.push(f64::from_bits(u64::from_be_bytes(raw)));
    }
    Some(out)
}

impl RecordAttribute {
    pub fn integer(type_id: u16, data: i32) -> RecordAttribute {
        RecordAttribute {
            type_id,
            data: AttrData::Integer(data),
        }
    }

    pub fn double(type_id: u16, data: f64) -> RecordAttribute {
        RecordAttribute {
            type_id,
            data: AttrData::Double(data),
        }
    }

    pub fn double_list(type_id: u16, data: Vec<f64>) -> RecordAttribute {
        RecordAttribute {
            type_id,
            data: AttrData::DoubleList(data),
        }
    }

    /// Interpret an attribute arriving in an update packet.
    ///
    /// Returns `None` for unknown type ids and payloads whose length does not
    /// match the expected shape; callers skip such attributes. A relative TTL
    /// is converted here into an absolute expiration time, so the stored form
    /// is always `ATTR_EXPIRATION_TIME`.
    pub fn from_wire(type_id: u16, payload: &[u8], now: i64) -> Option<RecordAttribute> {
        match type_id {
            ATTR_RELATIVE_TTL => {
                let relative = integer_from(payload)?;
                let expires = now.wrapping_add(i64::from(relative)) as i32;
                Some(RecordAttribute::integer(ATTR_EXPIRATION_TIME, expires))
            }
            ATTR_SPLIT_PROPORTION | ATTR_SPLIT_EPSILON | ATTR_BANDWIDTH_CAP => {
                Some(RecordAttribute::double(type_id, double_from(payload)?))
            }
            ATTR_DIST_ADJUSTMENT => Some(RecordAttribute::double_list(
                type_id,
                double_list_from(payload)?,
            )),
            _ => None,
        }
    }

    /// Reconstruct an attribute from its persisted payload.
    pub fn from_persisted(type_id: u16, payload: &[u8]) -> Option<RecordAttribute> {
        match type_id {
            ATTR_RELATIVE_TTL | ATTR_EXPIRATION_TIME => {
                Some(RecordAttribute::integer(type_id, integer_from(payload)?))
            }
            ATTR_SPLIT_PROPORTION | ATTR_SPLIT_EPSILON | ATTR_BANDWIDTH_CAP => {
                Some(RecordAttribute::double(type_id, double_from(payload)?))
            }
            ATTR_DIST_ADJUSTMENT => Some(RecordAttribute::double_list(
                type_id,
                double_list_from(payload)?,
            )),
            _ => None,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match &self.data {
            AttrData::Integer(v) => v.to_be_bytes().to_vec(),
            AttrData::Double(v) => v.to_bits().to_be_bytes().to_vec(),
            AttrData::DoubleList(vs) => {
                let mut out = Vec::with_capacity(vs.len() * 8);
                for v in vs {
                    out.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                out
            }
        }
    }

    /// Wire form: `type:u16 | len:u16 | payload`.
    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<(), BufferError> {
        let payload = self.payload();
        buffer.write_u16(self.type_id)?;
        buffer.write_u16(payload.len() as u16)?;
        buffer.write_bytes(&payload)?;
        Ok(())
    }
}
