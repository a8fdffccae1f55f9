//! Wire codec for the signed update protocol
//!
//! An update packet carries a magic string, protocol version, the publisher's
//! public key, a sequence number, a list of request elements, and a trailing
//! signature over everything that precedes it. The reply mirrors the framing
//! and carries one status code for the packet plus one per request element.
//!
//! This codec is transport-transient only. Records handed to the store use a
//! separate length-prefixed encoding that lives with the store types.

use std::fmt;

use derive_more::{Display, Error, From};

use crate::dns::attrs::RecordAttribute;
use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::validate::{is_valid_rrdata, is_valid_rrtype, is_valid_subdomain};

pub const NUP_MAGIC: [u8; 5] = *b"DONAR";
pub const NUP_VERSION: u16 = 0;
pub const NUP_MAX_PACKET_LENGTH: usize = 1500;
pub const NUP_DEFAULT_PORT: u16 = 21001;

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    BadMagic,
    UnsupportedVersion,
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// Directive carried by one request element.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Opcode {
    Add,     // 0
    Delete,  // 1
    Validate, // 2
    Unknown(u16),
}

impl Opcode {
    pub fn to_num(&self) -> u16 {
        match *self {
            Opcode::Add => 0,
            Opcode::Delete => 1,
            Opcode::Validate => 2,
            Opcode::Unknown(x) => x,
        }
    }

    pub fn from_num(num: u16) -> Opcode {
        match num {
            0 => Opcode::Add,
            1 => Opcode::Delete,
            2 => Opcode::Validate,
            _ => Opcode::Unknown(num),
        }
    }
}

/// Outcome for a whole update packet.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum PacketCode {
    Success,            // 0
    Failure,            // 100
    PartialSuccess,     // 101
    NoElements,         // 103
    InvalidSignature,   // 200
    InvalidSequence,    // 300
    VersionUnsupported, // 400
    Malformed,          // 500
    Unknown(u16),
}

impl PacketCode {
    pub fn to_num(&self) -> u16 {
        match *self {
            PacketCode::Success => 0,
            PacketCode::Failure => 100,
            PacketCode::PartialSuccess => 101,
            PacketCode::NoElements => 103,
            PacketCode::InvalidSignature => 200,
            PacketCode::InvalidSequence => 300,
            PacketCode::VersionUnsupported => 400,
            PacketCode::Malformed => 500,
            PacketCode::Unknown(x) => x,
        }
    }

    pub fn from_num(num: u16) -> PacketCode {
        match num {
            0 => PacketCode::Success,
            100 => PacketCode::Failure,
            101 => PacketCode::PartialSuccess,
            103 => PacketCode::NoElements,
            200 => PacketCode::InvalidSignature,
            300 => PacketCode::InvalidSequence,
            400 => PacketCode::VersionUnsupported,
            500 => PacketCode::Malformed,
            _ => PacketCode::Unknown(num),
        }
    }

    pub fn description(&self) -> &'static str {
        match *self {
            PacketCode::Success => "update request successfully processed",
            PacketCode::Failure => "update request failed",
            PacketCode::PartialSuccess => "update request partially successful",
            PacketCode::NoElements => "update request contained no elements",
            PacketCode::InvalidSignature => "update request contained an invalid signature",
            PacketCode::InvalidSequence => "update request contained an invalid sequence number",
            PacketCode::VersionUnsupported => "update request packet version unsupported",
            PacketCode::Malformed => "update request packet malformed",
            PacketCode::Unknown(_) => "unknown error",
        }
    }
}

/// Outcome for a single request element.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ElementCode {
    Success,          // 0
    InvalidOpcode,    // 100
    InvalidSubdomain, // 200
    InvalidRrType,    // 301
    InvalidRrData,    // 400
    InvalidTtl,       // 500
    BackendError,     // 600
    Unknown(u16),
}

impl ElementCode {
    pub fn to_num(&self) -> u16 {
        match *self {
            ElementCode::Success => 0,
            ElementCode::InvalidOpcode => 100,
            ElementCode::InvalidSubdomain => 200,
            ElementCode::InvalidRrType => 301,
            ElementCode::InvalidRrData => 400,
            ElementCode::InvalidTtl => 500,
            ElementCode::BackendError => 600,
            ElementCode::Unknown(x) => x,
        }
    }

    pub fn from_num(num: u16) -> ElementCode {
        match num {
            0 => ElementCode::Success,
            100 => ElementCode::InvalidOpcode,
            200 => ElementCode::InvalidSubdomain,
            301 => ElementCode::InvalidRrType,
            400 => ElementCode::InvalidRrData,
            500 => ElementCode::InvalidTtl,
            600 => ElementCode::BackendError,
            _ => ElementCode::Unknown(num),
        }
    }

    pub fn description(&self) -> &'static str {
        match *self {
            ElementCode::Success => "success",
            ElementCode::InvalidOpcode => "invalid opcode",
            ElementCode::InvalidSubdomain => "invalid subdomain",
            ElementCode::InvalidRrType => "unsupported record type",
            ElementCode::InvalidRrData => "invalid record data",
            ElementCode::InvalidTtl => "invalid TTL",
            ElementCode::BackendError => "could not process due to a backend error",
            ElementCode::Unknown(_) => "unknown error",
        }
    }
}

/// One directive within an update packet.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestElement {
    pub opcode: Opcode,
    pub subdomain: String,
    pub rrtype: String,
    pub rrdata: String,
    pub ttl: i32,
    pub attributes: Vec<RecordAttribute>,
}

impl RequestElement {
    pub fn new(
        opcode: Opcode,
        subdomain: &str,
        rrtype: &str,
        rrdata: &str,
        ttl: i32,
    ) -> RequestElement {
        RequestElement {
            opcode,
            subdomain: subdomain.to_string(),
            rrtype: rrtype.to_string(),
            rrdata: rrdata.to_string(),
            ttl,
            attributes: Vec::new(),
        }
    }

    /// Decode one element. Unknown or malformed attributes are skipped;
    /// structural truncation is an error.
    pub fn read<T: PacketBuffer>(buffer: &mut T, now: i64) -> Result<RequestElement> {
        let opcode = Opcode::from_num(buffer.read_u16()?);

        let sub_len = buffer.read_u16()? as usize;
        let subdomain = String::from_utf8_lossy(&buffer.read_bytes(sub_len)?).into_owned();

        let type_len = buffer.read_u16()? as usize;
        let rrtype = String::from_utf8_lossy(&buffer.read_bytes(type_len)?).into_owned();

        let data_len = buffer.read_u32()? as usize;
        let rrdata = String::from_utf8_lossy(&buffer.read_bytes(data_len)?).into_owned();

        let ttl = buffer.read_u32()? as i32;

        let attr_count = buffer.read_u16()?;
        let mut attributes = Vec::new();
        for _ in 0..attr_count {
            let type_id = buffer.read_u16()?;
            let len = buffer.read_u16()? as usize;
            let payload = buffer.read_bytes(len)?;
            if let Some(attr) = RecordAttribute::from_wire(type_id, &payload, now) {
                attributes.push(attr);
            }
        }

        Ok(RequestElement {
            opcode,
            subdomain,
            rrtype,
            rrdata,
            ttl,
            attributes,
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.opcode.to_num())?;
        buffer.write_u16(self.subdomain.len() as u16)?;
        buffer.write_bytes(self.subdomain.as_bytes())?;
        buffer.write_u16(self.rrtype.len() as u16)?;
        buffer.write_bytes(self.rrtype.as_bytes())?;
        buffer.write_u32(self.rrdata.len() as u32)?;
        buffer.write_bytes(self.rrdata.as_bytes())?;
        buffer.write_u32(self.ttl as u32)?;
        buffer.write_u16(self.attributes.len() as u16)?;
        for attr in &self.attributes {
            attr.write(buffer)?;
        }
        Ok(())
    }

    /// Validate the element's fields against its opcode.
    pub fn check(&self) -> ElementCode {
        match self.opcode {
            Opcode::Add => {
                if !is_valid_subdomain(&self.subdomain) {
                    return ElementCode::InvalidSubdomain;
                }
                if !is_valid_rrtype(&self.rrtype) {
                    return ElementCode::InvalidRrType;
                }
                if !is_valid_rrdata(&self.rrdata, &self.rrtype) {
                    return ElementCode::InvalidRrData;
                }
                if self.ttl <= 0 {
                    return ElementCode::InvalidTtl;
                }
            }
            Opcode::Delete => {
                if !is_valid_subdomain(&self.subdomain) {
                    return ElementCode::InvalidSubdomain;
                }
            }
            Opcode::Validate => {
                if !is_valid_subdomain(&self.subdomain) || self.subdomain.is_empty() {
                    return ElementCode::InvalidSubdomain;
                }
                if self.ttl <= 0 {
                    return ElementCode::InvalidTtl;
                }
            }
            Opcode::Unknown(_) => return ElementCode::InvalidOpcode,
        }

        ElementCode::Success
    }
}

/// A decoded update packet, together with the signature bytes and the length
/// of the prefix the signature covers.
#[derive(Debug, Clone)]
pub struct UpdatePacket {
    pub public_key: Vec<u8>,
    pub sequence_number: i64,
    pub elements: Vec<RequestElement>,
    pub signature: Vec<u8>,
    pub signed_len: usize,
}

impl UpdatePacket {
    /// Structural decode. Order matters: magic, then version, then the
    /// length-prefixed fields, each bounds-checked before use. No element is
    /// interpreted once an earlier stage has failed.
    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T, now: i64) -> Result<UpdatePacket> {
        let magic = buffer.read_bytes(NUP_MAGIC.len())?;
        if magic != NUP_MAGIC {
            return Err(ProtocolError::BadMagic);
        }

        let version = buffer.read_u16()?;
        if version != NUP_VERSION {
            return Err(ProtocolError::UnsupportedVersion);
        }

        let key_len = buffer.read_u16()? as usize;
        let public_key = buffer.read_bytes(key_len)?;
        let sequence_number = buffer.read_u64()? as i64;

        let element_count = buffer.read_u16()?;
        let mut elements = Vec::new();
        for _ in 0..element_count {
            elements.push(RequestElement::read(buffer, now)?);
        }

        // Everything up to this point is covered by the signature
        let signed_len = buffer.pos();
        let sig_len = buffer.read_u16()? as usize;
        let signature = buffer.read_bytes(sig_len)?;

        Ok(UpdatePacket {
            public_key,
            sequence_number,
            elements,
            signature,
            signed_len,
        })
    }

    /// Write the signed prefix: everything except the trailing signature.
    /// The caller signs the buffer contents and appends the signature with
    /// [`append_signature`](UpdatePacket::append_signature).
    pub fn write_unsigned<T: PacketBuffer>(
        buffer: &mut T,
        public_key: &[u8],
        sequence_number: i64,
        elements: &[RequestElement],
    ) -> Result<()> {
        buffer.write_bytes(&NUP_MAGIC)?;
        buffer.write_u16(NUP_VERSION)?;
        buffer.write_u16(public_key.len() as u16)?;
        buffer.write_bytes(public_key)?;
        buffer.write_u64(sequence_number as u64)?;
        buffer.write_u16(elements.len() as u16)?;
        for element in elements {
            element.write(buffer)?;
        }
        Ok(())
    }

    pub fn append_signature<T: PacketBuffer>(buffer: &mut T, signature: &[u8]) -> Result<()> {
        buffer.write_u16(signature.len() as u16)?;
        buffer.write_bytes(signature)?;
        Ok(())
    }
}

/// Reply to an update packet. `next_sequence` is the store's view of the
/// account's next expected sequence number after processing; both sequence
/// fields are -1 in minimal replies.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyPacket {
    pub public_key: Vec<u8>,
    pub echo_sequence: i64,
    pub next_sequence: i64,
    pub packet_code: PacketCode,
    pub element_codes: Vec<ElementCode>,
}

impl ReplyPacket {
    /// A reply carrying only a packet code: no key, no sequence guarantee,
    /// no per-element codes. Used when a packet fails before authentication
    /// completes.
    pub fn minimal(packet_code: PacketCode) -> ReplyPacket {
        ReplyPacket {
            public_key: Vec::new(),
            echo_sequence: -1,
            next_sequence: -1,
            packet_code,
            element_codes: Vec::new(),
        }
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<ReplyPacket> {
        let magic = buffer.read_bytes(NUP_MAGIC.len())?;
        if magic != NUP_MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        let version = buffer.read_u16()?;
        if version != NUP_VERSION {
            return Err(ProtocolError::UnsupportedVersion);
        }

        let key_len = buffer.read_u16()? as usize;
        let public_key = buffer.read_bytes(key_len)?;
        let echo_sequence = buffer.read_u64()? as i64;
        let next_sequence = buffer.read_u64()? as i64;

        let element_count = buffer.read_u16()?;
        let packet_code = PacketCode::from_num(buffer.read_u16()?);
        let mut element_codes = Vec::new();
        for _ in 0..element_count {
            element_codes.push(ElementCode::from_num(buffer.read_u16()?));
        }

        Ok(ReplyPacket {
            public_key,
            echo_sequence,
            next_sequence,
            packet_code,
            element_codes,
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_bytes(&NUP_MAGIC)?;
        buffer.write_u16(NUP_VERSION)?;
        buffer.write_u16(self.public_key.len() as u16)?;
        buffer.write_bytes(&self.public_key)?;
        buffer.write_u64(self.echo_sequence as u64)?;
        buffer.write_u64(self.next_sequence as u64)?;
        buffer.write_u16(self.element_codes.len() as u16)?;
        buffer.write_u16(self.packet_code.to_num())?;
        for code in &self.element_codes {
            buffer.write_u16(code.to_num())?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        self.write(&mut buffer)?;
        Ok(buffer.buffer)
    }

    pub fn is_success(&self) -> bool {
        self.packet_code == PacketCode::Success
    }
}

impl fmt::Display for ReplyPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "packet successfully processed");
        }

        // Per-element detail is only interesting when something went wrong
        write!(f, "request not successful: {}", self.packet_code.description())?;
        for (i, code) in self.element_codes.iter().enumerate() {
            write!(f, "\nrequest element {}: {}", i, code.description())?;
        }
        Ok(())
    }
}
