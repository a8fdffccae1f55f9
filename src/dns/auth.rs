//! Packet authentication and account identity
//!
//! Verification order is fixed: magic string, protocol version, structural
//! bounds, and only then the Ed25519 signature over the raw packet prefix
//! using the key embedded in the packet itself. Accounts are identified by
//! the SHA-1 hash of that key, rendered as 40 hex characters.

use derive_more::{Display, Error};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::Resolver;
use ring::signature::{UnparsedPublicKey, ED25519};
use sha1::{Digest, Sha1};

use crate::dns::buffer::VectorPacketBuffer;
use crate::dns::protocol::{ProtocolError, UpdatePacket, NUP_MAX_PACKET_LENGTH};

#[derive(Debug, Display, Error)]
pub enum AuthError {
    /// The datagram is not an update packet at all; no reply is owed.
    #[display(fmt = "not an update packet")]
    NotNup,
    #[display(fmt = "malformed packet")]
    Malformed,
    #[display(fmt = "unsupported protocol version")]
    VersionUnsupported,
    /// Structure was sound but the signature did not verify. The embedded
    /// key and claimed sequence number are carried so an error reply can
    /// still echo them.
    #[display(fmt = "invalid signature")]
    InvalidSignature {
        public_key: Vec<u8>,
        sequence_number: i64,
    },
}

/// Decode and authenticate a raw datagram.
pub fn verify_update(raw: &[u8], now: i64) -> Result<UpdatePacket, AuthError> {
    if raw.len() > NUP_MAX_PACKET_LENGTH {
        return Err(AuthError::Malformed);
    }

    let mut buffer = VectorPacketBuffer::from_bytes(raw);
    let packet = match UpdatePacket::from_buffer(&mut buffer, now) {
        Ok(packet) => packet,
        Err(ProtocolError::BadMagic) => return Err(AuthError::NotNup),
        Err(ProtocolError::UnsupportedVersion) => return Err(AuthError::VersionUnsupported),
        Err(ProtocolError::Buffer(_)) => return Err(AuthError::Malformed),
    };

    let verifier = UnparsedPublicKey::new(&ED25519, &packet.public_key);
    if verifier
        .verify(&raw[..packet.signed_len], &packet.signature)
        .is_err()
    {
        return Err(AuthError::InvalidSignature {
            public_key: packet.public_key,
            sequence_number: packet.sequence_number,
        });
    }

    Ok(packet)
}

/// Account identity for a public key: lowercase hex of its SHA-1 hash.
pub fn key_hash(public_key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(public_key);
    hex::encode(hasher.finalize())
}

/// Domain-ownership predicate consulted by VALIDATE elements.
pub trait OwnershipValidator: Send + Sync {
    /// Does the holder of `key_hash` control `domain`?
    fn validate(&self, domain: &str, key_hash: &str) -> bool;
}

/// Proves ownership through the DNS itself: the publisher is asked to create
/// a `validate-<keyhash>.<domain>` CNAME pointing at the service's suffix
/// base before submitting a VALIDATE element.
pub struct CnameOwnershipValidator {
    resolver: Resolver,
    suffix_base: String,
}

impl CnameOwnershipValidator {
    pub fn new(suffix_base: &str) -> std::io::Result<CnameOwnershipValidator> {
        let resolver = Resolver::new(ResolverConfig::default(), ResolverOpts::default())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(CnameOwnershipValidator {
            resolver,
            suffix_base: suffix_base.to_string(),
        })
    }
}

impl OwnershipValidator for CnameOwnershipValidator {
    fn validate(&self, domain: &str, key_hash: &str) -> bool {
        let probe = format!("validate-{}.{}.", key_hash, domain);
        let lookup = match self.resolver.lookup(probe.as_str(), RecordType::CNAME) {
            Ok(lookup) => lookup,
            Err(e) => {
                log::debug!("ownership probe for {} failed: {}", domain, e);
                return false;
            }
        };

        for rdata in lookup.iter() {
            if let RData::CNAME(target) = rdata {
                let target = target.to_string();
                if target.trim_end_matches('.') == self.suffix_base {
                    return true;
                }
            }
        }

        false
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::dns::protocol::{Opcode, RequestElement};
    use ring::signature::{Ed25519KeyPair, KeyPair};

    /// Ownership check that always answers the same way; shared with the
    /// processor tests.
    pub struct StaticOwnershipValidator(pub bool);

    impl OwnershipValidator for StaticOwnershipValidator {
        fn validate(&self, _domain: &str, _key_hash: &str) -> bool {
            self.0
        }
    }

    pub fn test_key_pair(seed: u8) -> Ed25519KeyPair {
        Ed25519KeyPair::from_seed_unchecked(&[seed; 32]).unwrap()
    }

    pub fn signed_packet(key_pair: &Ed25519KeyPair, sequence: i64, elements: &[RequestElement]) -> Vec<u8> {
        let mut buffer = VectorPacketBuffer::new();
        UpdatePacket::write_unsigned(
            &mut buffer,
            key_pair.public_key().as_ref(),
            sequence,
            elements,
        )
        .unwrap();
        let signature = key_pair.sign(&buffer.buffer);
        UpdatePacket::append_signature(&mut buffer, signature.as_ref()).unwrap();
        buffer.buffer
    }

    #[test]
    fn test_valid_signature_accepted() {
        let key_pair = test_key_pair(1);
        let elements = vec![RequestElement::new(Opcode::Add, "www", "A", "192.0.2.1", 60)];
        let raw = signed_packet(&key_pair, 3, &elements);

        let packet = verify_update(&raw, 0).unwrap();
        assert_eq!(3, packet.sequence_number);
        assert_eq!(elements, packet.elements);
    }

    #[test]
    fn test_bit_flip_in_signed_prefix_rejected() {
        let key_pair = test_key_pair(1);
        let elements = vec![RequestElement::new(Opcode::Add, "www", "A", "192.0.2.1", 60)];
        let mut raw = signed_packet(&key_pair, 3, &elements);

        // Flip one bit inside the request element region
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;

        match verify_update(&raw, 0) {
            Err(AuthError::InvalidSignature { .. }) => {}
            other => panic!("expected InvalidSignature, got {:?}", other),
        }
    }

    #[test]
    fn test_foreign_magic_is_not_nup() {
        match verify_update(b"GET / HTTP/1.1\r\n", 0) {
            Err(AuthError::NotNup) => {}
            other => panic!("expected NotNup, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_packet_malformed() {
        let key_pair = test_key_pair(1);
        let raw = signed_packet(&key_pair, 0, &[]);
        match verify_update(&raw[..raw.len() - 10], 0) {
            Err(AuthError::Malformed) => {}
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_key_hash_shape() {
        let hash = key_hash(&[0u8; 32]);
        assert_eq!(40, hash.len());
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
