//! Packet state machine for signed updates
//!
//! One packet runs through: authenticate, bind the account, validate and
//! apply each request element in order, fold the per-element outcomes into a
//! packet code, advance the sequence number on success, unbind, reply. The
//! bind/unbind bracket is the unit of mutual exclusion: two packets for the
//! same account never interleave their mutations.

use std::sync::Arc;

use crate::dns::auth::{self, AuthError, OwnershipValidator};
use crate::dns::protocol::{
    ElementCode, Opcode, PacketCode, ReplyPacket, RequestElement, UpdatePacket,
};
use crate::dns::store::{Backend, BoundAccount, StoreError};

pub struct RequestProcessor {
    backend: Arc<dyn Backend>,
    ownership: Arc<dyn OwnershipValidator>,
    /// Strict sequence equality checking. Off by default: replayed packets
    /// are then accepted, and idempotent upserts are the only protection.
    enforce_sequence: bool,
}

/// Packet-code folding. The first applied element decides between success
/// and failure; any later element with the opposite outcome moves the packet
/// to partial success, which never regresses.
fn fold(code: PacketCode, element_succeeded: bool) -> PacketCode {
    match (code, element_succeeded) {
        (PacketCode::NoElements, true) => PacketCode::Success,
        (PacketCode::Failure, true) => PacketCode::PartialSuccess,
        (PacketCode::NoElements, false) => PacketCode::Failure,
        (PacketCode::Success, false) => PacketCode::PartialSuccess,
        (other, _) => other,
    }
}

impl RequestProcessor {
    pub fn new(
        backend: Arc<dyn Backend>,
        ownership: Arc<dyn OwnershipValidator>,
        enforce_sequence: bool,
    ) -> RequestProcessor {
        RequestProcessor {
            backend,
            ownership,
            enforce_sequence,
        }
    }

    /// Process one datagram. `None` means the bytes were not an update
    /// packet at all and no reply should be sent; otherwise exactly one
    /// reply is owed to the sender.
    pub fn handle_packet(&self, raw: &[u8]) -> Option<ReplyPacket> {
        let now = chrono::Utc::now().timestamp();

        let packet = match auth::verify_update(raw, now) {
            Ok(packet) => packet,
            Err(AuthError::NotNup) => {
                log::debug!("ignoring non-update datagram");
                return None;
            }
            Err(AuthError::Malformed) => {
                return Some(ReplyPacket::minimal(PacketCode::Malformed));
            }
            Err(AuthError::VersionUnsupported) => {
                return Some(ReplyPacket::minimal(PacketCode::VersionUnsupported));
            }
            Err(AuthError::InvalidSignature {
                public_key,
                sequence_number,
            }) => {
                log::debug!("signature invalid, sending error reply");
                return Some(self.error_reply(
                    &public_key,
                    sequence_number,
                    PacketCode::InvalidSignature,
                ));
            }
        };

        let key_hash = auth::key_hash(&packet.public_key);

        if let Err(e) = self.backend.assure_account(&key_hash) {
            log::error!("assure_account failed for {}: {}", key_hash, e);
            return Some(self.error_reply(
                &packet.public_key,
                packet.sequence_number,
                PacketCode::Failure,
            ));
        }

        if self.enforce_sequence {
            match self.backend.sequence_number(&key_hash) {
                Ok(expected) if expected == packet.sequence_number => {}
                Ok(expected) => {
                    log::debug!(
                        "rejecting sequence {} for {}, expected {}",
                        packet.sequence_number,
                        key_hash,
                        expected
                    );
                    return Some(self.error_reply(
                        &packet.public_key,
                        packet.sequence_number,
                        PacketCode::InvalidSequence,
                    ));
                }
                Err(e) => {
                    log::error!("sequence lookup failed for {}: {}", key_hash, e);
                    return Some(self.error_reply(
                        &packet.public_key,
                        packet.sequence_number,
                        PacketCode::Failure,
                    ));
                }
            }
        }

        let (packet_code, element_codes) = self.process_elements(&key_hash, &packet);

        Some(self.build_reply(&packet, packet_code, element_codes))
    }

    /// Bind the account, apply each element, and fold the outcomes. A bind
    /// failure aborts the packet before any element runs.
    fn process_elements(
        &self,
        key_hash: &str,
        packet: &UpdatePacket,
    ) -> (PacketCode, Vec<ElementCode>) {
        let mut bound = match self.backend.bind(key_hash) {
            Ok(bound) => bound,
            Err(e) => {
                log::error!("bind failed for {}: {}", key_hash, e);
                return (PacketCode::Failure, Vec::new());
            }
        };

        let mut packet_code = PacketCode::NoElements;
        let mut element_codes = Vec::with_capacity(packet.elements.len());

        for element in &packet.elements {
            let mut code = element.check();
            if code == ElementCode::Success {
                match self.apply(&mut bound, element) {
                    Ok(()) => {
                        packet_code = fold(packet_code, true);
                    }
                    Err(e) => {
                        // One failing element never aborts the rest
                        log::error!("error applying element for {}: {}", key_hash, e);
                        code = ElementCode::BackendError;
                        packet_code = fold(packet_code, false);
                    }
                }
            } else {
                packet_code = fold(packet_code, false);
            }
            element_codes.push(code);
        }

        if packet_code == PacketCode::Success || packet_code == PacketCode::PartialSuccess {
            bound.increment_sequence_number();
        }

        if let Err(e) = self.backend.unbind(bound) {
            log::error!("unbind failed for {}: {}", key_hash, e);
        }

        (packet_code, element_codes)
    }

    fn apply(
        &self,
        bound: &mut BoundAccount,
        element: &RequestElement,
    ) -> Result<(), StoreError> {
        match element.opcode {
            Opcode::Add => self.backend.add_record(
                bound,
                &element.subdomain,
                &element.rrtype,
                &element.rrdata,
                element.ttl,
                &element.attributes,
            ),
            Opcode::Delete => self.backend.delete_records(
                bound,
                &element.subdomain,
                &element.rrtype,
                &element.rrdata,
            ),
            Opcode::Validate => {
                if !self
                    .ownership
                    .validate(&element.subdomain, bound.account.key_hash())
                {
                    log::info!(
                        "ownership of {} not proven for {}",
                        element.subdomain,
                        bound.account.key_hash()
                    );
                    return Err(StoreError::DomainNotValidated);
                }
                self.backend.update_suffix(bound, &element.subdomain)?;
                // Seed the apex SOA under the validated name
                self.backend.add_record(
                    bound,
                    "",
                    "SOA",
                    &format!("localhost {} 0", element.rrdata),
                    element.ttl,
                    &element.attributes,
                )
            }
            // check() has already rejected anything else
            Opcode::Unknown(_) => Ok(()),
        }
    }

    fn build_reply(
        &self,
        packet: &UpdatePacket,
        packet_code: PacketCode,
        element_codes: Vec<ElementCode>,
    ) -> ReplyPacket {
        let key_hash = auth::key_hash(&packet.public_key);
        let next_sequence = match self.backend.sequence_number(&key_hash) {
            Ok(seq) => seq,
            Err(e) => {
                log::warn!("could not read next sequence for {}: {}", key_hash, e);
                -1
            }
        };
        ReplyPacket {
            public_key: packet.public_key.clone(),
            echo_sequence: packet.sequence_number,
            next_sequence,
            packet_code,
            element_codes,
        }
    }

    /// Error reply that still echoes the key and claimed sequence number.
    /// The next-sequence field is best effort: -1 when the account is
    /// unknown or the store is unreachable.
    fn error_reply(&self, public_key: &[u8], sequence: i64, code: PacketCode) -> ReplyPacket {
        let next_sequence = if public_key.is_empty() {
            -1
        } else {
            self.backend
                .sequence_number(&auth::key_hash(public_key))
                .unwrap_or(-1)
        };
        ReplyPacket {
            public_key: public_key.to_vec(),
            echo_sequence: sequence,
            next_sequence,
            packet_code: code,
            element_codes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::auth::tests::{signed_packet, test_key_pair, StaticOwnershipValidator};
    use crate::dns::store::tests::MemoryBackend;
    use crate::dns::store::DEFAULT_SUFFIX_BASE;
    use ring::signature::KeyPair;

    fn processor(enforce_sequence: bool) -> (Arc<MemoryBackend>, RequestProcessor) {
        let backend = Arc::new(MemoryBackend::new());
        let processor = RequestProcessor::new(
            backend.clone(),
            Arc::new(StaticOwnershipValidator(true)),
            enforce_sequence,
        );
        (backend, processor)
    }

    fn add_element(subdomain: &str, content: &str) -> RequestElement {
        RequestElement::new(Opcode::Add, subdomain, "A", content, 300)
    }

    #[test]
    fn test_successful_add_round_trip() {
        let (backend, processor) = processor(false);
        let key_pair = test_key_pair(1);
        let elements = vec![add_element("www", "192.0.2.1")];
        let raw = signed_packet(&key_pair, 0, &elements);

        let reply = processor.handle_packet(&raw).unwrap();
        assert_eq!(PacketCode::Success, reply.packet_code);
        assert_eq!(vec![ElementCode::Success], reply.element_codes);
        assert_eq!(0, reply.echo_sequence);
        assert_eq!(1, reply.next_sequence);

        let hash = auth::key_hash(key_pair.public_key().as_ref());
        let fqdn = format!("www.{}.{}", hash, DEFAULT_SUFFIX_BASE);
        let answers = backend.answer_query(&fqdn, "IN", "A").unwrap();
        assert_eq!(1, answers.len());
        assert_eq!("192.0.2.1", answers[0].content);
    }

    #[test]
    fn test_repeated_add_is_idempotent() {
        let (backend, processor) = processor(false);
        let key_pair = test_key_pair(2);

        let first = signed_packet(&key_pair, 0, &[add_element("www", "192.0.2.1")]);
        processor.handle_packet(&first).unwrap();

        let mut updated = add_element("www", "192.0.2.1");
        updated.ttl = 900;
        let second = signed_packet(&key_pair, 1, &[updated]);
        let reply = processor.handle_packet(&second).unwrap();
        assert_eq!(PacketCode::Success, reply.packet_code);

        let hash = auth::key_hash(key_pair.public_key().as_ref());
        let fqdn = format!("www.{}.{}", hash, DEFAULT_SUFFIX_BASE);
        let info = backend.subdomain(&fqdn).unwrap();
        assert_eq!(1, info.records().len());
        assert_eq!(900, info.records()[0].ttl);
    }

    #[test]
    fn test_code_aggregation() {
        let (_, processor) = processor(false);
        let key_pair = test_key_pair(3);

        // Mixed outcomes fold to partial success
        let mixed = signed_packet(
            &key_pair,
            0,
            &[add_element("www", "192.0.2.1"), add_element("a..b", "192.0.2.1")],
        );
        let reply = processor.handle_packet(&mixed).unwrap();
        assert_eq!(PacketCode::PartialSuccess, reply.packet_code);
        assert_eq!(
            vec![ElementCode::Success, ElementCode::InvalidSubdomain],
            reply.element_codes
        );

        // All invalid folds to failure
        let failed = signed_packet(
            &key_pair,
            1,
            &[add_element("a..b", "192.0.2.1"), add_element("-x", "192.0.2.1")],
        );
        let reply = processor.handle_packet(&failed).unwrap();
        assert_eq!(PacketCode::Failure, reply.packet_code);

        // Empty packet reports that no elements were present
        let empty = signed_packet(&key_pair, 1, &[]);
        let reply = processor.handle_packet(&empty).unwrap();
        assert_eq!(PacketCode::NoElements, reply.packet_code);
    }

    #[test]
    fn test_sequence_advances_only_on_success() {
        let (backend, processor) = processor(false);
        let key_pair = test_key_pair(4);
        let hash = auth::key_hash(key_pair.public_key().as_ref());

        let failed = signed_packet(&key_pair, 0, &[add_element("a..b", "192.0.2.1")]);
        processor.handle_packet(&failed).unwrap();
        assert_eq!(0, backend.sequence_number(&hash).unwrap());

        let ok = signed_packet(&key_pair, 0, &[add_element("www", "192.0.2.1")]);
        let reply = processor.handle_packet(&ok).unwrap();
        assert_eq!(1, backend.sequence_number(&hash).unwrap());
        assert_eq!(1, reply.next_sequence);
    }

    #[test]
    fn test_enforced_sequence_rejects_mismatch() {
        let (backend, processor) = processor(true);
        let key_pair = test_key_pair(5);
        let hash = auth::key_hash(key_pair.public_key().as_ref());

        let stale = signed_packet(&key_pair, 7, &[add_element("www", "192.0.2.1")]);
        let reply = processor.handle_packet(&stale).unwrap();
        assert_eq!(PacketCode::InvalidSequence, reply.packet_code);
        assert_eq!(0, reply.next_sequence);
        // No state was touched
        assert_eq!(0, backend.sequence_number(&hash).unwrap());
        let fqdn = format!("www.{}.{}", hash, DEFAULT_SUFFIX_BASE);
        assert!(backend.subdomain(&fqdn).is_none());

        let current = signed_packet(&key_pair, 0, &[add_element("www", "192.0.2.1")]);
        let reply = processor.handle_packet(&current).unwrap();
        assert_eq!(PacketCode::Success, reply.packet_code);
        assert_eq!(1, reply.next_sequence);
    }

    #[test]
    fn test_tampered_packet_never_succeeds() {
        let (_, processor) = processor(false);
        let key_pair = test_key_pair(6);
        let mut raw = signed_packet(&key_pair, 0, &[add_element("www", "192.0.2.1")]);
        let mid = raw.len() / 3;
        raw[mid] ^= 0x40;

        let reply = processor.handle_packet(&raw).unwrap();
        assert_eq!(PacketCode::InvalidSignature, reply.packet_code);
        assert!(reply.element_codes.is_empty());
    }

    #[test]
    fn test_validate_moves_suffix_and_seeds_soa() {
        let (backend, processor) = processor(false);
        let key_pair = test_key_pair(7);

        let setup = signed_packet(&key_pair, 0, &[add_element("www", "192.0.2.1")]);
        processor.handle_packet(&setup).unwrap();

        let mut validate = RequestElement::new(Opcode::Validate, "example.com", "", "", 600);
        validate.rrdata = "hostmaster@example.com".to_string();
        let packet = signed_packet(&key_pair, 1, &[validate]);
        let reply = processor.handle_packet(&packet).unwrap();
        assert_eq!(PacketCode::Success, reply.packet_code);

        // Records moved under the vanity name
        let moved = backend.answer_query("www.example.com", "IN", "A").unwrap();
        assert_eq!(1, moved.len());

        // Apex SOA seeded
        let apex = backend.subdomain("example.com").unwrap();
        assert!(apex
            .records()
            .iter()
            .any(|r| r.rtype == "SOA" && r.content.contains("hostmaster@example.com")));

        // A second validation attempt must fail: the suffix is no longer
        // the auto-assigned one
        let validate_again =
            RequestElement::new(Opcode::Validate, "other.com", "", "", 600);
        let packet = signed_packet(&key_pair, 2, &[validate_again]);
        let reply = processor.handle_packet(&packet).unwrap();
        assert_eq!(PacketCode::Failure, reply.packet_code);
        assert_eq!(vec![ElementCode::BackendError], reply.element_codes);
    }

    #[test]
    fn test_refused_ownership_fails_element() {
        let backend = Arc::new(MemoryBackend::new());
        let processor = RequestProcessor::new(
            backend,
            Arc::new(StaticOwnershipValidator(false)),
            false,
        );
        let key_pair = test_key_pair(8);
        let validate = RequestElement::new(Opcode::Validate, "example.com", "", "", 600);
        let packet = signed_packet(&key_pair, 0, &[validate]);
        let reply = processor.handle_packet(&packet).unwrap();
        assert_eq!(PacketCode::Failure, reply.packet_code);
        assert_eq!(vec![ElementCode::BackendError], reply.element_codes);
    }

    #[test]
    fn test_delete_then_query_empty() {
        let (backend, processor) = processor(false);
        let key_pair = test_key_pair(9);
        let hash = auth::key_hash(key_pair.public_key().as_ref());

        let setup = signed_packet(
            &key_pair,
            0,
            &[add_element("www", "192.0.2.1"), add_element("www", "192.0.2.2")],
        );
        processor.handle_packet(&setup).unwrap();

        // Wildcard content delete removes both records
        let delete = RequestElement::new(Opcode::Delete, "www", "A", "", 0);
        let packet = signed_packet(&key_pair, 1, &[delete]);
        let reply = processor.handle_packet(&packet).unwrap();
        assert_eq!(PacketCode::Success, reply.packet_code);

        let fqdn = format!("www.{}.{}", hash, DEFAULT_SUFFIX_BASE);
        assert!(backend.answer_query(&fqdn, "IN", "A").unwrap().is_empty());
    }
}
