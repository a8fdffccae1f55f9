//! End-to-end exercise of the update path: a signed packet travels over UDP
//! through the listener and processor into a key/value store peer, and the
//! published records come back out through the proximity-ranked query path.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ring::signature::{Ed25519KeyPair, KeyPair};

use donar::dns::auth::OwnershipValidator;
use donar::dns::buffer::VectorPacketBuffer;
use donar::dns::client::UpdateConnection;
use donar::dns::context::ServerContext;
use donar::dns::kvstore::KvBackend;
use donar::dns::processor::RequestProcessor;
use donar::dns::protocol::{Opcode, PacketCode, RequestElement, UpdatePacket};
use donar::dns::proximity::{ProximityResolver, TableGeoLookup};
use donar::dns::server::UdpUpdateServer;
use donar::dns::store::Backend;

/// Minimal store peer speaking the line protocol against a hash map.
fn spawn_store_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind store peer");
    let addr = listener.local_addr().expect("store peer addr");
    let state: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));

    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => continue,
            };
            let state = state.clone();
            thread::spawn(move || serve_connection(stream, state));
        }
    });

    addr
}

fn serve_connection(stream: TcpStream, state: Arc<Mutex<HashMap<String, Vec<u8>>>>) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let tokens: Vec<String> = line.split_whitespace().map(|t| t.to_string()).collect();
        match tokens.first().map(|t| t.as_str()) {
            Some("GET") if tokens.len() == 2 => {
                let reply = match state.lock().unwrap().get(&tokens[1]) {
                    Some(value) => {
                        let mut out = format!("VALUE {}\r\n", value.len()).into_bytes();
                        out.extend_from_slice(value);
                        out.extend_from_slice(b"\r\n");
                        out
                    }
                    None => b"NOT_FOUND\r\n".to_vec(),
                };
                if reader.get_mut().write_all(&reply).is_err() {
                    return;
                }
            }
            Some("SET") if tokens.len() == 3 => {
                let len: usize = match tokens[2].parse() {
                    Ok(len) => len,
                    Err(_) => return,
                };
                let mut value = vec![0u8; len];
                if reader.read_exact(&mut value).is_err() {
                    return;
                }
                let mut crlf = String::new();
                let _ = reader.read_line(&mut crlf);
                state.lock().unwrap().insert(tokens[1].clone(), value);
                if reader.get_mut().write_all(b"STORED\r\n").is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}

struct AcceptAll;

impl OwnershipValidator for AcceptAll {
    fn validate(&self, _domain: &str, _key_hash: &str) -> bool {
        true
    }
}

/// Start a full server stack against a fresh store peer. Returns the
/// listener address and a backend handle onto the same store for
/// assertions.
fn start_server(handler_ceiling: usize) -> (SocketAddr, Arc<dyn Backend>) {
    let store_addr = spawn_store_peer();

    let backend: Arc<dyn Backend> = Arc::new(
        KvBackend::connect(&store_addr.ip().to_string(), store_addr.port(), "donardns.net")
            .expect("connect backend"),
    );
    let inspector: Arc<dyn Backend> = Arc::new(
        KvBackend::connect(&store_addr.ip().to_string(), store_addr.port(), "donardns.net")
            .expect("connect inspector"),
    );

    let mut context = ServerContext::new();
    context.listen_addrs = vec!["127.0.0.1:0".parse().unwrap()];
    context.handler_ceiling = handler_ceiling;
    let context = Arc::new(context);

    let processor = RequestProcessor::new(backend, Arc::new(AcceptAll), false);
    let server = UdpUpdateServer::new(context, processor);
    let addrs = server.run_server().expect("start server");

    (addrs[0], inspector)
}

fn key_pair(seed: u8) -> Ed25519KeyPair {
    Ed25519KeyPair::from_seed_unchecked(&[seed; 32]).expect("test key")
}

fn key_hash(key_pair: &Ed25519KeyPair) -> String {
    donar::dns::auth::key_hash(key_pair.public_key().as_ref())
}

#[test]
fn test_update_and_query_flow() {
    let (server_addr, inspector) = start_server(100);
    let keys = key_pair(11);
    let hash = key_hash(&keys);
    let mut conn = UpdateConnection::new(&server_addr.to_string(), keys);

    // First contact: the connection learns its sequence number (0) and the
    // add goes through
    let add = RequestElement::new(Opcode::Add, "www", "A", "192.0.2.1", 300);
    let reply = conn.send_update(&[add]).expect("send add");
    assert_eq!(PacketCode::Success, reply.packet_code);
    assert_eq!(1, reply.next_sequence);

    // Re-adding the same (type, content) with a new TTL replaces in place
    let readd = RequestElement::new(Opcode::Add, "www", "A", "192.0.2.1", 900);
    let reply = conn.send_update(&[readd]).expect("send re-add");
    assert_eq!(PacketCode::Success, reply.packet_code);
    assert_eq!(2, reply.next_sequence);

    let fqdn = format!("www.{}.donardns.net", hash);
    let answers = inspector.answer_query(&fqdn, "IN", "A").expect("query");
    assert_eq!(1, answers.len());
    assert_eq!("192.0.2.1", answers[0].content);
    assert_eq!(900, answers[0].ttl);

    // A second address plus a TXT record under the same name
    let more = vec![
        RequestElement::new(Opcode::Add, "www", "A", "192.0.2.2", 300),
        RequestElement::new(Opcode::Add, "www", "TXT", "v=1", 300),
    ];
    let reply = conn.send_update(&more).expect("send more");
    assert_eq!(PacketCode::Success, reply.packet_code);

    // Proximity ranking over the stored answers: client sits next to .2
    let mut table = TableGeoLookup::new();
    table.insert("198.51.100.7".parse().unwrap(), 50.0, 8.0);
    table.insert("192.0.2.1".parse().unwrap(), -33.0, 151.0);
    table.insert("192.0.2.2".parse().unwrap(), 50.1, 8.1);
    let resolver = ProximityResolver::new(Box::new(table), 1);

    let ranked = resolver
        .resolve(inspector.as_ref(), &fqdn, "IN", "ANY", "198.51.100.7")
        .expect("ranked query");
    let a_records: Vec<_> = ranked.iter().filter(|r| r.rtype == "A").collect();
    assert_eq!(1, a_records.len());
    assert_eq!("192.0.2.2", a_records[0].content);
    assert!(ranked.iter().any(|r| r.rtype == "TXT"));

    // Delete with wildcard content removes both address records
    let delete = RequestElement::new(Opcode::Delete, "www", "A", "", 0);
    let reply = conn.send_update(&[delete]).expect("send delete");
    assert_eq!(PacketCode::Success, reply.packet_code);
    assert!(inspector.answer_query(&fqdn, "IN", "A").expect("query").is_empty());

    // Mixed valid/invalid packet comes back partial, and the invalid
    // element is identified
    let mixed = vec![
        RequestElement::new(Opcode::Add, "mail", "A", "192.0.2.9", 300),
        RequestElement::new(Opcode::Add, "bad..name", "A", "192.0.2.9", 300),
    ];
    let reply = conn.send_update(&mixed).expect("send mixed");
    assert_eq!(PacketCode::PartialSuccess, reply.packet_code);
    assert_eq!(2, reply.element_codes.len());
}

#[test]
fn test_saturated_server_sheds_load() {
    let (server_addr, _inspector) = start_server(0);
    let keys = key_pair(12);

    let mut buffer = VectorPacketBuffer::new();
    UpdatePacket::write_unsigned(&mut buffer, keys.public_key().as_ref(), 0, &[]).unwrap();
    let signature = keys.sign(&buffer.buffer);
    UpdatePacket::append_signature(&mut buffer, signature.as_ref()).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    socket.send_to(&buffer.buffer, server_addr).unwrap();

    // With a ceiling of zero every datagram is dropped, not queued
    let mut reply = [0u8; 1500];
    assert!(socket.recv_from(&mut reply).is_err());
}
