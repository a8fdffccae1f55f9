//! Client side of the update protocol
//!
//! Builds and signs update packets, submits them over UDP, and parses the
//! reply. A server string may resolve to several addresses; they are tried
//! in shuffled order for up to three rounds, each receive bounded by a fixed
//! timeout, and the client gives up after that. Retries are safe because
//! resubmitting the same elements reaches the same upsert outcome. Key
//! generation and storage are the caller's concern; the connection just
//! holds a signing key.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use derive_more::{Display, Error, From};
use rand::seq::SliceRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};

use crate::dns::buffer::VectorPacketBuffer;
use crate::dns::protocol::{
    ProtocolError, ReplyPacket, RequestElement, UpdatePacket, NUP_DEFAULT_PORT,
    NUP_MAX_PACKET_LENGTH,
};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_ROUNDS: usize = 3;

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(ProtocolError),
    Io(std::io::Error),
    #[display(fmt = "packet exceeds the maximum update size")]
    PacketTooLarge,
    #[display(fmt = "server string did not resolve to any address")]
    NoServerAddress,
    #[display(fmt = "no reply from any update server")]
    NoReply,
    /// The reply parsed but was not a reply to our packet.
    ReplyMismatch(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, ClientError>;

pub struct UpdateConnection {
    server: String,
    key_pair: Ed25519KeyPair,
    /// Next sequence number to claim; learned from the server when unknown.
    sequence: Option<i64>,
}

impl UpdateConnection {
    pub fn new(server: &str, key_pair: Ed25519KeyPair) -> UpdateConnection {
        UpdateConnection {
            server: server.to_string(),
            key_pair,
            sequence: None,
        }
    }

    /// Submit a set of request elements and return the parsed reply. The
    /// connection tracks the server's next-expected sequence number across
    /// calls.
    pub fn send_update(&mut self, elements: &[RequestElement]) -> Result<ReplyPacket> {
        let sequence = match self.sequence {
            Some(sequence) => sequence,
            None => self.query_sequence()?,
        };

        let packet = self.build_packet(sequence, elements)?;
        let reply = self.exchange(&packet, sequence)?;
        self.sequence = Some(reply.next_sequence);

        if !reply.is_success() {
            // Per-element detail is only surfaced on failure
            log::warn!("{}", reply);
        }

        Ok(reply)
    }

    /// Ask the server for the account's next expected sequence number by
    /// submitting a packet with no elements.
    pub fn query_sequence(&mut self) -> Result<i64> {
        log::info!("querying for sequence number");
        let packet = self.build_packet(0, &[])?;
        let reply = self.exchange(&packet, 0)?;
        self.sequence = Some(reply.next_sequence);
        Ok(reply.next_sequence)
    }

    /// Build and sign one update packet.
    fn build_packet(&self, sequence: i64, elements: &[RequestElement]) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        UpdatePacket::write_unsigned(
            &mut buffer,
            self.key_pair.public_key().as_ref(),
            sequence,
            elements,
        )?;
        let signature = self.key_pair.sign(&buffer.buffer);
        UpdatePacket::append_signature(&mut buffer, signature.as_ref())?;

        if buffer.buffer.len() > NUP_MAX_PACKET_LENGTH {
            return Err(ClientError::PacketTooLarge);
        }
        Ok(buffer.buffer)
    }

    fn resolve_addresses(&self) -> Result<Vec<SocketAddr>> {
        let target = if self.server.contains(':') {
            self.server.clone()
        } else {
            format!("{}:{}", self.server, NUP_DEFAULT_PORT)
        };
        let mut addrs: Vec<SocketAddr> = target.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(ClientError::NoServerAddress);
        }
        // Load balance across update servers behind one name
        addrs.shuffle(&mut rand::thread_rng());
        Ok(addrs)
    }

    /// Fire the packet at each resolved address in turn until one of them
    /// answers, for up to three rounds.
    fn exchange(&self, packet: &[u8], sequence: i64) -> Result<ReplyPacket> {
        let addrs = self.resolve_addresses()?;

        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;

        let mut reply_buf = [0u8; NUP_MAX_PACKET_LENGTH];
        for round in 0..SEND_ROUNDS {
            for addr in &addrs {
                log::debug!("sending update to {} (round {})", addr, round + 1);
                if let Err(e) = socket.send_to(packet, addr) {
                    log::warn!("failed sending to {}: {}", addr, e);
                    continue;
                }

                match socket.recv_from(&mut reply_buf) {
                    Ok((len, _)) => {
                        return self.parse_reply(&reply_buf[..len], sequence);
                    }
                    Err(e) => {
                        log::warn!("timed out waiting on {}: {}", addr, e);
                    }
                }
            }
        }

        Err(ClientError::NoReply)
    }

    /// Parse a reply and confirm it belongs to the packet we sent: right
    /// key (when echoed) and right sequence number (when positive).
    fn parse_reply(&self, raw: &[u8], sequence: i64) -> Result<ReplyPacket> {
        let mut buffer = VectorPacketBuffer::from_bytes(raw);
        let reply = ReplyPacket::from_buffer(&mut buffer)?;

        if !reply.public_key.is_empty()
            && reply.public_key != self.key_pair.public_key().as_ref()
        {
            return Err(ClientError::ReplyMismatch(
                "reply carries another account's key".to_string(),
            ));
        }
        if reply.echo_sequence >= 0 && reply.echo_sequence != sequence {
            return Err(ClientError::ReplyMismatch(format!(
                "reply echoes sequence {} but {} was sent",
                reply.echo_sequence, sequence
            )));
        }

        Ok(reply)
    }
}
