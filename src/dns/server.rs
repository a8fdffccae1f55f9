//! UDP listener for the update protocol
//!
//! One receive loop per configured bind address. Each admitted datagram is
//! handed to its own handler thread, which runs the packet through the
//! request processor and sends exactly one reply to the source. Admission is
//! a hard ceiling on concurrently active handlers: above it, datagrams are
//! dropped on the floor and the client's retry takes care of the rest. No
//! handler outlives its packet.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::Builder;

use derive_more::{Display, Error, From};

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use crate::dns::context::ServerContext;
use crate::dns::processor::RequestProcessor;

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ServerError>;

macro_rules! return_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(res) => res,
            Err(_) => {
                log::info!($message);
                return;
            }
        }
    };
}

macro_rules! ignore_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(_) => {}
            Err(_) => {
                log::info!($message);
                return;
            }
        };
    };
}

/// A held admission slot. Handler spawns are gated on acquiring one, and the
/// slot is returned when the handler finishes, however it finishes.
struct AdmissionSlot(Arc<AtomicUsize>);

impl AdmissionSlot {
    /// Atomically claim a slot below the ceiling. The increment happens
    /// first and is undone on overshoot, so two racing receive loops cannot
    /// both slip under a full ceiling.
    fn acquire(counter: &Arc<AtomicUsize>, ceiling: usize) -> Option<AdmissionSlot> {
        let prev = counter.fetch_add(1, Ordering::AcqRel);
        if prev >= ceiling {
            counter.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(AdmissionSlot(counter.clone()))
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct UdpUpdateServer {
    context: Arc<ServerContext>,
    processor: Arc<RequestProcessor>,
    active_handlers: Arc<AtomicUsize>,
}

impl UdpUpdateServer {
    pub fn new(context: Arc<ServerContext>, processor: RequestProcessor) -> UdpUpdateServer {
        UdpUpdateServer {
            context,
            processor: Arc::new(processor),
            active_handlers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Service one datagram: process and send the single reply. Packets that
    /// are not ours produce no reply at all.
    fn handle_datagram(
        socket: &UdpSocket,
        processor: &RequestProcessor,
        src: SocketAddr,
        raw: &[u8],
    ) {
        let reply = match processor.handle_packet(raw) {
            Some(reply) => reply,
            None => return,
        };

        let mut res_buffer = VectorPacketBuffer::new();
        ignore_or_report!(reply.write(&mut res_buffer), "Failed to write reply packet");

        let len = res_buffer.pos();
        let data = return_or_report!(res_buffer.get_range(0, len), "Failed to get reply data");
        ignore_or_report!(socket.send_to(data, src), "Failed to send reply packet");
    }

    /// Spawn the receive loop for one bound socket.
    fn spawn_receive_loop(&self, socket: UdpSocket) -> std::io::Result<()> {
        let context = self.context.clone();
        let processor = self.processor.clone();
        let active_handlers = self.active_handlers.clone();
        let ceiling = context.handler_ceiling;
        let local = socket.local_addr()?;

        Builder::new()
            .name(format!("UdpUpdateServer-incoming-{}", local))
            .spawn(move || {
                loop {
                    let mut req_buffer = BytePacketBuffer::new();
                    let (len, src) = match socket.recv_from(&mut req_buffer.buf) {
                        Ok(x) => x,
                        Err(e) => {
                            log::info!("Failed to read from UDP socket: {:?}", e);
                            continue;
                        }
                    };

                    context.statistics.update_packet_count.fetch_add(1, Ordering::Release);

                    // Load shedding: drop rather than queue when saturated
                    let slot = match AdmissionSlot::acquire(&active_handlers, ceiling) {
                        Some(slot) => slot,
                        None => {
                            context.statistics.dropped_packet_count.fetch_add(1, Ordering::Release);
                            log::debug!("too many active handlers, dropping packet from {}", src);
                            continue;
                        }
                    };
                    let handler_socket = match socket.try_clone() {
                        Ok(s) => s,
                        Err(e) => {
                            log::info!("Failed to clone socket for handler: {:?}", e);
                            continue;
                        }
                    };
                    let handler_processor = processor.clone();

                    let spawned = Builder::new()
                        .name(format!("UdpUpdateServer-request-{}", src))
                        .spawn(move || {
                            let _slot = slot;
                            Self::handle_datagram(
                                &handler_socket,
                                &handler_processor,
                                src,
                                &req_buffer.buf[..len],
                            );
                        });
                    if let Err(e) = spawned {
                        log::info!("Failed to spawn handler thread: {:?}", e);
                    }
                }
            })?;

        Ok(())
    }

    /// Bind every configured address and start receiving. Does not block;
    /// the receive loops own their sockets. Returns the bound addresses,
    /// which is how a caller using port 0 learns the real ports.
    pub fn run_server(self) -> Result<Vec<SocketAddr>> {
        let mut bound = Vec::new();
        for addr in &self.context.listen_addrs {
            let socket = UdpSocket::bind(addr)?;
            let local = socket.local_addr()?;
            log::info!("listening for update requests on {}", local);
            bound.push(local);
            self.spawn_receive_loop(socket)?;
        }
        Ok(bound)
    }
}
