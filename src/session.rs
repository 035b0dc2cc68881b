// The per-transfer protocol state machine.
//
// A Session owns everything one transfer knows: the block counter, the open file, the last packet
// sent (for retransmission) and the last one received. It never touches the network. The caller
// feeds it datagrams from the peer and timeout expiries, and sends whatever packet it hands back.
//
// Lifecycle: Idle until the first datagram, which must be a request; Reading or Writing for the
// rest of the transfer; terminated once the final block is acknowledged, an error is sent to the
// peer, or the retransmission ladder runs out.
//
// The block counter is directional. When serving a read it is the number of the last DATA block
// sent, which is also the ACK expected next. When serving a write it is the number of the next DATA
// block expected.

use crate::config::ServerConfig;
use crate::file_io::{self, FileReader, FileWriter, PathError, WriteError};
use crate::tftp::{ErrorCode, FileMode, Packet, DATA_BUFFER_SIZE};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
enum Transfer {
    Idle,
    Reading {
        reader: FileReader,
        /// The last DATA sent was the short, final one.
        sent_final: bool,
    },
    Writing {
        writer: FileWriter,
    },
}

#[derive(Debug)]
pub struct Session {
    config: Arc<ServerConfig>,
    peer: SocketAddr,
    block: u16,
    transfer: Transfer,
    last_sent: Option<Packet>,
    last_received: Option<Packet>,
    retransmissions: usize,
    terminated: bool,
}

fn illegal(message: String) -> Option<Packet> {
    Some(Packet::Error { code: ErrorCode::Illegal, message })
}

fn io_error_packet(e: &io::Error) -> Packet {
    Packet::Error { code: e.kind().into(), message: e.to_string() }
}

impl Session {
    pub fn new(config: Arc<ServerConfig>, peer: SocketAddr) -> Session {
        Session {
            config,
            peer,
            block: 0,
            transfer: Transfer::Idle,
            last_sent: None,
            last_received: None,
            retransmissions: 0,
            terminated: false,
        }
    }

    /// Whether `datagram` can open a transfer. Anything else arriving on the well-known port is
    /// dropped without a reply.
    pub fn accepts(datagram: &[u8]) -> bool {
        matches!(
            Packet::parse_from_buf(datagram),
            Ok(Packet::ReadReq { .. } | Packet::WriteReq { .. })
        )
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The packet that would be retransmitted on timeout.
    pub fn last_sent(&self) -> Option<&Packet> {
        self.last_sent.as_ref()
    }

    /// How long to wait for the peer before calling [`Session::handle_timeout`]. `None` once the
    /// ladder is exhausted.
    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeouts.get(self.retransmissions).copied()
    }

    /// Processes one datagram from the peer and returns the packet to send back, if any.
    pub async fn handle_datagram(&mut self, datagram: &[u8]) -> Option<Packet> {
        self.retransmissions = 0;

        let response = match Packet::parse_from_buf(datagram) {
            Ok(packet) => {
                log::debug!("Got packet from {}: {:?}", self.peer, packet);
                let response = self.respond_to_packet(&packet).await;
                self.last_received = Some(packet);
                response
            }
            Err(e) => {
                log::warn!("Malformed packet from {}: {e}", self.peer);
                illegal(format!("Malformed packet: {e}"))
            }
        };

        if let Some(packet) = &response {
            self.record_sent(packet);
        }
        response
    }

    /// Called when the wait returned by [`Session::timeout`] expired without a reply. Returns the
    /// packet to retransmit, or `None` when the session is over.
    pub fn handle_timeout(&mut self) -> Option<Packet> {
        if !self.needs_retransmit() {
            log::debug!("Nothing left to retransmit to {}, ending session", self.peer);
            self.terminated = true;
            return None;
        }

        self.retransmissions += 1;
        if self.retransmissions >= self.config.timeouts.len() {
            log::warn!(
                "Transfer with {} abandoned after {} timeouts",
                self.peer,
                self.retransmissions
            );
            self.terminated = true;
            return None;
        }

        log::info!("Timed out waiting for {}, retransmitting", self.peer);
        self.last_sent.clone()
    }

    fn needs_retransmit(&self) -> bool {
        let received_final = matches!(
            &self.last_received,
            Some(Packet::Data { data, .. }) if data.len() < DATA_BUFFER_SIZE
        );
        match &self.last_sent {
            None | Some(Packet::Error { .. }) => false,
            Some(_) => !received_final,
        }
    }

    fn record_sent(&mut self, packet: &Packet) {
        if let Packet::Error { code, message } = packet {
            log::warn!("Sending error to {}: {:?}: {}", self.peer, code, message);
            // Errors are neither acknowledged nor retransmitted, so nothing can follow one.
            self.terminated = true;
        }
        self.last_sent = Some(packet.clone());
    }

    async fn respond_to_packet(&mut self, packet: &Packet) -> Option<Packet> {
        let idle = matches!(self.transfer, Transfer::Idle);
        match packet {
            Packet::ReadReq { .. } | Packet::WriteReq { .. } if !idle => {
                illegal("A transfer is already in progress on this port".to_string())
            }
            Packet::ReadReq { path, mode } => self.respond_to_rrq(path, *mode).await,
            Packet::WriteReq { path, mode } => self.respond_to_wrq(path, *mode).await,
            Packet::Data { block, data } => self.respond_to_data(*block, data).await,
            Packet::Ack { block } => self.respond_to_ack(*block).await,
            Packet::Error { code, message } => {
                log::warn!(
                    "Client {} sent error packet: code: {:?}, message: '{}'",
                    self.peer,
                    code,
                    message
                );
                Some(Packet::error(ErrorCode::UnknownTid))
            }
        }
    }

    async fn respond_to_rrq(&mut self, path: &str, mode: FileMode) -> Option<Packet> {
        let resolved = match file_io::resolve_existing(&self.config.tftp_root, path).await {
            Ok(resolved) => resolved,
            Err(e) => {
                log::info!("Refusing read of '{path}' from {}: {e}", self.peer);
                return Some(Packet::error(ErrorCode::FileNotFound));
            }
        };

        let mut reader = match FileReader::open(&resolved, mode).await {
            Ok(reader) => reader,
            Err(e) => return Some(io_error_packet(&e)),
        };
        let first = match reader.next_block().await {
            Ok(block) => block,
            Err(e) => return Some(io_error_packet(&e)),
        };

        log::info!("Sending {} to {} ({mode})", resolved.display(), self.peer);
        self.block = 1;
        self.transfer = Transfer::Reading { reader, sent_final: first.is_final };
        Some(Packet::Data { block: self.block, data: first.data })
    }

    async fn respond_to_wrq(&mut self, path: &str, mode: FileMode) -> Option<Packet> {
        if !self.config.writable {
            log::info!("Refusing write of '{path}' from {}: server is read-only", self.peer);
            return Some(Packet::error(ErrorCode::AccessViolation));
        }

        let resolved = match file_io::resolve_for_write(&self.config.tftp_root, path).await {
            Ok(resolved) => resolved,
            Err(PathError::OutsideRoot(p)) => {
                log::warn!("Refusing write of '{path}' from {}: {} is outside the root", self.peer, p.display());
                return Some(Packet::error(ErrorCode::AccessViolation));
            }
            Err(PathError::IO(e)) => return Some(io_error_packet(&e)),
        };

        let writer = match FileWriter::create(&resolved, mode).await {
            Ok(writer) => writer,
            Err(e) => return Some(io_error_packet(&e)),
        };

        log::info!("Receiving {} from {} ({mode})", resolved.display(), self.peer);
        self.block = 1;
        self.transfer = Transfer::Writing { writer };
        Some(Packet::Ack { block: 0 })
    }

    async fn respond_to_data(&mut self, block: u16, data: &[u8]) -> Option<Packet> {
        let Transfer::Writing { writer } = &mut self.transfer else {
            return illegal("Unexpected DATA packet, this transfer is not a write".to_string());
        };

        if block > self.block {
            return Some(Packet::error(ErrorCode::UnknownTid));
        }
        if block < self.block {
            // Duplicate of a block already written, the ACK for it was probably lost.
            return Some(Packet::Ack { block });
        }

        match writer.write_next_block(data).await {
            Ok(()) => {
                self.block = self.block.wrapping_add(1);
                if data.len() < DATA_BUFFER_SIZE {
                    log::info!("Finished receiving file from {}", self.peer);
                }
                Some(Packet::Ack { block })
            }
            Err(WriteError::DiskFull(e)) => {
                log::error!("Disk full while writing block {block} from {}: {e}", self.peer);
                Some(Packet::error(ErrorCode::DiskFull))
            }
            Err(WriteError::Malformed(e)) => illegal(format!("Malformed netascii data: {e}")),
            Err(WriteError::IO(e)) => Some(io_error_packet(&e)),
        }
    }

    async fn respond_to_ack(&mut self, block: u16) -> Option<Packet> {
        let Transfer::Reading { reader, sent_final } = &mut self.transfer else {
            return illegal("Unexpected ACK packet, this transfer is not a read".to_string());
        };

        if block > self.block {
            return Some(Packet::error(ErrorCode::UnknownTid));
        }
        if block < self.block {
            // Stale ACK: send the outstanding block again without counting it as a retry.
            return self.last_sent.clone();
        }

        if *sent_final {
            log::info!("Finished sending file to {}", self.peer);
            self.terminated = true;
            return None;
        }

        match reader.next_block().await {
            Ok(next) => {
                *sent_final = next.is_final;
                self.block = self.block.wrapping_add(1);
                Some(Packet::Data { block: self.block, data: next.data })
            }
            Err(e) => Some(io_error_packet(&e)),
        }
    }
}
