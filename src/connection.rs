// Server-side connection handling.
//
// Every transfer gets its own UDP socket, and the port of that socket is the server's transfer
// identifier (TID) for the rest of the exchange. The handler here owns the socket and drives a
// Session through its work and wait cycles:
//
// 1. Feed the request that arrived on the well-known port to the session and send its reply.
// 2. Wait on the private socket for the peer's next packet, for as long as the session's current
//    timeout allows. Packets from any other address are answered with an Unknown TID error and
//    otherwise ignored, they neither extend the wait nor disturb the transfer.
// 3. On a reply, hand it to the session and send whatever comes back. On a timeout, ask the session
//    whether to retransmit.
// 4. Stop once the session reports it is terminated. Dropping the handler releases the port.

use crate::config::ServerConfig;
use crate::session::Session;
use crate::tftp::{self, ErrorCode, Packet, SocketError, TftpResult, TftpSocket};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Instant;

/// How many random ports to try inside a configured range before giving up.
const BIND_ATTEMPTS: usize = 16;

/// Binds the socket for a new transfer, on a random port of `port_range` when one is configured.
fn bind_transfer_socket(ip: IpAddr, port_range: Option<(u16, u16)>) -> TftpResult<TftpSocket> {
    let Some((lo, hi)) = port_range else {
        return TftpSocket::bind((ip, 0).into());
    };

    let mut rng = rand::thread_rng();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match TftpSocket::bind((ip, rng.gen_range(lo..=hi)).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) if attempt < BIND_ATTEMPTS => log::warn!("Couldn't bind socket: {e}"),
            Err(e) => return Err(e),
        }
    }
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: String) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, dst).await;
}

/// Owns one transfer's socket and session.
pub struct SessionHandler {
    /// The socket whose port is this transfer's TID.
    sock: tftp::TftpSocket,

    /// The address to send packets to. Fixed by the initial request.
    dst: SocketAddr,

    session: Session,
}

impl SessionHandler {
    /// Sets up a transfer for the datagram `initial` that `src` sent to the well-known port and
    /// runs it to completion. Datagrams that are not requests are dropped here.
    pub async fn start(config: Arc<ServerConfig>, initial: Vec<u8>, src: SocketAddr) {
        if !Session::accepts(&initial) {
            log::debug!("Ignoring datagram from {src}, it is not a read or write request");
            return;
        }

        let sock = match bind_transfer_socket(config.host, config.port_range) {
            Ok(sock) => sock,
            Err(e) => {
                log::error!("Unable to allocate a transfer socket for {src}: {e}");
                return;
            }
        };

        let mut handler = SessionHandler { sock, dst: src, session: Session::new(config, src) };
        handler.handle(&initial).await;
    }

    /// The address of this transfer's socket.
    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Does the work of sending and receiving data over the connection until the session ends.
    pub async fn handle(&mut self, initial: &[u8]) {
        if let Ok(addr) = self.local_addr() {
            log::info!("Starting transfer with {} on {}", self.dst, addr);
        }

        let response = self.session.handle_datagram(initial).await;
        if let Err(e) = self.respond(response).await {
            log::warn!("Unable to send packet: {e}");
            return;
        }

        while !self.session.is_terminated() {
            let Some(wait) = self.session.timeout() else {
                break;
            };

            let response = match self.recv_from_peer(Instant::now() + wait).await {
                Ok(Some(datagram)) => self.session.handle_datagram(&datagram).await,
                Ok(None) => self.session.handle_timeout(),
                Err(e) => {
                    log::warn!("Socket error talking to {}: {e}", self.dst);
                    break;
                }
            };

            if let Err(e) = self.respond(response).await {
                log::warn!("Unable to send packet: {e}");
                break;
            }
        }

        log::info!("Closing connection with {}", self.dst);
    }

    async fn respond(&self, response: Option<Packet>) -> TftpResult<()> {
        match response {
            Some(packet) => self.sock.send(&packet, self.dst).await,
            None => Ok(()),
        }
    }

    /// Waits until `deadline` for a datagram from the peer. `Ok(None)` means the deadline passed.
    async fn recv_from_peer(&self, deadline: Instant) -> TftpResult<Option<Vec<u8>>> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.sock.recv_with_timeout(remaining).await {
                Ok((datagram, src)) if src == self.dst => return Ok(Some(datagram)),
                Ok((_, src)) => {
                    log::warn!("Got packet from unexpected peer {src} on transfer with {}", self.dst);
                    send_error_packet(
                        &self.sock,
                        src,
                        ErrorCode::UnknownTid,
                        "This port belongs to a transfer with a different client".to_string(),
                    )
                    .await;
                }
                Err(SocketError::Timeout(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}
