// The dispatch loop.
//
// One socket listens on the well-known port. Each datagram that lands there is handed, untouched,
// to a fresh task that allocates the transfer's own socket and runs the session. Sessions share
// nothing but the read-only configuration.

use crate::config::ServerConfig;
use crate::connection::SessionHandler;
use crate::tftp::TftpSocket;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const RECV_BACKOFF_BASE: Duration = Duration::from_millis(10);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before the next receive after `failures` consecutive errors on the listening socket.
fn recv_backoff(failures: u32) -> Duration {
    RECV_BACKOFF_BASE
        .saturating_mul(1 << failures.saturating_sub(1).min(16))
        .min(RECV_BACKOFF_MAX)
}

pub struct TftpServer {
    sock: TftpSocket,
    config: Arc<ServerConfig>,
}

impl TftpServer {
    /// Binds the listening socket. `config` is expected to have been validated.
    pub fn bind(config: ServerConfig) -> Result<TftpServer> {
        let addr = SocketAddr::new(config.host, config.port);
        let sock = TftpSocket::bind(addr).with_context(|| format!("Failed to bind {addr}"))?;
        Ok(TftpServer { sock, config: Arc::new(config) })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Accepts transfers forever.
    pub async fn serve(&self) -> Result<()> {
        log::info!("Start listening on {}", self.local_addr()?);
        let mut failures = 0;
        loop {
            let (datagram, src) = match self.sock.recv().await {
                Ok(received) => received,
                Err(e) => {
                    failures += 1;
                    let pause = recv_backoff(failures);
                    log::warn!("Error receiving on the listening socket, retrying in {pause:?}: {e}");
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            failures = 0;

            log::debug!("New datagram from {src}");
            tokio::spawn(SessionHandler::start(Arc::clone(&self.config), datagram, src));
        }
    }
}
