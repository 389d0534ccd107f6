//! UDP accept loop and per-session tasks.
//!
//! The main socket only ever sees requests: each accepted RRQ/WRQ gets its
//! own ephemeral socket (its transfer ID, RFC 1350 section 4) and its own
//! task, so a slow or silent client never blocks another. The shared session
//! table caps concurrency and keeps one live transfer per client address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::packet::{self, ErrorCode, MAX_PACKET_SIZE, Opcode, Request};
use crate::session::{AllocError, SessionSlot, SessionTable};
use crate::transfer::{Step, Transfer};

/// Retransmissions of the in-flight packet before a session is abandoned.
const MAX_RETRIES: u32 = 3;

pub struct TftpServer {
    config: Arc<ServerConfig>,
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionTable>,
    shutdown: CancellationToken,
}

impl TftpServer {
    /// Bind the main request socket.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let sessions = SessionTable::new(config.max_sessions);
        Ok(Self {
            config: Arc::new(config),
            socket: Arc::new(socket),
            sessions,
            shutdown: CancellationToken::new(),
        })
    }

    /// The bound address of the main socket (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// A token that stops the accept loop and all session tasks when
    /// cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept requests until the shutdown token fires.
    pub async fn run(&self) -> Result<()> {
        info!(
            "listening on {}, serving {}",
            self.local_addr()?,
            self.config.root_dir.display()
        );

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => self.accept_request(&buf[..len], peer).await,
                        Err(e) => error!("recv error on main socket: {}", e),
                    }
                }
            }
        }
    }

    async fn accept_request(&self, datagram: &[u8], peer: SocketAddr) {
        if datagram.len() < 2 {
            debug!("runt datagram from {}", peer);
            return;
        }

        // Claim a slot before looking at the request, so capacity refusal
        // takes precedence over any per-request error.
        let slot = match self.sessions.allocate(peer) {
            Ok(slot) => slot,
            Err(AllocError::Full) => {
                warn!(
                    "refusing {}: all {} sessions busy",
                    peer,
                    self.sessions.capacity()
                );
                let busy = packet::error(ErrorCode::NotDefined, "Server busy");
                if let Err(e) = self.socket.send_to(&busy, peer).await {
                    error!("failed to refuse {}: {}", peer, e);
                }
                return;
            }
            Err(AllocError::Duplicate) => {
                debug!("dropping request from {}: session already active", peer);
                return;
            }
        };

        let opcode = u16::from_be_bytes([datagram[0], datagram[1]]);
        match Opcode::try_from(opcode) {
            Ok(Opcode::Rrq | Opcode::Wrq) => {}
            _ => {
                warn!("unexpected opcode {} from {}", opcode, peer);
                drop(slot);
                self.refuse(peer, ErrorCode::IllegalOperation, "Expected RRQ or WRQ")
                    .await;
                return;
            }
        }

        let request = match Request::parse(datagram) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed request from {}: {}", peer, e);
                drop(slot);
                self.refuse(peer, ErrorCode::IllegalOperation, "Malformed request")
                    .await;
                return;
            }
        };

        let config = Arc::clone(&self.config);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_session(config, shutdown, slot, request).await {
                error!("session with {} failed: {}", peer, e);
            }
        });
    }

    /// Send an ERROR from a fresh ephemeral socket, matching how a session
    /// would have answered.
    async fn refuse(&self, peer: SocketAddr, code: ErrorCode, message: &str) {
        let bind = SocketAddr::new(self.config.bind_addr.ip(), 0);
        let result = async {
            let socket = UdpSocket::bind(bind).await?;
            socket.send_to(&packet::error(code, message), peer).await
        }
        .await;
        if let Err(e) = result {
            error!("failed to refuse {}: {}", peer, e);
        }
    }
}

/// Fire-and-forget send on a session socket. UDP send failures (an ICMP
/// error surfaced synchronously, say) must never take the session down;
/// the retransmission window covers the loss.
async fn send_or_log(socket: &UdpSocket, pkt: &[u8], to: SocketAddr) {
    if let Err(e) = socket.send_to(pkt, to).await {
        warn!("send to {} failed: {}", to, e);
    }
}

/// Drive one transfer to completion on its own socket.
async fn run_session(
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
    slot: SessionSlot,
    request: Request,
) -> Result<()> {
    let peer = slot.peer();
    let socket = UdpSocket::bind(SocketAddr::new(config.bind_addr.ip(), 0)).await?;
    debug!(
        "session {} for {} from {}",
        socket.local_addr()?,
        request.filename,
        peer
    );

    let opened = match request.opcode {
        Opcode::Rrq => Transfer::open_read(&config.root_dir, peer, &request).await,
        _ => Transfer::open_write(&config.root_dir, peer, &request).await,
    };

    let (mut transfer, first) = match opened {
        Ok(opened) => opened,
        Err(refusal) => {
            warn!(
                "refusing {} from {}: {}",
                request.filename, peer, refusal.message
            );
            send_or_log(&socket, &refusal.to_packet(), peer).await;
            return Ok(());
        }
    };

    let window = Duration::from_secs(config.timeout_secs);
    let mut last_packet = first;
    let mut retries: u32 = 0;
    send_or_log(&socket, &last_packet, peer).await;

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("session with {} cancelled", peer);
                return Ok(());
            }
            received = tokio::time::timeout(window, socket.recv_from(&mut buf)) => received,
        };

        let (len, from) = match received {
            Ok(inner) => inner?,
            Err(_) => {
                // Activity window expired; resend or give up.
                if retries >= MAX_RETRIES {
                    warn!("session timeout: {} with {}", transfer.filename(), peer);
                    return Ok(());
                }
                retries += 1;
                debug!("retransmit {} to {} (attempt {})", transfer.filename(), peer, retries);
                send_or_log(&socket, &last_packet, peer).await;
                continue;
            }
        };

        if from != peer {
            // Some other host hit our transfer ID. Tell it off, keep going.
            debug!("datagram from {} on session with {}", from, peer);
            let unknown = packet::error(ErrorCode::UnknownTid, "Unknown TID");
            send_or_log(&socket, &unknown, from).await;
            continue;
        }

        match transfer.handle_packet(&buf[..len]).await {
            Step::Reply(pkt) => {
                last_packet = pkt;
                retries = 0;
                send_or_log(&socket, &last_packet, peer).await;
            }
            Step::Echo(pkt) => {
                send_or_log(&socket, &pkt, peer).await;
            }
            Step::Idle => {}
            Step::Finish(pkt) => {
                send_or_log(&socket, &pkt, peer).await;
                return Ok(());
            }
            Step::Done => return Ok(()),
        }
    }
}
