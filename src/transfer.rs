//! Per-session transfer state machine.
//!
//! [`Transfer::open_read`] / [`Transfer::open_write`] run the RRQ/WRQ entry
//! handshake (path validation, file open, option negotiation) and produce
//! the opening packet; [`Transfer::handle_packet`] is the single transition
//! function that turns every later inbound datagram into a [`Step`]. The
//! machine never touches a socket, so transitions are unit-testable with
//! nothing but byte buffers and temp files.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Instant;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::fmt::{human_size, human_speed};
use crate::packet::{self, DEFAULT_BLOCK_SIZE, ErrorCode, Mode, Packet, Request};
use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Serving a read request; more blocks remain.
    Sending,
    /// The final (short) DATA block has been sent; awaiting its ACK.
    LastData,
    /// Serving a write request.
    Receiving,
}

/// What the scheduler should do with the outcome of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send a packet and arm it for retransmission.
    Reply(Vec<u8>),
    /// Re-send an ACK for a duplicate DATA block; retransmission state for
    /// the in-flight packet is left untouched.
    Echo(Vec<u8>),
    /// Nothing to send (stale ACK); the activity window is refreshed.
    Idle,
    /// Send a final packet, then release the session.
    Finish(Vec<u8>),
    /// Release the session without sending anything.
    Done,
}

/// A request refused before the first packet of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct Refusal {
    pub code: ErrorCode,
    pub message: &'static str,
}

impl Refusal {
    fn new(code: ErrorCode, message: &'static str) -> Self {
        Self { code, message }
    }

    pub fn to_packet(self) -> Vec<u8> {
        packet::error(self.code, self.message)
    }
}

#[derive(Debug)]
pub struct Transfer {
    state: State,
    peer: SocketAddr,
    filename: String,
    file: File,
    /// Last block sent (read) or last block written and ACKed (write).
    block_num: u16,
    block_size: usize,
    bytes_transferred: u64,
    started: Instant,
}

impl Transfer {
    /// Accept an RRQ: validate the path, open the file read-only, negotiate
    /// options, and return the transfer along with its opening packet (OACK,
    /// or DATA block 1 when no options were negotiated).
    pub async fn open_read(
        root: &Path,
        peer: SocketAddr,
        request: &Request,
    ) -> std::result::Result<(Self, Vec<u8>), Refusal> {
        if Mode::parse(&request.mode).is_none() {
            return Err(Refusal::new(ErrorCode::IllegalOperation, "Unsupported mode"));
        }

        let full_path = path::resolve(root, &request.filename)
            .map_err(|_| Refusal::new(ErrorCode::AccessViolation, "Access denied"))?;

        let file = File::open(&full_path)
            .await
            .map_err(|_| Refusal::new(ErrorCode::FileNotFound, "File not found"))?;

        let file_size = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        info!(
            "GET {} ({}) from {}",
            request.filename,
            human_size(file_size),
            peer
        );

        let mut transfer = Self {
            state: State::Sending,
            peer,
            filename: request.filename.clone(),
            file,
            block_num: 0,
            block_size: request.options.block_size,
            bytes_transferred: 0,
            started: Instant::now(),
        };

        let opts = request.options;
        let first = if opts.block_size != DEFAULT_BLOCK_SIZE || opts.transfer_size.is_some() {
            // OACK handshake: the client ACKs block 0 before data flows.
            // tsize on a read carries the actual file size (RFC 2349).
            packet::oack(
                (opts.block_size != DEFAULT_BLOCK_SIZE).then_some(opts.block_size),
                opts.transfer_size.is_some().then_some(file_size),
            )
        } else {
            transfer.block_num = 1;
            transfer
                .next_data()
                .await
                .map_err(|_| Refusal::new(ErrorCode::NotDefined, "Read error"))?
        };

        Ok((transfer, first))
    }

    /// Accept a WRQ: validate the path, create missing parent directories,
    /// open the file write-create-truncate, and return the transfer along
    /// with its opening packet (OACK or ACK 0).
    pub async fn open_write(
        root: &Path,
        peer: SocketAddr,
        request: &Request,
    ) -> std::result::Result<(Self, Vec<u8>), Refusal> {
        if Mode::parse(&request.mode).is_none() {
            return Err(Refusal::new(ErrorCode::IllegalOperation, "Unsupported mode"));
        }

        let full_path = path::resolve(root, &request.filename)
            .map_err(|_| Refusal::new(ErrorCode::AccessViolation, "Access denied"))?;

        if let Some(parent) = full_path.parent()
            && tokio::fs::create_dir_all(parent).await.is_err()
        {
            return Err(Refusal::new(ErrorCode::AccessViolation, "Cannot create file"));
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .await
            .map_err(|_| Refusal::new(ErrorCode::AccessViolation, "Cannot create file"))?;

        info!("PUT {} from {}", request.filename, peer);

        let transfer = Self {
            state: State::Receiving,
            peer,
            filename: request.filename.clone(),
            file,
            block_num: 0,
            block_size: request.options.block_size,
            bytes_transferred: 0,
            started: Instant::now(),
        };

        let opts = request.options;
        let first = if opts.block_size != DEFAULT_BLOCK_SIZE || opts.transfer_size.is_some() {
            // tsize on a write echoes the client-declared size (advisory).
            packet::oack(
                (opts.block_size != DEFAULT_BLOCK_SIZE).then_some(opts.block_size),
                opts.transfer_size,
            )
        } else {
            packet::ack(0)
        };

        Ok((transfer, first))
    }

    /// Feed one inbound datagram through the state machine.
    pub async fn handle_packet(&mut self, datagram: &[u8]) -> Step {
        let pkt = match Packet::parse(datagram) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("bad packet from {}: {}", self.peer, e);
                return Step::Finish(packet::error(
                    ErrorCode::IllegalOperation,
                    "Unexpected packet",
                ));
            }
        };

        match (self.state, pkt) {
            (State::Sending | State::LastData, Packet::Ack { block }) => {
                self.handle_ack(block).await
            }
            (State::Receiving, Packet::Data { block, payload }) => {
                self.handle_data(block, &payload).await
            }
            (_, Packet::Error { code, message }) => {
                warn!("client error {} from {}: {}", code, self.peer, message);
                Step::Done
            }
            (_, other) => {
                warn!("unexpected {:?} from {} in {:?}", other, self.peer, self.state);
                Step::Finish(packet::error(
                    ErrorCode::IllegalOperation,
                    "Unexpected packet",
                ))
            }
        }
    }

    async fn handle_ack(&mut self, block: u16) -> Step {
        debug!("ACK {} from {}", block, self.peer);

        if block == 0 && self.block_num == 0 {
            // The OACK handshake: block 0 acknowledges the option reply and
            // kicks off the first real DATA block.
            self.block_num = 1;
        } else if block == self.block_num {
            if self.state == State::LastData {
                self.log_sent();
                return Step::Done;
            }
            self.block_num = self.block_num.wrapping_add(1);
        } else if block < self.block_num {
            // Stale ACK: refresh activity only, never re-read the file.
            return Step::Idle;
        } else {
            return Step::Finish(packet::error(ErrorCode::IllegalOperation, "Invalid ACK"));
        }

        match self.next_data().await {
            Ok(pkt) => Step::Reply(pkt),
            Err(e) => {
                warn!("read failed for {}: {}", self.filename, e);
                Step::Finish(packet::error(ErrorCode::NotDefined, "Read error"))
            }
        }
    }

    async fn handle_data(&mut self, block: u16, payload: &[u8]) -> Step {
        debug!("DATA {} ({} bytes) from {}", block, payload.len(), self.peer);

        if block == self.block_num.wrapping_add(1) {
            if !payload.is_empty()
                && let Err(e) = self.file.write_all(payload).await
            {
                warn!("write failed for {}: {}", self.filename, e);
                return Step::Finish(packet::error(ErrorCode::DiskFull, "Write error"));
            }

            self.block_num = block;
            self.bytes_transferred += payload.len() as u64;

            if payload.len() < self.block_size {
                // Short block: end of transfer.
                if let Err(e) = self.file.flush().await {
                    warn!("flush failed for {}: {}", self.filename, e);
                    return Step::Finish(packet::error(ErrorCode::DiskFull, "Write error"));
                }
                self.log_received();
                return Step::Finish(packet::ack(block));
            }

            Step::Reply(packet::ack(block))
        } else if block <= self.block_num {
            // Duplicate of a block already written: re-ACK it so the peer
            // makes progress, without rearming retransmission.
            Step::Echo(packet::ack(block))
        } else {
            Step::Finish(packet::error(
                ErrorCode::IllegalOperation,
                "Invalid block number",
            ))
        }
    }

    /// Read the next block and build its DATA packet. A short (or empty)
    /// read marks this as the final block.
    async fn next_data(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        self.bytes_transferred += filled as u64;
        if filled < self.block_size {
            self.state = State::LastData;
        }

        Ok(packet::data(self.block_num, &buf[..filled]))
    }

    fn log_sent(&self) {
        let (size, speed) = self.completion_stats();
        info!(
            "SENT {} {} @ {} to {}",
            self.filename, size, speed, self.peer
        );
    }

    fn log_received(&self) {
        let (size, speed) = self.completion_stats();
        info!(
            "RECV {} {} @ {} from {}",
            self.filename, size, speed, self.peer
        );
    }

    fn completion_stats(&self) -> (String, String) {
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let speed = self.bytes_transferred as f64 / elapsed;
        (human_size(self.bytes_transferred), human_speed(speed))
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}
