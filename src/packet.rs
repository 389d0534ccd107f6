//! TFTP wire codec (RFC 1350, RFC 2347/2348).
//!
//! Parses RRQ/WRQ request datagrams into [`Request`] and session-socket
//! traffic into [`Packet`]; builds DATA/ACK/ERROR/OACK packets. All block
//! numbers and codes are big-endian on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};

/// RFC 1350 standard block size.
pub const DEFAULT_BLOCK_SIZE: usize = 512;
/// RFC 2348 lower bound for a negotiated block size.
pub const MIN_BLOCK_SIZE: usize = 8;
/// RFC 2348 upper bound for a negotiated block size.
pub const MAX_BLOCK_SIZE: usize = 65464;
/// Largest datagram the server ever sends or receives (4-byte header + max block).
pub const MAX_PACKET_SIZE: usize = 4 + MAX_BLOCK_SIZE;

/// RFC 1350 strings (filenames, modes, option names/values) are rejected
/// beyond this length.
const MAX_STRING_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, TftpError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(TftpError::Tftp(format!("invalid opcode: {}", value))),
        }
    }
}

// RFC 1350 / RFC 2347 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
    OptionNegotiation = 8,
}

/// Accepted transfer modes.
///
/// `netascii` is accepted for client compatibility but data passes through
/// unmodified; no CR/LF translation is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Octet,
    Netascii,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Mode> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Mode::Octet),
            "netascii" => Some(Mode::Netascii),
            _ => None,
        }
    }
}

/// Options negotiated on a request (RFC 2347/2348).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Negotiated block size; stays at 512 unless the client asked for a
    /// value within [8, 65464].
    pub block_size: usize,
    /// `tsize` as sent by the client: `Some(0)` on a read request asking for
    /// the file size, the declared upload size on a write request. Absent or
    /// unparsable values leave this `None`.
    pub transfer_size: Option<u64>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            transfer_size: None,
        }
    }
}

/// A parsed RRQ or WRQ datagram.
#[derive(Debug, Clone)]
pub struct Request {
    pub opcode: Opcode,
    pub filename: String,
    /// Raw mode string; validated against [`Mode`] by the transfer handlers
    /// so an unsupported mode can be refused with ERROR 4.
    pub mode: String,
    pub options: RequestOptions,
}

impl Request {
    /// Parse a full RRQ/WRQ datagram, opcode included.
    ///
    /// The body is two NUL-terminated strings (filename, mode) followed by
    /// zero or more NUL-terminated option name/value pairs. Unknown options
    /// and out-of-range `blksize` values are ignored per RFC 2347.
    pub fn parse(datagram: &[u8]) -> Result<Request> {
        if datagram.len() < 4 {
            return Err(TftpError::Tftp("request too short".to_string()));
        }

        let mut bytes = Bytes::copy_from_slice(datagram);
        let opcode = Opcode::try_from(bytes.get_u16())?;
        if opcode != Opcode::Rrq && opcode != Opcode::Wrq {
            return Err(TftpError::Tftp(format!("not a request: {:?}", opcode)));
        }

        let filename = parse_string(&mut bytes)?;
        let mode = parse_string(&mut bytes)?;

        let mut options = RequestOptions::default();
        while bytes.has_remaining() {
            let Ok(name) = parse_string(&mut bytes) else {
                break;
            };
            let Ok(value) = parse_string(&mut bytes) else {
                break;
            };

            match name.to_ascii_lowercase().as_str() {
                "blksize" => {
                    if let Ok(size) = value.parse::<usize>()
                        && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size)
                    {
                        options.block_size = size;
                    }
                }
                "tsize" => {
                    if let Ok(size) = value.parse::<u64>() {
                        options.transfer_size = Some(size);
                    }
                }
                other => {
                    tracing::debug!("ignoring unknown option: {}", other);
                }
            }
        }

        Ok(Request {
            opcode,
            filename,
            mode,
            options,
        })
    }
}

/// A datagram received on a session socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl Packet {
    pub fn parse(datagram: &[u8]) -> Result<Packet> {
        if datagram.len() < 4 {
            return Err(TftpError::Tftp("packet too short".to_string()));
        }

        let mut bytes = Bytes::copy_from_slice(datagram);
        let opcode = Opcode::try_from(bytes.get_u16())?;

        match opcode {
            Opcode::Data => Ok(Packet::Data {
                block: bytes.get_u16(),
                payload: bytes,
            }),
            Opcode::Ack => Ok(Packet::Ack {
                block: bytes.get_u16(),
            }),
            Opcode::Error => {
                let code = bytes.get_u16();
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                let message = String::from_utf8_lossy(&bytes[..end]).into_owned();
                Ok(Packet::Error { code, message })
            }
            other => Err(TftpError::Tftp(format!(
                "unexpected opcode on session socket: {:?}",
                other
            ))),
        }
    }
}

/// Build a DATA packet. A payload shorter than the negotiated block size
/// (including empty) marks the final block of a transfer.
pub fn data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = BytesMut::with_capacity(4 + payload.len());
    pkt.put_u16(Opcode::Data as u16);
    pkt.put_u16(block);
    pkt.put_slice(payload);
    pkt.to_vec()
}

pub fn ack(block: u16) -> Vec<u8> {
    let mut pkt = BytesMut::with_capacity(4);
    pkt.put_u16(Opcode::Ack as u16);
    pkt.put_u16(block);
    pkt.to_vec()
}

pub fn error(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut pkt = BytesMut::with_capacity(5 + message.len());
    pkt.put_u16(Opcode::Error as u16);
    pkt.put_u16(code as u16);
    pkt.put_slice(message.as_bytes());
    pkt.put_u8(0);
    pkt.to_vec()
}

/// Build an OACK carrying only the options actually negotiated away from
/// their defaults, values as decimal strings (RFC 2347).
pub fn oack(block_size: Option<usize>, transfer_size: Option<u64>) -> Vec<u8> {
    let mut pkt = BytesMut::new();
    pkt.put_u16(Opcode::Oack as u16);

    if let Some(size) = block_size {
        pkt.put_slice(b"blksize");
        pkt.put_u8(0);
        pkt.put_slice(size.to_string().as_bytes());
        pkt.put_u8(0);
    }
    if let Some(size) = transfer_size {
        pkt.put_slice(b"tsize");
        pkt.put_u8(0);
        pkt.put_slice(size.to_string().as_bytes());
        pkt.put_u8(0);
    }

    pkt.to_vec()
}

fn parse_string(bytes: &mut Bytes) -> Result<String> {
    let null_pos = bytes
        .iter()
        .take(MAX_STRING_LENGTH + 1)
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::Tftp("unterminated or oversized string".to_string()))?;

    let string_bytes = bytes.split_to(null_pos);
    bytes.advance(1); // NUL

    String::from_utf8(string_bytes.to_vec())
        .map_err(|e| TftpError::Tftp(format!("invalid UTF-8: {}", e)))
}
