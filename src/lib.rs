//! utftpd - a small concurrent TFTP server.
//!
//! Implements RFC 1350 (TFTP revision 2) with RFC 2347/2348 option
//! negotiation for `blksize` and `tsize`. Every accepted transfer is served
//! from its own ephemeral UDP socket (the server-side TID) by a dedicated
//! task; a fixed-capacity session table bounds concurrency.

pub mod config;
pub mod error;
pub mod fmt;
pub mod packet;
pub mod path;
pub mod server;
pub mod session;
pub mod transfer;

pub use config::ServerConfig;
pub use error::{Result, TftpError};
pub use server::TftpServer;
