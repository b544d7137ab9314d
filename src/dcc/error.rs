//! Error taxonomy for the DCC subsystem.
//!
//! Parser and address errors are contained inside the negotiation boundary
//! (logged and dropped). Socket and file errors end a transfer as `Failed`
//! and are surfaced through [`DccEvent::StateChanged`](super::event::DccEvent).

use std::net::SocketAddr;
use thiserror::Error;

use super::transfer::{TransferId, TransferState};

/// A CTCP `DCC` payload that could not be turned into a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty DCC payload")]
    Empty,

    #[error("unknown DCC subcommand: {0}")]
    UnknownCommand(String),

    #[error("DCC {command} needs at least {expected} arguments, got {got}")]
    MissingFields {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("unterminated quoted filename")]
    UnterminatedQuote,

    #[error("empty filename")]
    EmptyFilename,

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Conversion between textual addresses and the 32-bit wire form failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("not an IPv4 address: {0}")]
    NotIpv4(String),

    #[error("malformed wire address: {0}")]
    Malformed(String),

    #[error("could not resolve {0} to an IPv4 address")]
    Unresolvable(String),
}

#[derive(Debug, Error)]
pub enum DccError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("no free port in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },

    #[error("connection to {addr} timed out")]
    ConnectTimeout { addr: SocketAddr },

    #[error("connection to {addr} refused")]
    ConnectRefused { addr: SocketAddr },

    #[error("no peer connected within {secs}s")]
    AcceptTimeout { secs: u64 },

    #[error("resume position mismatch: asked for {requested}, peer accepted {accepted}")]
    ResumeMismatch { requested: u64, accepted: u64 },

    #[error("a transfer with the same {0} is already active")]
    DuplicateTransfer(String),

    #[error("transfer {0} not found")]
    UnknownTransfer(TransferId),

    #[error("transfer {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: TransferId,
        from: TransferState,
        to: TransferState,
    },

    #[error("peer closed the connection at {position} of {expected} bytes")]
    PeerClosed { position: u64, expected: u64 },

    #[error("no data for {secs}s")]
    IdleTimeout { secs: u64 },

    #[error("{0}")]
    Rejected(String),

    #[error("could not send CTCP to {nick}: {reason}")]
    Ctcp { nick: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DccError>;
