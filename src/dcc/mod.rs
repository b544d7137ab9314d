//! DCC (Direct Client-to-Client) chat and file transfer subsystem.
//!
//! Offers arrive as CTCP `DCC` messages relayed by the IRC layer and are
//! answered through a [`CtcpSender`]; the data itself flows over direct TCP
//! connections. Classic, reverse (port 0 plus token), resumed and turbo
//! transfers are supported.

pub mod address;
pub mod chat;
pub mod error;
pub mod event;
pub mod manager;
pub mod parser;
pub mod registry;
pub mod security;
pub mod socket;
pub mod transfer;

/// Identifies the IRC connection a DCC session was negotiated over.
pub type ConnectionHandle = usize;

pub use chat::{ChatSession, ChatState};
pub use error::{DccError, ParseError};
pub use event::{Confirmation, DccEvent};
pub use manager::{CtcpSender, DccManager};
pub use parser::DccRequest;
pub use transfer::{Direction, Transfer, TransferId, TransferState};
