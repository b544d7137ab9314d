//! Events the DCC engine emits towards the user interface.
//!
//! Prompts carry a `oneshot` sender; the engine waits on the matching
//! receiver inside the transfer's own task. Dropping the sender without
//! answering counts as "no" (or "cancel" for a save location).

use std::path::PathBuf;
use tokio::sync::oneshot;

use super::chat::ChatState;
use super::transfer::{TransferId, TransferState};

/// Something the user has to approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    AcceptSend {
        nickname: String,
        filename: String,
        size: Option<u64>,
    },
    AcceptChat {
        nickname: String,
    },
    /// `path` already holds `existing` bytes; continue from there?
    Resume { path: PathBuf, existing: u64 },
}

#[derive(Debug)]
pub enum DccEvent {
    Confirm {
        id: TransferId,
        prompt: Confirmation,
        reply: oneshot::Sender<bool>,
    },
    ChooseSavePath {
        id: TransferId,
        suggested_name: String,
        suggested_dir: PathBuf,
        reply: oneshot::Sender<Option<PathBuf>>,
    },
    Progress {
        id: TransferId,
        bytes_done: u64,
        bytes_total: Option<u64>,
    },
    StateChanged {
        id: TransferId,
        state: TransferState,
    },
    ChatStateChanged {
        id: TransferId,
        nickname: String,
        state: ChatState,
    },
    ChatMessage {
        id: TransferId,
        nickname: String,
        text: String,
    },
}
