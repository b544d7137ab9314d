//! Registry of active DCC transfers and chat sessions.
//!
//! The registry owns every [`Transfer`]; everyone else refers to them by
//! [`TransferId`]. Transfers are indexed two ways for the CTCP handshakes:
//! by reverse-DCC token, and by `(nickname, port, short filename)`, all
//! lowercased, for RESUME/ACCEPT messages without a token. Token-bearing
//! transfers only take the endpoint slot when it is free: every reverse offer
//! starts on port 0, so the token is what tells them apart. All reads and
//! writes go through a single mutex, so a lookup never sees a half-inserted
//! transfer and a lookup-then-insert is one atomic step.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::chat::ChatSession;
use super::error::{DccError, Result};
use super::transfer::{short_name, Transfer, TransferId, TransferState};

type EndpointKey = (String, u16, String);

fn endpoint_key(nickname: &str, port: u16, filename: &str) -> EndpointKey {
    (
        nickname.to_lowercase(),
        port,
        short_name(filename).to_lowercase(),
    )
}

fn key_of(transfer: &Transfer) -> EndpointKey {
    endpoint_key(&transfer.remote_nickname, transfer.port, &transfer.filename)
}

#[derive(Default)]
struct Inner {
    next_id: TransferId,
    transfers: HashMap<TransferId, Transfer>,
    by_token: HashMap<String, TransferId>,
    by_endpoint: HashMap<EndpointKey, TransferId>,
    chats: HashMap<TransferId, ChatSession>,
    /// Tokens of transfers that have finished, kept to spot stale echoes.
    retired_tokens: HashSet<String>,
    /// `(nickname, filename)` of finished token-bearing transfers.
    retired_offers: HashSet<(String, String)>,
}

impl Inner {
    fn allocate_id(&mut self) -> TransferId {
        self.next_id += 1;
        self.next_id
    }

    fn index(&mut self, transfer: &Transfer) {
        if let Some(token) = &transfer.token {
            self.by_token.insert(token.clone(), transfer.id);
        }
        self.by_endpoint.entry(key_of(transfer)).or_insert(transfer.id);
    }

    fn unindex(&mut self, transfer: &Transfer) {
        if let Some(token) = &transfer.token {
            if self.by_token.get(token) == Some(&transfer.id) {
                self.by_token.remove(token);
            }
        }
        let key = key_of(transfer);
        if self.by_endpoint.get(&key) == Some(&transfer.id) {
            self.by_endpoint.remove(&key);
        }
    }
}

fn duplicate_endpoint(key: &EndpointKey) -> DccError {
    DccError::DuplicateTransfer(format!(
        "{} on port {} with file {}",
        key.0, key.1, key.2
    ))
}

/// Owned table of live transfers. Cloning yields another handle to the same
/// table.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("dcc registry lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    /// Insert a transfer, assigning its id.
    ///
    /// Fails with [`DccError::DuplicateTransfer`] when the token is already
    /// live, or, for a transfer without a token, when the same nickname,
    /// port and filename are. On failure nothing is inserted.
    pub fn insert(&self, mut transfer: Transfer) -> Result<TransferId> {
        let mut inner = self.lock();
        match &transfer.token {
            Some(token) => {
                if inner.by_token.contains_key(token) {
                    return Err(DccError::DuplicateTransfer(format!("token {}", token)));
                }
            }
            None => {
                let key = key_of(&transfer);
                if inner.by_endpoint.contains_key(&key) {
                    return Err(duplicate_endpoint(&key));
                }
            }
        }

        transfer.id = inner.allocate_id();
        let id = transfer.id;
        inner.index(&transfer);
        inner.transfers.insert(id, transfer);
        Ok(id)
    }

    /// Snapshot of a transfer.
    pub fn get(&self, id: TransferId) -> Option<Transfer> {
        self.lock().transfers.get(&id).cloned()
    }

    pub fn find_by_token(&self, token: &str) -> Option<TransferId> {
        if token.is_empty() {
            return None;
        }
        self.lock().by_token.get(token).copied()
    }

    /// Locate the transfer a RESUME or ACCEPT refers to.
    ///
    /// With a token the token index decides, and the transfer found must
    /// also belong to `nickname` and carry the same port and filename.
    /// Without one, the endpoint index decides.
    pub fn find_for_handshake(
        &self,
        nickname: &str,
        port: u16,
        filename: &str,
        token: Option<&str>,
    ) -> Option<TransferId> {
        let inner = self.lock();
        let key = endpoint_key(nickname, port, filename);
        match token.filter(|t| !t.is_empty()) {
            Some(token) => {
                let id = *inner.by_token.get(token)?;
                let transfer = inner.transfers.get(&id)?;
                (key_of(transfer) == key).then_some(id)
            }
            None => inner.by_endpoint.get(&key).copied(),
        }
    }

    /// Run `f` against a live transfer while holding the lock.
    ///
    /// `f` must not change `token`, `port` or `filename`; use
    /// [`Registry::set_port`] for the one key that changes after insertion.
    pub fn update<R>(&self, id: TransferId, f: impl FnOnce(&mut Transfer) -> R) -> Option<R> {
        self.lock().transfers.get_mut(&id).map(f)
    }

    /// Record the port a transfer is now reachable on, re-indexing it.
    pub fn set_port(&self, id: TransferId, port: u16) -> Result<()> {
        let mut inner = self.lock();
        let current = inner
            .transfers
            .get(&id)
            .cloned()
            .ok_or(DccError::UnknownTransfer(id))?;
        if current.port == port {
            return Ok(());
        }
        let key = endpoint_key(&current.remote_nickname, port, &current.filename);
        if inner.by_endpoint.get(&key).is_some_and(|other| *other != id) {
            return Err(duplicate_endpoint(&key));
        }

        inner.unindex(&current);
        let mut moved = current;
        moved.port = port;
        inner.index(&moved);
        inner.transfers.insert(id, moved);
        Ok(())
    }

    /// Move a transfer to `next` if that is a legal successor.
    ///
    /// Returns the previous state.
    pub fn transition(&self, id: TransferId, next: TransferState) -> Result<TransferState> {
        let mut inner = self.lock();
        let transfer = inner
            .transfers
            .get_mut(&id)
            .ok_or(DccError::UnknownTransfer(id))?;
        if !transfer.state.can_transition_to(&next) {
            return Err(DccError::InvalidTransition {
                id,
                from: transfer.state.clone(),
                to: next,
            });
        }
        Ok(std::mem::replace(&mut transfer.state, next))
    }

    /// Remove a transfer. Only the first call for an id returns it.
    pub fn remove(&self, id: TransferId) -> Option<Transfer> {
        let mut inner = self.lock();
        let transfer = inner.transfers.remove(&id)?;
        inner.unindex(&transfer);
        if let Some(token) = &transfer.token {
            inner.retired_tokens.insert(token.clone());
            inner.retired_offers.insert((
                transfer.remote_nickname.to_lowercase(),
                transfer.short_filename().to_lowercase(),
            ));
        }
        Some(transfer)
    }

    pub fn is_retired_token(&self, token: &str) -> bool {
        self.lock().retired_tokens.contains(token)
    }

    /// Whether `nickname` already completed a token-bearing offer of `filename`.
    pub fn is_retired_offer(&self, nickname: &str, filename: &str) -> bool {
        self.lock().retired_offers.contains(&(
            nickname.to_lowercase(),
            short_name(filename).to_lowercase(),
        ))
    }

    /// Whether any live transfer or retired record uses `token`.
    pub fn token_in_use(&self, token: &str) -> bool {
        let inner = self.lock();
        inner.by_token.contains_key(token) || inner.retired_tokens.contains(token)
    }

    /// Snapshot of all live transfers, ordered by id.
    pub fn transfers(&self) -> Vec<Transfer> {
        let mut all: Vec<Transfer> = self.lock().transfers.values().cloned().collect();
        all.sort_by_key(|t| t.id);
        all
    }

    pub fn len(&self) -> usize {
        self.lock().transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert_chat(&self, mut chat: ChatSession) -> TransferId {
        let mut inner = self.lock();
        chat.id = inner.allocate_id();
        let id = chat.id;
        inner.chats.insert(id, chat);
        id
    }

    pub fn update_chat<R>(&self, id: TransferId, f: impl FnOnce(&mut ChatSession) -> R) -> Option<R> {
        self.lock().chats.get_mut(&id).map(f)
    }

    pub fn chat(&self, id: TransferId) -> Option<ChatSession> {
        self.lock().chats.get(&id).cloned()
    }

    pub fn remove_chat(&self, id: TransferId) -> Option<ChatSession> {
        self.lock().chats.remove(&id)
    }

    pub fn chats(&self) -> Vec<ChatSession> {
        let mut all: Vec<ChatSession> = self.lock().chats.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    /// Drop every entry, returning the ids that were live.
    pub fn clear(&self) -> Vec<TransferId> {
        let mut inner = self.lock();
        let mut ids: Vec<TransferId> = inner.transfers.keys().copied().collect();
        ids.extend(inner.chats.keys().copied());
        inner.transfers.clear();
        inner.chats.clear();
        inner.by_token.clear();
        inner.by_endpoint.clear();
        ids
    }
}
