//! DCC negotiation engine.
//!
//! [`DccManager`] turns inbound CTCP `DCC` messages and local commands into
//! registry changes, socket tasks and outbound CTCP replies. Decisions are
//! taken synchronously on the caller's path; everything that waits (prompts,
//! sockets, file I/O) runs in one tokio task per transfer or chat.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use rand::RngExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use super::address::{detect_local_ipv4, ip_to_u32, resolve_ipv4};
use super::chat::{run_chat, ChatSession, ChatState};
use super::error::{DccError, Result};
use super::event::{Confirmation, DccEvent};
use super::parser::{AcceptRequest, ChatRequest, DccRequest, ResumeRequest, SendRequest};
use super::registry::Registry;
use super::security;
use super::socket;
use super::transfer::{self, Direction, StreamPlan, Transfer, TransferId, TransferState};
use super::ConnectionHandle;
use crate::config::DccConfig;

/// Outbound half of the IRC layer, as seen by the DCC engine.
pub trait CtcpSender: Send + Sync {
    /// Send `\x01<command> <text>\x01` to `nick` over `connection`.
    fn send_ctcp(
        &self,
        connection: ConnectionHandle,
        nick: &str,
        command: &str,
        text: &str,
    ) -> anyhow::Result<()>;

    /// Our address as the IRC server sees it, if the connection knows it.
    fn local_ip(&self, connection: ConnectionHandle) -> Option<Ipv4Addr>;
}

/// Coordinates DCC chats and file transfers for every IRC connection.
///
/// Cloning is cheap; all clones share one registry.
#[derive(Clone)]
pub struct DccManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: DccConfig,
    registry: Registry,
    ctcp: Arc<dyn CtcpSender>,
    event_tx: mpsc::UnboundedSender<DccEvent>,
    tasks: Mutex<HashMap<TransferId, AbortHandle>>,
}

impl DccManager {
    pub fn new(
        config: DccConfig,
        ctcp: Arc<dyn CtcpSender>,
        event_tx: mpsc::UnboundedSender<DccEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Registry::new(),
                ctcp,
                event_tx,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &DccConfig {
        &self.shared.config
    }

    pub fn transfer(&self, id: TransferId) -> Option<Transfer> {
        self.shared.registry.get(id)
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.shared.registry.transfers()
    }

    pub fn chats(&self) -> Vec<ChatSession> {
        self.shared.registry.chats()
    }

    /// Entry point for every inbound CTCP message.
    ///
    /// Anything that is not a well-formed `DCC` request is logged and
    /// dropped. Must be called from within a tokio runtime.
    pub fn handle_ctcp_dcc(
        &self,
        command: &str,
        args: &str,
        from_nick: &str,
        connection: ConnectionHandle,
    ) {
        if !command.eq_ignore_ascii_case("DCC") {
            return;
        }
        let request = match DccRequest::parse(args) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(nick = from_nick, error = %e, payload = args, "ignoring malformed DCC request");
                return;
            }
        };
        tracing::debug!(nick = from_nick, command = request.command_name(), "DCC <-");

        match request {
            DccRequest::Chat(req) => self.on_chat_offer(req, from_nick, connection),
            DccRequest::Send(req) => self.on_send_offer(req, from_nick, connection),
            DccRequest::Resume(req) => self.on_resume(req, from_nick, connection),
            DccRequest::Accept(req) => self.on_accept(req, from_nick),
        }
    }

    fn on_send_offer(&self, req: SendRequest, nick: &str, connection: ConnectionHandle) {
        let registry = &self.shared.registry;
        let token = req.token.clone().filter(|t| !t.is_empty());

        if let Some(token) = &token {
            if let Some(id) = registry.find_by_token(token) {
                match registry.get(id) {
                    Some(ours)
                        if ours.direction == Direction::Send
                            && ours.state == TransferState::Requested
                            && req.port != 0
                            && ours.remote_nickname.eq_ignore_ascii_case(nick) =>
                    {
                        self.connect_reverse_send(id, &req)
                    }
                    _ => tracing::debug!(id, token = %token, "duplicate DCC SEND ignored"),
                }
                return;
            }
            if req.port != 0 {
                tracing::debug!(nick, token = %token, "stale reverse DCC echo ignored");
                return;
            }
            if registry.is_retired_token(token) {
                tracing::debug!(nick, token = %token, "DCC SEND for a finished transfer ignored");
                return;
            }
        } else if req.port == 0 && registry.is_retired_offer(nick, &req.filename) {
            tracing::debug!(nick, file = %req.filename, "stale tokenless reverse DCC SEND ignored");
            return;
        }

        if security::sanitize_filename(&req.filename).is_none() {
            tracing::warn!(nick, file = %req.filename, "DCC SEND with unusable filename ignored");
            return;
        }
        if let Err(e) = security::vet_offer(&req, &self.shared.config) {
            tracing::warn!(nick, error = %e, "DCC SEND refused");
            return;
        }

        let mut offer = Transfer::new(Direction::Receive, nick, connection, req.filename.clone());
        offer.token = token;
        offer.host = req.ip();
        offer.port = req.port;
        offer.reverse = req.is_reverse();
        offer.file_size = req.size;
        offer.turbo = req.turbo;
        offer.block_size = self.shared.config.block_size;

        let id = match registry.insert(offer) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(nick, error = %e, "DCC SEND ignored");
                return;
            }
        };
        tracing::info!(
            id,
            nick,
            file = %req.filename,
            size = ?req.size,
            reverse = req.is_reverse(),
            "DCC SEND offer"
        );
        self.emit_state(id, TransferState::Requested);

        let this = self.clone();
        self.spawn_transfer(id, async move { this.negotiate_receive(id).await });
    }

    /// Prompt, pick a save path, then either resume or start receiving.
    async fn negotiate_receive(&self, id: TransferId) -> Result<()> {
        let offer = self.snapshot(id)?;
        let auto = self.shared.config.auto_accept;

        if !auto {
            let prompt = Confirmation::AcceptSend {
                nickname: offer.remote_nickname.clone(),
                filename: offer.short_filename().to_string(),
                size: offer.file_size,
            };
            if !self.confirm(id, prompt).await {
                return Err(DccError::Rejected("declined".into()));
            }
        }

        let Some(path) = self.choose_save_path(&offer).await else {
            return Err(DccError::Rejected("no save location chosen".into()));
        };
        let existing = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let resume = existing > 0
            && (auto
                || self
                    .confirm(
                        id,
                        Confirmation::Resume {
                            path: path.clone(),
                            existing,
                        },
                    )
                    .await);
        self.shared
            .registry
            .update(id, |t| t.local_path = Some(path))
            .ok_or(DccError::UnknownTransfer(id))?;

        if !resume {
            return self.begin_receive(id).await;
        }

        self.set_state(id, TransferState::ResumeRequested { position: existing })?;
        let token = match &offer.token {
            Some(_) if offer.reverse && !self.shared.config.resume_reverse_send_token => None,
            other => other.clone(),
        };
        let request = DccRequest::Resume(ResumeRequest {
            filename: offer.short_filename().to_string(),
            port: offer.port,
            position: existing,
            token,
        });
        self.send_request(offer.connection, &offer.remote_nickname, &request)?;

        // The ACCEPT handler replaces this task; still being here means no answer.
        let wait = self.listen_timeout();
        tokio::time::sleep(wait).await;
        Err(DccError::AcceptTimeout {
            secs: wait.as_secs(),
        })
    }

    async fn choose_save_path(&self, offer: &Transfer) -> Option<PathBuf> {
        let dir = &self.shared.config.download_dir;
        let name = security::sanitize_filename(&offer.filename)?;

        if self.shared.config.auto_accept {
            let target = security::download_target(dir, &name)?;
            if is_complete_file(&target, offer.file_size).await {
                return security::safe_download_path(dir, &name);
            }
            return Some(target);
        }

        loop {
            let path = self.ask_save_path(offer.id, &name, dir).await?;
            if !is_complete_file(&path, offer.file_size).await {
                return Some(path);
            }
            tracing::warn!(
                path = %path.display(),
                "file is already complete or longer than the offer; choose another"
            );
        }
    }

    /// Open the data connection for a receive: listen and answer with our
    /// own SEND for reverse offers, dial the sender otherwise.
    async fn begin_receive(&self, id: TransferId) -> Result<()> {
        let offer = self.snapshot(id)?;

        let mut stream = if offer.reverse {
            let (listener, port) = socket::listen(self.shared.config.port_range).await?;
            self.shared.registry.set_port(id, port)?;
            self.set_state(id, TransferState::Listening)?;

            let ip = self.local_ip(offer.connection).await?;
            let reply = DccRequest::Send(SendRequest {
                filename: offer.short_filename().to_string(),
                ip_raw: ip_to_u32(IpAddr::V4(ip))?,
                port,
                size: offer.file_size,
                token: offer.token.clone(),
                turbo: false,
            });
            self.send_request(offer.connection, &offer.remote_nickname, &reply)?;

            let (stream, peer) = socket::accept_one(listener, self.listen_timeout()).await?;
            tracing::debug!(id, %peer, "reverse DCC peer connected");
            stream
        } else {
            self.set_state(id, TransferState::Connecting)?;
            let addr = SocketAddr::from((offer.host, offer.port));
            socket::connect(addr, self.connect_timeout()).await?
        };

        self.set_state(id, TransferState::Connected)?;
        self.receive(id, &mut stream).await
    }

    async fn receive(&self, id: TransferId, stream: &mut TcpStream) -> Result<()> {
        self.set_state(id, TransferState::Transferring)?;
        let t = self.mark_started(id)?;
        let path = t
            .local_path
            .clone()
            .ok_or_else(|| DccError::Rejected("no save location".into()))?;
        let plan = StreamPlan {
            path,
            start_offset: t.start_offset,
            file_size: t.file_size,
            block_size: t.block_size,
            turbo: t.turbo,
            idle_timeout: self.idle_timeout(),
        };

        let received =
            transfer::run_receive(stream, &plan, |done| self.progress(&t, done)).await?;
        tracing::info!(id, received, path = %plan.path.display(), "DCC receive finished");
        self.finish(id, TransferState::Completed).await;
        Ok(())
    }

    /// The receiver of our reverse offer is listening: dial it.
    fn connect_reverse_send(&self, id: TransferId, req: &SendRequest) {
        if let Err(e) = self.set_state(id, TransferState::Connecting) {
            tracing::debug!(id, error = %e, "duplicate reverse DCC answer ignored");
            return;
        }
        self.shared.registry.update(id, |t| t.host = req.ip());
        if let Err(e) = self.shared.registry.set_port(id, req.port) {
            tracing::warn!(id, error = %e, "could not record reverse DCC port");
        }

        let addr = SocketAddr::from((req.ip(), req.port));
        let this = self.clone();
        self.spawn_transfer(id, async move {
            let mut stream = socket::connect(addr, this.connect_timeout()).await?;
            this.set_state(id, TransferState::Connected)?;
            this.stream_send(id, &mut stream).await
        });
    }

    async fn stream_send(&self, id: TransferId, stream: &mut TcpStream) -> Result<()> {
        self.set_state(id, TransferState::Transferring)?;
        let t = self.mark_started(id)?;
        let path = t
            .local_path
            .clone()
            .ok_or_else(|| DccError::Rejected("no local file".into()))?;
        let plan = StreamPlan {
            path,
            start_offset: t.start_offset,
            file_size: t.file_size,
            block_size: t.block_size,
            turbo: t.turbo,
            idle_timeout: self.idle_timeout(),
        };

        let registry = &self.shared.registry;
        let sent = transfer::run_send(
            stream,
            &plan,
            |done| {
                registry.update(id, |t| t.transferred = done);
            },
            |done| self.progress(&t, done),
        )
        .await?;
        tracing::info!(id, sent, file = %t.filename, "DCC send finished");
        self.finish(id, TransferState::Completed).await;
        Ok(())
    }

    /// We are the sender and the peer wants to continue from `req.position`.
    fn on_resume(&self, req: ResumeRequest, nick: &str, connection: ConnectionHandle) {
        let registry = &self.shared.registry;
        let Some(id) =
            registry.find_for_handshake(nick, req.port, &req.filename, req.token.as_deref())
        else {
            tracing::debug!(nick, file = %req.filename, port = req.port, "DCC RESUME for unknown transfer ignored");
            return;
        };

        let accepted = registry
            .update(id, |t| {
                let waiting = matches!(t.state, TransferState::Requested | TransferState::Listening);
                if t.direction != Direction::Send
                    || !waiting
                    || !t.remote_nickname.eq_ignore_ascii_case(nick)
                {
                    return None;
                }
                let position = match t.file_size {
                    Some(size) if req.position > size => 0,
                    _ => req.position,
                };
                t.start_offset = position;
                Some(position)
            })
            .flatten();
        let Some(position) = accepted else {
            tracing::debug!(id, nick, "DCC RESUME for a transfer that cannot resume ignored");
            return;
        };

        tracing::info!(id, requested = req.position, position, "DCC RESUME accepted");
        let reply = DccRequest::Accept(AcceptRequest {
            filename: req.filename,
            port: req.port,
            position,
            token: req.token,
        });
        if let Err(e) = self.send_request(connection, nick, &reply) {
            tracing::warn!(id, error = %e, "could not answer DCC RESUME");
        }
    }

    /// The sender answered our RESUME.
    fn on_accept(&self, req: AcceptRequest, nick: &str) {
        let registry = &self.shared.registry;
        let Some(id) =
            registry.find_for_handshake(nick, req.port, &req.filename, req.token.as_deref())
        else {
            tracing::debug!(nick, file = %req.filename, port = req.port, "DCC ACCEPT for unknown transfer ignored");
            return;
        };

        let outcome = registry
            .update(id, |t| {
                let TransferState::ResumeRequested { position } = t.state else {
                    return None;
                };
                if t.direction != Direction::Receive || !t.remote_nickname.eq_ignore_ascii_case(nick) {
                    return None;
                }
                let next = if position == req.position {
                    t.start_offset = position;
                    TransferState::ResumeAccepted
                } else {
                    t.start_offset = 0;
                    TransferState::Requested
                };
                t.state = next.clone();
                Some((position, next))
            })
            .flatten();
        let Some((proposed, next)) = outcome else {
            tracing::debug!(id, nick, "unexpected DCC ACCEPT ignored");
            return;
        };

        if next == TransferState::Requested {
            let mismatch = DccError::ResumeMismatch {
                requested: proposed,
                accepted: req.position,
            };
            tracing::warn!(id, error = %mismatch, "restarting DCC transfer from zero");
        }
        self.emit_state(id, next);

        let this = self.clone();
        self.spawn_transfer(id, async move { this.begin_receive(id).await });
    }

    /// Offer a local file to `nick`.
    ///
    /// Classic offers listen on a local port; with `reverse_send` the offer
    /// carries port 0 and a fresh token and the peer is expected to listen.
    pub async fn start_send(
        &self,
        connection: ConnectionHandle,
        nick: &str,
        path: &Path,
    ) -> Result<TransferId> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(DccError::Rejected(format!("{} is not a file", path.display())));
        }
        if meta.len() == 0 {
            return Err(DccError::Rejected(format!("{} is empty", path.display())));
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DccError::Rejected(format!("{} has no usable name", path.display())))?
            .to_string();

        let config = &self.shared.config;
        let ip = self.local_ip(connection).await?;
        let ip_raw = ip_to_u32(IpAddr::V4(ip))?;

        let mut offer = Transfer::new(Direction::Send, nick, connection, filename.clone());
        offer.host = ip;
        offer.local_path = Some(path.to_path_buf());
        offer.file_size = Some(meta.len());
        offer.reverse = config.reverse_send;
        offer.turbo = config.force_turbo;
        offer.block_size = config.block_size;

        let mut request = SendRequest {
            filename,
            ip_raw,
            port: 0,
            size: Some(meta.len()),
            token: None,
            turbo: config.force_turbo,
        };

        let (id, listener) = if config.reverse_send {
            let token = self.new_token();
            offer.token = Some(token.clone());
            request.token = Some(token);
            let id = self.shared.registry.insert(offer)?;
            self.emit_state(id, TransferState::Requested);
            (id, None)
        } else {
            let (listener, port) = socket::listen(config.port_range).await?;
            offer.port = port;
            request.port = port;
            let id = self.shared.registry.insert(offer)?;
            self.emit_state(id, TransferState::Requested);
            self.set_state(id, TransferState::Listening)?;
            (id, Some(listener))
        };
        tracing::info!(id, nick, file = %request.filename, reverse = listener.is_none(), "offering file over DCC");

        if let Err(e) = self.send_request(connection, nick, &DccRequest::Send(request)) {
            self.finish(id, TransferState::failed(e.to_string())).await;
            return Err(e);
        }

        let wait = self.listen_timeout();
        match listener {
            Some(listener) => {
                let this = self.clone();
                self.spawn_transfer(id, async move {
                    let (mut stream, peer) = socket::accept_one(listener, wait).await?;
                    tracing::debug!(id, %peer, "DCC receiver connected");
                    this.set_state(id, TransferState::Connected)?;
                    this.stream_send(id, &mut stream).await
                });
            }
            // Replaced by the connect task once the peer answers.
            None => self.spawn_transfer(id, async move {
                tokio::time::sleep(wait).await;
                Err(DccError::AcceptTimeout {
                    secs: wait.as_secs(),
                })
            }),
        }
        Ok(id)
    }

    fn on_chat_offer(&self, req: ChatRequest, nick: &str, connection: ConnectionHandle) {
        if req.port == 0 {
            tracing::debug!(nick, "reverse DCC CHAT is not supported");
            return;
        }
        let ip = req.ip();
        if self.shared.config.reject_private_ips && security::is_private_ip(&IpAddr::V4(ip)) {
            tracing::warn!(nick, %ip, "DCC CHAT from private address refused");
            return;
        }

        let mut chat = ChatSession::new(nick, connection);
        chat.host = ip;
        chat.port = req.port;
        let id = self.shared.registry.insert_chat(chat);
        tracing::info!(id, nick, "DCC CHAT offer");
        self.emit_chat_state(id, nick, ChatState::Connecting);

        let this = self.clone();
        let nick = nick.to_string();
        let addr = SocketAddr::from((ip, req.port));
        self.spawn_chat(id, async move {
            if !this.shared.config.auto_accept
                && !this
                    .confirm(id, Confirmation::AcceptChat { nickname: nick })
                    .await
            {
                return Err(DccError::Rejected("declined".into()));
            }
            let stream = socket::connect(addr, this.connect_timeout()).await?;
            this.run_chat_session(id, stream).await
        });
    }

    /// Offer a DCC CHAT to `nick` and wait for them to connect.
    pub async fn start_chat(&self, connection: ConnectionHandle, nick: &str) -> Result<TransferId> {
        let (listener, port) = socket::listen(self.shared.config.port_range).await?;
        let ip = self.local_ip(connection).await?;
        let request = DccRequest::Chat(ChatRequest {
            ip_raw: ip_to_u32(IpAddr::V4(ip))?,
            port,
        });

        let mut chat = ChatSession::new(nick, connection);
        chat.host = ip;
        chat.port = port;
        chat.state = ChatState::Listening;
        let id = self.shared.registry.insert_chat(chat);
        self.emit_chat_state(id, nick, ChatState::Listening);

        if let Err(e) = self.send_request(connection, nick, &request) {
            self.end_chat(id);
            return Err(e);
        }

        let this = self.clone();
        let wait = self.listen_timeout();
        self.spawn_chat(id, async move {
            let (stream, _) = socket::accept_one(listener, wait).await?;
            this.run_chat_session(id, stream).await
        });
        Ok(id)
    }

    async fn run_chat_session(&self, id: TransferId, stream: TcpStream) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let nick = self
            .shared
            .registry
            .update_chat(id, |c| {
                c.state = ChatState::Open;
                c.outgoing = Some(tx);
                c.remote_nickname.clone()
            })
            .ok_or(DccError::UnknownTransfer(id))?;
        self.emit_chat_state(id, &nick, ChatState::Open);

        run_chat(stream, rx, |text| {
            self.emit(DccEvent::ChatMessage {
                id,
                nickname: nick.clone(),
                text,
            })
        })
        .await
    }

    pub fn send_chat_line(&self, id: TransferId, text: &str) -> Result<()> {
        let chat = self
            .shared
            .registry
            .chat(id)
            .ok_or(DccError::UnknownTransfer(id))?;
        match chat.outgoing {
            Some(tx) if chat.is_open() => tx
                .send(text.to_string())
                .map_err(|_| DccError::Rejected(format!("chat {} is closed", id))),
            _ => Err(DccError::Rejected(format!("chat {} is not open yet", id))),
        }
    }

    /// Close a chat session. Returns `false` if it was already gone.
    pub fn close_chat(&self, id: TransferId) -> bool {
        let task = self.tasks().remove(&id);
        let closed = self.end_chat(id);
        if let Some(task) = task {
            task.abort();
        }
        closed
    }

    fn end_chat(&self, id: TransferId) -> bool {
        let Some(chat) = self.shared.registry.remove_chat(id) else {
            return false;
        };
        self.tasks().remove(&id);
        tracing::info!(id, nick = %chat.remote_nickname, "DCC CHAT closed");
        self.emit_chat_state(id, &chat.remote_nickname, ChatState::Closed);
        true
    }

    /// Cancel a transfer or close a chat.
    ///
    /// Only the first call for an id has an effect and returns `true`.
    pub fn cancel(&self, id: TransferId) -> bool {
        if self.shared.registry.chat(id).is_some() {
            return self.close_chat(id);
        }

        let registry = &self.shared.registry;
        let cancelled = TransferState::failed("cancelled");
        if registry.transition(id, cancelled.clone()).is_err() {
            return false;
        }
        let Some(t) = registry.remove(id) else {
            return false;
        };
        if let Some(task) = self.tasks().remove(&id) {
            task.abort();
        }
        tracing::info!(id, file = %t.filename, "DCC transfer cancelled");

        if t.direction == Direction::Receive {
            if let (Some(path), Ok(runtime)) = (t.local_path, tokio::runtime::Handle::try_current()) {
                runtime.spawn(async move { transfer::discard_if_empty(&path).await });
            }
        }
        self.emit_state(id, cancelled);
        true
    }

    /// Abort every task and forget every transfer and chat.
    pub fn shutdown(&self) {
        for (_, task) in self.tasks().drain() {
            task.abort();
        }
        let ids = self.shared.registry.clear();
        tracing::info!(count = ids.len(), "DCC subsystem shut down");
    }

    /// Move a transfer to a terminal state and drop it from the registry.
    /// A transfer that is already gone is left alone.
    async fn finish(&self, id: TransferId, outcome: TransferState) {
        let registry = &self.shared.registry;
        if registry.transition(id, outcome.clone()).is_err() {
            return;
        }
        let Some(t) = registry.remove(id) else {
            return;
        };
        self.tasks().remove(&id);

        match &outcome {
            TransferState::Failed { reason } => {
                tracing::warn!(id, nick = %t.remote_nickname, file = %t.filename, reason = %reason, "DCC transfer failed");
                if t.direction == Direction::Receive {
                    if let Some(path) = &t.local_path {
                        transfer::discard_if_empty(path).await;
                    }
                }
            }
            _ => {
                tracing::info!(id, nick = %t.remote_nickname, file = %t.filename, bytes = t.position(), "DCC transfer completed")
            }
        }
        self.emit_state(id, outcome);
    }

    fn spawn_transfer<F>(&self, id: TransferId, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = task.await {
                this.finish(id, TransferState::failed(e.to_string())).await;
            }
        });
        self.track(id, handle.abort_handle());
    }

    fn spawn_chat<F>(&self, id: TransferId, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::warn!(id, error = %e, "DCC CHAT ended");
            }
            this.end_chat(id);
        });
        self.track(id, handle.abort_handle());
    }

    /// Remember the task driving `id`, aborting the one it replaces.
    fn track(&self, id: TransferId, handle: AbortHandle) {
        let previous = if handle.is_finished() {
            self.tasks().remove(&id)
        } else {
            self.tasks().insert(id, handle)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TransferId, AbortHandle>> {
        match self.shared.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("dcc task table lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    fn snapshot(&self, id: TransferId) -> Result<Transfer> {
        self.shared
            .registry
            .get(id)
            .ok_or(DccError::UnknownTransfer(id))
    }

    fn mark_started(&self, id: TransferId) -> Result<Transfer> {
        self.shared
            .registry
            .update(id, |t| {
                t.started_at = Some(Local::now());
                t.transferred = 0;
                t.clone()
            })
            .ok_or(DccError::UnknownTransfer(id))
    }

    fn progress(&self, t: &Transfer, done: u64) {
        self.shared.registry.update(t.id, |live| live.transferred = done);
        self.emit(DccEvent::Progress {
            id: t.id,
            bytes_done: t.start_offset + done,
            bytes_total: t.file_size,
        });
    }

    fn set_state(&self, id: TransferId, state: TransferState) -> Result<()> {
        self.shared.registry.transition(id, state.clone())?;
        self.emit_state(id, state);
        Ok(())
    }

    fn emit_state(&self, id: TransferId, state: TransferState) {
        self.emit(DccEvent::StateChanged { id, state });
    }

    fn emit_chat_state(&self, id: TransferId, nickname: &str, state: ChatState) {
        self.emit(DccEvent::ChatStateChanged {
            id,
            nickname: nickname.to_string(),
            state,
        });
    }

    fn emit(&self, event: DccEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    async fn confirm(&self, id: TransferId, prompt: Confirmation) -> bool {
        let (reply, answer) = oneshot::channel();
        self.emit(DccEvent::Confirm { id, prompt, reply });
        answer.await.unwrap_or(false)
    }

    async fn ask_save_path(&self, id: TransferId, name: &str, dir: &Path) -> Option<PathBuf> {
        let (reply, answer) = oneshot::channel();
        self.emit(DccEvent::ChooseSavePath {
            id,
            suggested_name: name.to_string(),
            suggested_dir: dir.to_path_buf(),
            reply,
        });
        answer.await.ok().flatten()
    }

    fn send_request(&self, connection: ConnectionHandle, nick: &str, request: &DccRequest) -> Result<()> {
        let text = request.to_string();
        tracing::debug!(nick, text = %text, "DCC ->");
        self.shared
            .ctcp
            .send_ctcp(connection, nick, "DCC", &text)
            .map_err(|e| DccError::Ctcp {
                nick: nick.to_string(),
                reason: e.to_string(),
            })
    }

    /// Address advertised to peers: the configured one, then what the IRC
    /// connection reports, then a local guess.
    async fn local_ip(&self, connection: ConnectionHandle) -> Result<Ipv4Addr> {
        if let Some(forced) = self.shared.config.forced_outbound_ip.as_deref() {
            return Ok(resolve_ipv4(forced).await?);
        }
        Ok(self
            .shared
            .ctcp
            .local_ip(connection)
            .unwrap_or_else(detect_local_ipv4))
    }

    fn new_token(&self) -> String {
        let mut rng = rand::rng();
        loop {
            let token = rng.random_range(1_000u32..1_000_000_000).to_string();
            if !self.shared.registry.token_in_use(&token) {
                return token;
            }
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.shared.config.connect_timeout_secs)
    }

    fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.shared.config.listen_timeout_secs)
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.shared.config.idle_timeout_secs)
    }
}

async fn is_complete_file(path: &Path, size: Option<u64>) -> bool {
    match (size, tokio::fs::metadata(path).await) {
        (Some(size), Ok(meta)) => meta.len() >= size,
        _ => false,
    }
}
