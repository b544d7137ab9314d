use crate::app::event::ServerId;
use crabchat_dcc::config::{AppConfig, ServerConfig};
use crabchat_dcc::dcc::TransferId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ServerState {
    pub id: ServerId,
    pub name: String,
    /// Our current nickname on this server.
    pub nickname: String,
    pub status: ConnectionStatus,
}

/// How a pending DCC prompt is answered.
#[derive(Debug)]
pub enum PromptReply {
    Confirm(oneshot::Sender<bool>),
    SavePath {
        suggested: PathBuf,
        reply: oneshot::Sender<Option<PathBuf>>,
    },
}

#[derive(Debug)]
pub struct PendingPrompt {
    pub id: TransferId,
    pub reply: PromptReply,
}

impl PendingPrompt {
    /// Answer "yes" (or the suggested path). Dropping the prompt means "no".
    pub fn accept(self) {
        match self.reply {
            PromptReply::Confirm(reply) => {
                let _ = reply.send(true);
            }
            PromptReply::SavePath { suggested, reply } => {
                let _ = reply.send(Some(suggested));
            }
        }
    }
}

/// A DCC chat line waiting to be written to the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    pub peer: String,
    pub sender: String,
    pub text: String,
}

pub struct AppState {
    pub config: AppConfig,
    pub servers: BTreeMap<ServerId, ServerState>,
    pub active_server: Option<ServerId>,
    next_server_id: ServerId,
    /// Unanswered DCC prompts, oldest first.
    pub prompts: VecDeque<PendingPrompt>,
    /// Last progress quarter reported per transfer.
    pub progress_marks: HashMap<TransferId, u64>,
    /// Lines to print, drained by the main loop.
    pub output: Vec<String>,
    pub new_chat_lines: Vec<ChatLine>,
    pub should_quit: bool,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            servers: BTreeMap::new(),
            active_server: None,
            next_server_id: 1,
            prompts: VecDeque::new(),
            progress_marks: HashMap::new(),
            output: Vec::new(),
            new_chat_lines: Vec::new(),
            should_quit: false,
        }
    }

    pub fn allocate_server_id(&mut self) -> ServerId {
        let id = self.next_server_id;
        self.next_server_id += 1;
        id
    }

    /// Register a server we are about to connect to and make it active.
    pub fn add_server(&mut self, config: &ServerConfig) -> ServerId {
        let id = self.allocate_server_id();
        self.servers.insert(
            id,
            ServerState {
                id,
                name: config.name.clone(),
                nickname: config.nickname.clone(),
                status: ConnectionStatus::Connecting,
            },
        );
        self.active_server = Some(id);
        id
    }

    pub fn get_server(&self, id: ServerId) -> Option<&ServerState> {
        self.servers.get(&id)
    }

    pub fn get_server_mut(&mut self, id: ServerId) -> Option<&mut ServerState> {
        self.servers.get_mut(&id)
    }

    pub fn active_server_id(&self) -> Option<ServerId> {
        self.active_server
            .filter(|id| matches!(self.servers.get(id), Some(s) if s.status != ConnectionStatus::Disconnected))
    }

    pub fn system_message(&mut self, text: impl Into<String>) {
        self.output.push(format!("-!- {}", text.into()));
    }

    pub fn error_message(&mut self, text: impl Into<String>) {
        self.output.push(format!("!!! {}", text.into()));
    }

    /// Remove the oldest prompt matching `id` (any id when `None`) that
    /// `filter` accepts.
    pub fn take_prompt(
        &mut self,
        id: Option<TransferId>,
        filter: impl Fn(&PromptReply) -> bool,
    ) -> Option<PendingPrompt> {
        let idx = self
            .prompts
            .iter()
            .position(|p| id.map_or(true, |id| p.id == id) && filter(&p.reply))?;
        self.prompts.remove(idx)
    }

    /// Forget prompts for a transfer that has ended.
    pub fn drop_prompts(&mut self, id: TransferId) {
        self.prompts.retain(|p| p.id != id);
    }
}
