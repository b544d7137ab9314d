use crate::app::event::ServerId;
use crabchat_dcc::config::ServerConfig;
use crabchat_dcc::dcc::TransferId;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Action {
    ConnectServer { server_id: ServerId, server: ServerConfig },
    DisconnectServer { server_id: ServerId },
    SendPrivmsg { server_id: ServerId, target: String, text: String },
    /// Inbound CTCP addressed to the DCC engine
    DccIncoming { server_id: ServerId, from: String, command: String, args: String },
    DccSend { server_id: ServerId, nick: String, path: PathBuf },
    DccChat { server_id: ServerId, nick: String },
    DccSay { id: TransferId, text: String },
    DccCancel { id: TransferId },
    DccList,
    Quit { message: Option<String> },
}
