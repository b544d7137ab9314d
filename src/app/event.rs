use crabchat_dcc::dcc::DccEvent;

pub type ServerId = usize;

#[derive(Debug)]
pub enum AppEvent {
    /// A line typed by the user
    Input(String),
    /// Standard input reached end of file
    InputClosed,

    /// IRC message received from a server
    IrcMessage {
        server_id: ServerId,
        message: irc::client::prelude::Message,
    },

    /// IRC connection state changed
    IrcConnected {
        server_id: ServerId,
    },
    IrcDisconnected {
        server_id: ServerId,
        reason: String,
    },

    /// Prompts, progress, and state changes from the DCC engine
    Dcc(DccEvent),
}
