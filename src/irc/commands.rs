//! User slash-command parser.
//!
//! Parses `/command arg1 arg2 ...` input lines into typed [`ParsedCommand`]
//! values that the event handler can act on.

use crabchat_dcc::dcc::TransferId;

/// A parsed user command. Each variant corresponds to a `/command`.
#[derive(Debug, PartialEq)]
pub enum ParsedCommand {
    ServerConnect { name: String },
    ServerList,
    ServerDisconnect,
    Msg { target: String, text: String },
    DccSend { nick: String, path: String },
    DccChat { nick: String },
    DccSay { id: TransferId, text: String },
    DccList,
    DccCancel { id: TransferId },
    /// Answer a pending yes/no prompt; without an id, the oldest one.
    DccAnswer { id: Option<TransferId>, yes: bool },
    /// Answer a pending save-location prompt.
    DccSave { id: Option<TransferId>, path: Option<String> },
    Quit { message: Option<String> },
    Help,
}

/// Parse a slash-command string into a [`ParsedCommand`].
///
/// Returns `None` if the input does not start with `/` or is not a recognized
/// command. Commands are case-insensitive.
pub fn parse_command(input: &str) -> Option<ParsedCommand> {
    let input = input.trim();
    let body = input.strip_prefix('/')?;

    let parts: Vec<&str> = body.splitn(3, ' ').collect();
    let cmd = parts.first()?.to_lowercase();

    match cmd.as_str() {
        "server" => {
            let subcmd = parts.get(1).map(|s| s.to_lowercase()).unwrap_or_default();
            match subcmd.as_str() {
                "connect" => {
                    let name = parts.get(2)?.trim().to_string();
                    Some(ParsedCommand::ServerConnect { name })
                }
                "list" | "ls" => Some(ParsedCommand::ServerList),
                "disconnect" | "dc" => Some(ParsedCommand::ServerDisconnect),
                _ => None,
            }
        }
        "msg" | "query" => {
            let target = parts.get(1)?.to_string();
            let text = parts.get(2).unwrap_or(&"").to_string();
            Some(ParsedCommand::Msg { target, text })
        }
        "dcc" => parse_dcc(parts.get(1)?, parts.get(2).copied().unwrap_or("").trim()),
        "quit" | "exit" => {
            let message = body.split_once(' ').map(|(_, m)| m.to_string());
            Some(ParsedCommand::Quit { message })
        }
        "help" | "h" => Some(ParsedCommand::Help),
        _ => None,
    }
}

fn parse_dcc(subcmd: &str, rest: &str) -> Option<ParsedCommand> {
    match subcmd.to_lowercase().as_str() {
        "send" => {
            let (nick, path) = rest.split_once(' ')?;
            let path = unquote(path.trim());
            if path.is_empty() {
                return None;
            }
            Some(ParsedCommand::DccSend {
                nick: nick.to_string(),
                path,
            })
        }
        "chat" => {
            let nick = rest.split_whitespace().next()?.to_string();
            Some(ParsedCommand::DccChat { nick })
        }
        "say" | "msg" => {
            let (id, text) = rest.split_once(' ')?;
            Some(ParsedCommand::DccSay {
                id: id.parse().ok()?,
                text: text.to_string(),
            })
        }
        "list" | "ls" => Some(ParsedCommand::DccList),
        "cancel" | "close" => Some(ParsedCommand::DccCancel {
            id: rest.parse().ok()?,
        }),
        "yes" | "accept" | "no" | "reject" => {
            let id = match rest {
                "" => None,
                id => Some(id.parse().ok()?),
            };
            let yes = matches!(subcmd.to_lowercase().as_str(), "yes" | "accept");
            Some(ParsedCommand::DccAnswer { id, yes })
        }
        "save" => {
            // `/dcc save [id] [path]`: a leading number is the id.
            let (id, path) = match rest.split_once(' ') {
                Some((first, path)) if first.parse::<TransferId>().is_ok() => {
                    (first.parse().ok(), path.trim())
                }
                None if rest.parse::<TransferId>().is_ok() => (rest.parse().ok(), ""),
                _ => (None, rest),
            };
            let path = unquote(path);
            Some(ParsedCommand::DccSave {
                id,
                path: (!path.is_empty()).then_some(path),
            })
        }
        _ => None,
    }
}

fn unquote(text: &str) -> String {
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
        .to_string()
}
