use crate::app::action::Action;
use crate::app::event::{AppEvent, ServerId};
use crate::app::state::*;
use crate::irc::commands::{self, ParsedCommand};
use crabchat_dcc::dcc::{ChatState, Confirmation, DccEvent, Direction, Transfer, TransferState};
use std::path::PathBuf;

pub fn handle_event(state: &mut AppState, event: AppEvent) -> Vec<Action> {
    match event {
        AppEvent::Input(line) => handle_input(state, &line),
        AppEvent::InputClosed => vec![Action::Quit { message: None }],
        AppEvent::IrcMessage { server_id, message } => handle_irc_message(state, server_id, message),
        AppEvent::IrcConnected { server_id } => {
            if let Some(srv) = state.get_server_mut(server_id) {
                srv.status = ConnectionStatus::Connected;
            }
            state.system_message(format!("Connected to server {}.", server_id));
            vec![]
        }
        AppEvent::IrcDisconnected { server_id, reason } => {
            if let Some(srv) = state.get_server_mut(server_id) {
                srv.status = ConnectionStatus::Disconnected;
            }
            state.system_message(format!("Disconnected from server {}: {}", server_id, reason));
            vec![]
        }
        AppEvent::Dcc(event) => {
            handle_dcc_event(state, event);
            vec![]
        }
    }
}

fn handle_input(state: &mut AppState, line: &str) -> Vec<Action> {
    let line = line.trim();
    if line.is_empty() {
        return vec![];
    }
    if !line.starts_with('/') {
        state.system_message("Not a command. Use /msg <nick> <text> or /help.");
        return vec![];
    }
    match commands::parse_command(line) {
        Some(cmd) => handle_command(state, cmd),
        None => {
            state.error_message(format!("Unknown or incomplete command: {}", line));
            vec![]
        }
    }
}

fn handle_command(state: &mut AppState, cmd: ParsedCommand) -> Vec<Action> {
    match cmd {
        ParsedCommand::ServerConnect { name } => {
            let Some(srv_cfg) = state
                .config
                .servers
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(&name))
                .cloned()
            else {
                let names: Vec<_> = state.config.servers.iter().map(|s| s.name.clone()).collect();
                state.error_message(format!("Unknown server '{}'. Available: {}", name, names.join(", ")));
                return vec![];
            };
            let server_id = state.add_server(&srv_cfg);
            state.system_message(format!("Connecting to {}:{}...", srv_cfg.host, srv_cfg.port));
            vec![Action::ConnectServer { server_id, server: srv_cfg }]
        }
        ParsedCommand::ServerList => {
            let lines: Vec<String> = state
                .config
                .servers
                .iter()
                .map(|s| format!("  {}  ({}:{})", s.name, s.host, s.port))
                .collect();
            for line in lines {
                state.system_message(line);
            }
            vec![]
        }
        ParsedCommand::ServerDisconnect => match state.active_server_id() {
            Some(server_id) => vec![Action::DisconnectServer { server_id }],
            None => {
                state.error_message("No active server");
                vec![]
            }
        },
        ParsedCommand::Msg { target, text } => match state.active_server_id() {
            Some(server_id) if !text.is_empty() => {
                state.output.push(format!("-> <{}> {}", target, text));
                vec![Action::SendPrivmsg { server_id, target, text }]
            }
            Some(_) => vec![],
            None => {
                state.error_message("No active server");
                vec![]
            }
        },
        ParsedCommand::DccSend { nick, path } => {
            let Some(server_id) = dcc_target(state, &nick) else {
                return vec![];
            };
            vec![Action::DccSend {
                server_id,
                nick,
                path: PathBuf::from(path),
            }]
        }
        ParsedCommand::DccChat { nick } => {
            let Some(server_id) = dcc_target(state, &nick) else {
                return vec![];
            };
            vec![Action::DccChat { server_id, nick }]
        }
        ParsedCommand::DccSay { id, text } => vec![Action::DccSay { id, text }],
        ParsedCommand::DccList => vec![Action::DccList],
        ParsedCommand::DccCancel { id } => vec![Action::DccCancel { id }],
        ParsedCommand::DccAnswer { id, yes } => {
            match state.take_prompt(id, |_| true) {
                Some(prompt) if yes => prompt.accept(),
                // Dropping the reply declines.
                Some(_) => {}
                None => state.error_message("No pending DCC question"),
            }
            vec![]
        }
        ParsedCommand::DccSave { id, path } => {
            let prompt = state.take_prompt(id, |reply| matches!(reply, PromptReply::SavePath { .. }));
            match (prompt, path) {
                (
                    Some(PendingPrompt {
                        reply: PromptReply::SavePath { reply, .. },
                        ..
                    }),
                    Some(path),
                ) => {
                    let _ = reply.send(Some(PathBuf::from(path)));
                }
                (Some(prompt), None) => prompt.accept(),
                _ => state.error_message("No pending DCC save location"),
            }
            vec![]
        }
        ParsedCommand::Quit { message } => vec![Action::Quit { message }],
        ParsedCommand::Help => {
            for line in HELP {
                state.system_message(*line);
            }
            vec![]
        }
    }
}

const HELP: &[&str] = &[
    "Commands:",
    "  /server connect <name> | list | disconnect",
    "  /msg <nick> <text>",
    "  /dcc send <nick> <path>     offer a file",
    "  /dcc chat <nick>            offer a chat",
    "  /dcc say <id> <text>        write to an open chat",
    "  /dcc list | cancel <id>",
    "  /dcc yes [id] | no [id]     answer a question",
    "  /dcc save [id] [path]       answer a save-location question",
    "  /quit [message]",
];

/// The server to negotiate a DCC with `nick` over, if `nick` is a user
/// other than ourselves.
fn dcc_target(state: &mut AppState, nick: &str) -> Option<ServerId> {
    let Some(server_id) = state.active_server_id() else {
        state.error_message("No active server");
        return None;
    };
    if nick.starts_with('#') || nick.starts_with('&') {
        state.error_message("DCC works with users, not channels");
        return None;
    }
    let own = state
        .get_server(server_id)
        .is_some_and(|srv| srv.nickname.eq_ignore_ascii_case(nick));
    if own {
        state.error_message("You cannot DCC yourself");
        return None;
    }
    Some(server_id)
}

pub fn handle_irc_message(
    state: &mut AppState,
    server_id: ServerId,
    message: irc::client::prelude::Message,
) -> Vec<Action> {
    use irc::client::prelude::{Command, Prefix, Response};

    let nick_from = match &message.prefix {
        Some(Prefix::Nickname(nick, _, _)) => nick.clone(),
        Some(Prefix::ServerName(name)) => name.clone(),
        None => String::new(),
    };

    match &message.command {
        Command::PRIVMSG(target, text) => {
            // Some clients omit the closing \x01.
            if let Some(ctcp) = text.strip_prefix('\x01') {
                let ctcp = ctcp.strip_suffix('\x01').unwrap_or(ctcp);
                let (command, args) = ctcp.split_once(' ').unwrap_or((ctcp, ""));
                if !command.eq_ignore_ascii_case("DCC") {
                    tracing::debug!(from = %nick_from, command, "ignoring CTCP");
                    return vec![];
                }
                if target.starts_with('#') || target.starts_with('&') {
                    tracing::debug!(from = %nick_from, channel = %target, "ignoring channel DCC");
                    return vec![];
                }
                return vec![Action::DccIncoming {
                    server_id,
                    from: nick_from,
                    command: command.to_string(),
                    args: args.to_string(),
                }];
            }
            state.output.push(format!("<{}:{}> {}", nick_from, target, text));
        }
        Command::NICK(new_nick) => {
            if let Some(srv) = state.get_server_mut(server_id) {
                if srv.nickname.eq_ignore_ascii_case(&nick_from) {
                    srv.nickname = new_nick.clone();
                }
            }
        }
        Command::Response(Response::RPL_WELCOME, args) => {
            // The server confirms the nickname it registered us under.
            if let (Some(nick), Some(srv)) = (args.first(), state.get_server_mut(server_id)) {
                srv.nickname = nick.clone();
            }
        }
        _ => {}
    }
    vec![]
}

fn handle_dcc_event(state: &mut AppState, event: DccEvent) {
    match event {
        DccEvent::Confirm { id, prompt, reply } => {
            let question = match prompt {
                Confirmation::AcceptSend {
                    nickname,
                    filename,
                    size,
                } => format!(
                    "{} offers \"{}\" ({}). Accept?",
                    nickname,
                    filename,
                    size.map_or_else(|| "unknown size".to_string(), |s| format!("{} bytes", s))
                ),
                Confirmation::AcceptChat { nickname } => format!("{} offers a DCC chat. Accept?", nickname),
                Confirmation::Resume { path, existing } => format!(
                    "{} already has {} bytes. Resume?",
                    path.display(),
                    existing
                ),
            };
            state.system_message(format!("[{}] {}  (/dcc yes {} or /dcc no {})", id, question, id, id));
            state.prompts.push_back(PendingPrompt {
                id,
                reply: PromptReply::Confirm(reply),
            });
        }
        DccEvent::ChooseSavePath {
            id,
            suggested_name,
            suggested_dir,
            reply,
        } => {
            let suggested = suggested_dir.join(suggested_name);
            state.system_message(format!(
                "[{}] Save as {}?  (/dcc save {} [path] or /dcc no {})",
                id,
                suggested.display(),
                id,
                id
            ));
            state.prompts.push_back(PendingPrompt {
                id,
                reply: PromptReply::SavePath { suggested, reply },
            });
        }
        DccEvent::Progress {
            id,
            bytes_done,
            bytes_total: Some(total),
        } if total > 0 => {
            let quarter = bytes_done.saturating_mul(4) / total;
            let last = state.progress_marks.entry(id).or_insert(0);
            if quarter > *last && quarter < 4 {
                *last = quarter;
                state.system_message(format!("[{}] {}% ({}/{} bytes)", id, quarter * 25, bytes_done, total));
            }
        }
        DccEvent::Progress { .. } => {}
        DccEvent::StateChanged { id, state: new_state } => {
            match &new_state {
                TransferState::Failed { reason } => {
                    state.error_message(format!("[{}] DCC transfer failed: {}", id, reason))
                }
                other => state.system_message(format!("[{}] {}", id, other.label())),
            }
            if new_state.is_terminal() {
                state.progress_marks.remove(&id);
                state.drop_prompts(id);
            }
        }
        DccEvent::ChatStateChanged { id, nickname, state: chat } => {
            let label = match chat {
                ChatState::Listening => "waiting for the peer",
                ChatState::Connecting => "connecting",
                ChatState::Open => "open",
                ChatState::Closed => "closed",
            };
            state.system_message(format!("[{}] DCC chat with {}: {}", id, nickname, label));
            if chat == ChatState::Closed {
                state.drop_prompts(id);
            }
        }
        DccEvent::ChatMessage { id, nickname, text } => {
            state.output.push(format!("[{}] <{}> {}", id, nickname, text));
            state.new_chat_lines.push(ChatLine {
                peer: nickname.clone(),
                sender: nickname,
                text,
            });
        }
    }
}

/// One line of `/dcc list` output.
pub fn format_transfer(t: &Transfer) -> String {
    let arrow = match t.direction {
        Direction::Send => "to",
        Direction::Receive => "from",
    };
    let progress = match (t.percent(), t.file_size) {
        (Some(pct), Some(size)) => format!("{:.0}% of {} bytes", pct, size),
        _ => format!("{} bytes", t.position()),
    };
    let mut line = format!(
        "  [{}] {} {} {}: {} ({})",
        t.id,
        t.short_filename(),
        arrow,
        t.remote_nickname,
        progress,
        t.state.label()
    );
    if t.reverse {
        line.push_str(" reverse");
    }
    if t.turbo {
        line.push_str(" turbo");
    }
    if let Some(secs) = t.remaining_secs() {
        line.push_str(&format!(", {:.0} KiB/s, {:.0}s left", t.bytes_per_second() / 1024.0, secs));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crabchat_dcc::config::AppConfig;
    use tokio::sync::oneshot;

    fn connected_state() -> (AppState, ServerId) {
        let mut state = AppState::new(AppConfig::default());
        let mut server = state.config.servers[0].clone();
        server.nickname = "me".into();
        let id = state.add_server(&server);
        state.get_server_mut(id).unwrap().status = ConnectionStatus::Connected;
        (state, id)
    }

    fn privmsg(raw: &str) -> irc::client::prelude::Message {
        raw.parse().unwrap()
    }

    #[test]
    fn test_ctcp_dcc_is_routed_to_engine() {
        let (mut state, sid) = connected_state();
        let actions = handle_irc_message(
            &mut state,
            sid,
            privmsg(":alice!a@host PRIVMSG me :\x01DCC SEND \"a b.txt\" 2130706433 5000 10\x01"),
        );
        match actions.as_slice() {
            [Action::DccIncoming { server_id, from, command, args }] => {
                assert_eq!(*server_id, sid);
                assert_eq!(from, "alice");
                assert_eq!(command, "DCC");
                assert_eq!(args, "SEND \"a b.txt\" 2130706433 5000 10");
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn test_other_ctcp_and_channel_dcc_are_ignored() {
        let (mut state, sid) = connected_state();
        assert!(handle_irc_message(&mut state, sid, privmsg(":alice!a@host PRIVMSG me :\x01VERSION\x01")).is_empty());
        assert!(handle_irc_message(
            &mut state,
            sid,
            privmsg(":alice!a@host PRIVMSG #rust :\x01DCC CHAT chat 1 2\x01")
        )
        .is_empty());
    }

    #[test]
    fn test_dcc_send_refuses_channels_and_self() {
        let (mut state, sid) = connected_state();
        assert!(handle_event(&mut state, AppEvent::Input("/dcc send #rust /tmp/x".into())).is_empty());
        assert!(handle_event(&mut state, AppEvent::Input("/dcc send ME /tmp/x".into())).is_empty());
        assert_eq!(state.output.len(), 2);

        let actions = handle_event(&mut state, AppEvent::Input("/dcc send bob /tmp/x".into()));
        assert!(matches!(
            actions.as_slice(),
            [Action::DccSend { server_id, nick, .. }] if *server_id == sid && nick == "bob"
        ));
    }

    #[test]
    fn test_welcome_and_nick_track_own_nickname() {
        let (mut state, sid) = connected_state();
        handle_irc_message(&mut state, sid, privmsg(":server 001 me_ :Welcome"));
        assert_eq!(state.get_server(sid).unwrap().nickname, "me_");
        handle_irc_message(&mut state, sid, privmsg(":me_!u@h NICK :other"));
        assert_eq!(state.get_server(sid).unwrap().nickname, "other");
    }

    #[test]
    fn test_prompts_are_answered_by_id() {
        let (mut state, _) = connected_state();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        handle_event(
            &mut state,
            AppEvent::Dcc(DccEvent::Confirm {
                id: 1,
                prompt: Confirmation::AcceptChat { nickname: "alice".into() },
                reply: tx1,
            }),
        );
        handle_event(
            &mut state,
            AppEvent::Dcc(DccEvent::Confirm {
                id: 2,
                prompt: Confirmation::AcceptChat { nickname: "bob".into() },
                reply: tx2,
            }),
        );

        handle_event(&mut state, AppEvent::Input("/dcc yes 2".into()));
        assert_eq!(rx2.try_recv(), Ok(true));
        handle_event(&mut state, AppEvent::Input("/dcc no".into()));
        assert!(rx1.try_recv().is_err());
        assert!(state.prompts.is_empty());
    }

    #[test]
    fn test_save_prompt_defaults_to_suggestion() {
        let (mut state, _) = connected_state();
        let (tx, mut rx) = oneshot::channel();
        handle_event(
            &mut state,
            AppEvent::Dcc(DccEvent::ChooseSavePath {
                id: 5,
                suggested_name: "a.bin".into(),
                suggested_dir: PathBuf::from("/dl"),
                reply: tx,
            }),
        );
        handle_event(&mut state, AppEvent::Input("/dcc save".into()));
        assert_eq!(rx.try_recv(), Ok(Some(PathBuf::from("/dl/a.bin"))));
    }

    #[test]
    fn test_terminal_state_drops_prompts() {
        let (mut state, _) = connected_state();
        let (tx, _rx) = oneshot::channel();
        state.prompts.push_back(PendingPrompt {
            id: 9,
            reply: PromptReply::Confirm(tx),
        });
        handle_event(
            &mut state,
            AppEvent::Dcc(DccEvent::StateChanged {
                id: 9,
                state: TransferState::failed("cancelled"),
            }),
        );
        assert!(state.prompts.is_empty());
        assert!(state.output.last().unwrap().contains("cancelled"));
    }

    #[test]
    fn test_list_line_keeps_reverse_marker() {
        let mut t = Transfer::new(Direction::Receive, "alice", 1, "a.bin");
        t.id = 4;
        t.reverse = true;
        // Tokenless, and already listening on its own port.
        t.port = 40000;
        t.file_size = Some(2048);
        let line = format_transfer(&t);
        assert!(line.starts_with("  [4] a.bin from alice: 0% of 2048 bytes"));
        assert!(line.contains(" reverse"));

        t.reverse = false;
        assert!(!format_transfer(&t).contains("reverse"));
    }
}
