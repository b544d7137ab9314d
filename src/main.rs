mod app;
mod irc;

use crate::app::action::Action;
use crate::app::event::AppEvent;
use crate::app::handler;
use crate::app::state::*;
use crate::irc::manager::IrcManager;
use anyhow::Result;
use crabchat_dcc::config;
use crabchat_dcc::dcc::{DccEvent, DccManager};
use crabchat_dcc::logging::{self, ChatLogger};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    let first_run = !config::config_path().exists();
    let cfg = config::load_config()?;
    logging::init_tracing(&cfg.logging);

    if first_run {
        match config::save_config(&cfg) {
            Ok(()) => tracing::info!(path = %config::config_path().display(), "wrote default config"),
            Err(e) => tracing::warn!(error = %e, "could not write default config"),
        }
    }

    // Ensure download directory exists
    std::fs::create_dir_all(&cfg.dcc.download_dir)?;

    if let Err(e) = run_app(cfg).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_app(cfg: config::AppConfig) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AppEvent>();

    let mut state = AppState::new(cfg.clone());
    let mut irc_manager = IrcManager::new(event_tx.clone());
    let mut chat_logger = ChatLogger::new(&cfg.logging);

    // DCC events are forwarded into the main loop as AppEvent::Dcc.
    let (dcc_tx, mut dcc_rx) = mpsc::unbounded_channel::<DccEvent>();
    let dcc_manager = DccManager::new(cfg.dcc.clone(), Arc::new(irc_manager.ctcp_sender()), dcc_tx);
    let forward_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = dcc_rx.recv().await {
            if forward_tx.send(AppEvent::Dcc(event)).is_err() {
                break;
            }
        }
    });

    // Spawn stdin reader task
    let input_tx = event_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if input_tx.send(AppEvent::Input(line)).is_err() {
                return;
            }
        }
        let _ = input_tx.send(AppEvent::InputClosed);
    });

    // Auto-connect servers from config
    for srv_cfg in cfg.servers.iter().filter(|s| s.auto_connect) {
        let server_id = state.add_server(srv_cfg);
        if let Err(e) = irc_manager.connect(server_id, srv_cfg).await {
            state.error_message(format!("Connection to {} failed: {:#}", srv_cfg.name, e));
            if let Some(srv) = state.get_server_mut(server_id) {
                srv.status = ConnectionStatus::Disconnected;
            }
        }
    }
    if state.servers.is_empty() {
        state.system_message("Welcome to CrabChat DCC. Connect with /server connect <name>, /help for more.");
    }
    flush_output(&mut state);

    while let Some(event) = event_rx.recv().await {
        let actions = handler::handle_event(&mut state, event);

        for line in state.new_chat_lines.drain(..) {
            chat_logger.log_line(&line.peer, &line.sender, &line.text);
        }

        for action in actions {
            match action {
                Action::ConnectServer { server_id, server } => {
                    if let Err(e) = irc_manager.connect(server_id, &server).await {
                        state.error_message(format!("Connection failed: {:#}", e));
                        if let Some(srv) = state.get_server_mut(server_id) {
                            srv.status = ConnectionStatus::Disconnected;
                        }
                    }
                }
                Action::DisconnectServer { server_id } => {
                    irc_manager.disconnect(server_id);
                    if let Some(srv) = state.get_server_mut(server_id) {
                        srv.status = ConnectionStatus::Disconnected;
                    }
                    state.system_message("Disconnected.");
                }
                Action::SendPrivmsg { server_id, target, text } => {
                    if let Err(e) = irc_manager.send_privmsg(server_id, &target, &text) {
                        state.error_message(format!("Send failed: {:#}", e));
                    }
                }
                Action::DccIncoming { server_id, from, command, args } => {
                    dcc_manager.handle_ctcp_dcc(&command, &args, &from, server_id);
                }
                Action::DccSend { server_id, nick, path } => {
                    match dcc_manager.start_send(server_id, &nick, &path).await {
                        Ok(id) => state.system_message(format!("[{}] Offering {} to {}", id, path.display(), nick)),
                        Err(e) => state.error_message(format!("DCC send failed: {}", e)),
                    }
                }
                Action::DccChat { server_id, nick } => match dcc_manager.start_chat(server_id, &nick).await {
                    Ok(id) => state.system_message(format!("[{}] Offering a chat to {}", id, nick)),
                    Err(e) => state.error_message(format!("DCC chat failed: {}", e)),
                },
                Action::DccSay { id, text } => match dcc_manager.send_chat_line(id, &text) {
                    Ok(()) => {
                        let chat = dcc_manager
                            .chats()
                            .into_iter()
                            .find(|c| c.id == id)
                            .map(|c| (c.remote_nickname, c.connection));
                        if let Some((peer, server_id)) = chat {
                            let me = state
                                .get_server(server_id)
                                .map(|s| s.nickname.clone())
                                .unwrap_or_default();
                            state.output.push(format!("[{}] <{}> {}", id, me, text));
                            chat_logger.log_line(&peer, &me, &text);
                        }
                    }
                    Err(e) => state.error_message(format!("DCC chat: {}", e)),
                },
                Action::DccCancel { id } => {
                    if !dcc_manager.cancel(id) {
                        state.error_message(format!("No active DCC session {}", id));
                    }
                }
                Action::DccList => {
                    let transfers = dcc_manager.transfers();
                    let chats = dcc_manager.chats();
                    if transfers.is_empty() && chats.is_empty() {
                        state.system_message("No DCC transfers.");
                    }
                    for t in &transfers {
                        state.output.push(handler::format_transfer(t));
                    }
                    for c in &chats {
                        state.output.push(format!("  [{}] chat with {} ({:?})", c.id, c.remote_nickname, c.state));
                    }
                }
                Action::Quit { message } => {
                    state.should_quit = true;
                    dcc_manager.shutdown();
                    irc_manager.send_quit_all(message.as_deref());
                }
            }
        }

        flush_output(&mut state);
        if state.should_quit {
            break;
        }
    }

    Ok(())
}

fn flush_output(state: &mut AppState) {
    for line in state.output.drain(..) {
        println!("{}", line);
    }
}
