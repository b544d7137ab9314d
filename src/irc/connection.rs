use crate::app::event::{AppEvent, ServerId};
use anyhow::Result;
use crabchat_dcc::config::ServerConfig;
use futures::StreamExt;
use irc::client::prelude::*;
use tokio::sync::mpsc;

pub struct IrcConnection {
    pub server_id: ServerId,
    pub sender: irc::client::Sender,
}

/// Connect, register, and forward every inbound message as an [`AppEvent`].
pub async fn spawn_connection(
    server_id: ServerId,
    server: &ServerConfig,
    event_tx: mpsc::UnboundedSender<AppEvent>,
) -> Result<IrcConnection> {
    let config = Config {
        server: Some(server.host.clone()),
        port: Some(server.port),
        use_tls: Some(server.tls),
        nickname: Some(server.nickname.clone()),
        username: server.username.clone(),
        realname: server.realname.clone(),
        password: server.password.clone(),
        channels: server.channels.clone(),
        dangerously_accept_invalid_certs: Some(server.accept_invalid_certs),
        ..Config::default()
    };

    let mut client = Client::from_config(config).await?;
    client.identify()?;

    let sender = client.sender();
    let stream = client.stream()?;

    let _ = event_tx.send(AppEvent::IrcConnected { server_id });
    tokio::spawn(forward_messages(server_id, stream, event_tx));

    Ok(IrcConnection { server_id, sender })
}

async fn forward_messages(
    server_id: ServerId,
    mut stream: irc::client::ClientStream,
    event_tx: mpsc::UnboundedSender<AppEvent>,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(message)) => {
                if event_tx.send(AppEvent::IrcMessage { server_id, message }).is_err() {
                    return;
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed".to_string(),
        }
    };
    tracing::info!(server_id, reason = %reason, "IRC connection ended");
    let _ = event_tx.send(AppEvent::IrcDisconnected { server_id, reason });
}
