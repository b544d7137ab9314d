//! DCC CHAT sessions: a direct, line-oriented TCP conversation.

use std::net::Ipv4Addr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::error::Result;
use super::transfer::TransferId;
use super::ConnectionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    /// We offered the chat and wait for the peer to connect.
    Listening,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: TransferId,
    pub remote_nickname: String,
    pub connection: ConnectionHandle,
    pub host: Ipv4Addr,
    pub port: u16,
    pub state: ChatState,
    /// Lines queued here are written to the socket once the session is open.
    pub outgoing: Option<mpsc::UnboundedSender<String>>,
}

impl ChatSession {
    pub fn new(remote_nickname: impl Into<String>, connection: ConnectionHandle) -> Self {
        Self {
            id: 0,
            remote_nickname: remote_nickname.into(),
            connection,
            host: Ipv4Addr::UNSPECIFIED,
            port: 0,
            state: ChatState::Connecting,
            outgoing: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ChatState::Open
    }
}

/// Pump lines both ways until the peer hangs up or `outgoing` is closed.
///
/// Incoming lines are passed to `on_line` without their terminator.
pub async fn run_chat<S, F>(
    stream: S,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    mut on_line: F,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(String),
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            incoming = lines.next_line() => match incoming? {
                Some(line) => on_line(line.trim_end_matches('\r').to_string()),
                None => break,
            },
            queued = outgoing.recv() => match queued {
                Some(text) => {
                    writer.write_all(text.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                }
                None => break,
            },
        }
    }

    writer.shutdown().await.ok();
    Ok(())
}
