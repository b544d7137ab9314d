use crate::app::event::{AppEvent, ServerId};
use crate::irc::connection::spawn_connection;
use anyhow::{anyhow, Result};
use crabchat_dcc::config::ServerConfig;
use crabchat_dcc::dcc::address::{local_ipv4_towards, resolve_ipv4};
use crabchat_dcc::dcc::{ConnectionHandle, CtcpSender};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Live IRC senders by server, shared with the DCC engine.
#[derive(Clone, Default)]
pub struct SenderTable {
    senders: Arc<Mutex<HashMap<ServerId, irc::client::Sender>>>,
    /// Local end of each server connection, advertised in DCC offers.
    local_ips: Arc<Mutex<HashMap<ServerId, Ipv4Addr>>>,
}

impl SenderTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<ServerId, irc::client::Sender>> {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn local_ips(&self) -> MutexGuard<'_, HashMap<ServerId, Ipv4Addr>> {
        self.local_ips.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_local_ip(&self, server_id: ServerId, ip: Option<Ipv4Addr>) {
        match ip {
            Some(ip) => self.local_ips().insert(server_id, ip),
            None => self.local_ips().remove(&server_id),
        };
    }

    fn get(&self, server_id: ServerId) -> Result<irc::client::Sender> {
        self.lock()
            .get(&server_id)
            .cloned()
            .ok_or_else(|| anyhow!("not connected to server {}", server_id))
    }
}

impl CtcpSender for SenderTable {
    fn send_ctcp(&self, connection: ConnectionHandle, nick: &str, command: &str, text: &str) -> Result<()> {
        // Embedded \x01 would end the CTCP frame early.
        let body = format!("{} {}", command, text).replace('\x01', "");
        self.get(connection)?.send_privmsg(nick, format!("\x01{}\x01", body))?;
        Ok(())
    }

    fn local_ip(&self, connection: ConnectionHandle) -> Option<Ipv4Addr> {
        self.local_ips().get(&connection).copied()
    }
}

pub struct IrcManager {
    senders: SenderTable,
    event_tx: mpsc::UnboundedSender<AppEvent>,
}

impl IrcManager {
    pub fn new(event_tx: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            senders: SenderTable::default(),
            event_tx,
        }
    }

    /// The handle the DCC engine sends its CTCP messages through.
    pub fn ctcp_sender(&self) -> SenderTable {
        self.senders.clone()
    }

    pub async fn connect(&mut self, server_id: ServerId, server: &ServerConfig) -> Result<()> {
        let conn = spawn_connection(server_id, server, self.event_tx.clone()).await?;
        self.senders.lock().insert(conn.server_id, conn.sender);

        let local = route_to(&server.host, server.port).await;
        tracing::debug!(server_id, local = ?local, "local address for DCC offers");
        self.senders.set_local_ip(server_id, local);
        Ok(())
    }

    pub fn disconnect(&mut self, server_id: ServerId) {
        self.senders.lock().remove(&server_id);
        self.senders.set_local_ip(server_id, None);
    }

    pub fn send_privmsg(&self, server_id: ServerId, target: &str, text: &str) -> Result<()> {
        // No CTCP injection in plain messages.
        let clean = text.replace('\x01', "");
        self.senders.get(server_id)?.send_privmsg(target, &clean)?;
        Ok(())
    }

    pub fn send_quit_all(&mut self, message: Option<&str>) {
        let msg = message.unwrap_or("Leaving");
        for (_id, sender) in self.senders.lock().drain() {
            let _ = sender.send_quit(msg);
        }
        self.senders.local_ips().clear();
    }
}

/// Our address on the interface that carries traffic to the IRC server.
async fn route_to(host: &str, port: u16) -> Option<Ipv4Addr> {
    let server = resolve_ipv4(host).await.ok()?;
    local_ipv4_towards(SocketAddrV4::new(server, port))
}
