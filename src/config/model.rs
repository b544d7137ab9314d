//! Configuration data model.
//!
//! All structs derive `Serialize`/`Deserialize` for TOML persistence.
//! Every field has a sensible default so the application works out of the box.

use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::dcc::socket::PortRange;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_servers")]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub dcc: DccConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            dcc: DccConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_servers() -> Vec<ServerConfig> {
    vec![ServerConfig {
        name: "libera".into(),
        host: "irc.libera.chat".into(),
        port: 6697,
        tls: true,
        nickname: default_nickname(),
        username: None,
        realname: None,
        password: None,
        channels: vec![],
        auto_connect: false,
        accept_invalid_certs: false,
    }]
}

/// Configuration for a single IRC server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// User-facing label (e.g. `"libera"`).
    pub name: String,
    /// Hostname or IP address of the IRC server.
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default = "default_nickname")]
    pub nickname: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub auto_connect: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// DCC chat and file transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DccConfig {
    /// Skip every prompt: accept offers and save to `download_dir`.
    #[serde(default)]
    pub auto_accept: bool,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Local ports to listen on. Unset lets the OS choose.
    #[serde(default)]
    pub port_range: Option<PortRange>,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Offer files with the turbo flag and ignore acknowledgements.
    #[serde(default)]
    pub force_turbo: bool,
    /// Offer files as reverse DCC (port 0 plus token) for senders behind NAT.
    #[serde(default)]
    pub reverse_send: bool,
    /// Echo the token in RESUME for reverse transfers. Some clients choke on it.
    #[serde(default = "default_true")]
    pub resume_reverse_send_token: bool,
    /// Address (or hostname) to advertise instead of the detected one.
    #[serde(default)]
    pub forced_outbound_ip: Option<String>,
    /// Offers above this size are refused; `0` disables the limit.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default)]
    pub reject_private_ips: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_listen_timeout")]
    pub listen_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for DccConfig {
    fn default() -> Self {
        Self {
            auto_accept: false,
            download_dir: default_download_dir(),
            port_range: None,
            block_size: default_block_size(),
            force_turbo: false,
            reverse_send: false,
            resume_reverse_send_token: true,
            forced_outbound_ip: None,
            max_file_size: default_max_file_size(),
            reject_private_ips: false,
            connect_timeout_secs: default_connect_timeout(),
            listen_timeout_secs: default_listen_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Diagnostics and DCC chat transcript settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    /// Write DCC chat sessions to per-nick daily files.
    #[serde(default)]
    pub chat_logs: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            chat_logs: false,
            log_dir: default_log_dir(),
        }
    }
}

/// `crab` plus four digits, inside the 9-character limit most networks use.
fn default_nickname() -> String {
    format!("crab{}", rand::rng().random_range(1000..10000u32))
}
fn default_port() -> u16 {
    6697
}
fn default_true() -> bool {
    true
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}
fn default_block_size() -> u32 {
    1024
}
fn default_max_file_size() -> u64 {
    500 * 1024 * 1024 // 500 MB
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_listen_timeout() -> u64 {
    120
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "~/.local/share/crabchat/logs".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gets_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.servers.len(), 1);
        assert!(!config.dcc.auto_accept);
        assert_eq!(config.dcc.block_size, 1024);
        assert!(config.dcc.resume_reverse_send_token);
        assert_eq!(config.dcc.port_range, None);
        assert_eq!(config.dcc.idle_timeout_secs, 60);
        assert_eq!(config.dcc.listen_timeout_secs, 120);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_dcc_section() {
        let config: AppConfig = toml::from_str(
            r#"
            [dcc]
            auto_accept = true
            reverse_send = true
            forced_outbound_ip = "203.0.113.7"
            port_range = { start = 5000, end = 5010 }
            "#,
        )
        .unwrap();
        assert!(config.dcc.auto_accept);
        assert!(config.dcc.reverse_send);
        assert_eq!(config.dcc.forced_outbound_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(config.dcc.port_range, Some(PortRange::new(5000, 5010)));
        assert_eq!(config.dcc.max_file_size, 500 * 1024 * 1024);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = AppConfig::default();
        config.dcc.force_turbo = true;
        config.dcc.port_range = Some(PortRange::new(6000, 6100));
        config.logging.chat_logs = true;

        let text = toml::to_string_pretty(&config).unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert!(back.dcc.force_turbo);
        assert_eq!(back.dcc.port_range, config.dcc.port_range);
        assert!(back.logging.chat_logs);
        assert_eq!(back.servers[0].nickname, config.servers[0].nickname);
    }

    #[test]
    fn test_default_nickname_fits_limit() {
        let nick = default_nickname();
        assert!(nick.starts_with("crab"));
        assert_eq!(nick.len(), 8);
    }
}
