//! Diagnostics and DCC chat transcripts.
//!
//! [`init_tracing`] installs the global `tracing` subscriber. [`ChatLogger`]
//! writes DCC chat lines to daily files named `dcc_<nick>_<date>.log` in the
//! configured log directory (default: `~/.local/share/crabchat/logs/`).

use crate::config::LoggingConfig;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
///
/// Output goes to stderr so it does not interleave with the command prompt.
pub fn init_tracing(config: &LoggingConfig) {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();
}

/// Appends DCC chat lines to per-nick daily log files.
///
/// File handles are cached for the lifetime of the logger. A file that cannot
/// be opened is reported once and its lines are dropped.
pub struct ChatLogger {
    enabled: bool,
    log_dir: PathBuf,
    file_handles: HashMap<String, Option<fs::File>>,
}

impl ChatLogger {
    pub fn new(config: &LoggingConfig) -> Self {
        Self {
            enabled: config.chat_logs,
            log_dir: expand_home(&config.log_dir),
            file_handles: HashMap::new(),
        }
    }

    /// Record `text` said by `sender` in the chat with `peer`.
    pub fn log_line(&mut self, peer: &str, sender: &str, text: &str) {
        if !self.enabled {
            return;
        }

        let now = chrono::Local::now();
        let filename = format!("dcc_{}_{}.log", safe_name(peer), now.format("%Y-%m-%d"));
        let log_dir = &self.log_dir;
        let handle = self.file_handles.entry(filename.clone()).or_insert_with(|| {
            let _ = fs::create_dir_all(log_dir);
            let path = log_dir.join(&filename);
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(file),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot open chat log");
                    None
                }
            }
        });

        if let Some(file) = handle {
            let _ = writeln!(file, "[{}] <{}> {}", now.format("%H:%M:%S"), sender, text);
        }
    }
}

fn safe_name(nick: &str) -> String {
    nick.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

/// Expand a leading `~/` to the home directory.
fn expand_home(dir: &str) -> PathBuf {
    match (dir.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(dir),
    }
}
