use std::path::PathBuf;

use derive_builder::Builder;
use serde::Deserialize;

/// Port used when a server entry omits one.
pub const DEFAULT_GEARMAN_PORT: u16 = 4730;

/// Library configuration.
///
/// Callers usually layer their own file or environment loading on top
/// (the struct is `Deserialize`); the worker CLI assembles one from flags.
#[derive(Debug, Clone, Deserialize, Builder)]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(into),
    default,
    pattern = "owned"
)]
#[serde(default)]
pub struct Config {
    /// Queue servers as `host[:port]`; must be non-empty
    pub gearman_servers: Vec<String>,

    /// Base directory for per-job logs; must be writable
    pub worker_log_dir: PathBuf,

    /// Failure notification recipients; an empty list disables
    /// notifications entirely
    pub notifications_emails: Vec<String>,

    /// RFC 5322 sender address for notifications
    pub notifications_from_address: String,

    /// Prefix prepended to every notification subject
    pub notifications_subject_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gearman_servers: vec![format!("localhost:{DEFAULT_GEARMAN_PORT}")],
            worker_log_dir: PathBuf::from("/var/tmp/gearwork"),
            notifications_emails: Vec::new(),
            notifications_from_address: "gearwork@localhost".to_string(),
            notifications_subject_prefix: "[gearwork] ".to_string(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Server list normalized to `host:port`, applying the default port
    /// where the entry omits one.
    pub fn server_addrs(&self) -> Vec<String> {
        self.gearman_servers
            .iter()
            .map(|server| normalize_server(server))
            .collect()
    }

    /// Notifications are active only when at least one recipient is set.
    pub fn notifications_enabled(&self) -> bool {
        !self.notifications_emails.is_empty()
    }
}

fn normalize_server(server: &str) -> String {
    match server.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            server.to_string()
        }
        _ => format!("{server}:{DEFAULT_GEARMAN_PORT}"),
    }
}

impl ConfigBuilder {
    pub fn build(self) -> Config {
        self.build_internal()
            .expect("all config fields have defaults")
    }
}
