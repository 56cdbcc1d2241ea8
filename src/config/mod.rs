use std::sync::OnceLock;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

use crate::proto::{self, timeouts};

mod log_config;
pub use log_config::LogConfig;
pub use log_config::set_filter as set_log_filter;

pub static CONFIG: OnceLock<ServerConfig> = OnceLock::new();

pub fn init() {
    let raw_config = Figment::new()
        .merge(Toml::file(
            Env::var("APP_CONFIG").as_deref().unwrap_or("config.toml"),
        ))
        .merge(Env::prefixed("WARREN_").global());

    let config = match raw_config.extract::<ServerConfig>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "It looks like your config is invalid. The following error occurred: {e}"
            );
            std::process::exit(1);
        }
    };
    if config.role == Role::Ingress && config.server_url.is_none() {
        eprintln!("server_url must be set for the ingress role");
        std::process::exit(1);
    }
    CONFIG.set(config).expect("config should be set");
}

pub fn get() -> &'static ServerConfig {
    CONFIG.get().expect("config should be set")
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Dials the egress peer, allocates streams, exposes the client API.
    Ingress,
    /// Accepts upgrades and performs the real network I/O.
    Egress,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub role: Role,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Path the egress peer serves upgrades on and the ingress peer dials.
    #[serde(default = "default_connect_path")]
    pub connect_path: String,
    /// `ws[s]://host:port` of the egress peer. Ingress role only.
    pub server_url: Option<String>,
    pub tls: Option<TlsConfig>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Grace window during which a dropped session awaits a reconnect.
    #[serde(default = "default_reconnect_grace")]
    pub reconnect_grace_secs: u64,
    #[serde(default = "default_send_queue_limit")]
    pub send_queue_limit: usize,
    #[serde(default = "default_max_pending")]
    pub max_pending_requests: usize,
    #[serde(default)]
    pub log: LogConfig,
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1".into()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_connect_path() -> String {
    "/".into()
}

fn default_max_sessions() -> usize {
    64
}

fn default_heartbeat_interval() -> u64 {
    timeouts::HEARTBEAT_INTERVAL.as_secs()
}

fn default_heartbeat_timeout() -> u64 {
    timeouts::HEARTBEAT_TIMEOUT.as_secs()
}

fn default_reconnect_grace() -> u64 {
    timeouts::RECONNECT_TIMEOUT.as_secs()
}

fn default_send_queue_limit() -> usize {
    proto::MAX_QUEUE_SIZE
}

fn default_max_pending() -> usize {
    proto::MAX_PENDING_REQUESTS
}
