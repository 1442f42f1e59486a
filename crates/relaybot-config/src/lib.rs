use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use relaybot_types::ChannelConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Gateway server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token for authentication (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_port() -> u16 {
    18789
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
        }
    }
}

/// How the external agent process is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Argv of the agent command. Arguments may contain `{{Body}}`-style placeholders.
    #[serde(default)]
    pub command: Vec<String>,
    /// Wall-clock limit for a single turn.
    #[serde(default = "default_agent_timeout")]
    pub timeout_seconds: u64,
    /// Working directory for the agent process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Body used for heartbeat turns.
    #[serde(default = "default_heartbeat_prompt")]
    pub heartbeat_prompt: String,
}

fn default_agent_timeout() -> u64 {
    600
}

fn default_heartbeat_prompt() -> String {
    "HEARTBEAT".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_seconds: default_agent_timeout(),
            cwd: None,
            heartbeat_prompt: default_heartbeat_prompt(),
        }
    }
}

/// Which session an inbound message lands in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    /// Every direct message shares `main_key`.
    #[default]
    Main,
    /// One session per channel and sender.
    PerSender,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session store file. Defaults to `~/.relaybot/sessions.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<PathBuf>,
    /// Inactivity after which a new session id is minted.
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,
    #[serde(default = "default_main_key")]
    pub main_key: String,
    #[serde(default)]
    pub scope: SessionScope,
    /// Prepend the intro until it has been sent once, rather than on every new session.
    #[serde(default)]
    pub send_system_once: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_intro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_prefix: Option<String>,
}

fn default_idle_minutes() -> u64 {
    10080
}

fn default_main_key() -> String {
    "main".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: None,
            idle_minutes: default_idle_minutes(),
            main_key: default_main_key(),
            scope: SessionScope::default(),
            send_system_once: false,
            session_intro: None,
            body_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// When false the scheduler loop never starts; jobs stay manageable.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// SQLite database for jobs and the run log. Defaults to `~/.relaybot/cron.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<PathBuf>,
    /// Lane used for isolated runs.
    #[serde(default = "default_cron_lane")]
    pub lane: String,
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_runs() -> usize {
    1
}

fn default_tick_seconds() -> u64 {
    30
}

fn default_cron_lane() -> String {
    "cron".to_string()
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_runs: default_max_concurrent_runs(),
            tick_seconds: default_tick_seconds(),
            store: None,
            lane: default_cron_lane(),
        }
    }
}

/// Top-level relaybot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayBotConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cron: CronConfig,
    /// Named channel configurations.
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

impl RelayBotConfig {
    /// Union of `allow_from` over every enabled channel of the given type.
    pub fn allow_from(&self, channel_type: &str) -> Vec<String> {
        let mut ids: Vec<&String> = self.channels.keys().collect();
        ids.sort();
        let mut out: Vec<String> = Vec::new();
        for id in ids {
            let ch = &self.channels[id];
            if !ch.enabled || ch.channel_type != channel_type {
                continue;
            }
            for entry in &ch.allow_from {
                if !out.contains(entry) {
                    out.push(entry.clone());
                }
            }
        }
        out
    }

    /// Resolved session store path.
    pub fn session_store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.session.store {
            Some(p) => Ok(expand_home(p)),
            None => Ok(config_dir()?.join("sessions.json")),
        }
    }

    /// Resolved cron database path.
    pub fn cron_store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.cron.store {
            Some(p) => Ok(expand_home(p)),
            None => Ok(config_dir()?.join("cron.db")),
        }
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Resolve the relaybot config directory (~/.relaybot/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".relaybot"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.relaybot/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<RelayBotConfig, ConfigError> {
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    load_config_from(&path)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<RelayBotConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(RelayBotConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: RelayBotConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}
