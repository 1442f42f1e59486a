//! Error types for the cron engine.

use std::time::Duration;

use thiserror::Error;

/// Rejected job input. Raised at create/edit time, never at run time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("sessionTarget \"main\" requires a systemEvent payload")]
    MainRequiresSystemEvent,

    #[error("sessionTarget \"isolated\" requires an agentTurn payload")]
    IsolatedRequiresAgentTurn,

    #[error("isolation is only allowed with sessionTarget \"isolated\"")]
    IsolationRequiresIsolated,

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Errors from job management and persistence.
#[derive(Debug, Error)]
pub enum CronError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("SQLite error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session store error: {0}")]
    Session(#[from] relaybot_storage::StorageError),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("cron store lock poisoned")]
    LockPoisoned,
}

/// Why a lane task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaneError {
    #[error("task timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("task cancelled")]
    Cancelled,

    #[error("lane closed before the task completed")]
    Closed,
}

/// Agent invocation failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent command is not configured")]
    NotConfigured,

    #[error("failed to spawn agent: {0}")]
    Spawn(std::io::Error),

    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent exited with code {}: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    Exit { code: Option<i32>, stderr: String },

    #[error("agent timed out after {0}s")]
    TimedOut(u64),

    #[error("agent run cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Outbound delivery failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no delivery recipient for {channel}")]
    NoRecipient { channel: String },

    #[error("no running channel for {0}")]
    NoChannel(String),

    #[error("send failed: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, CronError>;
