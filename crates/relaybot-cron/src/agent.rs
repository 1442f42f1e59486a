//! Agent invocation.
//!
//! The agent is an opaque external command. [`CommandAgent`] substitutes
//! `{{Body}}`, `{{SessionId}}`, `{{IsNewSession}}`, `{{Channel}}`,
//! `{{From}}` and `{{Thinking}}` into its argv, runs it, and parses stdout
//! into reply payloads.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use relaybot_types::ReplyPayload;

use crate::error::AgentError;

/// Max stderr characters carried in an exit error.
const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub body: String,
    pub session_id: String,
    pub is_new_session: bool,
    pub channel: Option<String>,
    pub from: Option<String>,
    pub thinking: Option<String>,
    /// Overrides the invoker's default limit.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    #[serde(default)]
    pub payloads: Vec<ReplyPayload>,
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Run one turn. Implementations must stop work promptly when `cancel` fires.
    async fn run(&self, request: AgentRequest, cancel: CancellationToken) -> Result<AgentReply, AgentError>;
}

/// Runs the configured agent command as a child process.
pub struct CommandAgent {
    command: Vec<String>,
    cwd: Option<PathBuf>,
    default_timeout: Duration,
}

impl CommandAgent {
    pub fn new(command: Vec<String>, cwd: Option<PathBuf>, default_timeout: Duration) -> Self {
        Self {
            command,
            cwd,
            default_timeout,
        }
    }

    fn render_args(&self, request: &AgentRequest) -> Vec<String> {
        let is_new = if request.is_new_session { "true" } else { "false" };
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{{Body}}", &request.body)
                    .replace("{{SessionId}}", &request.session_id)
                    .replace("{{IsNewSession}}", is_new)
                    .replace("{{Channel}}", request.channel.as_deref().unwrap_or(""))
                    .replace("{{From}}", request.from.as_deref().unwrap_or(""))
                    .replace("{{Thinking}}", request.thinking.as_deref().unwrap_or(""))
            })
            .collect()
    }
}

#[async_trait]
impl AgentInvoker for CommandAgent {
    #[tracing::instrument(skip_all, fields(session_id = %request.session_id))]
    async fn run(&self, request: AgentRequest, cancel: CancellationToken) -> Result<AgentReply, AgentError> {
        let argv = self.render_args(&request);
        let Some((program, args)) = argv.split_first() else {
            return Err(AgentError::NotConfigured);
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(AgentError::Spawn)?;
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            _ = tokio::time::sleep(timeout) => return Err(AgentError::TimedOut(timeout.as_secs())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Exit {
                code: output.status.code(),
                stderr: tail_chars(stderr.trim(), STDERR_TAIL_CHARS),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_reply(&stdout))
    }
}

fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

/// `{"payloads":[…]}`, then a single `{"text":…}` object, then raw text.
pub fn parse_reply(stdout: &str) -> AgentReply {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return AgentReply::default();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.get("payloads").is_some_and(|p| p.is_array()) {
            if let Ok(reply) = serde_json::from_value::<AgentReply>(value.clone()) {
                return reply;
            }
        }
        if value.get("text").is_some_and(|t| t.is_string()) {
            if let Ok(payload) = serde_json::from_value::<ReplyPayload>(value) {
                return AgentReply { payloads: vec![payload] };
            }
        }
    }
    AgentReply {
        payloads: vec![ReplyPayload::text(trimmed)],
    }
}
