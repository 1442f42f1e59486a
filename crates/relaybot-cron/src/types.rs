//! Job, schedule and run-log shapes.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::schedule;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Schedule {
    /// Once, at an absolute instant.
    At { at_ms: i64 },
    /// Every `every_ms`, optionally phase-aligned to `anchor_ms`.
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// Five-field cron expression in `tz` (host local zone when absent).
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Payload {
    /// Queue a line of text for the main session.
    SystemEvent { text: String },
    /// Run an agent turn in an isolated session.
    AgentTurn {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deliver: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        best_effort_deliver: Option<bool>,
    },
}

impl Payload {
    pub fn system_event(text: impl Into<String>) -> Self {
        Payload::SystemEvent { text: text.into() }
    }

    pub fn agent_turn(message: impl Into<String>) -> Self {
        Payload::AgentTurn {
            message: message.into(),
            thinking: None,
            timeout_seconds: None,
            deliver: None,
            channel: None,
            to: None,
            best_effort_deliver: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionTarget {
    Main,
    Isolated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WakeMode {
    #[default]
    NextHeartbeat,
    Now,
}

/// Settings for isolated jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Isolation {
    /// Label used when posting the run summary back to the main session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_to_main_prefix: Option<String>,
}

impl Isolation {
    pub const DEFAULT_PREFIX: &'static str = "Cron";

    pub fn prefix(&self) -> &str {
        self.post_to_main_prefix
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(Self::DEFAULT_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunAction {
    Started,
    Finished,
    Skipped,
}

impl RunAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunAction::Started => "started",
            RunAction::Finished => "finished",
            RunAction::Skipped => "skipped",
        }
    }
}

/// Mutable runtime state of a job, owned by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    /// Set while a run is in flight. Found at startup, it is stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub schedule: Schedule,
    pub session_target: SessionTarget,
    #[serde(default)]
    pub wake_mode: WakeMode,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Isolation>,
    #[serde(default)]
    pub state: JobState,
}

/// Input for creating a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreate {
    /// Minted as a UUID when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: Schedule,
    pub session_target: SessionTarget,
    #[serde(default)]
    pub wake_mode: WakeMode,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Isolation>,
}

fn default_true() -> bool {
    true
}

/// Partial update of a job. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_target: Option<SessionTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_mode: Option<WakeMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Isolation>,
}

/// One append-only run-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub timestamp: i64,
    pub job_id: String,
    pub action: RunAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
}

impl RunLogEntry {
    pub fn new(job_id: &str, action: RunAction, timestamp: i64) -> Self {
        Self {
            timestamp,
            job_id: job_id.to_string(),
            action,
            status: None,
            error: None,
            summary: None,
            run_at_ms: None,
            duration_ms: None,
            next_run_at_ms: None,
        }
    }
}

/// The single exhaustive check applied on create and edit.
pub fn validate(
    schedule: &Schedule,
    target: SessionTarget,
    payload: &Payload,
    isolation: Option<&Isolation>,
    now_ms: i64,
) -> Result<(), ValidationError> {
    schedule::validate_schedule(schedule, now_ms)?;
    if target == SessionTarget::Main && isolation.is_some() {
        return Err(ValidationError::IsolationRequiresIsolated);
    }
    match (target, payload) {
        (SessionTarget::Main, Payload::SystemEvent { text }) => {
            if text.trim().is_empty() {
                return Err(ValidationError::Empty("systemEvent text"));
            }
        }
        (SessionTarget::Isolated, Payload::AgentTurn { message, timeout_seconds, .. }) => {
            if message.trim().is_empty() {
                return Err(ValidationError::Empty("agentTurn message"));
            }
            if *timeout_seconds == Some(0) {
                return Err(ValidationError::InvalidDuration("timeoutSeconds must be positive".into()));
            }
        }
        (SessionTarget::Main, Payload::AgentTurn { .. }) => {
            return Err(ValidationError::MainRequiresSystemEvent);
        }
        (SessionTarget::Isolated, Payload::SystemEvent { .. }) => {
            return Err(ValidationError::IsolatedRequiresAgentTurn);
        }
    }
    Ok(())
}

impl Job {
    /// Validate `input` and build a job with its first `next_run_at_ms`.
    pub fn create(input: JobCreate, now_ms: i64) -> Result<Self, ValidationError> {
        validate(
            &input.schedule,
            input.session_target,
            &input.payload,
            input.isolation.as_ref(),
            now_ms,
        )?;
        let id = match input.id.map(|s| s.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let mut job = Job {
            id,
            name: input.name.filter(|n| !n.trim().is_empty()),
            enabled: input.enabled,
            created_at: now_ms,
            updated_at: now_ms,
            schedule: input.schedule,
            session_target: input.session_target,
            wake_mode: input.wake_mode,
            payload: input.payload,
            isolation: input.isolation,
            state: JobState::default(),
        };
        job.state.next_run_at_ms = job.compute_next_run(now_ms);
        Ok(job)
    }

    /// Merge `patch`, re-validate, and recompute `next_run_at_ms` when the
    /// schedule or enabled flag changed. On error `self` is untouched.
    pub fn apply_patch(&mut self, patch: JobPatch, now_ms: i64) -> Result<(), ValidationError> {
        let mut next = self.clone();
        let reschedule = patch.schedule.is_some() || patch.enabled.is_some();
        if let Some(name) = patch.name {
            next.name = Some(name).filter(|n| !n.trim().is_empty());
        }
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        if let Some(schedule) = patch.schedule {
            next.schedule = schedule;
        }
        if let Some(target) = patch.session_target {
            next.session_target = target;
        }
        if let Some(wake_mode) = patch.wake_mode {
            next.wake_mode = wake_mode;
        }
        if let Some(payload) = patch.payload {
            next.payload = payload;
        }
        match patch.isolation {
            Some(isolation) => next.isolation = Some(isolation),
            // moving to the main session drops isolated-only settings
            None if next.session_target == SessionTarget::Main => next.isolation = None,
            None => {}
        }
        validate(
            &next.schedule,
            next.session_target,
            &next.payload,
            next.isolation.as_ref(),
            now_ms,
        )?;
        next.updated_at = now_ms;
        if reschedule {
            next.state.next_run_at_ms = next.compute_next_run(now_ms);
        }
        *self = next;
        Ok(())
    }

    /// Next fire time from `from_ms`, or `None` when disabled or exhausted.
    pub fn compute_next_run(&self, from_ms: i64) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        schedule::next_run(&self.schedule, from_ms)
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.enabled
            && self.state.running_at_ms.is_none()
            && self.state.next_run_at_ms.is_some_and(|next| next <= now_ms)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}
