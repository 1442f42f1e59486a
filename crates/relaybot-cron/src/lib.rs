//! relaybot-cron: scheduled jobs for the gateway.
//!
//! Jobs fire on a schedule (`at`, `every`, or a cron expression). A
//! main-session job drops a system event into the main conversation; an
//! isolated job runs its own agent turn on a dedicated lane, optionally
//! delivers the result to a chat surface, and posts a summary back to the
//! main session.

pub mod agent;
pub mod cron_expr;
pub mod delivery;
pub mod error;
pub mod events;
pub mod lanes;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod tracker;
pub mod types;

pub use agent::{AgentInvoker, AgentReply, AgentRequest, CommandAgent};
pub use delivery::{DeliveryTarget, MessageSender, resolve_delivery, send_payloads};
pub use error::{AgentError, CronError, DeliveryError, LaneError, Result, ValidationError};
pub use events::{MainSessionSink, PendingEvents, SystemEventQueue};
pub use lanes::{CommandLanes, EnqueueOptions, LaneStats, MAIN_LANE};
pub use schedule::{next_run, parse_duration_ms};
pub use scheduler::{CronDeps, CronService, CronSettings, CronStatus, RunMode, RunNowResult, RunReport};
pub use store::CronStore;
pub use types::{Job, JobCreate, JobPatch, Payload, RunLogEntry, RunStatus, Schedule, SessionTarget, WakeMode};
