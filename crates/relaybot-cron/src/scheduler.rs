//! Cron service: job management, the tick loop, and run execution.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relaybot_storage::{LastRoute, SessionResolver};
use relaybot_types::ReplyPayload;

use crate::agent::{AgentInvoker, AgentRequest};
use crate::delivery::{MessageSender, resolve_delivery, send_payloads};
use crate::error::{CronError, DeliveryError, LaneError, Result};
use crate::events::MainSessionSink;
use crate::lanes::{CommandLanes, EnqueueOptions, LaneStats, MAIN_LANE};
use crate::store::CronStore;
use crate::tracker::{DeliveryOutcome, RunOutcome, classify_run, extract_summary};
use crate::types::{
    Job, JobCreate, JobPatch, Payload, RunAction, RunLogEntry, RunStatus, Schedule, WakeMode,
};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Session key used by isolated runs of `job_id`.
pub fn isolated_session_key(job_id: &str) -> String {
    format!("cron:{job_id}")
}

#[derive(Debug, Clone)]
pub struct CronSettings {
    /// When false, [`CronService::run`] returns immediately.
    pub enabled: bool,
    pub max_concurrent_runs: usize,
    pub tick: Duration,
    /// Lane for isolated runs.
    pub lane: String,
    pub main_key: String,
    /// Primary-surface allowlist.
    pub allow_from: Vec<String>,
    /// Agent timeout when the payload does not set one.
    pub agent_timeout: Duration,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_runs: 1,
            tick: Duration::from_secs(30),
            lane: "cron".to_string(),
            main_key: "main".to_string(),
            allow_from: Vec::new(),
            agent_timeout: Duration::from_secs(600),
        }
    }
}

/// Collaborators the service drives.
#[derive(Clone)]
pub struct CronDeps {
    pub store: Arc<CronStore>,
    pub lanes: CommandLanes,
    pub agent: Arc<dyn AgentInvoker>,
    pub sessions: Arc<SessionResolver>,
    pub sender: Arc<dyn MessageSender>,
    pub sink: Arc<dyn MainSessionSink>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunMode {
    /// Run regardless of the schedule.
    #[default]
    Force,
    /// Run only if the job is currently due.
    Due,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub job_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub duration_ms: i64,
}

/// Answer to a run-now request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunNowResult {
    pub ran: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStatus {
    pub enabled: bool,
    pub jobs: usize,
    pub enabled_jobs: usize,
    pub running: usize,
    pub max_concurrent_runs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_wake_at_ms: Option<i64>,
}

/// Turn result carried out of the lane.
struct TurnResult {
    payloads: Vec<ReplyPayload>,
    error: Option<String>,
}

/// Owns jobs and their state. Mutations validate first and persist before
/// the in-memory list changes.
pub struct CronService {
    deps: CronDeps,
    settings: CronSettings,
    jobs: RwLock<Vec<Job>>,
    in_flight: Mutex<HashSet<String>>,
    wake: Notify,
}

impl CronService {
    pub fn new(deps: CronDeps, settings: CronSettings) -> Self {
        Self {
            deps,
            settings,
            jobs: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            wake: Notify::new(),
        }
    }

    pub fn settings(&self) -> &CronSettings {
        &self.settings
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load jobs from storage and clear running markers left by a previous process.
    pub async fn load(&self) -> Result<()> {
        let jobs = self.deps.store.list_jobs()?;
        info!("Loaded {} cron jobs", jobs.len());
        *self.jobs.write().await = jobs;
        self.reconcile_stale(now_ms()).await?;
        Ok(())
    }

    /// Clear `running_at_ms` on jobs that are not actually in flight and log
    /// a `skipped` entry for each.
    pub async fn reconcile_stale(&self, now: i64) -> Result<usize> {
        let mut jobs = self.jobs.write().await;
        let mut cleared = 0;
        for job in jobs.iter_mut() {
            let Some(stale_at) = job.state.running_at_ms else {
                continue;
            };
            if self.in_flight().contains(&job.id) {
                continue;
            }
            warn!(job_id = %job.id, running_at_ms = stale_at, "clearing stale running marker");
            job.state.running_at_ms = None;
            // the interrupted run is not retried; wait for the next natural due time
            if matches!(job.schedule, Schedule::At { .. }) {
                job.enabled = false;
                job.state.next_run_at_ms = None;
            } else if job.enabled {
                job.state.next_run_at_ms = job.compute_next_run(now);
            }
            self.deps.store.upsert_job(job)?;

            let mut entry = RunLogEntry::new(&job.id, RunAction::Skipped, now);
            entry.status = Some(RunStatus::Error);
            entry.error = Some("interrupted: process exited while the job was running".into());
            entry.run_at_ms = Some(stale_at);
            entry.next_run_at_ms = job.state.next_run_at_ms;
            self.deps.store.append_run(&entry)?;
            cleared += 1;
        }
        Ok(cleared)
    }

    // ─── Management ───────────────────────────────────────────

    pub async fn list(&self, include_disabled: bool) -> Vec<Job> {
        self.jobs
            .read()
            .await
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.iter().find(|j| j.id == id).cloned()
    }

    #[tracing::instrument(skip_all)]
    pub async fn add(&self, input: JobCreate) -> Result<Job> {
        let job = Job::create(input, now_ms())?;
        let mut jobs = self.jobs.write().await;
        if jobs.iter().any(|j| j.id == job.id) {
            return Err(CronError::Validation(crate::error::ValidationError::InvalidSchedule(
                format!("job id already exists: {}", job.id),
            )));
        }
        self.deps.store.upsert_job(&job)?;
        info!(job_id = %job.id, next_run_at_ms = ?job.state.next_run_at_ms, "cron job added");
        jobs.push(job.clone());
        drop(jobs);
        self.wake.notify_one();
        Ok(job)
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, patch: JobPatch) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;
        let mut next = job.clone();
        next.apply_patch(patch, now_ms())?;
        self.deps.store.upsert_job(&next)?;
        *job = next.clone();
        drop(jobs);
        self.wake.notify_one();
        Ok(next)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Job> {
        self.update(
            id,
            JobPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let removed = self.deps.store.delete_job(id)?;
        jobs.retain(|j| j.id != id);
        if removed {
            info!(job_id = %id, "cron job removed");
        }
        Ok(removed)
    }

    /// Most recent run-log entries, oldest first.
    pub fn runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<RunLogEntry>> {
        self.deps.store.runs(job_id, limit)
    }

    pub async fn status(&self) -> CronStatus {
        let jobs = self.jobs.read().await;
        CronStatus {
            enabled: self.settings.enabled,
            jobs: jobs.len(),
            enabled_jobs: jobs.iter().filter(|j| j.enabled).count(),
            running: self.in_flight().len(),
            max_concurrent_runs: self.settings.max_concurrent_runs,
            next_wake_at_ms: jobs
                .iter()
                .filter(|j| j.enabled)
                .filter_map(|j| j.state.next_run_at_ms)
                .min(),
        }
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        self.deps.lanes.stats()
    }

    // ─── Dispatch ─────────────────────────────────────────────

    /// Mark `job` running in memory and in the store. Caller holds the jobs lock.
    fn mark_running(&self, job: &mut Job, now: i64) -> Result<()> {
        job.state.running_at_ms = Some(now);
        self.deps.store.upsert_job(job)?;
        self.in_flight().insert(job.id.clone());
        Ok(())
    }

    /// Run a job now. `Force` ignores the schedule; both modes refuse a job
    /// that is already running. Waits for the run to finish.
    #[tracing::instrument(skip(self))]
    pub async fn run_now(self: &Arc<Self>, id: &str, mode: RunMode) -> Result<RunNowResult> {
        let now = now_ms();
        let job = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| CronError::NotFound(id.to_string()))?;
            if self.in_flight().contains(&job.id) {
                return Ok(RunNowResult {
                    ran: false,
                    reason: Some("already-running".into()),
                    report: None,
                });
            }
            if mode == RunMode::Due && !job.is_due(now) {
                return Ok(RunNowResult {
                    ran: false,
                    reason: Some("not-due".into()),
                    report: None,
                });
            }
            self.mark_running(job, now)?;
            job.clone()
        };

        let report = tokio::spawn(self.clone().execute(job, now))
            .await
            .map_err(|e| CronError::Io(std::io::Error::other(e)))?;
        Ok(RunNowResult {
            ran: true,
            reason: None,
            report: Some(report),
        })
    }

    /// One scheduler pass at `now`: reconcile stale markers, then dispatch due
    /// jobs up to the concurrency cap. Runs are fire-and-forget; the handles
    /// are returned for callers that want to wait.
    pub async fn tick(self: &Arc<Self>, now: i64) -> Vec<JoinHandle<RunReport>> {
        if let Err(e) = self.reconcile_stale(now).await {
            warn!("stale job reconciliation failed: {e}");
        }

        let mut jobs = self.jobs.write().await;
        let running = self.in_flight().len();
        let slots = self.settings.max_concurrent_runs.max(1).saturating_sub(running);

        let mut due: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.is_due(now) && !self.in_flight().contains(&j.id))
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| jobs[i].state.next_run_at_ms);
        if due.len() > slots {
            debug!(due = due.len(), slots, "concurrency cap reached, deferring jobs");
        }

        let mut handles = Vec::new();
        for i in due.into_iter().take(slots) {
            let job = &mut jobs[i];
            if let Err(e) = self.mark_running(job, now) {
                warn!(job_id = %job.id, "failed to mark cron job running: {e}");
                continue;
            }
            info!(job_id = %job.id, name = %job.display_name(), "dispatching cron job");
            handles.push(tokio::spawn(self.clone().execute(job.clone(), now)));
        }
        handles
    }

    /// How long the loop may sleep: the tick interval, shortened to the
    /// next `wakeMode = now` job that comes due in the future.
    async fn next_sleep(&self, now: i64) -> Duration {
        let jobs = self.jobs.read().await;
        let precise = jobs
            .iter()
            .filter(|j| j.enabled && j.wake_mode == WakeMode::Now && j.state.running_at_ms.is_none())
            .filter_map(|j| j.state.next_run_at_ms)
            .filter(|&t| t > now)
            .min()
            .map(|t| Duration::from_millis((t - now) as u64));
        match precise {
            Some(d) => d.min(self.settings.tick),
            None => self.settings.tick,
        }
    }

    /// Ask the loop to re-evaluate now.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// The scheduler loop. Stops dispatching once `shutdown` flips to true;
    /// runs already in flight complete on their own.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.settings.enabled {
            info!("Cron scheduler disabled");
            return;
        }
        info!(tick_secs = self.settings.tick.as_secs(), "Cron scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick(now_ms()).await;
            let sleep_for = self.next_sleep(now_ms()).await;
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Cron scheduler stopped");
    }

    // ─── Execution ────────────────────────────────────────────

    async fn execute(self: Arc<Self>, job: Job, started_at: i64) -> RunReport {
        let clock = Instant::now();
        if let Err(e) = self
            .deps
            .store
            .append_run(&RunLogEntry::new(&job.id, RunAction::Started, started_at))
        {
            warn!(job_id = %job.id, "failed to append run log: {e}");
        }

        let (outcome, summary) = match &job.payload {
            Payload::SystemEvent { text } => (self.run_main(&job, text.clone()).await, None),
            Payload::AgentTurn { .. } => self.run_isolated(&job).await,
        };

        let duration_ms = clock.elapsed().as_millis() as i64;
        self.finish(&job.id, started_at, duration_ms, &outcome, summary.clone())
            .await;

        RunReport {
            job_id: job.id,
            status: outcome.status,
            error: outcome.error,
            summary,
            duration_ms,
        }
    }

    /// Main-session job: queue the text on the `main` lane.
    async fn run_main(&self, job: &Job, text: String) -> RunOutcome {
        let sink = self.deps.sink.clone();
        let wake_now = job.wake_mode == WakeMode::Now;
        let result = self
            .deps
            .lanes
            .run(MAIN_LANE, EnqueueOptions::default(), move |_| async move {
                sink.enqueue_system_event(text);
                if wake_now {
                    sink.wake();
                }
            })
            .await;
        match result {
            Ok(()) => RunOutcome {
                status: RunStatus::Ok,
                error: None,
            },
            Err(e) => RunOutcome {
                status: RunStatus::Error,
                error: Some(e.to_string()),
            },
        }
    }

    /// Isolated job: agent turn on the cron lane, then delivery after the
    /// lane is released, then the summary posted to the main session.
    async fn run_isolated(&self, job: &Job) -> (RunOutcome, Option<String>) {
        let Payload::AgentTurn {
            message,
            thinking,
            timeout_seconds,
            deliver,
            channel,
            to,
            best_effort_deliver,
        } = job.payload.clone()
        else {
            return (
                RunOutcome {
                    status: RunStatus::Error,
                    error: Some("isolated job without an agentTurn payload".into()),
                },
                None,
            );
        };

        let key = isolated_session_key(&job.id);
        let timeout = timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.settings.agent_timeout);

        let turn = {
            let agent = self.deps.agent.clone();
            let sessions = self.deps.sessions.clone();
            let key = key.clone();
            let channel = channel.clone();
            self.deps
                .lanes
                .run(
                    &self.settings.lane,
                    EnqueueOptions::with_timeout(timeout),
                    move |cancel| async move {
                        let session = sessions.reset(&key, now_ms()).await.map_err(|e| e.to_string())?;
                        let request = AgentRequest {
                            body: message,
                            session_id: session.session_id,
                            is_new_session: session.is_new_session,
                            channel,
                            from: None,
                            thinking,
                            timeout: Some(timeout),
                        };
                        let reply = agent.run(request, cancel).await.map_err(|e| e.to_string())?;
                        Ok::<_, String>(reply)
                    },
                )
                .await
        };

        let turn = match turn {
            Ok(Ok(reply)) => TurnResult {
                payloads: reply.payloads,
                error: None,
            },
            Ok(Err(e)) => TurnResult {
                payloads: Vec::new(),
                error: Some(e),
            },
            Err(LaneError::Timeout(d)) => TurnResult {
                payloads: Vec::new(),
                error: Some(format!("agent timed out after {}s", d.as_secs())),
            },
            Err(e) => TurnResult {
                payloads: Vec::new(),
                error: Some(e.to_string()),
            },
        };

        let summary = extract_summary(&turn.payloads);

        let delivery = if turn.error.is_none() && deliver == Some(true) {
            self.deliver(&key, channel.as_deref(), to.as_deref(), &turn.payloads)
                .await
        } else {
            DeliveryOutcome::NotRequested
        };

        let best_effort = best_effort_deliver.unwrap_or(false);
        let outcome = classify_run(turn.error.as_deref(), &delivery, best_effort);
        if let Some(err) = &outcome.error {
            warn!(job_id = %job.id, status = outcome.status.as_str(), "cron run problem: {err}");
        }

        if let Some(summary) = &summary {
            let prefix = job
                .isolation
                .as_ref()
                .map(|i| i.prefix().to_string())
                .unwrap_or_else(|| crate::types::Isolation::DEFAULT_PREFIX.to_string());
            self.deps
                .sink
                .enqueue_system_event(format!("{prefix}: {summary}"));
            if job.wake_mode == WakeMode::Now {
                self.deps.sink.wake();
            }
        }

        (outcome, summary)
    }

    /// The isolated session's own route, else the main session's.
    async fn delivery_route(&self, key: &str) -> Option<LastRoute> {
        let own = self.deps.sessions.last_route(key).await.ok().flatten();
        match own {
            Some(r) if r.channel.is_some() || r.to.is_some() => Some(r),
            _ => self
                .deps
                .sessions
                .last_route(&self.settings.main_key)
                .await
                .ok()
                .flatten(),
        }
    }

    async fn deliver(
        &self,
        key: &str,
        channel: Option<&str>,
        to: Option<&str>,
        payloads: &[ReplyPayload],
    ) -> DeliveryOutcome {
        let route = self.delivery_route(key).await;
        let target = resolve_delivery(channel, to, route.as_ref(), &self.settings.allow_from);
        let Some(recipient) = target.to else {
            let err = DeliveryError::NoRecipient {
                channel: target.channel.to_string(),
            };
            return DeliveryOutcome::NoRecipient(err.to_string());
        };

        match send_payloads(self.deps.sender.as_ref(), target.channel, &recipient, payloads).await {
            Ok(receipts) => {
                debug!(channel = %target.channel, to = %recipient, sent = receipts.len(), "cron result delivered");
                if let Err(e) = self
                    .deps
                    .sessions
                    .record_route(key, target.channel.as_str(), &recipient, now_ms())
                    .await
                {
                    warn!("failed to record delivery route: {e}");
                }
                DeliveryOutcome::Delivered
            }
            Err(e) => DeliveryOutcome::Failed(e.to_string()),
        }
    }

    /// Write the final state and the `finished` log entry.
    async fn finish(
        &self,
        job_id: &str,
        started_at: i64,
        duration_ms: i64,
        outcome: &RunOutcome,
        summary: Option<String>,
    ) {
        let finished_at = now_ms();
        let mut jobs = self.jobs.write().await;
        let mut entry = RunLogEntry::new(job_id, RunAction::Finished, finished_at);
        entry.status = Some(outcome.status);
        entry.error = outcome.error.clone();
        entry.summary = summary;
        entry.run_at_ms = Some(started_at);
        entry.duration_ms = Some(duration_ms);

        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.state.running_at_ms = None;
            job.state.last_run_at_ms = Some(started_at);
            job.state.last_status = Some(outcome.status);
            job.state.last_error = outcome.error.clone();
            job.state.last_duration_ms = Some(duration_ms);
            if matches!(job.schedule, Schedule::At { .. }) {
                job.enabled = false;
                job.state.next_run_at_ms = None;
            } else {
                job.state.next_run_at_ms = job.compute_next_run(finished_at.max(started_at + 1));
            }
            entry.next_run_at_ms = job.state.next_run_at_ms;
            if let Err(e) = self.deps.store.upsert_job(job) {
                warn!(job_id = %job_id, "failed to persist job state: {e}");
            }
        } else {
            debug!(job_id = %job_id, "job removed while running");
        }

        if let Err(e) = self.deps.store.append_run(&entry) {
            warn!(job_id = %job_id, "failed to append run log: {e}");
        }
        self.in_flight().remove(job_id);
        drop(jobs);
        info!(job_id = %job_id, status = outcome.status.as_str(), duration_ms, "cron job finished");
        self.wake.notify_one();
    }
}
