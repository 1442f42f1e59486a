use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand, ValueEnum};
use serde_json::{Value, json};

use relaybot_cron::types::Isolation;
use relaybot_cron::{Job, JobCreate, JobPatch, Payload, RunLogEntry, Schedule, SessionTarget, WakeMode, parse_duration_ms};

use crate::rpc::RpcClient;

#[derive(Subcommand)]
pub enum CronCommand {
    /// Show scheduler status
    Status,
    /// List jobs
    List {
        /// Include disabled jobs
        #[arg(long)]
        all: bool,
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a job
    Add(AddArgs),
    /// Change an existing job
    Edit(EditArgs),
    /// Delete a job (its run history is kept)
    Rm { id: String },
    /// Enable a job
    Enable { id: String },
    /// Disable a job
    Disable { id: String },
    /// Run a job now and wait for the result
    Run {
        id: String,
        /// Only run if the job is currently due
        #[arg(long)]
        due: bool,
    },
    /// Show run history
    Runs {
        /// Only this job
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum TargetArg {
    Main,
    Isolated,
}

impl From<TargetArg> for SessionTarget {
    fn from(t: TargetArg) -> Self {
        match t {
            TargetArg::Main => SessionTarget::Main,
            TargetArg::Isolated => SessionTarget::Isolated,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum WakeArg {
    Now,
    NextHeartbeat,
}

impl From<WakeArg> for WakeMode {
    fn from(w: WakeArg) -> Self {
        match w {
            WakeArg::Now => WakeMode::Now,
            WakeArg::NextHeartbeat => WakeMode::NextHeartbeat,
        }
    }
}

#[derive(Args, Default)]
pub struct ScheduleArgs {
    /// Run once: RFC 3339 time, epoch millis, or "+20m" from now
    #[arg(long)]
    pub at: Option<String>,
    /// Run repeatedly, e.g. "90s", "1h30m"
    #[arg(long)]
    pub every: Option<String>,
    /// Five-field cron expression
    #[arg(long)]
    pub cron: Option<String>,
    /// IANA time zone for --cron (host zone when absent)
    #[arg(long, requires = "cron")]
    pub tz: Option<String>,
}

#[derive(Args, Default)]
pub struct PayloadArgs {
    /// Text queued into the main session
    #[arg(long, conflicts_with = "message")]
    pub system_event: Option<String>,
    /// Agent prompt for an isolated run
    #[arg(long)]
    pub message: Option<String>,
    #[arg(long)]
    pub thinking: Option<String>,
    #[arg(long)]
    pub timeout_seconds: Option<u64>,
    /// Deliver the isolated run's output to a chat
    #[arg(long)]
    pub deliver: bool,
    /// whatsapp, telegram, discord, or "last"
    #[arg(long)]
    pub channel: Option<String>,
    #[arg(long)]
    pub to: Option<String>,
    /// Delivery failures do not fail the run
    #[arg(long)]
    pub best_effort_deliver: bool,
}

impl PayloadArgs {
    fn has_agent_options(&self) -> bool {
        self.thinking.is_some()
            || self.timeout_seconds.is_some()
            || self.deliver
            || self.channel.is_some()
            || self.to.is_some()
            || self.best_effort_deliver
    }
}

#[derive(Args)]
pub struct AddArgs {
    #[arg(long)]
    pub name: Option<String>,
    #[command(flatten)]
    pub schedule: ScheduleArgs,
    #[command(flatten)]
    pub payload: PayloadArgs,
    /// Defaults to main for --system-event and isolated for --message
    #[arg(long, value_enum)]
    pub session: Option<TargetArg>,
    #[arg(long, value_enum)]
    pub wake: Option<WakeArg>,
    /// Prefix for summaries posted back to the main session
    #[arg(long)]
    pub post_prefix: Option<String>,
    /// Create the job disabled
    #[arg(long)]
    pub disabled: bool,
}

#[derive(Args)]
pub struct EditArgs {
    pub id: String,
    #[arg(long)]
    pub name: Option<String>,
    #[command(flatten)]
    pub schedule: ScheduleArgs,
    #[command(flatten)]
    pub payload: PayloadArgs,
    #[arg(long, value_enum)]
    pub session: Option<TargetArg>,
    #[arg(long, value_enum)]
    pub wake: Option<WakeArg>,
    #[arg(long)]
    pub post_prefix: Option<String>,
}

/// `--at` value to epoch millis.
pub fn parse_at(raw: &str, now_ms: i64) -> Result<i64> {
    let raw = raw.trim();
    if let Some(rel) = raw.strip_prefix('+') {
        return Ok(now_ms + parse_duration_ms(rel)?);
    }
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        return raw.parse().context("invalid epoch millis");
    }
    let at = chrono::DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid --at time: {raw} (use RFC 3339, epoch ms, or +duration)"))?;
    Ok(at.timestamp_millis())
}

/// Schedule from flags; `None` when no schedule flag was given.
pub fn build_schedule(args: &ScheduleArgs, now_ms: i64) -> Result<Option<Schedule>> {
    let given = [args.at.is_some(), args.every.is_some(), args.cron.is_some()]
        .iter()
        .filter(|b| **b)
        .count();
    if given > 1 {
        bail!("choose one of --at, --every, --cron");
    }
    if let Some(at) = &args.at {
        return Ok(Some(Schedule::At {
            at_ms: parse_at(at, now_ms)?,
        }));
    }
    if let Some(every) = &args.every {
        return Ok(Some(Schedule::Every {
            every_ms: parse_duration_ms(every)?,
            anchor_ms: None,
        }));
    }
    Ok(args.cron.as_ref().map(|expr| Schedule::Cron {
        expr: expr.clone(),
        tz: args.tz.clone(),
    }))
}

/// Payload from flags; `None` when neither text flag was given.
pub fn build_payload(args: &PayloadArgs) -> Result<Option<Payload>> {
    if let Some(text) = &args.system_event {
        if args.has_agent_options() {
            bail!("agent options only apply to --message");
        }
        return Ok(Some(Payload::system_event(text.clone())));
    }
    let Some(message) = &args.message else {
        if args.has_agent_options() {
            bail!("agent options need --message");
        }
        return Ok(None);
    };
    Ok(Some(Payload::AgentTurn {
        message: message.clone(),
        thinking: args.thinking.clone(),
        timeout_seconds: args.timeout_seconds,
        deliver: args.deliver.then_some(true),
        channel: args.channel.clone(),
        to: args.to.clone(),
        best_effort_deliver: args.best_effort_deliver.then_some(true),
    }))
}

fn target_for(explicit: Option<TargetArg>, payload: &Payload) -> SessionTarget {
    match (explicit, payload) {
        (Some(t), _) => t.into(),
        (None, Payload::SystemEvent { .. }) => SessionTarget::Main,
        (None, Payload::AgentTurn { .. }) => SessionTarget::Isolated,
    }
}

fn isolation(prefix: Option<&String>) -> Option<Isolation> {
    prefix.map(|p| Isolation {
        post_to_main_prefix: Some(p.clone()),
    })
}

pub fn build_create(args: &AddArgs, now_ms: i64) -> Result<JobCreate> {
    let schedule = build_schedule(&args.schedule, now_ms)?.context("a schedule is required (--at, --every or --cron)")?;
    let payload = build_payload(&args.payload)?.context("a payload is required (--system-event or --message)")?;
    Ok(JobCreate {
        id: None,
        name: args.name.clone(),
        enabled: !args.disabled,
        schedule,
        session_target: target_for(args.session, &payload),
        wake_mode: args.wake.map(Into::into).unwrap_or_default(),
        payload,
        isolation: isolation(args.post_prefix.as_ref()),
    })
}

pub fn build_patch(args: &EditArgs, now_ms: i64) -> Result<JobPatch> {
    let payload = build_payload(&args.payload)?;
    let session_target = match (&payload, args.session) {
        (Some(p), explicit) => Some(target_for(explicit, p)),
        (None, explicit) => explicit.map(Into::into),
    };
    let patch = JobPatch {
        name: args.name.clone(),
        enabled: None,
        schedule: build_schedule(&args.schedule, now_ms)?,
        session_target,
        wake_mode: args.wake.map(Into::into),
        payload,
        isolation: isolation(args.post_prefix.as_ref()),
    };
    if patch == JobPatch::default() {
        bail!("nothing to change");
    }
    Ok(patch)
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub fn format_duration(ms: i64) -> String {
    const UNITS: [(i64, &str); 4] = [(86_400_000, "d"), (3_600_000, "h"), (60_000, "m"), (1_000, "s")];
    let mut rest = ms;
    let mut out = String::new();
    for (size, unit) in UNITS {
        if rest >= size {
            out.push_str(&format!("{}{unit}", rest / size));
            rest %= size;
        }
    }
    if rest > 0 || out.is_empty() {
        out.push_str(&format!("{rest}ms"));
    }
    out
}

pub fn format_schedule(schedule: &Schedule) -> String {
    match schedule {
        Schedule::At { at_ms } => format!("at {}", format_time(*at_ms)),
        Schedule::Every { every_ms, .. } => format!("every {}", format_duration(*every_ms)),
        Schedule::Cron { expr, tz: Some(tz) } => format!("cron {expr} ({tz})"),
        Schedule::Cron { expr, tz: None } => format!("cron {expr}"),
    }
}

fn print_job(job: &Job) {
    let target = match job.session_target {
        SessionTarget::Main => "main",
        SessionTarget::Isolated => "isolated",
    };
    println!(
        "{}  {}  [{}{}]  {}",
        job.id,
        job.display_name(),
        target,
        if job.enabled { "" } else { ", disabled" },
        format_schedule(&job.schedule),
    );
    if let Some(next) = job.state.next_run_at_ms {
        println!("    next: {}", format_time(next));
    }
    if let Some(status) = job.state.last_status {
        let when = job.state.last_run_at_ms.map(format_time).unwrap_or_default();
        match &job.state.last_error {
            Some(err) => println!("    last: {} {when} ({err})", status.as_str()),
            None => println!("    last: {} {when}", status.as_str()),
        }
    }
}

fn print_entry(entry: &RunLogEntry) {
    let mut line = format!("{}  {}  {}", format_time(entry.timestamp), entry.job_id, entry.action.as_str());
    if let Some(status) = entry.status {
        line.push_str(&format!("  {}", status.as_str()));
    }
    if let Some(ms) = entry.duration_ms {
        line.push_str(&format!("  {}", format_duration(ms)));
    }
    if let Some(err) = &entry.error {
        line.push_str(&format!("  error: {err}"));
    } else if let Some(summary) = &entry.summary {
        line.push_str(&format!("  {}", summary.lines().next().unwrap_or("")));
    }
    println!("{line}");
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(rpc: &RpcClient, command: CronCommand) -> Result<()> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    match command {
        CronCommand::Status => print_json(&rpc.call("cron.status", Value::Null).await?)?,
        CronCommand::List { all, json } => {
            let result = rpc.call("cron.list", json!({ "includeDisabled": all })).await?;
            if json {
                return print_json(&result);
            }
            let jobs: Vec<Job> = serde_json::from_value(result["jobs"].clone()).context("unexpected cron.list result")?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            jobs.iter().for_each(print_job);
        }
        CronCommand::Add(args) => {
            let input = build_create(&args, now_ms)?;
            let result = rpc.call("cron.add", serde_json::to_value(input)?).await?;
            let job: Job = serde_json::from_value(result["job"].clone())?;
            print_job(&job);
        }
        CronCommand::Edit(args) => {
            let patch = build_patch(&args, now_ms)?;
            let result = rpc.call("cron.update", json!({ "id": args.id, "patch": patch })).await?;
            let job: Job = serde_json::from_value(result["job"].clone())?;
            print_job(&job);
        }
        CronCommand::Rm { id } => {
            let result = rpc.call("cron.remove", json!({ "id": id })).await?;
            if result["removed"].as_bool() == Some(true) {
                println!("Removed {id}");
            } else {
                println!("No job {id}");
            }
        }
        CronCommand::Enable { id } => {
            rpc.call("cron.enable", json!({ "id": id })).await?;
            println!("Enabled {id}");
        }
        CronCommand::Disable { id } => {
            rpc.call("cron.disable", json!({ "id": id })).await?;
            println!("Disabled {id}");
        }
        CronCommand::Run { id, due } => {
            let mode = if due { "due" } else { "force" };
            print_json(&rpc.call("cron.run", json!({ "id": id, "mode": mode })).await?)?;
        }
        CronCommand::Runs { id, limit } => {
            let result = rpc.call("cron.runs", json!({ "jobId": id, "limit": limit })).await?;
            let entries: Vec<RunLogEntry> =
                serde_json::from_value(result["entries"].clone()).context("unexpected cron.runs result")?;
            entries.iter().for_each(print_entry);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_parse_at() {
        assert_eq!(parse_at("+20m", NOW).unwrap(), NOW + 1_200_000);
        assert_eq!(parse_at("1700000000123", NOW).unwrap(), 1_700_000_000_123);
        assert_eq!(parse_at("2023-11-14T22:13:20Z", NOW).unwrap(), NOW);
        assert!(parse_at("tomorrow", NOW).is_err());
        assert!(parse_at("+0s", NOW).is_err());
    }

    #[test]
    fn test_build_schedule() {
        let every = ScheduleArgs {
            every: Some("1h30m".into()),
            ..Default::default()
        };
        assert_eq!(
            build_schedule(&every, NOW).unwrap(),
            Some(Schedule::Every { every_ms: 5_400_000, anchor_ms: None })
        );

        let cron = ScheduleArgs {
            cron: Some("0 9 * * 3".into()),
            tz: Some("Europe/Berlin".into()),
            ..Default::default()
        };
        assert!(matches!(build_schedule(&cron, NOW).unwrap(), Some(Schedule::Cron { .. })));

        let both = ScheduleArgs {
            at: Some("+1m".into()),
            every: Some("1m".into()),
            ..Default::default()
        };
        assert!(build_schedule(&both, NOW).is_err());
        assert_eq!(build_schedule(&ScheduleArgs::default(), NOW).unwrap(), None);
    }

    #[test]
    fn test_build_payload() {
        let turn = PayloadArgs {
            message: Some("summarize".into()),
            deliver: true,
            channel: Some("telegram".into()),
            to: Some("42".into()),
            ..Default::default()
        };
        match build_payload(&turn).unwrap() {
            Some(Payload::AgentTurn { deliver, best_effort_deliver, to, .. }) => {
                assert_eq!(deliver, Some(true));
                assert_eq!(best_effort_deliver, None);
                assert_eq!(to.as_deref(), Some("42"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        let bad = PayloadArgs {
            system_event: Some("x".into()),
            deliver: true,
            ..Default::default()
        };
        assert!(build_payload(&bad).is_err());

        let orphan = PayloadArgs {
            to: Some("42".into()),
            ..Default::default()
        };
        assert!(build_payload(&orphan).is_err());
    }

    #[test]
    fn test_target_inferred_from_payload() {
        let args = AddArgs {
            name: None,
            schedule: ScheduleArgs {
                every: Some("5m".into()),
                ..Default::default()
            },
            payload: PayloadArgs {
                message: Some("check mail".into()),
                ..Default::default()
            },
            session: None,
            wake: Some(WakeArg::Now),
            post_prefix: Some("Mail".into()),
            disabled: false,
        };
        let input = build_create(&args, NOW).unwrap();
        assert_eq!(input.session_target, SessionTarget::Isolated);
        assert_eq!(input.wake_mode, WakeMode::Now);
        assert_eq!(input.isolation.unwrap().prefix(), "Mail");
    }

    #[test]
    fn test_empty_edit_rejected() {
        let args = EditArgs {
            id: "j1".into(),
            name: None,
            schedule: ScheduleArgs::default(),
            payload: PayloadArgs::default(),
            session: None,
            wake: None,
            post_prefix: None,
        };
        assert!(build_patch(&args, NOW).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5_400_000), "1h30m");
        assert_eq!(format_duration(90_061_001), "1d1h1m1s1ms");
        assert_eq!(format_duration(0), "0ms");
    }

    #[test]
    fn test_format_schedule() {
        let every = Schedule::Every { every_ms: 60_000, anchor_ms: None };
        assert_eq!(format_schedule(&every), "every 1m");
        let cron = Schedule::Cron {
            expr: "0 9 * * 3".into(),
            tz: Some("UTC".into()),
        };
        assert_eq!(format_schedule(&cron), "cron 0 9 * * 3 (UTC)");
    }
}
