//! Heartbeat turns on the main session.
//!
//! When cron asks for a wake, the main session gets an agent turn carrying
//! the queued system events. The agent answers `HEARTBEAT_OK` when it has
//! nothing to say; anything else goes to the main session's last route.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use relaybot_cron::{
    AgentInvoker, AgentRequest, CommandLanes, EnqueueOptions, MAIN_LANE, MessageSender, SystemEventQueue,
    resolve_delivery, send_payloads,
};
use relaybot_storage::SessionResolver;
use relaybot_types::ReplyPayload;

pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The agent acknowledged with nothing to deliver.
    Acknowledged,
    Delivered(usize),
    /// A reply was produced but the main session has no usable route.
    NoRecipient,
}

/// True when the reply is only the acknowledgement token.
pub fn is_ack(payloads: &[ReplyPayload]) -> bool {
    let visible: Vec<&ReplyPayload> = payloads.iter().filter(|p| !p.is_empty()).collect();
    match visible.as_slice() {
        [] => true,
        [only] => only.media().is_empty() && only.text.as_deref().map(str::trim) == Some(HEARTBEAT_OK),
        _ => false,
    }
}

pub struct Heartbeat {
    lanes: CommandLanes,
    agent: Arc<dyn AgentInvoker>,
    sessions: Arc<SessionResolver>,
    events: Arc<SystemEventQueue>,
    sender: Arc<dyn MessageSender>,
    main_key: String,
    prompt: String,
    allow_from: Vec<String>,
}

impl Heartbeat {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lanes: CommandLanes,
        agent: Arc<dyn AgentInvoker>,
        sessions: Arc<SessionResolver>,
        events: Arc<SystemEventQueue>,
        sender: Arc<dyn MessageSender>,
        main_key: String,
        prompt: String,
        allow_from: Vec<String>,
    ) -> Self {
        Self {
            lanes,
            agent,
            sessions,
            events,
            sender,
            main_key,
            prompt,
            allow_from,
        }
    }

    /// Run one heartbeat turn now.
    pub async fn beat(&self) -> anyhow::Result<HeartbeatOutcome> {
        let reply = {
            let agent = self.agent.clone();
            let sessions = self.sessions.clone();
            let events = self.events.clone();
            let key = self.main_key.clone();
            let prompt = self.prompt.clone();
            self.lanes
                .run(MAIN_LANE, EnqueueOptions::default(), move |cancel| async move {
                    let session = sessions.resolve(&key, now_ms()).await?;
                    let pending = events.take_pending();
                    let mut lines: Vec<String> = pending.lines().iter().map(|e| format!("System: {e}")).collect();
                    lines.push(prompt);
                    let request = AgentRequest {
                        body: lines.join("\n"),
                        session_id: session.session_id,
                        is_new_session: session.is_new_session,
                        ..Default::default()
                    };
                    let reply = agent.run(request, cancel).await?;
                    pending.commit();
                    Ok::<_, anyhow::Error>(reply)
                })
                .await??
        };

        if is_ack(&reply.payloads) {
            debug!("heartbeat acknowledged");
            return Ok(HeartbeatOutcome::Acknowledged);
        }

        let route = self.sessions.last_route(&self.main_key).await?;
        let target = resolve_delivery(None, None, route.as_ref(), &self.allow_from);
        let Some(to) = target.to else {
            warn!(channel = %target.channel, "heartbeat reply has no recipient");
            return Ok(HeartbeatOutcome::NoRecipient);
        };
        let receipts = send_payloads(self.sender.as_ref(), target.channel, &to, &reply.payloads).await?;
        info!(channel = %target.channel, sent = receipts.len(), "heartbeat reply delivered");
        Ok(HeartbeatOutcome::Delivered(receipts.len()))
    }

    /// Run a heartbeat each time the event queue is woken, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Heartbeat runner started");
        loop {
            tokio::select! {
                _ = self.events.woken() => {
                    if let Err(e) = self.beat().await {
                        warn!("heartbeat failed: {e:#}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Heartbeat runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use relaybot_cron::{AgentError, AgentReply, DeliveryError, MainSessionSink};
    use relaybot_storage::SessionStore;
    use relaybot_types::{SendReceipt, Surface};
    use tokio_util::sync::CancellationToken;

    struct ScriptedAgent {
        reply: &'static str,
        fail: bool,
        bodies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentInvoker for ScriptedAgent {
        async fn run(&self, request: AgentRequest, _cancel: CancellationToken) -> Result<AgentReply, AgentError> {
            self.bodies.lock().unwrap().push(request.body);
            if self.fail {
                return Err(AgentError::TimedOut(600));
            }
            Ok(AgentReply {
                payloads: vec![ReplyPayload::text(self.reply)],
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Surface, String, String)>>,
    }

    #[async_trait]
    impl MessageSender for Recorder {
        async fn send(
            &self,
            surface: Surface,
            to: &str,
            text: &str,
            _media_url: Option<&str>,
        ) -> Result<SendReceipt, DeliveryError> {
            self.sent.lock().unwrap().push((surface, to.into(), text.into()));
            Ok(SendReceipt {
                message_id: "1".into(),
                chat_id: to.into(),
            })
        }
    }

    struct Harness {
        heartbeat: Arc<Heartbeat>,
        agent: Arc<ScriptedAgent>,
        events: Arc<SystemEventQueue>,
        sessions: Arc<SessionResolver>,
        sender: Arc<Recorder>,
        _dir: tempfile::TempDir,
    }

    fn harness(reply: &'static str) -> Harness {
        harness_with(reply, false)
    }

    fn harness_with(reply: &'static str, fail: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let agent = Arc::new(ScriptedAgent {
            reply,
            fail,
            bodies: Mutex::new(Vec::new()),
        });
        let events = Arc::new(SystemEventQueue::new());
        let sessions = Arc::new(SessionResolver::new(
            SessionStore::new(dir.path().join("sessions.json")),
            60,
        ));
        let sender = Arc::new(Recorder::default());
        let heartbeat = Arc::new(Heartbeat::new(
            CommandLanes::new(),
            agent.clone(),
            sessions.clone(),
            events.clone(),
            sender.clone(),
            "main".into(),
            "HEARTBEAT".into(),
            Vec::new(),
        ));
        Harness {
            heartbeat,
            agent,
            events,
            sessions,
            sender,
            _dir: dir,
        }
    }

    #[test]
    fn test_is_ack() {
        assert!(is_ack(&[]));
        assert!(is_ack(&[ReplyPayload::text(" HEARTBEAT_OK\n")]));
        assert!(is_ack(&[ReplyPayload::text("HEARTBEAT_OK"), ReplyPayload::text(" ")]));
        assert!(!is_ack(&[ReplyPayload::text("HEARTBEAT_OK please")]));
        assert!(!is_ack(&[ReplyPayload::text("HEARTBEAT_OK"), ReplyPayload::text("also this")]));
    }

    #[tokio::test]
    async fn test_ack_is_not_delivered() {
        let h = harness("HEARTBEAT_OK");
        h.events.enqueue_system_event("Cron: nothing new".into());
        assert_eq!(h.heartbeat.beat().await.unwrap(), HeartbeatOutcome::Acknowledged);
        assert!(h.sender.sent.lock().unwrap().is_empty());
        assert_eq!(h.agent.bodies.lock().unwrap()[0], "System: Cron: nothing new\nHEARTBEAT");
        assert!(h.events.is_empty());
    }

    #[tokio::test]
    async fn test_reply_goes_to_main_route() {
        let h = harness("Your backup finished.");
        h.sessions.record_route("main", "telegram", "42", now_ms()).await.unwrap();
        assert_eq!(h.heartbeat.beat().await.unwrap(), HeartbeatOutcome::Delivered(1));
        let sent = h.sender.sent.lock().unwrap();
        assert_eq!(sent[0], (Surface::Telegram, "42".to_string(), "Your backup finished.".to_string()));
    }

    #[tokio::test]
    async fn test_reply_without_route_is_not_sent() {
        let h = harness("hello?");
        assert_eq!(h.heartbeat.beat().await.unwrap(), HeartbeatOutcome::NoRecipient);
        assert!(h.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_beat_keeps_system_events() {
        let h = harness_with("unused", true);
        h.events.enqueue_system_event("Cron: backup done".into());
        h.events.enqueue_system_event("Digest: Inbox zero.".into());

        assert!(h.heartbeat.beat().await.is_err());
        assert_eq!(h.events.len(), 2);
        assert!(h.sender.sent.lock().unwrap().is_empty());

        // the next beat sees the same events
        assert!(h.heartbeat.beat().await.is_err());
        let bodies = h.agent.bodies.lock().unwrap();
        assert_eq!(bodies[0], bodies[1]);
        assert_eq!(h.events.drain(), vec!["Cron: backup done", "Digest: Inbox zero."]);
    }

    #[tokio::test]
    async fn test_wake_triggers_beat() {
        let h = harness("HEARTBEAT_OK");
        let (tx, rx) = watch::channel(false);
        let runner = tokio::spawn(h.heartbeat.clone().run(rx));

        h.events.enqueue_system_event("ping".into());
        h.events.wake();
        for _ in 0..100 {
            if !h.agent.bodies.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(h.agent.bodies.lock().unwrap().len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }
}
