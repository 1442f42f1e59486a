//! Inbound chat traffic.
//!
//! Every inbound message runs on the `main` lane, the same lane cron uses
//! for main-session payloads, so the two never interleave their session
//! writes.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use relaybot_config::{SessionConfig, SessionScope};
use relaybot_cron::{AgentInvoker, AgentRequest, CommandLanes, EnqueueOptions, MAIN_LANE, SystemEventQueue};
use relaybot_storage::{ResolvedSession, SessionResolver};
use relaybot_types::{InboundMessage, OutboundMessage, ReplyPayload, SendReceipt};

use crate::channel::ChannelManager;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Session key for an inbound message. An explicit key on the message wins.
pub fn session_key_for(inbound: &InboundMessage, config: &SessionConfig) -> String {
    if let Some(key) = inbound.session_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        return key.to_string();
    }
    match config.scope {
        SessionScope::Main => config.main_key.clone(),
        SessionScope::PerSender => format!(
            "{}:{}:{}",
            inbound.channel_type, inbound.channel_id, inbound.sender_id
        ),
    }
}

/// Whether this turn carries the session intro and body prefix.
fn intro_due(config: &SessionConfig, session: &ResolvedSession) -> bool {
    if config.send_system_once {
        !session.system_sent
    } else {
        session.is_new_session
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// Build the agent body: intro, then pending system events as `System:`
/// lines, then the (prefixed) message text.
pub fn compose_body(text: &str, events: &[String], intro: Option<&str>, prefix: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(intro) = intro {
        parts.push(intro.to_string());
    }
    if !events.is_empty() {
        parts.push(
            events
                .iter()
                .map(|e| format!("System: {e}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }
    let text = text.trim();
    match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => parts.push(format!("{prefix}{text}")),
        None => parts.push(text.to_string()),
    }
    parts.join("\n\n")
}

/// Outbound messages answering `inbound`, one per text or media item.
pub fn reply_messages(inbound: &InboundMessage, session_key: &str, payloads: &[ReplyPayload]) -> Vec<OutboundMessage> {
    let base = OutboundMessage {
        channel_type: inbound.channel_type.clone(),
        channel_id: inbound.channel_id.clone(),
        recipient_id: inbound.sender_id.clone(),
        text: String::new(),
        media_url: None,
        session_key: Some(session_key.to_string()),
        metadata: inbound.metadata.clone(),
    };
    let mut out = Vec::new();
    for payload in payloads {
        let text = payload.text.as_deref().map(str::trim).unwrap_or("");
        let media = payload.media();
        if media.is_empty() {
            if !text.is_empty() {
                out.push(OutboundMessage {
                    text: text.to_string(),
                    ..base.clone()
                });
            }
            continue;
        }
        for (i, url) in media.into_iter().enumerate() {
            out.push(OutboundMessage {
                text: if i == 0 { text.to_string() } else { String::new() },
                media_url: Some(url.to_string()),
                ..base.clone()
            });
        }
    }
    out
}

pub struct Ingress {
    lanes: CommandLanes,
    agent: Arc<dyn AgentInvoker>,
    sessions: Arc<SessionResolver>,
    events: Arc<SystemEventQueue>,
    channels: Arc<ChannelManager>,
    config: Arc<SessionConfig>,
}

impl Ingress {
    pub fn new(
        lanes: CommandLanes,
        agent: Arc<dyn AgentInvoker>,
        sessions: Arc<SessionResolver>,
        events: Arc<SystemEventQueue>,
        channels: Arc<ChannelManager>,
        config: SessionConfig,
    ) -> Self {
        Self {
            lanes,
            agent,
            sessions,
            events,
            channels,
            config: Arc::new(config),
        }
    }

    /// Run one inbound message through the agent and send the reply back
    /// through the originating channel.
    #[tracing::instrument(skip_all, fields(channel_id = %inbound.channel_id, sender = %inbound.sender_id))]
    pub async fn handle(&self, inbound: InboundMessage) -> anyhow::Result<Vec<SendReceipt>> {
        let key = session_key_for(&inbound, &self.config);
        info!(session = %key, "Processing inbound message");

        let reply = {
            let agent = self.agent.clone();
            let sessions = self.sessions.clone();
            let events = self.events.clone();
            let config = self.config.clone();
            let key = key.clone();
            let inbound = inbound.clone();
            self.lanes
                .run(MAIN_LANE, EnqueueOptions::default(), move |cancel| async move {
                    let session = sessions.resolve(&key, now_ms()).await?;
                    let pending = (key == config.main_key).then(|| events.take_pending());
                    let due = intro_due(&config, &session);
                    if due {
                        sessions.mark_system_sent(&key).await?;
                    }
                    let (intro, prefix) = if due {
                        (
                            non_empty(config.session_intro.as_deref()).map(str::trim),
                            non_empty(config.body_prefix.as_deref()),
                        )
                    } else {
                        (None, None)
                    };
                    let lines = pending.as_ref().map(|p| p.lines()).unwrap_or_default();
                    let body = compose_body(&inbound.text, lines, intro, prefix);

                    let request = AgentRequest {
                        body,
                        session_id: session.session_id,
                        is_new_session: session.is_new_session,
                        channel: Some(inbound.channel_type.clone()),
                        from: Some(inbound.sender_id.clone()),
                        thinking: None,
                        timeout: None,
                    };
                    let reply = agent.run(request, cancel).await?;
                    if let Some(pending) = pending {
                        pending.commit();
                    }
                    sessions
                        .record_route(&key, &inbound.channel_type, &inbound.sender_id, now_ms())
                        .await?;
                    Ok::<_, anyhow::Error>(reply)
                })
                .await
                .context("main lane")??
        };

        let mut receipts = Vec::new();
        for message in reply_messages(&inbound, &key, &reply.payloads) {
            receipts.push(self.channels.send_message(message).await?);
        }
        Ok(receipts)
    }
}
