//! Channel plugin framework.
//!
//! ```text
//! chat surface
//!     ↓ ChannelPlugin::start() spawns a listener
//!     ↓ InboundMessage via mpsc
//! ChannelManager::run_message_loop → Ingress (main lane)
//!     ↓ reply payloads
//! ChannelPlugin::send(OutboundMessage)
//! ```
//!
//! The manager is also the cron service's [`MessageSender`]: a send for a
//! surface goes through the first running plugin of that type.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};

use relaybot_cron::{DeliveryError, MessageSender};
use relaybot_types::{ChannelInfo, ChannelStatus, InboundMessage, OutboundMessage, SendReceipt, Surface};

use crate::ingress::Ingress;

/// Bridges one chat-surface account to the gateway.
///
/// All methods take `&self`; implementations keep mutable state behind
/// interior mutability.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Surface name, e.g. "telegram".
    fn channel_type(&self) -> &str;

    /// Unique instance id.
    fn channel_id(&self) -> &str;

    /// Connect and start pushing inbound messages into `sender`.
    async fn start(&self, sender: mpsc::Sender<InboundMessage>) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn send(&self, message: OutboundMessage) -> anyhow::Result<SendReceipt>;

    fn status(&self) -> ChannelStatus;
}

pub struct ChannelManager {
    // ordered by id so surface lookups are deterministic
    channels: RwLock<BTreeMap<String, Arc<dyn ChannelPlugin>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
}

impl ChannelManager {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        Self {
            channels: RwLock::new(BTreeMap::new()),
            inbound_tx: tx,
            inbound_rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Sender that feeds the inbound loop.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Register a plugin, replacing any with the same id.
    pub async fn register(&self, channel: Arc<dyn ChannelPlugin>) {
        let id = channel.channel_id().to_string();
        info!(channel_type = channel.channel_type(), channel_id = %id, "Registering channel plugin");
        self.channels.write().await.insert(id, channel);
    }

    /// Remove a plugin, stopping it if it is running.
    pub async fn unregister(&self, channel_id: &str) -> bool {
        let Some(channel) = self.channels.write().await.remove(channel_id) else {
            return false;
        };
        if channel.status() == ChannelStatus::Running {
            if let Err(e) = channel.stop().await {
                warn!(channel_id, "Failed to stop channel during unregister: {e}");
            }
        }
        true
    }

    pub async fn start_all(&self) {
        let channels = self.channels.read().await;
        for (id, channel) in channels.iter() {
            if let Err(e) = channel.start(self.inbound_tx.clone()).await {
                warn!(channel_id = %id, "Failed to start channel: {e}");
            }
        }
    }

    pub async fn stop_all(&self) {
        let channels: Vec<_> = self.channels.read().await.values().cloned().collect();
        let results = futures::future::join_all(channels.iter().map(|c| c.stop())).await;
        for (channel, result) in channels.iter().zip(results) {
            if let Err(e) = result {
                warn!(channel_id = channel.channel_id(), "Failed to stop channel: {e}");
            }
        }
    }

    /// Send through the plugin named by `message.channel_id`.
    pub async fn send_message(&self, message: OutboundMessage) -> anyhow::Result<SendReceipt> {
        let channel = self
            .channels
            .read()
            .await
            .get(&message.channel_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Channel not found: {}", message.channel_id))?;
        channel.send(message).await
    }

    /// First running plugin serving `surface`.
    pub async fn channel_for(&self, surface: Surface) -> Option<Arc<dyn ChannelPlugin>> {
        self.channels
            .read()
            .await
            .values()
            .find(|c| c.channel_type() == surface.as_str() && c.status() == ChannelStatus::Running)
            .cloned()
    }

    pub async fn list_channels(&self) -> Vec<ChannelInfo> {
        self.channels
            .read()
            .await
            .values()
            .map(|ch| ChannelInfo {
                channel_type: ch.channel_type().to_string(),
                channel_id: ch.channel_id().to_string(),
                status: ch.status(),
            })
            .collect()
    }

    pub async fn channel_status(&self, channel_id: &str) -> Option<ChannelStatus> {
        self.channels.read().await.get(channel_id).map(|ch| ch.status())
    }

    /// Consume inbound messages from every channel and hand each to `ingress`.
    /// Spawn as a background task.
    pub async fn run_message_loop(self: &Arc<Self>, ingress: Arc<Ingress>) {
        let mut rx = self.inbound_rx.lock().await;
        info!("Channel message loop started");

        while let Some(inbound) = rx.recv().await {
            let ingress = ingress.clone();
            tokio::spawn(async move {
                let channel_id = inbound.channel_id.clone();
                if let Err(e) = ingress.handle(inbound).await {
                    warn!(channel_id = %channel_id, "Inbound message failed: {e:#}");
                }
            });
        }

        info!("Channel message loop stopped");
    }
}

#[async_trait]
impl MessageSender for ChannelManager {
    async fn send(
        &self,
        surface: Surface,
        to: &str,
        text: &str,
        media_url: Option<&str>,
    ) -> Result<SendReceipt, DeliveryError> {
        let channel = self
            .channel_for(surface)
            .await
            .ok_or_else(|| DeliveryError::NoChannel(surface.to_string()))?;
        let message = OutboundMessage {
            channel_type: surface.to_string(),
            channel_id: channel.channel_id().to_string(),
            recipient_id: to.to_string(),
            text: text.to_string(),
            media_url: media_url.map(String::from),
            session_key: None,
            metadata: Default::default(),
        };
        channel
            .send(message)
            .await
            .map_err(|e| DeliveryError::Send(format!("{e:#}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU8, Ordering};

    pub(crate) struct MockChannel {
        kind: String,
        id: String,
        state: AtomicU8, // 0=stopped, 2=running
        pub(crate) sent: tokio::sync::Mutex<Vec<OutboundMessage>>,
    }

    impl MockChannel {
        pub(crate) fn new(kind: &str, id: &str) -> Self {
            Self {
                kind: kind.to_string(),
                id: id.to_string(),
                state: AtomicU8::new(0),
                sent: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChannelPlugin for MockChannel {
        fn channel_type(&self) -> &str {
            &self.kind
        }

        fn channel_id(&self) -> &str {
            &self.id
        }

        async fn start(&self, _sender: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
            self.state.store(2, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.state.store(0, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, message: OutboundMessage) -> anyhow::Result<SendReceipt> {
            let mut sent = self.sent.lock().await;
            let receipt = SendReceipt {
                message_id: format!("{}-{}", self.id, sent.len() + 1),
                chat_id: message.recipient_id.clone(),
            };
            sent.push(message);
            Ok(receipt)
        }

        fn status(&self) -> ChannelStatus {
            match self.state.load(Ordering::SeqCst) {
                0 => ChannelStatus::Stopped,
                2 => ChannelStatus::Running,
                _ => ChannelStatus::Error("unknown".into()),
            }
        }
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let mgr = ChannelManager::new(16);
        assert!(mgr.list_channels().await.is_empty());

        mgr.register(Arc::new(MockChannel::new("telegram", "tg-1"))).await;
        let list = mgr.list_channels().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].channel_type, "telegram");
        assert_eq!(list[0].status, ChannelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_stop_and_unregister() {
        let mgr = ChannelManager::new(16);
        mgr.register(Arc::new(MockChannel::new("telegram", "tg-1"))).await;

        mgr.start_all().await;
        assert_eq!(mgr.channel_status("tg-1").await, Some(ChannelStatus::Running));
        mgr.stop_all().await;
        assert_eq!(mgr.channel_status("tg-1").await, Some(ChannelStatus::Stopped));

        assert!(mgr.unregister("tg-1").await);
        assert!(!mgr.unregister("tg-1").await);
    }

    #[tokio::test]
    async fn test_send_message_by_channel_id() {
        let mgr = ChannelManager::new(16);
        let ch = Arc::new(MockChannel::new("discord", "dc-1"));
        mgr.register(ch.clone()).await;

        let msg = OutboundMessage {
            channel_type: "discord".into(),
            channel_id: "dc-1".into(),
            recipient_id: "chan-1".into(),
            text: "Hello!".into(),
            media_url: None,
            session_key: None,
            metadata: HashMap::new(),
        };
        let receipt = mgr.send_message(msg.clone()).await.unwrap();
        assert_eq!(receipt.chat_id, "chan-1");
        assert_eq!(ch.sent.lock().await[0].text, "Hello!");

        let missing = OutboundMessage {
            channel_id: "nope".into(),
            ..msg
        };
        assert!(mgr.send_message(missing).await.is_err());
    }

    #[tokio::test]
    async fn test_surface_send_uses_running_plugin() {
        let mgr = ChannelManager::new(16);
        let ch = Arc::new(MockChannel::new("telegram", "tg-1"));
        mgr.register(ch.clone()).await;

        let err = MessageSender::send(&mgr, Surface::Telegram, "42", "hi", None).await.unwrap_err();
        assert_eq!(err, DeliveryError::NoChannel("telegram".into()));

        mgr.start_all().await;
        let receipt = MessageSender::send(&mgr, Surface::Telegram, "42", "hi", Some("https://x/a.png"))
            .await
            .unwrap();
        assert_eq!(receipt.chat_id, "42");
        let sent = ch.sent.lock().await;
        assert_eq!(sent[0].channel_id, "tg-1");
        assert_eq!(sent[0].media_url.as_deref(), Some("https://x/a.png"));

        let err = MessageSender::send(&mgr, Surface::Discord, "1", "hi", None).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NoChannel(_)));
    }
}
