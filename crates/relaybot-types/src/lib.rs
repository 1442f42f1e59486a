use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ──────────────────── Surface Types ────────────────────

/// A messaging surface the gateway can talk through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    WhatsApp,
    Telegram,
    Discord,
    /// Local web chat. Replies are rendered in-page, never delivered.
    Web,
}

impl Surface {
    /// The surface used when nothing better is known.
    pub const PRIMARY: Surface = Surface::WhatsApp;

    /// Surfaces that accept outbound delivery.
    pub const DELIVERABLE: [Surface; 3] = [Surface::WhatsApp, Surface::Telegram, Surface::Discord];

    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::WhatsApp => "whatsapp",
            Surface::Telegram => "telegram",
            Surface::Discord => "discord",
            Surface::Web => "web",
        }
    }

    pub fn is_deliverable(&self) -> bool {
        !matches!(self, Surface::Web)
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a known surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSurface(pub String);

impl fmt::Display for UnknownSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown surface: {}", self.0)
    }
}

impl std::error::Error for UnknownSurface {}

impl FromStr for Surface {
    type Err = UnknownSurface;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Ok(Surface::WhatsApp),
            "telegram" => Ok(Surface::Telegram),
            "discord" => Ok(Surface::Discord),
            "web" | "webchat" => Ok(Surface::Web),
            other => Err(UnknownSurface(other.to_string())),
        }
    }
}

// ──────────────────── Agent Reply Types ────────────────────

/// One reply payload produced by the agent process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// All media URLs, `media_url` first, without duplicates.
    pub fn media(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = Vec::new();
        for url in self.media_url.iter().chain(self.media_urls.iter()) {
            if !url.trim().is_empty() && !urls.contains(&url.as_str()) {
                urls.push(url.as_str());
            }
        }
        urls
    }

    /// True when the payload carries neither text nor media.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty()) && self.media().is_empty()
    }
}

// ──────────────────── Channel Types ────────────────────

/// Message from an external channel to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel type (e.g. "telegram", "whatsapp").
    pub channel_type: String,
    /// Unique channel instance ID.
    pub channel_id: String,
    /// External user/sender identifier.
    pub sender_id: String,
    /// Display name of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Message text content.
    pub text: String,
    /// Explicit session key. If None, derived from the configured session scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Platform-specific metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Message timestamp (unix millis).
    pub timestamp: i64,
}

/// Message from the gateway to an external channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Channel type (e.g. "telegram", "whatsapp").
    pub channel_type: String,
    /// Unique channel instance ID.
    pub channel_id: String,
    /// Recipient identifier on the external platform.
    pub recipient_id: String,
    /// Text content.
    pub text: String,
    /// Optional media attachment URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Session key for conversation continuity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Platform-specific metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// What a channel reports back after a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
    pub chat_id: String,
}

/// Status of a channel plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Channel is not running.
    Stopped,
    /// Channel is initializing.
    Starting,
    /// Channel is running and accepting messages.
    Running,
    /// Channel encountered an error.
    Error(String),
}

/// Summary information about a registered channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_type: String,
    pub channel_id: String,
    pub status: ChannelStatus,
}

/// Configuration for a channel instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel type (e.g. "whatsapp", "telegram").
    pub channel_type: String,
    /// Whether this channel is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Recipients outbound delivery may reach. `"*"` allows anyone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_from: Vec<String>,
    /// Channel-specific settings (e.g. bot token, webhook URL).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub settings: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_parse() {
        assert_eq!("WhatsApp".parse::<Surface>(), Ok(Surface::WhatsApp));
        assert_eq!(" telegram ".parse::<Surface>(), Ok(Surface::Telegram));
        assert_eq!("webchat".parse::<Surface>(), Ok(Surface::Web));
        assert!("signal".parse::<Surface>().is_err());
        assert!("last".parse::<Surface>().is_err());
    }

    #[test]
    fn test_surface_serde() {
        let json = serde_json::to_string(&Surface::WhatsApp).unwrap();
        assert_eq!(json, "\"whatsapp\"");
        assert!(!Surface::Web.is_deliverable());
        assert!(Surface::DELIVERABLE.iter().all(|s| s.is_deliverable()));
    }

    #[test]
    fn test_reply_payload_media_dedup() {
        let payload = ReplyPayload {
            text: None,
            media_url: Some("https://a/1.png".into()),
            media_urls: vec!["https://a/1.png".into(), "https://a/2.png".into(), " ".into()],
        };
        assert_eq!(payload.media(), vec!["https://a/1.png", "https://a/2.png"]);
        assert!(!payload.is_empty());
        assert!(ReplyPayload::text("   ").is_empty());
    }

    #[test]
    fn test_reply_payload_wire_format() {
        let json = r#"{"text":"hi","mediaUrls":["u1"]}"#;
        let parsed: ReplyPayload = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("hi"));
        assert_eq!(parsed.media_urls, vec!["u1".to_string()]);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }

    #[test]
    fn test_inbound_message_serde() {
        let json = r#"{"channel_type":"telegram","channel_id":"x","sender_id":"u","text":"hi","timestamp":0}"#;
        let parsed: InboundMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.channel_type, "telegram");
        assert!(parsed.session_key.is_none());
        assert!(parsed.metadata.is_empty());
    }

    #[test]
    fn test_channel_status_serde() {
        let json = serde_json::to_string(&ChannelStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");

        let err = ChannelStatus::Error("connection lost".into());
        let json = serde_json::to_string(&err).unwrap();
        let parsed: ChannelStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ChannelStatus::Error("connection lost".into()));
    }

    #[test]
    fn test_channel_config_defaults() {
        let config: ChannelConfig = json5::from_str(r#"{ channel_type: "whatsapp" }"#).unwrap();
        assert!(config.enabled);
        assert!(config.allow_from.is_empty());
        assert!(config.settings.is_empty());
    }
}
