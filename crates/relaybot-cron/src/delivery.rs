//! Delivery target resolution and outbound sending.

use async_trait::async_trait;

use relaybot_storage::LastRoute;
use relaybot_types::{ReplyPayload, SendReceipt, Surface};

use crate::error::DeliveryError;

/// Per-surface send. Implemented by the gateway's channel manager.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        surface: Surface,
        to: &str,
        text: &str,
        media_url: Option<&str>,
    ) -> Result<SendReceipt, DeliveryError>;
}

/// Where a result should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub channel: Surface,
    pub to: Option<String>,
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn deliverable(s: Option<&str>) -> Option<Surface> {
    non_empty(s)
        .and_then(|s| s.parse::<Surface>().ok())
        .filter(Surface::is_deliverable)
}

/// Normalize a primary-surface recipient: strip a `whatsapp:` prefix,
/// whitespace, `-()` and `.`, and ensure a leading `+`.
pub fn normalize_e164(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let without_prefix = match trimmed.get(..9) {
        Some(head) if head.eq_ignore_ascii_case("whatsapp:") => &trimmed[9..],
        _ => trimmed,
    };
    let digits: String = without_prefix
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')' | '.'))
        .collect();
    let digits = digits.trim_start_matches('+');
    if digits.is_empty() {
        return None;
    }
    Some(format!("+{digits}"))
}

/// Resolve the outbound channel and recipient for a result.
///
/// An explicit trimmed `to` wins over the session's last recipient. The
/// channel is the requested one when it names a deliverable surface,
/// otherwise the last route's channel (never `web`), otherwise the primary
/// surface. Primary-surface recipients are sanitized against `allow_from`.
pub fn resolve_delivery(
    requested_channel: Option<&str>,
    explicit_to: Option<&str>,
    last_route: Option<&LastRoute>,
    allow_from: &[String],
) -> DeliveryTarget {
    let last_channel = last_route.and_then(|r| r.channel.as_deref());
    let last_to = last_route.and_then(|r| r.to.as_deref());

    let channel = deliverable(requested_channel)
        .or_else(|| deliverable(last_channel))
        .unwrap_or(Surface::PRIMARY);

    let to = non_empty(explicit_to)
        .or_else(|| non_empty(last_to))
        .map(str::to_string);

    let to = if channel == Surface::PRIMARY {
        sanitize_primary(to, allow_from)
    } else {
        to
    };

    DeliveryTarget { channel, to }
}

fn sanitize_primary(to: Option<String>, allow_from: &[String]) -> Option<String> {
    if allow_from.is_empty() || allow_from.iter().any(|a| a.trim() == "*") {
        return to;
    }
    let allowed: Vec<String> = allow_from.iter().filter_map(|a| normalize_e164(a)).collect();
    if let Some(candidate) = to.as_deref().and_then(normalize_e164) {
        if allowed.contains(&candidate) {
            return Some(candidate);
        }
    }
    allowed.into_iter().next()
}

/// Send every payload to `to`. Media-bearing payloads send one message per
/// URL, with the text attached to the first.
pub async fn send_payloads(
    sender: &dyn MessageSender,
    channel: Surface,
    to: &str,
    payloads: &[ReplyPayload],
) -> Result<Vec<SendReceipt>, DeliveryError> {
    let mut receipts = Vec::new();
    for payload in payloads {
        let text = payload.text.as_deref().map(str::trim).unwrap_or("");
        let media = payload.media();
        if media.is_empty() {
            if text.is_empty() {
                continue;
            }
            receipts.push(sender.send(channel, to, text, None).await?);
            continue;
        }
        for (i, url) in media.into_iter().enumerate() {
            let caption = if i == 0 { text } else { "" };
            receipts.push(sender.send(channel, to, caption, Some(url)).await?);
        }
    }
    Ok(receipts)
}
