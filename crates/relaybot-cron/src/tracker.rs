//! Run summaries and status classification.

use relaybot_types::ReplyPayload;

use crate::types::RunStatus;

pub const SUMMARY_MAX_CHARS: usize = 2000;

/// Truncate to `max` characters, appending `…` when anything was cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// The last payload with non-empty trimmed text, truncated.
pub fn extract_summary(payloads: &[ReplyPayload]) -> Option<String> {
    payloads
        .iter()
        .rev()
        .filter_map(|p| p.text.as_deref())
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(|t| truncate_chars(t, SUMMARY_MAX_CHARS))
}

/// What happened when a result was handed to delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    NotRequested,
    Delivered,
    /// No recipient could be resolved.
    NoRecipient(String),
    Failed(String),
}

/// Final status and error of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
}

/// Fold the turn result and the delivery outcome into one status.
///
/// Under best-effort delivery a send failure keeps `ok` but still records
/// the failure, and a missing recipient becomes `skipped`.
pub fn classify_run(turn_error: Option<&str>, delivery: &DeliveryOutcome, best_effort: bool) -> RunOutcome {
    if let Some(err) = turn_error {
        return RunOutcome {
            status: RunStatus::Error,
            error: Some(err.to_string()),
        };
    }
    match delivery {
        DeliveryOutcome::NotRequested | DeliveryOutcome::Delivered => RunOutcome {
            status: RunStatus::Ok,
            error: None,
        },
        DeliveryOutcome::NoRecipient(msg) => RunOutcome {
            status: if best_effort { RunStatus::Skipped } else { RunStatus::Error },
            error: Some(msg.clone()),
        },
        DeliveryOutcome::Failed(msg) => RunOutcome {
            status: if best_effort { RunStatus::Ok } else { RunStatus::Error },
            error: Some(msg.clone()),
        },
    }
}
