//! System events queued for the main session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Cap on queued events. The oldest are dropped beyond it.
pub const MAX_EVENTS: usize = 20;

/// Where cron posts text destined for the main session.
pub trait MainSessionSink: Send + Sync {
    fn enqueue_system_event(&self, text: String);

    /// Ask for a heartbeat turn as soon as possible.
    fn wake(&self);
}

/// In-memory, per-process queue of system event lines.
#[derive(Default)]
pub struct SystemEventQueue {
    events: Mutex<VecDeque<String>>,
    wake: Notify,
}

impl SystemEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take every queued event, oldest first.
    pub fn drain(&self) -> Vec<String> {
        self.events().drain(..).collect()
    }

    /// Take every queued event for one agent turn. The events return to the
    /// queue unless the turn commits them.
    pub fn take_pending(self: &Arc<Self>) -> PendingEvents {
        PendingEvents {
            queue: self.clone(),
            events: self.drain(),
            committed: false,
        }
    }

    /// Put events back ahead of anything queued since they were taken.
    fn restore(&self, taken: Vec<String>) {
        let mut events = self.events();
        for text in taken.into_iter().rev() {
            events.push_front(text);
        }
        while events.len() > MAX_EVENTS {
            events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }

    /// Resolves after the next [`wake`](MainSessionSink::wake). A wake that
    /// happened while nobody was waiting is remembered.
    pub async fn woken(&self) {
        self.wake.notified().await;
    }
}

/// Events handed to an agent turn.
pub struct PendingEvents {
    queue: Arc<SystemEventQueue>,
    events: Vec<String>,
    committed: bool,
}

impl PendingEvents {
    pub fn lines(&self) -> &[String] {
        &self.events
    }

    /// The turn succeeded; the events are consumed.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingEvents {
    fn drop(&mut self) {
        if !self.committed && !self.events.is_empty() {
            tracing::debug!(count = self.events.len(), "returning system events to the queue");
            self.queue.restore(std::mem::take(&mut self.events));
        }
    }
}

impl MainSessionSink for SystemEventQueue {
    fn enqueue_system_event(&self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        let mut events = self.events();
        // consecutive duplicates collapse
        if events.back() == Some(&text) {
            return;
        }
        events.push_back(text);
        while events.len() > MAX_EVENTS {
            events.pop_front();
        }
    }

    fn wake(&self) {
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_drain_in_order() {
        let q = SystemEventQueue::new();
        q.enqueue_system_event("a".into());
        q.enqueue_system_event(" b ".into());
        q.enqueue_system_event("".into());
        assert_eq!(q.drain(), vec!["a", "b"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_consecutive_duplicates_collapse() {
        let q = SystemEventQueue::new();
        for text in ["x", "x", "y", "x"] {
            q.enqueue_system_event(text.into());
        }
        assert_eq!(q.drain(), vec!["x", "y", "x"]);
    }

    #[test]
    fn test_cap_drops_oldest() {
        let q = SystemEventQueue::new();
        for i in 0..(MAX_EVENTS + 5) {
            q.enqueue_system_event(format!("e{i}"));
        }
        let events = q.drain();
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events[0], "e5");
    }

    #[test]
    fn test_uncommitted_events_return_to_front() {
        let q = Arc::new(SystemEventQueue::new());
        q.enqueue_system_event("a".into());
        q.enqueue_system_event("b".into());

        let pending = q.take_pending();
        assert_eq!(pending.lines(), ["a", "b"]);
        assert!(q.is_empty());
        q.enqueue_system_event("c".into());
        drop(pending);
        assert_eq!(q.drain(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_committed_events_are_consumed() {
        let q = Arc::new(SystemEventQueue::new());
        q.enqueue_system_event("a".into());
        q.take_pending().commit();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_wake_before_wait_is_remembered() {
        let q = SystemEventQueue::new();
        q.wake();
        tokio::time::timeout(Duration::from_secs(1), q.woken()).await.unwrap();
    }
}
